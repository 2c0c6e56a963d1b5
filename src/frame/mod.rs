// Frame module - per-frame scheduling and synchronization
//
// sync        fences and semaphores per frame slot
// submission  the ordered batches of one frame
// workers     recording thread pool
// shadows     shadow map / blur work items
// targets     off-screen render targets
// release     deferred destruction of removed scene objects
// scheduler   the tick state machine tying it together

pub mod release;
pub mod scheduler;
pub mod shadows;
pub mod submission;
pub mod sync;
pub mod targets;
pub mod workers;

pub use scheduler::{
    DispatchReport, FpsReport, FrameScheduler, FrameState, SchedulerSettings, TickOutcome, UpdateContext,
};
pub use submission::{FrameWork, SemaphoreWait, Stage, SubmissionGraph, SubmitBatch};
