// Submission graph
//
// Builds the queue submissions of one frame. The order is fixed:
//
//   setup (optional) -> pre-compute -> graphics -> post-compute -> debug
//
// Every later batch waits on the semaphore the previous one signals, so the
// batches must reach their queues in exactly this order. Shadow maps, shadow
// blur and the main pass share one graphics submission: a binary semaphore
// cannot be signaled and then waited on the same queue without a submission
// boundary in between.

use anyhow::Result;
use ash::vk;

use super::sync::FrameSlot;
use crate::backend::{GpuDevice, QueueKind};

/// Stages that first write the acquired swapchain image: the composite
/// shader or, without postprocessing, the clear.
pub const SWAPCHAIN_WRITE_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::COMPUTE_SHADER.as_raw() | vk::PipelineStageFlags::TRANSFER.as_raw(),
);

/// Stage the overlay batch waits for the composited image at.
pub const OVERLAY_WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

/// Position of a batch in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ResourcesInit,
    ApplicationInit,
    PreCompute,
    Graphics,
    PostCompute,
    Debug,
}

impl Stage {
    /// The four per-frame stages, in submission order.
    pub const FRAME: [Stage; 4] = [
        Stage::PreCompute,
        Stage::Graphics,
        Stage::PostCompute,
        Stage::Debug,
    ];

    pub fn is_setup(self) -> bool {
        matches!(self, Stage::ResourcesInit | Stage::ApplicationInit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// One queue submission call.
#[derive(Debug, Clone)]
pub struct SubmitBatch {
    pub stage: Stage,
    pub queue: QueueKind,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

/// Command buffers recorded (and joined) for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameWork {
    pub resources_init: Option<vk::CommandBuffer>,
    pub application_init: Vec<vk::CommandBuffer>,
    pub particles: Option<vk::CommandBuffer>,
    pub shadow_maps: Vec<vk::CommandBuffer>,
    pub shadow_blurs: Vec<vk::CommandBuffer>,
    pub main_color: vk::CommandBuffer,
    pub postprocess: vk::CommandBuffer,
    pub overlay: vk::CommandBuffer,
}

#[derive(Debug, Clone)]
pub struct SubmissionGraph {
    batches: Vec<SubmitBatch>,
}

impl SubmissionGraph {
    /// Wires the semaphore chain of `slot` around `work`.
    ///
    /// Arms the slot's one-shot semaphores for pending setup work and
    /// consumes them in the first frame batch. The slot fence goes on the
    /// debug batch; it must be marked submitted once `submit` succeeds.
    pub fn build(slot: &mut FrameSlot, work: FrameWork) -> Result<Self> {
        let semaphores = slot.semaphores;
        let mut batches = Vec::with_capacity(6);

        if let Some(cmd) = work.resources_init {
            let signal = slot.resources_ready.arm()?;
            batches.push(SubmitBatch {
                stage: Stage::ResourcesInit,
                queue: QueueKind::Graphics,
                command_buffers: vec![cmd],
                waits: Vec::new(),
                signals: vec![signal],
                fence: None,
            });
        }
        if !work.application_init.is_empty() {
            let signal = slot.application_ready.arm()?;
            batches.push(SubmitBatch {
                stage: Stage::ApplicationInit,
                queue: QueueKind::Graphics,
                command_buffers: work.application_init,
                waits: Vec::new(),
                signals: vec![signal],
                fence: None,
            });
        }

        // One-shot waits go to whichever batch runs first
        let mut carried: Vec<SemaphoreWait> = [
            slot.resources_ready.take_wait(),
            slot.application_ready.take_wait(),
        ]
        .into_iter()
        .flatten()
        .map(|semaphore| SemaphoreWait {
            semaphore,
            stage: vk::PipelineStageFlags::ALL_COMMANDS,
        })
        .collect();

        if let Some(cmd) = work.particles {
            let waits = carried
                .drain(..)
                .map(|wait| SemaphoreWait {
                    stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                    ..wait
                })
                .collect();
            batches.push(SubmitBatch {
                stage: Stage::PreCompute,
                queue: QueueKind::Compute,
                command_buffers: vec![cmd],
                waits,
                signals: vec![semaphores.particles_done],
                fence: None,
            });
            // Particle vertex data is consumed at vertex input
            carried.push(SemaphoreWait {
                semaphore: semaphores.particles_done,
                stage: vk::PipelineStageFlags::VERTEX_INPUT,
            });
        }

        let mut graphics = Vec::with_capacity(work.shadow_maps.len() + work.shadow_blurs.len() + 1);
        graphics.extend(work.shadow_maps);
        graphics.extend(work.shadow_blurs);
        graphics.push(work.main_color);
        batches.push(SubmitBatch {
            stage: Stage::Graphics,
            queue: QueueKind::Graphics,
            command_buffers: graphics,
            waits: carried,
            signals: vec![semaphores.postprocess_start],
            fence: None,
        });

        // The swapchain image barrier at the start of the batch names these
        // stages as its source, which chains it after the acquire
        let compute_and_clear = SWAPCHAIN_WRITE_STAGES;
        batches.push(SubmitBatch {
            stage: Stage::PostCompute,
            queue: QueueKind::Compute,
            command_buffers: vec![work.postprocess],
            waits: vec![
                SemaphoreWait {
                    semaphore: semaphores.image_available,
                    stage: compute_and_clear,
                },
                SemaphoreWait {
                    semaphore: semaphores.postprocess_start,
                    stage: compute_and_clear,
                },
            ],
            signals: vec![semaphores.gui_ready],
            fence: None,
        });

        let fence = slot.in_flight.for_submit()?;
        batches.push(SubmitBatch {
            stage: Stage::Debug,
            queue: QueueKind::Graphics,
            command_buffers: vec![work.overlay],
            waits: vec![SemaphoreWait {
                semaphore: semaphores.gui_ready,
                stage: OVERLAY_WAIT_STAGE,
            }],
            signals: vec![semaphores.render_finished],
            fence: Some(fence),
        });

        Ok(Self { batches })
    }

    /// Every batch, setup first.
    pub fn batches(&self) -> &[SubmitBatch] {
        &self.batches
    }

    /// Only the per-frame batches, in submission order.
    pub fn frame_batches(&self) -> impl Iterator<Item = &SubmitBatch> {
        self.batches.iter().filter(|batch| !batch.stage.is_setup())
    }

    pub fn batch(&self, stage: Stage) -> Option<&SubmitBatch> {
        self.batches.iter().find(|batch| batch.stage == stage)
    }

    /// Issues every batch back to back without waiting in between.
    pub fn submit(&self, device: &dyn GpuDevice) -> Result<()> {
        for batch in &self.batches {
            device.submit(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;
    use crate::frame::sync::SyncPool;
    use ash::vk::Handle;

    fn cmd(raw: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(raw)
    }

    fn work(particles: bool) -> FrameWork {
        FrameWork {
            particles: particles.then(|| cmd(10)),
            shadow_maps: vec![cmd(20), cmd(21)],
            shadow_blurs: vec![cmd(30)],
            main_color: cmd(40),
            postprocess: cmd(50),
            overlay: cmd(60),
            ..Default::default()
        }
    }

    fn ready_pool(device: &HeadlessDevice) -> SyncPool {
        let mut pool = SyncPool::new(device, 2).unwrap();
        pool.slot_mut(0).unwrap().in_flight.wait_and_reset(device).unwrap();
        pool
    }

    #[test]
    fn frame_batches_follow_fixed_order() {
        let device = HeadlessDevice::new();
        let mut pool = ready_pool(&device);
        let graph = SubmissionGraph::build(pool.slot_mut(0).unwrap(), work(true)).unwrap();

        let stages: Vec<Stage> = graph.frame_batches().map(|b| b.stage).collect();
        assert_eq!(stages, Stage::FRAME.to_vec());

        let semaphores = pool.slot(0).unwrap().semaphores;
        let graphics = graph.batch(Stage::Graphics).unwrap();
        assert_eq!(graphics.command_buffers, vec![cmd(20), cmd(21), cmd(30), cmd(40)]);
        assert_eq!(graphics.waits[0].semaphore, semaphores.particles_done);
        assert_eq!(graphics.signals, vec![semaphores.postprocess_start]);

        let post = graph.batch(Stage::PostCompute).unwrap();
        let post_waits: Vec<_> = post.waits.iter().map(|w| w.semaphore).collect();
        assert_eq!(
            post_waits,
            vec![semaphores.image_available, semaphores.postprocess_start]
        );
    }

    #[test]
    fn only_debug_batch_carries_the_fence() {
        let device = HeadlessDevice::new();
        let mut pool = ready_pool(&device);
        let graph = SubmissionGraph::build(pool.slot_mut(0).unwrap(), work(true)).unwrap();

        for batch in graph.batches() {
            match batch.stage {
                Stage::Debug => assert_eq!(batch.fence, Some(pool.slot(0).unwrap().in_flight.handle())),
                _ => assert_eq!(batch.fence, None),
            }
        }
    }

    #[test]
    fn missing_particles_forward_one_shot_waits_to_graphics() {
        let device = HeadlessDevice::new();
        let mut pool = ready_pool(&device);
        let mut frame = work(false);
        frame.resources_init = Some(cmd(1));
        let graph = SubmissionGraph::build(pool.slot_mut(0).unwrap(), frame).unwrap();

        assert!(graph.batch(Stage::PreCompute).is_none());
        let resources_ready = pool.slot(0).unwrap().resources_ready.handle();
        let graphics = graph.batch(Stage::Graphics).unwrap();
        assert_eq!(graphics.waits.len(), 1);
        assert_eq!(graphics.waits[0].semaphore, resources_ready);
        assert!(!pool.slot(0).unwrap().resources_ready.is_armed());
    }

    #[test]
    fn setup_batches_precede_frame_and_are_consumed_once() {
        let device = HeadlessDevice::new();
        let mut pool = ready_pool(&device);
        let mut frame = work(true);
        frame.resources_init = Some(cmd(1));
        frame.application_init = vec![cmd(2), cmd(3)];
        let graph = SubmissionGraph::build(pool.slot_mut(0).unwrap(), frame).unwrap();

        let stages: Vec<Stage> = graph.batches().iter().map(|b| b.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::ResourcesInit,
                Stage::ApplicationInit,
                Stage::PreCompute,
                Stage::Graphics,
                Stage::PostCompute,
                Stage::Debug,
            ]
        );
        let pre = graph.batch(Stage::PreCompute).unwrap();
        assert_eq!(pre.waits.len(), 2);

        // A later frame on the same slot has nothing left to wait for
        let slot = pool.slot_mut(0).unwrap();
        assert!(slot.resources_ready.take_wait().is_none());
        assert!(slot.application_ready.take_wait().is_none());
    }

    #[test]
    fn fence_must_be_reset_before_building() {
        let device = HeadlessDevice::new();
        let mut pool = SyncPool::new(&device, 1).unwrap();
        assert!(SubmissionGraph::build(pool.slot_mut(0).unwrap(), work(true)).is_err());
    }
}
