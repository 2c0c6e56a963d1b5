// Cadence - per-frame scheduling for a multi-queue Vulkan renderer
//
// backend  GPU seam (Vulkan + headless)
// frame    frame scheduler and everything it drives
// scene    what gets drawn, as trait objects
// config   config.toml
// timer    frame timing and pacing

pub mod backend;
pub mod config;
pub mod frame;
pub mod scene;
pub mod timer;

pub use ash::vk;
