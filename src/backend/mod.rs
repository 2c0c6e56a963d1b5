// Backend module - GPU abstraction seam
//
// Design: the frame scheduler only talks to the GPU through the traits below.
// `VulkanDevice`/`Swapchain` implement them on top of ash, `HeadlessDevice`
// implements them in memory so the scheduling logic can run without a GPU.
//
// Workers only ever see `CommandRecorder`. Submission lives on `GpuDevice`,
// which is owned by the driving thread.

pub mod device;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod swapchain;

pub use device::VulkanDevice;
#[cfg(any(test, feature = "headless"))]
pub use headless::{GpuCall, HeadlessDevice, HeadlessPresenter};
pub use swapchain::Swapchain;

use anyhow::Result;
use ash::vk;

use crate::frame::submission::SubmitBatch;

/// Hardware queue a batch is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
}

/// Output size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-sized surface
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

impl From<vk::Extent2D> for Resolution {
    fn from(extent: vk::Extent2D) -> Self {
        Self::new(extent.width, extent.height)
    }
}

/// Description of an off-screen image the Render Target Set allocates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDesc {
    pub label: String,
    pub format: vk::Format,
    pub resolution: Resolution,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// An allocated image plus its default view.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub desc: AttachmentDesc,
}

/// A presentable image owned by the presenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

/// One image layout transition, recorded as an image memory barrier.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub layer_count: u32,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl ImageTransition {
    /// Single-layer color transition with empty access masks.
    pub fn color(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            layer_count: 1,
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::empty(),
        }
    }

    pub fn stages(mut self, src: vk::PipelineStageFlags, dst: vk::PipelineStageFlags) -> Self {
        self.src_stage = src;
        self.dst_stage = dst;
        self
    }

    pub fn access(mut self, src: vk::AccessFlags, dst: vk::AccessFlags) -> Self {
        self.src_access = src;
        self.dst_access = dst;
        self
    }

    pub fn aspect(mut self, aspect: vk::ImageAspectFlags, layer_count: u32) -> Self {
        self.aspect = aspect;
        self.layer_count = layer_count;
        self
    }
}

/// Attachments for one dynamic-rendering scope.
///
/// `clear == None` loads the previous contents (overlay on top of composite).
#[derive(Debug, Clone)]
pub struct RenderingTarget {
    pub color: Vec<vk::ImageView>,
    pub color_layout: vk::ImageLayout,
    pub depth: Option<vk::ImageView>,
    pub resolution: Resolution,
    pub clear: Option<[f32; 4]>,
}

/// Result of asking the presenter for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

/// Result of a present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Command recording entry points.
///
/// Safe to call from any thread as long as a given command buffer (and the
/// pool it came from) is only touched by one thread at a time.
pub trait CommandRecorder: Send + Sync {
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn transition_images(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]);
    /// Compute shader writes made visible to subsequent compute shader reads.
    fn compute_barrier(&self, cmd: vk::CommandBuffer);
    fn begin_rendering(&self, cmd: vk::CommandBuffer, target: &RenderingTarget);
    fn end_rendering(&self, cmd: vk::CommandBuffer);
    fn set_depth_bias(&self, cmd: vk::CommandBuffer, constant: f32, slope: f32);
    /// Image must be in GENERAL layout.
    fn clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]);
    fn begin_label(&self, cmd: vk::CommandBuffer, name: &str);
    fn end_label(&self, cmd: vk::CommandBuffer);
}

/// Device-level operations used by the driving thread only.
pub trait GpuDevice: CommandRecorder {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(&self, queue: QueueKind) -> Result<vk::CommandPool>;
    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    /// Frees the pool and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn create_attachment(&self, desc: &AttachmentDesc) -> Result<Attachment>;
    fn destroy_attachment(&self, attachment: Attachment) -> Result<()>;

    /// One queue submission call. Never blocks on GPU completion.
    fn submit(&self, batch: &SubmitBatch) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}

/// Swapchain-like presentation surface.
pub trait Presenter {
    fn resolution(&self) -> Resolution;
    fn images(&self) -> &[SwapchainImage];
    /// Signals `signal` once the returned image can be written.
    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome>;
    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome>;
    /// Rebuilds the swapchain; returns the size actually chosen by the surface.
    fn recreate(&mut self, requested: Resolution) -> Result<Resolution>;
}
