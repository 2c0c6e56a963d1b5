// Headless backend
//
// Runs the scheduler without a GPU. Handles are minted from a counter, every
// call is appended to a log, and the state rules a driver enforces are
// checked: fences and semaphores must be able to signal before anything
// waits on them, command buffers must be recorded before they are submitted.
// Submitted work completes immediately.
//
// Built for tests and with the `headless` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::{
    AcquireOutcome, Attachment, AttachmentDesc, CommandRecorder, GpuDevice, ImageTransition,
    PresentOutcome, Presenter, QueueKind, RenderingTarget, Resolution, SwapchainImage,
};
use crate::frame::submission::SubmitBatch;

/// One recorded backend call.
#[derive(Debug, Clone)]
pub enum GpuCall {
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateCommandPool(vk::CommandPool, QueueKind),
    DestroyCommandPool(vk::CommandPool),
    BeginCommands { cmd: vk::CommandBuffer, thread: Option<String> },
    EndCommands(vk::CommandBuffer),
    Barrier { cmd: vk::CommandBuffer, transitions: Vec<ImageTransition> },
    ComputeBarrier(vk::CommandBuffer),
    BeginRendering { cmd: vk::CommandBuffer, clear: bool },
    EndRendering(vk::CommandBuffer),
    DepthBias { cmd: vk::CommandBuffer, constant: f32, slope: f32 },
    ClearColor { cmd: vk::CommandBuffer, image: vk::Image },
    Label { cmd: vk::CommandBuffer, name: String },
    EndLabel(vk::CommandBuffer),
    CreateAttachment { image: vk::Image, label: String },
    DestroyAttachment(vk::Image),
    Submit(SubmitBatch),
    WaitIdle,
    Acquire(AcquireOutcome),
    Present { image_index: u32, outcome: PresentOutcome },
    Recreate(Resolution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Initial,
    Recording,
    Executable,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    calls: Vec<GpuCall>,
    /// `true` when signaled.
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, bool>,
    pools: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    command_buffers: HashMap<vk::CommandBuffer, CommandState>,
    attachments: HashMap<vk::Image, String>,
    fail_next_submit: bool,
}

impl State {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore) -> Result<()> {
        match self.semaphores.get_mut(&semaphore) {
            None => bail!("unknown semaphore {:?}", semaphore),
            Some(true) => bail!("semaphore {:?} signaled while already signaled", semaphore),
            Some(signaled) => {
                *signaled = true;
                Ok(())
            }
        }
    }

    fn wait_semaphore(&mut self, semaphore: vk::Semaphore) -> Result<()> {
        match self.semaphores.get_mut(&semaphore) {
            None => bail!("unknown semaphore {:?}", semaphore),
            Some(false) => bail!("wait on semaphore {:?} with no pending signal", semaphore),
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
        }
    }
}

/// In-memory GPU device.
#[derive(Default)]
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<GpuCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Submits recorded so far.
    pub fn submits(&self) -> Vec<SubmitBatch> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                GpuCall::Submit(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    /// The next `submit` fails like a lost device.
    pub fn inject_submit_failure(&self) {
        self.state.lock().fail_next_submit = true;
    }

    pub fn live_attachments(&self) -> usize {
        self.state.lock().attachments.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    fn log(&self, call: GpuCall) {
        self.state.lock().calls.push(call);
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore) -> Result<()> {
        self.state.lock().signal_semaphore(semaphore)
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore) -> Result<()> {
        self.state.lock().wait_semaphore(semaphore)
    }

    fn mint_image(&self) -> SwapchainImage {
        let mut state = self.state.lock();
        SwapchainImage {
            image: vk::Image::from_raw(state.mint()),
            view: vk::ImageView::from_raw(state.mint()),
        }
    }
}

impl CommandRecorder for HeadlessDevice {
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd) {
            None => bail!("unknown command buffer {:?}", cmd),
            Some(CommandState::Recording) => bail!("command buffer {:?} is already recording", cmd),
            // Pools allow individual reset, begin resets implicitly
            Some(s) => *s = CommandState::Recording,
        }
        let thread = std::thread::current().name().map(str::to_owned);
        state.calls.push(GpuCall::BeginCommands { cmd, thread });
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd) {
            Some(s @ CommandState::Recording) => *s = CommandState::Executable,
            other => bail!("end of command buffer {:?} in state {:?}", cmd, other),
        }
        state.calls.push(GpuCall::EndCommands(cmd));
        Ok(())
    }

    fn transition_images(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]) {
        self.log(GpuCall::Barrier {
            cmd,
            transitions: transitions.to_vec(),
        });
    }

    fn compute_barrier(&self, cmd: vk::CommandBuffer) {
        self.log(GpuCall::ComputeBarrier(cmd));
    }

    fn begin_rendering(&self, cmd: vk::CommandBuffer, target: &RenderingTarget) {
        self.log(GpuCall::BeginRendering {
            cmd,
            clear: target.clear.is_some(),
        });
    }

    fn end_rendering(&self, cmd: vk::CommandBuffer) {
        self.log(GpuCall::EndRendering(cmd));
    }

    fn set_depth_bias(&self, cmd: vk::CommandBuffer, constant: f32, slope: f32) {
        self.log(GpuCall::DepthBias { cmd, constant, slope });
    }

    fn clear_color_image(&self, cmd: vk::CommandBuffer, image: vk::Image, _color: [f32; 4]) {
        self.log(GpuCall::ClearColor { cmd, image });
    }

    fn begin_label(&self, cmd: vk::CommandBuffer, name: &str) {
        self.log(GpuCall::Label {
            cmd,
            name: name.to_owned(),
        });
    }

    fn end_label(&self, cmd: vk::CommandBuffer) {
        self.log(GpuCall::EndLabel(cmd));
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.mint());
        state.fences.insert(fence, signaled);
        state.calls.push(GpuCall::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.calls.push(GpuCall::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence) {
            None => bail!("unknown fence {:?}", fence),
            Some(false) => bail!("wait on fence {:?} that can never signal", fence),
            Some(true) => {}
        }
        state.calls.push(GpuCall::WaitFence(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| anyhow!("unknown fence {:?}", fence))?;
        *signaled = false;
        state.calls.push(GpuCall::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.mint());
        state.semaphores.insert(semaphore, false);
        state.calls.push(GpuCall::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore);
        state.calls.push(GpuCall::DestroySemaphore(semaphore));
    }

    fn create_command_pool(&self, queue: QueueKind) -> Result<vk::CommandPool> {
        let mut state = self.state.lock();
        let pool = vk::CommandPool::from_raw(state.mint());
        state.pools.insert(pool, Vec::new());
        state.calls.push(GpuCall::CreateCommandPool(pool, queue));
        Ok(pool)
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            bail!("unknown command pool {:?}", pool);
        }
        let buffers: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.mint()))
            .collect();
        for cmd in &buffers {
            state.command_buffers.insert(*cmd, CommandState::Initial);
        }
        if let Some(owned) = state.pools.get_mut(&pool) {
            owned.extend(&buffers);
        }
        Ok(buffers)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        if let Some(buffers) = state.pools.remove(&pool) {
            for cmd in buffers {
                state.command_buffers.remove(&cmd);
            }
        }
        state.calls.push(GpuCall::DestroyCommandPool(pool));
    }

    fn create_attachment(&self, desc: &AttachmentDesc) -> Result<Attachment> {
        if desc.resolution.is_zero() {
            bail!("attachment '{}' has zero extent", desc.label);
        }
        let mut state = self.state.lock();
        let image = vk::Image::from_raw(state.mint());
        let view = vk::ImageView::from_raw(state.mint());
        state.attachments.insert(image, desc.label.clone());
        state.calls.push(GpuCall::CreateAttachment {
            image,
            label: desc.label.clone(),
        });
        Ok(Attachment {
            image,
            view,
            desc: desc.clone(),
        })
    }

    fn destroy_attachment(&self, attachment: Attachment) -> Result<()> {
        let mut state = self.state.lock();
        if state.attachments.remove(&attachment.image).is_none() {
            bail!("attachment {:?} destroyed twice", attachment.image);
        }
        state.calls.push(GpuCall::DestroyAttachment(attachment.image));
        Ok(())
    }

    fn submit(&self, batch: &SubmitBatch) -> Result<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_submit) {
            bail!("vkQueueSubmit failed: ERROR_DEVICE_LOST");
        }
        for cmd in &batch.command_buffers {
            match state.command_buffers.get(cmd) {
                Some(CommandState::Executable) => {}
                other => bail!(
                    "{:?} batch submits command buffer {:?} in state {:?}",
                    batch.stage,
                    cmd,
                    other
                ),
            }
        }
        for wait in &batch.waits {
            state.wait_semaphore(wait.semaphore)?;
        }
        // Work completes immediately
        for signal in &batch.signals {
            state.signal_semaphore(*signal)?;
        }
        if let Some(fence) = batch.fence {
            match state.fences.get_mut(&fence) {
                None => bail!("unknown fence {:?}", fence),
                Some(true) => bail!("fence {:?} submitted while still signaled", fence),
                Some(signaled) => *signaled = true,
            }
        }
        state.calls.push(GpuCall::Submit(batch.clone()));
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.log(GpuCall::WaitIdle);
        Ok(())
    }
}

/// In-memory swapchain with scriptable acquire and present results.
pub struct HeadlessPresenter {
    device: Arc<HeadlessDevice>,
    resolution: Resolution,
    images: Vec<SwapchainImage>,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    recreations: Vec<Resolution>,
}

impl HeadlessPresenter {
    pub fn new(device: Arc<HeadlessDevice>, resolution: Resolution, image_count: usize) -> Self {
        let images = (0..image_count).map(|_| device.mint_image()).collect();
        Self {
            device,
            resolution,
            images,
            next_image: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            recreations: Vec::new(),
        }
    }

    /// Queues a result for an upcoming acquire. For `Acquired` only the
    /// `suboptimal` flag is used.
    pub fn script_acquire(&mut self, outcome: AcquireOutcome) {
        self.acquire_script.push_back(outcome);
    }

    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    /// Resolutions passed to `recreate`, in order.
    pub fn recreations(&self) -> &[Resolution] {
        &self.recreations
    }
}

impl Presenter for HeadlessPresenter {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        let suboptimal = match self.acquire_script.pop_front() {
            Some(AcquireOutcome::OutOfDate) => {
                self.device.log(GpuCall::Acquire(AcquireOutcome::OutOfDate));
                return Ok(AcquireOutcome::OutOfDate);
            }
            Some(AcquireOutcome::Acquired { suboptimal, .. }) => suboptimal,
            None => false,
        };
        self.device.signal_semaphore(signal)?;
        let outcome = AcquireOutcome::Acquired {
            image_index: self.next_image,
            suboptimal,
        };
        self.next_image = (self.next_image + 1) % self.images.len().max(1) as u32;
        self.device.log(GpuCall::Acquire(outcome));
        Ok(outcome)
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        if image_index as usize >= self.images.len() {
            bail!("present of unknown image {}", image_index);
        }
        self.device.wait_semaphore(wait)?;
        let outcome = self
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented);
        self.device.log(GpuCall::Present { image_index, outcome });
        Ok(outcome)
    }

    fn recreate(&mut self, requested: Resolution) -> Result<Resolution> {
        self.resolution = requested;
        let count = self.images.len();
        self.images = (0..count).map(|_| self.device.mint_image()).collect();
        self.next_image = 0;
        self.recreations.push(requested);
        self.device.log(GpuCall::Recreate(requested));
        Ok(requested)
    }
}
