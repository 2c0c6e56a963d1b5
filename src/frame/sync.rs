// Synchronization primitives
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU sync. Allocated once per
// frame in flight and reused every cycle via modulo indexing.

use anyhow::{anyhow, bail, Result};
use ash::vk;

use crate::backend::GpuDevice;

/// Where an in-flight fence is in its wait/reset/submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    /// Created signaled, nothing submitted yet.
    Signaled,
    /// Attached to a submission whose completion has not been waited on.
    Pending,
    /// Waited and reset; must be submitted before it can be waited again.
    Reset,
}

/// The CPU-visible fence of a frame slot.
#[derive(Debug)]
pub struct InFlightFence {
    handle: vk::Fence,
    state: FenceState,
}

impl InFlightFence {
    pub fn new(device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self {
            // Start signaled so the very first wait returns immediately
            handle: device.create_fence(true)?,
            state: FenceState::Signaled,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn state(&self) -> FenceState {
        self.state
    }

    /// Blocks until the previous use of this slot finished, then resets.
    ///
    /// Returns `false` without touching the fence when it is already reset
    /// and nothing was submitted since (a restarted tick).
    pub fn wait_and_reset(&mut self, device: &dyn GpuDevice) -> Result<bool> {
        if self.state == FenceState::Reset {
            log::debug!("Fence {:?} already reset, skipping wait", self.handle);
            return Ok(false);
        }
        device.wait_for_fence(self.handle)?;
        device.reset_fence(self.handle)?;
        self.state = FenceState::Reset;
        Ok(true)
    }

    /// The handle to attach to the last submission of the frame. The state
    /// only moves to `Pending` once that submission went through.
    pub fn for_submit(&self) -> Result<vk::Fence> {
        if self.state != FenceState::Reset {
            bail!(
                "fence {:?} attached to a submission while {:?}",
                self.handle,
                self.state
            );
        }
        Ok(self.handle)
    }

    /// The submission carrying the fence was accepted by the queue.
    pub fn mark_submitted(&mut self) -> Result<()> {
        self.for_submit()?;
        self.state = FenceState::Pending;
        Ok(())
    }
}

/// A binary semaphore that is signaled once and waited on exactly once.
///
/// Disarmed → armed (signal submitted) → disarmed (wait consumed).
#[derive(Debug)]
pub struct OneShotSemaphore {
    handle: vk::Semaphore,
    armed: bool,
}

impl OneShotSemaphore {
    pub fn new(device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self {
            handle: device.create_semaphore()?,
            armed: false,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Marks a signal operation as submitted; returns the handle to signal.
    pub fn arm(&mut self) -> Result<vk::Semaphore> {
        if self.armed {
            bail!("semaphore {:?} signaled twice without a wait", self.handle);
        }
        self.armed = true;
        Ok(self.handle)
    }

    /// Yields the handle once per arming.
    pub fn take_wait(&mut self) -> Option<vk::Semaphore> {
        if !self.armed {
            return None;
        }
        self.armed = false;
        Some(self.handle)
    }
}

/// Semaphores chaining the batches of one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameSemaphores {
    pub image_available: vk::Semaphore,
    pub particles_done: vk::Semaphore,
    pub postprocess_start: vk::Semaphore,
    pub gui_ready: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSemaphores {
    fn new(device: &dyn GpuDevice) -> Result<Self> {
        Ok(Self {
            image_available: device.create_semaphore()?,
            particles_done: device.create_semaphore()?,
            postprocess_start: device.create_semaphore()?,
            gui_ready: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
        })
    }

    fn all(&self) -> [vk::Semaphore; 5] {
        [
            self.image_available,
            self.particles_done,
            self.postprocess_start,
            self.gui_ready,
            self.render_finished,
        ]
    }
}

/// Frame synchronization - one per frame in flight
#[derive(Debug)]
pub struct FrameSlot {
    pub index: usize,
    pub in_flight: InFlightFence,
    pub semaphores: FrameSemaphores,
    pub resources_ready: OneShotSemaphore,
    pub application_ready: OneShotSemaphore,
}

impl FrameSlot {
    fn new(device: &dyn GpuDevice, index: usize) -> Result<Self> {
        Ok(Self {
            index,
            in_flight: InFlightFence::new(device)?,
            semaphores: FrameSemaphores::new(device)?,
            resources_ready: OneShotSemaphore::new(device)?,
            application_ready: OneShotSemaphore::new(device)?,
        })
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        for semaphore in self.semaphores.all() {
            device.destroy_semaphore(semaphore);
        }
        device.destroy_semaphore(self.resources_ready.handle());
        device.destroy_semaphore(self.application_ready.handle());
        device.destroy_fence(self.in_flight.handle());
    }
}

/// All frame slots, allocated once at startup.
#[derive(Debug)]
pub struct SyncPool {
    slots: Vec<FrameSlot>,
}

impl SyncPool {
    pub fn new(device: &dyn GpuDevice, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            bail!("at least one frame in flight is required");
        }
        let slots = (0..frames_in_flight)
            .map(|index| FrameSlot::new(device, index))
            .collect::<Result<Vec<_>>>()?;
        log::info!("Created sync objects for {} frames in flight", frames_in_flight);
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Result<&FrameSlot> {
        let len = self.slots.len();
        self.slots
            .get(index)
            .ok_or_else(|| anyhow!("frame slot {} out of range ({} slots)", index, len))
    }

    pub fn slot_mut(&mut self, index: usize) -> Result<&mut FrameSlot> {
        let len = self.slots.len();
        self.slots
            .get_mut(index)
            .ok_or_else(|| anyhow!("frame slot {} out of range ({} slots)", index, len))
    }

    /// Caller must have drained the GPU.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
    }
}
