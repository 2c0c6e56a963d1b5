// =============================================================================
// FRAME SCHEDULER
// =============================================================================
//
// Drives one tick:
//
//   Idle -> AcquireImage -> RecordAndDispatch -> Submit -> Present -> Pace -> Idle
//                \                                   |
//                 +----------> Reset <---------------+  (out of date / resize)
//
// The only CPU waits are the slot fence, the worker joins and the pacing
// sleep. Everything between the four batches is ordered on the GPU by the
// slot's semaphore chain.
//
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ash::vk;

use super::release::DeferredRelease;
use super::shadows::{record_shadow_blur, record_shadow_map, DepthBias, ShadowWork, ShadowWorkPlan, CUBE_FACES};
use super::submission::{FrameWork, SubmissionGraph, OVERLAY_WAIT_STAGE};
use super::sync::SyncPool;
use super::targets::RenderTargets;
use super::workers::{TaskHandle, TaskSet, WorkerPool};
use crate::backend::{
    AcquireOutcome, CommandRecorder, GpuDevice, ImageTransition, PresentOutcome, Presenter, QueueKind,
    RenderingTarget, Resolution,
};
use crate::config::{Config, FrameConfig};
use crate::scene::{
    Animated, Overlay, ParticleSimulation, PostProcess, Scene, SceneSnapshot, ShadowTarget, SharedScene,
};
use crate::timer::{FpsCounter, FrameTimer};

/// An out-of-date surface may keep failing while the window is being dragged.
const MAX_ACQUIRE_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    AcquireImage,
    RecordAndDispatch,
    Submit,
    Present,
    Pace,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Presented { frame: u64, image_index: u32 },
    /// Nothing was rendered (minimized or the surface kept going out of date).
    Skipped,
}

/// Runtime knobs, resolved from `Config`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub frames_in_flight: usize,
    pub desired_fps: u32,
    pub worker_threads: usize,
    pub bloom_passes: u32,
    pub clear_color: [f32; 4],
    pub depth_bias: DepthBias,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frames_in_flight: config.graphics.max_frames_in_flight,
            desired_fps: config.frame.desired_fps,
            worker_threads: config.frame.worker_threads,
            bloom_passes: config.frame.bloom_passes,
            clear_color: config.graphics.clear_color,
            depth_bias: DepthBias {
                constant: config.frame.depth_bias_constant,
                slope: config.frame.depth_bias_slope,
            },
            color_format: vk::Format::R16G16B16A16_SFLOAT,
            depth_format: vk::Format::D32_SFLOAT,
        }
    }
}

/// Handed to the update callback once per tick, after the slot fence wait.
pub struct UpdateContext<'a> {
    pub scene: &'a mut Scene,
    pub frame_number: u64,
    pub frame_in_flight: usize,
    pub delta: Duration,
}

/// What the last RecordAndDispatch stage fanned out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub shadow_maps: usize,
    pub shadow_blurs: usize,
    pub particles: bool,
    pub animations: usize,
    pub tasks_joined: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FpsReport {
    /// Work time only.
    pub real: f32,
    /// Including the pacing sleep.
    pub limited: f32,
}

/// One command pool per stage, one command buffer per slot.
struct StageCommands {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
}

impl StageCommands {
    fn new(device: &dyn GpuDevice, queue: QueueKind, frames_in_flight: usize) -> Result<Self> {
        let pool = device.create_command_pool(queue)?;
        let buffers = device.allocate_command_buffers(pool, frames_in_flight as u32)?;
        Ok(Self { pool, buffers })
    }
}

struct StagePools {
    main: StageCommands,
    particles: StageCommands,
    postprocess: StageCommands,
    overlay: StageCommands,
}

impl StagePools {
    fn new(device: &dyn GpuDevice, frames_in_flight: usize) -> Result<Self> {
        Ok(Self {
            main: StageCommands::new(device, QueueKind::Graphics, frames_in_flight)?,
            particles: StageCommands::new(device, QueueKind::Compute, frames_in_flight)?,
            postprocess: StageCommands::new(device, QueueKind::Compute, frames_in_flight)?,
            overlay: StageCommands::new(device, QueueKind::Graphics, frames_in_flight)?,
        })
    }

    fn destroy(&self, device: &dyn GpuDevice) {
        for stage in [&self.main, &self.particles, &self.postprocess, &self.overlay] {
            device.destroy_command_pool(stage.pool);
        }
    }
}

/// Images the post-compute and overlay stages touch.
#[derive(Clone, Copy)]
struct PresentImages {
    blur_in: vk::Image,
    blur_out: vk::Image,
    swapchain: vk::Image,
    swapchain_view: vk::ImageView,
    resolution: Resolution,
}

type UpdateFn = Box<dyn FnMut(&mut UpdateContext<'_>)>;
type ResetFn = Box<dyn FnMut(Resolution)>;

pub struct FrameScheduler<D: GpuDevice + 'static, P: Presenter> {
    device: Arc<D>,
    presenter: P,
    scene: SharedScene,
    settings: SchedulerSettings,

    timer: FrameTimer,
    real_fps: FpsCounter,
    limited_fps: FpsCounter,

    workers: WorkerPool,
    sync: SyncPool,
    targets: RenderTargets,
    shadows: ShadowWorkPlan,
    stages: StagePools,
    deferred: DeferredRelease,
    pending_init: Vec<vk::CommandBuffer>,

    state: FrameState,
    reset_requested: Option<Resolution>,
    minimized: bool,
    shut_down: bool,

    update: Option<UpdateFn>,
    on_reset: Option<ResetFn>,

    last_submission: Option<SubmissionGraph>,
    last_dispatch: DispatchReport,
}

impl<D: GpuDevice + 'static, P: Presenter> FrameScheduler<D, P> {
    pub fn new(device: Arc<D>, presenter: P, scene: SharedScene, settings: SchedulerSettings) -> Result<Self> {
        let frames = settings.frames_in_flight;
        let workers = WorkerPool::new(settings.worker_threads)?;
        let sync = SyncPool::new(&*device, frames).context("Failed to create frame sync objects")?;
        let mut targets = RenderTargets::new(&*device, frames, settings.color_format, settings.depth_format)?;
        let resolution = presenter.resolution();
        targets.initialize(&*device, resolution)?;
        let stages = StagePools::new(&*device, frames)?;

        log::info!(
            "Frame scheduler ready: {} frames in flight, {} workers, {}x{}",
            frames,
            workers.threads(),
            resolution.width,
            resolution.height
        );

        Ok(Self {
            device,
            presenter,
            scene,
            settings,
            timer: FrameTimer::new(),
            real_fps: FpsCounter::new(),
            limited_fps: FpsCounter::new(),
            workers,
            sync,
            targets,
            shadows: ShadowWorkPlan::default(),
            stages,
            deferred: DeferredRelease::new(frames),
            pending_init: Vec::new(),
            state: FrameState::Idle,
            reset_requested: None,
            minimized: resolution.is_zero(),
            shut_down: false,
            update: None,
            on_reset: None,
            last_submission: None,
            last_dispatch: DispatchReport::default(),
        })
    }

    // =========================================================================
    // CALLBACKS & EXTERNAL REQUESTS
    // =========================================================================

    /// Runs once per tick with exclusive access to the scene.
    pub fn on_update<F>(&mut self, update: F)
    where
        F: FnMut(&mut UpdateContext<'_>) + 'static,
    {
        self.update = Some(Box::new(update));
    }

    /// Runs after every reset with the new output size.
    pub fn on_reset<F>(&mut self, on_reset: F)
    where
        F: FnMut(Resolution) + 'static,
    {
        self.on_reset = Some(Box::new(on_reset));
    }

    /// Applied at the start of the next tick.
    pub fn request_resize(&mut self, resolution: Resolution) {
        log::debug!("Resize to {}x{} requested", resolution.width, resolution.height);
        self.reset_requested = Some(resolution);
    }

    /// A recorded command buffer submitted once, before the next frame's work.
    pub fn submit_initialization_work(&mut self, cmd: vk::CommandBuffer) {
        self.pending_init.push(cmd);
    }

    pub fn set_desired_fps(&mut self, desired_fps: u32) {
        self.settings.desired_fps = desired_fps;
    }

    pub fn set_bloom_passes(&mut self, passes: u32) {
        self.settings.bloom_passes = passes;
    }

    /// Live-reloadable subset of the frame settings.
    pub fn apply_frame_config(&mut self, frame: &FrameConfig) {
        if frame.desired_fps != self.settings.desired_fps || frame.bloom_passes != self.settings.bloom_passes {
            log::info!(
                "Frame settings changed: {} fps, {} bloom passes",
                frame.desired_fps,
                frame.bloom_passes
            );
        }
        self.set_desired_fps(frame.desired_fps);
        self.set_bloom_passes(frame.bloom_passes);
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn current_frame_in_flight(&self) -> usize {
        self.timer.frame_in_flight(self.settings.frames_in_flight)
    }

    pub fn frame_counter(&self) -> u64 {
        self.timer.frame_counter()
    }

    pub fn fps(&self) -> FpsReport {
        FpsReport {
            real: self.real_fps.fps(),
            limited: self.limited_fps.fps(),
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn last_submission(&self) -> Option<&SubmissionGraph> {
        self.last_submission.as_ref()
    }

    pub fn last_dispatch(&self) -> DispatchReport {
        self.last_dispatch
    }

    pub fn deferred(&self) -> &DeferredRelease {
        &self.deferred
    }

    pub fn scene(&self) -> &SharedScene {
        &self.scene
    }

    pub fn targets(&self) -> &RenderTargets {
        &self.targets
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    fn set_state(&mut self, state: FrameState) {
        log::trace!("Frame {}: {:?} -> {:?}", self.timer.frame_counter(), self.state, state);
        self.state = state;
    }

    // =========================================================================
    // TICK
    // =========================================================================

    pub fn tick(&mut self) -> Result<TickOutcome> {
        if self.shut_down {
            bail!("tick after the frame scheduler was shut down");
        }
        if let Some(requested) = self.reset_requested.take() {
            self.reset(requested)?;
        }
        if self.minimized {
            self.set_state(FrameState::Idle);
            return Ok(TickOutcome::Skipped);
        }

        self.timer.tick();
        self.real_fps.tick();
        self.limited_fps.tick();
        let slot = self.current_frame_in_flight();

        let Some(image_index) = self.acquire(slot)? else {
            self.set_state(FrameState::Idle);
            return Ok(TickOutcome::Skipped);
        };

        let work = self.record_and_dispatch(slot, image_index)?;

        self.set_state(FrameState::Submit);
        let graph = SubmissionGraph::build(self.sync.slot_mut(slot)?, work)?;
        graph.submit(&*self.device).context("Frame submission failed")?;
        // A failed submit leaves the fence reset, so it is never waited on
        self.sync.slot_mut(slot)?.in_flight.mark_submitted()?;
        self.last_submission = Some(graph);

        self.set_state(FrameState::Present);
        let render_finished = self.sync.slot(slot)?.semaphores.render_finished;
        match self.presenter.present(image_index, render_finished)? {
            PresentOutcome::Presented => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::debug!("Swapchain needs recreation after present");
                let current = self.presenter.resolution();
                self.reset_requested.get_or_insert(current);
            }
        }

        self.set_state(FrameState::Pace);
        self.real_fps.tock();
        self.timer.sleep_to_target_fps(self.settings.desired_fps);
        let frame = self.timer.frame_counter();
        self.timer.tock();
        self.limited_fps.tock();

        self.set_state(FrameState::Idle);
        Ok(TickOutcome::Presented { frame, image_index })
    }

    /// Waits the slot fence and acquires an image. An out-of-date surface
    /// resets and starts over; the fence stays reset so it is not waited again.
    fn acquire(&mut self, slot: usize) -> Result<Option<u32>> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            self.set_state(FrameState::AcquireImage);
            self.sync
                .slot_mut(slot)?
                .in_flight
                .wait_and_reset(&*self.device)
                .context("Failed to wait for frame fence")?;

            let image_available = self.sync.slot(slot)?.semaphores.image_available;
            match self.presenter.acquire_next_image(image_available)? {
                AcquireOutcome::Acquired { image_index, suboptimal } => {
                    if suboptimal {
                        let current = self.presenter.resolution();
                        self.reset_requested.get_or_insert(current);
                    }
                    return Ok(Some(image_index));
                }
                AcquireOutcome::OutOfDate => {
                    log::debug!("Swapchain out of date on acquire, restarting tick");
                    let requested = self
                        .reset_requested
                        .take()
                        .unwrap_or_else(|| self.presenter.resolution());
                    self.reset(requested)?;
                    if self.minimized {
                        return Ok(None);
                    }
                }
            }
        }
        log::warn!("Swapchain stayed out of date, skipping frame");
        Ok(None)
    }

    // =========================================================================
    // RECORD & DISPATCH
    // =========================================================================

    fn record_and_dispatch(&mut self, slot: usize, image_index: u32) -> Result<FrameWork> {
        self.set_state(FrameState::RecordAndDispatch);

        // The slot fence was waited: nothing from N frames ago is in use
        self.deferred.release(slot);

        let snapshot = {
            let mut scene = self.scene.write();
            if let Some(update) = self.update.as_mut() {
                let mut ctx = UpdateContext {
                    scene: &mut *scene,
                    frame_number: self.timer.frame_counter(),
                    frame_in_flight: slot,
                    delta: self.timer.elapsed_since_last_tick(),
                };
                update(&mut ctx);
            }
            self.deferred.schedule(slot, scene.take_retired());
            scene.snapshot()
        };

        let lights = snapshot.lights.as_deref();
        if !self.shadows.is_current(lights) {
            // Light setup changed; old item pools may still be executing
            self.device.wait_idle()?;
            self.shadows.sync(&*self.device, lights, self.settings.frames_in_flight)?;
        }

        let frame = self
            .targets
            .frame(slot)
            .context("Render targets missing for frame slot")?;
        let swapchain = *self
            .presenter
            .images()
            .get(image_index as usize)
            .context("Acquired image index out of range")?;
        let images = PresentImages {
            blur_in: frame.blur_in.image,
            blur_out: frame.blur_out.image,
            swapchain: swapchain.image,
            swapchain_view: swapchain.view,
            resolution: self.targets.resolution(),
        };

        let animation_tasks = self.dispatch_animations(&snapshot, slot);
        let recorder: Arc<dyn CommandRecorder> = self.device.clone();
        let shadow_tasks = self.dispatch_shadows(&recorder, &snapshot, slot);
        let particle_task = self.dispatch_particles(&recorder, &snapshot, slot);
        let postprocess_task = self.dispatch_postprocess(&recorder, snapshot.postprocess.clone(), slot, image_index, images);
        let overlay_task = self.dispatch_overlay(&recorder, snapshot.overlay.clone(), slot, image_index, images);
        let tasks =
            animation_tasks.len() + shadow_tasks.len() + 2 + usize::from(particle_task.is_some());

        // Drawables read the joint data the animation updates write
        let animated = animation_tasks.join_all();
        let main_color = animated
            .as_ref()
            .ok()
            .map(|_| self.record_main_pass(&snapshot, slot));

        // Barrier: nothing is submitted while a worker still records
        let shadow_result = shadow_tasks.join_all();
        let particle_result = particle_task.map(TaskHandle::join).transpose();
        let postprocess_result = postprocess_task.join();
        let overlay_result = overlay_task.join();

        let animations = animated?.len();
        let main_color = main_color.transpose()?.context("Main pass was not recorded")?;
        let mut shadow_maps = shadow_result?;
        let particles = particle_result?;
        let postprocess = postprocess_result?;
        let overlay = overlay_result?;

        // Items are planned maps first, blurs last
        let shadow_blurs = shadow_maps.split_off(self.shadows.map_count().min(shadow_maps.len()));
        self.last_dispatch = DispatchReport {
            shadow_maps: shadow_maps.len(),
            shadow_blurs: shadow_blurs.len(),
            particles: particles.is_some(),
            animations,
            tasks_joined: tasks,
        };

        Ok(FrameWork {
            resources_init: self.targets.take_pending_initialization(),
            application_init: std::mem::take(&mut self.pending_init),
            particles,
            shadow_maps,
            shadow_blurs,
            main_color,
            postprocess,
            overlay,
        })
    }

    /// One task per animated object, writing this slot's data.
    fn dispatch_animations(&self, snapshot: &SceneSnapshot, slot: usize) -> TaskSet<()> {
        let mut tasks = TaskSet::new();
        let elapsed = self.timer.elapsed_current();
        for (i, animated) in snapshot.animated.iter().enumerate() {
            let animated: Arc<dyn Animated> = animated.clone();
            tasks.push(
                self.workers
                    .spawn(format!("Animation {}", i), move || animated.update_animation(slot, elapsed)),
            );
        }
        tasks
    }

    fn dispatch_shadows(
        &self,
        recorder: &Arc<dyn CommandRecorder>,
        snapshot: &SceneSnapshot,
        slot: usize,
    ) -> TaskSet<vk::CommandBuffer> {
        let mut tasks = TaskSet::new();
        let Some(lights) = &snapshot.lights else {
            return tasks;
        };
        for item in self.shadows.items() {
            let cmd = item.command_buffer(slot);
            let work = item.work;
            let recorder = recorder.clone();
            let lights = lights.clone();
            let casters = snapshot.shadowables.clone();
            let bias = self.settings.depth_bias;
            tasks.push(self.workers.spawn(item.name(), move || {
                match work {
                    ShadowWork::Map(target) => {
                        record_shadow_map(&*recorder, cmd, slot, target, &*lights, &casters, bias)?
                    }
                    ShadowWork::Blur(light) => record_shadow_blur(&*recorder, cmd, slot, light, &*lights)?,
                }
                Ok(cmd)
            }));
        }
        tasks
    }

    fn dispatch_particles(
        &self,
        recorder: &Arc<dyn CommandRecorder>,
        snapshot: &SceneSnapshot,
        slot: usize,
    ) -> Option<TaskHandle<vk::CommandBuffer>> {
        if snapshot.particles.is_empty() {
            return None;
        }
        let cmd = self.stages.particles.buffers[slot];
        let recorder = recorder.clone();
        let systems: Arc<[Arc<dyn ParticleSimulation>]> = snapshot.particles.clone();
        let elapsed = self.timer.elapsed_since_last_tick();
        Some(self.workers.spawn("Particles", move || {
            recorder.begin_commands(cmd)?;
            recorder.begin_label(cmd, "Particles");
            for system in systems.iter() {
                system.record_compute(&*recorder, cmd, slot, elapsed)?;
            }
            recorder.end_label(cmd);
            recorder.end_commands(cmd)?;
            Ok(cmd)
        }))
    }

    /// Bloom blur and composite into the swapchain image, or a plain clear
    /// when no postprocessing is installed.
    fn dispatch_postprocess(
        &self,
        recorder: &Arc<dyn CommandRecorder>,
        postprocess: Option<Arc<dyn PostProcess>>,
        slot: usize,
        image_index: u32,
        images: PresentImages,
    ) -> TaskHandle<vk::CommandBuffer> {
        let cmd = self.stages.postprocess.buffers[slot];
        let recorder = recorder.clone();
        let passes = self.settings.bloom_passes;
        let clear_color = self.settings.clear_color;
        self.workers.spawn("Postprocess", move || {
            recorder.begin_commands(cmd)?;
            recorder.begin_label(cmd, "Postprocess");
            match postprocess {
                Some(postprocess) => {
                    for pass in 0..passes {
                        recorder.begin_label(cmd, "Bloom blur");
                        postprocess.record_blur(&*recorder, cmd, slot, pass % 2 == 0)?;
                        recorder.end_label(cmd);
                        // Ping-pong: next pass reads what this one wrote
                        recorder.compute_barrier(cmd);
                    }
                    // Source stage matches the acquire wait, so the transition
                    // happens after the presentation engine let go of the image
                    recorder.transition_images(
                        cmd,
                        &[ImageTransition::color(
                            images.swapchain,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::GENERAL,
                        )
                        .stages(
                            vk::PipelineStageFlags::COMPUTE_SHADER,
                            vk::PipelineStageFlags::COMPUTE_SHADER,
                        )
                        .access(vk::AccessFlags::empty(), vk::AccessFlags::SHADER_WRITE)],
                    );
                    recorder.begin_label(cmd, "Composite");
                    postprocess.record_composite(&*recorder, cmd, slot, image_index)?;
                    recorder.end_label(cmd);
                }
                None => {
                    recorder.transition_images(
                        cmd,
                        &[ImageTransition::color(
                            images.swapchain,
                            vk::ImageLayout::UNDEFINED,
                            vk::ImageLayout::GENERAL,
                        )
                        .stages(vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::TRANSFER)
                        .access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE)],
                    );
                    recorder.clear_color_image(cmd, images.swapchain, clear_color);
                }
            }
            recorder.end_label(cmd);
            recorder.end_commands(cmd)?;
            log::trace!(
                "Postprocess for slot {} recorded (blur {:?} <-> {:?})",
                slot,
                images.blur_in,
                images.blur_out
            );
            Ok(cmd)
        })
    }

    /// GUI on top of the composited image, then hand it to the presentation engine.
    fn dispatch_overlay(
        &self,
        recorder: &Arc<dyn CommandRecorder>,
        overlay: Option<Arc<dyn Overlay>>,
        slot: usize,
        image_index: u32,
        images: PresentImages,
    ) -> TaskHandle<vk::CommandBuffer> {
        let cmd = self.stages.overlay.buffers[slot];
        let recorder = recorder.clone();
        self.workers.spawn("Overlay", move || {
            recorder.begin_commands(cmd)?;
            recorder.begin_label(cmd, "Overlay");
            // The composite ran on the compute queue; only the gui_ready wait
            // orders it, so the source stage is the wait stage
            recorder.transition_images(
                cmd,
                &[ImageTransition::color(
                    images.swapchain,
                    vk::ImageLayout::GENERAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                )
                .stages(OVERLAY_WAIT_STAGE, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .access(
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )],
            );
            recorder.begin_rendering(
                cmd,
                &RenderingTarget {
                    color: vec![images.swapchain_view],
                    color_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    depth: None,
                    resolution: images.resolution,
                    clear: None,
                },
            );
            if let Some(overlay) = &overlay {
                overlay.record(&*recorder, cmd, slot, image_index)?;
            }
            recorder.end_rendering(cmd);
            recorder.transition_images(
                cmd,
                &[ImageTransition::color(
                    images.swapchain,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                )
                .stages(
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                )
                .access(vk::AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::empty())],
            );
            recorder.end_label(cmd);
            recorder.end_commands(cmd)?;
            Ok(cmd)
        })
    }

    /// Recorded on the driving thread while the workers run.
    fn record_main_pass(&self, snapshot: &SceneSnapshot, slot: usize) -> Result<vk::CommandBuffer> {
        let device = &*self.device;
        let cmd = self.stages.main.buffers[slot];
        let frame = self
            .targets
            .frame(slot)
            .context("Render targets missing for frame slot")?;

        device.begin_commands(cmd)?;
        device.begin_label(cmd, "Main pass");

        // The depth buffer is shared by every slot; the previous frame's
        // main pass may still be writing it
        if let Some(depth) = self.targets.depth() {
            device.transition_images(
                cmd,
                &[ImageTransition::color(
                    depth.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                )
                .aspect(vk::ImageAspectFlags::DEPTH, 1)
                .stages(
                    vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                )
                .access(
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                    vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                        | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                )],
            );
        }

        // Shadow maps written earlier in this submission are sampled here
        if let Some(lights) = &snapshot.lights {
            let transitions: Vec<ImageTransition> = self
                .shadows
                .items()
                .iter()
                .filter_map(|item| match item.work {
                    ShadowWork::Map(target @ ShadowTarget::Directional { .. }) => Some((target, 1)),
                    ShadowWork::Map(target @ ShadowTarget::PointFace { face: 0, .. }) => {
                        Some((target, CUBE_FACES as u32))
                    }
                    _ => None,
                })
                .map(|(target, layers)| {
                    ImageTransition::color(
                        lights.shadow_attachment(target, slot).image,
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                    )
                    .aspect(vk::ImageAspectFlags::DEPTH, layers)
                    .stages(
                        vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                    )
                    .access(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE, vk::AccessFlags::SHADER_READ)
                })
                .collect();
            if !transitions.is_empty() {
                device.transition_images(cmd, &transitions);
            }
        }

        device.begin_rendering(
            cmd,
            &RenderingTarget {
                color: vec![frame.color.view],
                color_layout: vk::ImageLayout::GENERAL,
                depth: self.targets.depth().map(|depth| depth.view),
                resolution: self.targets.resolution(),
                clear: Some(self.settings.clear_color),
            },
        );
        for drawable in snapshot.drawables() {
            drawable.record(device, cmd, slot)?;
        }
        device.end_rendering(cmd);

        device.end_label(cmd);
        device.end_commands(cmd)?;
        Ok(cmd)
    }

    // =========================================================================
    // RESET & SHUTDOWN
    // =========================================================================

    /// Full drain, swapchain recreation and render target rebuild.
    fn reset(&mut self, requested: Resolution) -> Result<()> {
        self.set_state(FrameState::Reset);
        self.device.wait_idle()?;

        if requested.is_zero() {
            log::debug!("Zero-sized surface, pausing rendering");
            self.minimized = true;
            return Ok(());
        }

        let resolution = self
            .presenter
            .recreate(requested)
            .context("Failed to recreate swapchain")?;
        self.targets
            .rebuild(&*self.device, resolution)
            .context("Failed to rebuild render targets")?;
        self.minimized = resolution.is_zero();

        if let Some(on_reset) = self.on_reset.as_mut() {
            on_reset(resolution);
        }
        log::info!("Reset complete: {}x{}", resolution.width, resolution.height);
        Ok(())
    }

    /// Drains the GPU and releases everything the scheduler owns. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let device = &*self.device;
        device.wait_idle()?;
        let released = self.deferred.release_all();
        self.shadows.destroy(device);
        self.stages.destroy(device);
        self.targets.destroy(device)?;
        self.sync.destroy(device);

        log::info!("Frame scheduler shut down, {} deferred objects released", released);
        Ok(())
    }
}

impl<D: GpuDevice + 'static, P: Presenter> Drop for FrameScheduler<D, P> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Frame scheduler shutdown failed: {:?}", e);
        }
    }
}
