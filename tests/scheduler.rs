// End-to-end scheduler behavior on the headless backend.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use cadence::backend::{
    AcquireOutcome, CommandRecorder, GpuCall, GpuDevice, HeadlessDevice, HeadlessPresenter, ImageTransition,
    PresentOutcome, Presenter, QueueKind, Resolution,
};
use cadence::frame::{FrameScheduler, SchedulerSettings, Stage, TickOutcome};
use cadence::scene::{
    Animated, Blend, Drawable, DrawableKind, LightRef, LightRig, ParticleSimulation, PostProcess,
    ShadowAttachment, ShadowTarget, Shadowable,
};
use cadence::scene::Scene;
use cadence::vk::{self, Handle};
use glam::Vec3;
use parking_lot::Mutex;

type Scheduler = FrameScheduler<HeadlessDevice, HeadlessPresenter>;

fn harness(frames_in_flight: usize) -> (Arc<HeadlessDevice>, Scheduler) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(HeadlessDevice::new());
    let presenter = HeadlessPresenter::new(device.clone(), Resolution::new(640, 480), 3);
    let settings = SchedulerSettings {
        frames_in_flight,
        desired_fps: 0,
        worker_threads: 4,
        ..SchedulerSettings::default()
    };
    let scheduler = FrameScheduler::new(device.clone(), presenter, Scene::shared(), settings).unwrap();
    (device, scheduler)
}

fn count(device: &HeadlessDevice, pred: impl Fn(&GpuCall) -> bool) -> usize {
    device.calls().iter().filter(|call| pred(call)).count()
}

fn stages(device: &HeadlessDevice) -> Vec<Stage> {
    device.submits().iter().map(|batch| batch.stage).collect()
}

/// Transitions of `image` recorded into `cmd`, in order.
fn transitions_of(device: &HeadlessDevice, cmd: vk::CommandBuffer, image: vk::Image) -> Vec<ImageTransition> {
    device
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            GpuCall::Barrier { cmd: c, transitions } if c == cmd => Some(transitions),
            _ => None,
        })
        .flatten()
        .filter(|transition| transition.image == image)
        .collect()
}

// =============================================================================
// SCENE DOUBLES
// =============================================================================

struct Mesh {
    position: Vec3,
}

impl Drawable for Mesh {
    fn kind(&self) -> DrawableKind {
        DrawableKind::Model
    }

    fn record(&self, recorder: &dyn CommandRecorder, cmd: vk::CommandBuffer, _frame: usize) -> Result<()> {
        recorder.begin_label(cmd, "mesh");
        recorder.end_label(cmd);
        Ok(())
    }

    fn position(&self) -> Vec3 {
        self.position
    }
}

impl Shadowable for Mesh {
    fn record_shadow(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        _frame: usize,
        _target: ShadowTarget,
    ) -> Result<()> {
        recorder.begin_label(cmd, "mesh shadow");
        recorder.end_label(cmd);
        Ok(())
    }
}

struct BrokenCaster;

impl Shadowable for BrokenCaster {
    fn record_shadow(
        &self,
        _recorder: &dyn CommandRecorder,
        _cmd: vk::CommandBuffer,
        _frame: usize,
        _target: ShadowTarget,
    ) -> Result<()> {
        bail!("pipeline missing")
    }
}

struct Sparks;

impl Drawable for Sparks {
    fn kind(&self) -> DrawableKind {
        DrawableKind::ParticleSystem
    }

    fn record(&self, _recorder: &dyn CommandRecorder, _cmd: vk::CommandBuffer, _frame: usize) -> Result<()> {
        Ok(())
    }
}

impl ParticleSimulation for Sparks {
    fn record_compute(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        _frame: usize,
        _elapsed: std::time::Duration,
    ) -> Result<()> {
        recorder.compute_barrier(cmd);
        Ok(())
    }
}

/// Logs its updates and draws into a shared event list.
struct Walker {
    events: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl Drawable for Walker {
    fn kind(&self) -> DrawableKind {
        DrawableKind::Model
    }

    fn record(&self, _recorder: &dyn CommandRecorder, _cmd: vk::CommandBuffer, frame: usize) -> Result<()> {
        self.events.lock().push(format!("draw {}", frame));
        Ok(())
    }
}

impl Shadowable for Walker {
    fn record_shadow(
        &self,
        _recorder: &dyn CommandRecorder,
        _cmd: vk::CommandBuffer,
        _frame: usize,
        _target: ShadowTarget,
    ) -> Result<()> {
        Ok(())
    }
}

impl Animated for Walker {
    fn update_animation(&self, frame: usize, _elapsed: Duration) -> Result<()> {
        // Slow enough that an unjoined update would land after the draw
        std::thread::sleep(Duration::from_millis(20));
        if self.fail {
            bail!("skeleton missing");
        }
        self.events.lock().push(format!("animate {}", frame));
        Ok(())
    }
}

struct Rig {
    directional: usize,
    point: usize,
    soft_point: bool,
}

impl LightRig for Rig {
    fn directional_lights(&self) -> usize {
        self.directional
    }

    fn point_lights(&self) -> usize {
        self.point
    }

    fn shadow_attachment(&self, target: ShadowTarget, frame: usize) -> ShadowAttachment {
        let raw = match target {
            ShadowTarget::Directional { light } => 1_000_000 + light as u64 * 10 + frame as u64,
            ShadowTarget::PointFace { light, .. } => 2_000_000 + light as u64 * 10 + frame as u64,
        };
        ShadowAttachment {
            image: vk::Image::from_raw(raw),
            view: vk::ImageView::from_raw(raw),
            resolution: Resolution::new(2048, 2048),
        }
    }

    fn soft_shadows(&self, light: LightRef) -> bool {
        self.soft_point && matches!(light, LightRef::Point(_))
    }

    fn record_blur(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        _frame: usize,
        _light: LightRef,
    ) -> Result<()> {
        recorder.compute_barrier(cmd);
        Ok(())
    }
}

struct Bloom;

impl PostProcess for Bloom {
    fn record_blur(
        &self,
        _recorder: &dyn CommandRecorder,
        _cmd: vk::CommandBuffer,
        _frame: usize,
        _horizontal: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn record_composite(
        &self,
        recorder: &dyn CommandRecorder,
        cmd: vk::CommandBuffer,
        _frame: usize,
        _image_index: u32,
    ) -> Result<()> {
        recorder.begin_label(cmd, "composite");
        recorder.end_label(cmd);
        Ok(())
    }
}

// =============================================================================
// TICK LOOP
// =============================================================================

#[test]
fn frame_counter_and_slot_advance_per_tick() {
    let (_device, mut scheduler) = harness(2);
    for expected in 0..5 {
        match scheduler.tick().unwrap() {
            TickOutcome::Presented { frame, .. } => assert_eq!(frame, expected),
            TickOutcome::Skipped => panic!("tick {} skipped", expected),
        }
    }
    assert_eq!(scheduler.frame_counter(), 5);
    assert_eq!(scheduler.current_frame_in_flight(), 1);
}

#[test]
fn update_callback_sees_frame_number_and_slot() {
    let (_device, mut scheduler) = harness(3);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    scheduler.on_update(move |ctx| log.borrow_mut().push((ctx.frame_number, ctx.frame_in_flight)));

    for _ in 0..4 {
        scheduler.tick().unwrap();
    }
    assert_eq!(*seen.borrow(), vec![(0, 0), (1, 1), (2, 2), (3, 0)]);
}

#[test]
fn first_frame_batches_run_in_fixed_order() {
    let (device, mut scheduler) = harness(2);
    scheduler
        .scene()
        .write()
        .add_particle_system(Arc::new(Sparks), Blend::Transparent);

    scheduler.tick().unwrap();
    assert_eq!(
        stages(&device),
        vec![
            Stage::ResourcesInit,
            Stage::PreCompute,
            Stage::Graphics,
            Stage::PostCompute,
            Stage::Debug
        ]
    );
    let submits = device.submits();
    let fenced: Vec<Stage> = submits
        .iter()
        .filter(|batch| batch.fence.is_some())
        .map(|batch| batch.stage)
        .collect();
    assert_eq!(fenced, vec![Stage::Debug]);
    assert_eq!(submits[1].queue, QueueKind::Compute);
    assert_eq!(submits[3].queue, QueueKind::Compute);

    // Resource initialization is waited by the particle batch, exactly once
    let init_signal = submits[0].signals[0];
    assert!(submits[1].waits.iter().any(|wait| wait.semaphore == init_signal));

    device.clear_calls();
    scheduler.tick().unwrap();
    assert_eq!(
        stages(&device),
        vec![Stage::PreCompute, Stage::Graphics, Stage::PostCompute, Stage::Debug]
    );
}

#[test]
fn application_init_is_submitted_and_waited_once() {
    let (device, mut scheduler) = harness(2);
    let pool = device.create_command_pool(QueueKind::Graphics).unwrap();
    let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
    device.begin_commands(cmd).unwrap();
    device.end_commands(cmd).unwrap();

    scheduler.tick().unwrap();
    scheduler.submit_initialization_work(cmd);
    device.clear_calls();
    scheduler.tick().unwrap();

    let graph = scheduler.last_submission().unwrap();
    let init = graph.batch(Stage::ApplicationInit).unwrap();
    assert_eq!(init.command_buffers, vec![cmd]);
    // No particles: the graphics batch runs first and carries the wait
    let graphics = graph.batch(Stage::Graphics).unwrap();
    assert!(graphics.waits.iter().any(|wait| wait.semaphore == init.signals[0]));

    scheduler.tick().unwrap();
    assert!(scheduler.last_submission().unwrap().batch(Stage::ApplicationInit).is_none());
    device.destroy_command_pool(pool);
}

// =============================================================================
// WORKERS & SHADOWS
// =============================================================================

#[test]
fn every_shadow_item_is_recorded_before_the_graphics_submit() {
    let (device, mut scheduler) = harness(2);
    {
        let mut scene = scheduler.scene().write();
        scene.add_object(Arc::new(Mesh { position: Vec3::ZERO }), Blend::Opaque, true);
        scene.set_lights(Some(Arc::new(Rig {
            directional: 4,
            point: 2,
            soft_point: false,
        })));
    }

    scheduler.tick().unwrap();
    let report = scheduler.last_dispatch();
    assert_eq!(report.shadow_maps, 16);
    assert_eq!(report.shadow_blurs, 0);

    let calls = device.calls();
    let graphics_at = calls
        .iter()
        .position(|call| matches!(call, GpuCall::Submit(batch) if batch.stage == Stage::Graphics))
        .unwrap();
    let GpuCall::Submit(graphics) = &calls[graphics_at] else {
        unreachable!()
    };
    assert_eq!(graphics.command_buffers.len(), 17);
    for cmd in &graphics.command_buffers {
        let ended = calls[..graphics_at]
            .iter()
            .any(|call| matches!(call, GpuCall::EndCommands(c) if c == cmd));
        assert!(ended, "{:?} submitted before it was recorded", cmd);
    }

    // Shadow maps come from the worker threads, the main pass does not
    let recorded_on_worker = |cmd: &vk::CommandBuffer| {
        calls.iter().any(|call| match call {
            GpuCall::BeginCommands { cmd: c, thread } => {
                c == cmd && thread.as_deref().is_some_and(|name| name.starts_with("cadence-worker"))
            }
            _ => false,
        })
    };
    assert!(graphics.command_buffers[..16].iter().all(recorded_on_worker));
    assert!(!recorded_on_worker(&graphics.command_buffers[16]));
}

#[test]
fn soft_shadow_blurs_follow_the_maps() {
    let (device, mut scheduler) = harness(2);
    scheduler.scene().write().set_lights(Some(Arc::new(Rig {
        directional: 1,
        point: 2,
        soft_point: true,
    })));

    scheduler.tick().unwrap();
    let report = scheduler.last_dispatch();
    assert_eq!(report.shadow_maps, 13);
    assert_eq!(report.shadow_blurs, 2);

    let graphics = device
        .submits()
        .into_iter()
        .find(|batch| batch.stage == Stage::Graphics)
        .unwrap();
    assert_eq!(graphics.command_buffers.len(), 16);
    // Blur buffers record a compute barrier, maps do not
    let calls = device.calls();
    let blurred: Vec<bool> = graphics.command_buffers[..15]
        .iter()
        .map(|cmd| calls.iter().any(|call| matches!(call, GpuCall::ComputeBarrier(c) if c == cmd)))
        .collect();
    assert_eq!(blurred[..13], [false; 13]);
    assert_eq!(blurred[13..], [true, true]);
}

#[test]
fn worker_failure_aborts_the_tick_before_submission() {
    let (device, mut scheduler) = harness(2);
    {
        let mut scene = scheduler.scene().write();
        scene.add_shadowable(Arc::new(BrokenCaster));
        scene.set_lights(Some(Arc::new(Rig {
            directional: 2,
            point: 0,
            soft_point: false,
        })));
    }

    let err = scheduler.tick().unwrap_err();
    assert!(format!("{:#}", err).contains("pipeline missing"));
    assert_eq!(device.submits().len(), 0);
}

#[test]
fn bloom_passes_are_separated_by_compute_barriers() {
    let (device, mut scheduler) = harness(2);
    scheduler.set_bloom_passes(4);
    scheduler.scene().write().set_postprocess(Some(Arc::new(Bloom)));

    scheduler.tick().unwrap();
    assert_eq!(count(&device, |call| matches!(call, GpuCall::ComputeBarrier(_))), 4);
    assert_eq!(count(&device, |call| matches!(call, GpuCall::ClearColor { .. })), 0);
}

#[test]
fn animation_updates_are_joined_before_the_main_pass_records() {
    let (device, mut scheduler) = harness(2);
    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let mut scene = scheduler.scene().write();
        for _ in 0..2 {
            let walker = Walker {
                events: events.clone(),
                fail: false,
            };
            scene.add_animated_object(Arc::new(walker), Blend::Opaque, true);
        }
    }

    scheduler.tick().unwrap();
    scheduler.tick().unwrap();
    assert_eq!(scheduler.last_dispatch().animations, 2);
    assert_eq!(
        *events.lock(),
        vec!["animate 0", "animate 0", "draw 0", "draw 0", "animate 1", "animate 1", "draw 1", "draw 1"]
    );
    assert_eq!(stages(&device).iter().filter(|stage| **stage == Stage::Graphics).count(), 2);
}

#[test]
fn animation_failure_aborts_the_tick_before_submission() {
    let (device, mut scheduler) = harness(2);
    let events = Arc::new(Mutex::new(Vec::new()));
    let walker = Walker {
        events: events.clone(),
        fail: true,
    };
    scheduler
        .scene()
        .write()
        .add_animated_object(Arc::new(walker), Blend::Opaque, false);

    let err = scheduler.tick().unwrap_err();
    assert!(format!("{:#}", err).contains("skeleton missing"));
    assert!(events.lock().is_empty());
    assert_eq!(device.submits().len(), 0);
}

// =============================================================================
// BARRIERS
// =============================================================================

#[test]
fn swapchain_barriers_chain_to_their_semaphore_waits() {
    for bloom in [false, true] {
        let (device, mut scheduler) = harness(2);
        if bloom {
            scheduler.scene().write().set_postprocess(Some(Arc::new(Bloom)));
        }
        let TickOutcome::Presented { image_index, .. } = scheduler.tick().unwrap() else {
            panic!("tick skipped");
        };
        let image = scheduler.presenter().images()[image_index as usize].image;
        let graph = scheduler.last_submission().unwrap();

        // Nothing touches the image outside the two batches that own it
        let post = graph.batch(Stage::PostCompute).unwrap();
        let overlay = graph.batch(Stage::Debug).unwrap();
        for batch in graph.batches() {
            if batch.stage != Stage::PostCompute && batch.stage != Stage::Debug {
                for cmd in &batch.command_buffers {
                    assert!(transitions_of(&device, *cmd, image).is_empty());
                }
            }
        }

        // First wait of the post-compute batch is the acquire semaphore
        let acquire_wait = post.waits[0];
        let first = transitions_of(&device, post.command_buffers[0], image)[0];
        assert_eq!(first.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(first.new_layout, vk::ImageLayout::GENERAL);
        assert!(acquire_wait.stage.contains(first.src_stage));

        let gui_wait = overlay.waits[0];
        let to_attachment = transitions_of(&device, overlay.command_buffers[0], image)[0];
        assert_eq!(to_attachment.old_layout, vk::ImageLayout::GENERAL);
        assert!(to_attachment.src_stage.intersects(gui_wait.stage));
    }
}

#[test]
fn shared_depth_is_fenced_off_between_main_passes() {
    let (device, mut scheduler) = harness(2);
    let depth = scheduler.targets().depth().unwrap().image;

    for _ in 0..2 {
        device.clear_calls();
        scheduler.tick().unwrap();
        let graph = scheduler.last_submission().unwrap();
        let main = *graph.batch(Stage::Graphics).unwrap().command_buffers.last().unwrap();

        let calls = device.calls();
        let barrier_at = calls
            .iter()
            .position(|call| match call {
                GpuCall::Barrier { cmd, transitions } => {
                    *cmd == main && transitions.iter().any(|t| t.image == depth)
                }
                _ => false,
            })
            .unwrap();
        let rendering_at = calls
            .iter()
            .position(|call| matches!(call, GpuCall::BeginRendering { cmd, .. } if *cmd == main))
            .unwrap();
        assert!(barrier_at < rendering_at);

        let transition = transitions_of(&device, main, depth)[0];
        assert!(transition.src_access.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert!(transition.dst_stage.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
    }
}

// =============================================================================
// DEFERRED RELEASE
// =============================================================================

#[test]
fn removed_object_outlives_the_frames_that_used_it() {
    let (_device, mut scheduler) = harness(2);
    let mesh = Arc::new(Mesh { position: Vec3::ONE });
    let weak: Weak<Mesh> = Arc::downgrade(&mesh);
    let id = scheduler.scene().write().add_object(mesh, Blend::Transparent, true);

    for _ in 0..3 {
        scheduler.tick().unwrap();
    }

    // Removed while recording frame 3, which uses slot 1
    assert!(scheduler.scene().write().remove(id));
    scheduler.tick().unwrap();
    assert!(scheduler.deferred().contains(1, id));
    assert!(weak.upgrade().is_some());

    scheduler.tick().unwrap();
    assert!(scheduler.deferred().contains(1, id));
    assert!(weak.upgrade().is_some());

    // Frame 5 waits slot 1's fence, then releases
    scheduler.tick().unwrap();
    assert_eq!(scheduler.deferred().pending(1), 0);
    assert!(weak.upgrade().is_none());
}

// =============================================================================
// RESET
// =============================================================================

#[test]
fn out_of_date_acquire_restarts_without_waiting_the_fence_twice() {
    let (device, mut scheduler) = harness(2);
    let resets = Rc::new(RefCell::new(Vec::new()));
    let log = resets.clone();
    scheduler.on_reset(move |resolution| log.borrow_mut().push(resolution));

    scheduler.tick().unwrap();
    device.clear_calls();
    scheduler.presenter_mut().script_acquire(AcquireOutcome::OutOfDate);

    assert!(matches!(scheduler.tick().unwrap(), TickOutcome::Presented { frame: 1, .. }));
    assert_eq!(count(&device, |call| matches!(call, GpuCall::WaitFence(_))), 1);
    assert_eq!(count(&device, |call| matches!(call, GpuCall::ResetFence(_))), 1);
    assert_eq!(scheduler.presenter().recreations(), &[Resolution::new(640, 480)]);
    assert_eq!(*resets.borrow(), vec![Resolution::new(640, 480)]);
}

#[test]
fn persistent_out_of_date_skips_the_tick() {
    let (device, mut scheduler) = harness(2);
    for _ in 0..4 {
        scheduler.presenter_mut().script_acquire(AcquireOutcome::OutOfDate);
    }

    assert_eq!(scheduler.tick().unwrap(), TickOutcome::Skipped);
    assert_eq!(scheduler.frame_counter(), 0);
    assert_eq!(scheduler.presenter().recreations().len(), 4);
    assert_eq!(device.submits().len(), 0);

    // Same slot again; its fence is already reset
    device.clear_calls();
    assert!(matches!(scheduler.tick().unwrap(), TickOutcome::Presented { frame: 0, .. }));
    assert_eq!(count(&device, |call| matches!(call, GpuCall::WaitFence(_))), 0);
}

#[test]
fn suboptimal_present_resets_on_the_next_tick() {
    let (_device, mut scheduler) = harness(2);
    scheduler.presenter_mut().script_present(PresentOutcome::Suboptimal);

    scheduler.tick().unwrap();
    assert!(scheduler.presenter().recreations().is_empty());
    scheduler.tick().unwrap();
    assert_eq!(scheduler.presenter().recreations(), &[Resolution::new(640, 480)]);
}

#[test]
fn resize_rebuilds_targets_and_reports_new_size() {
    let (device, mut scheduler) = harness(2);
    let resets = Rc::new(RefCell::new(Vec::new()));
    let log = resets.clone();
    scheduler.on_reset(move |resolution| log.borrow_mut().push(resolution));
    scheduler.tick().unwrap();

    scheduler.request_resize(Resolution::new(0, 0));
    assert_eq!(scheduler.tick().unwrap(), TickOutcome::Skipped);
    assert!(scheduler.is_minimized());
    assert!(resets.borrow().is_empty());

    scheduler.request_resize(Resolution::new(1024, 768));
    assert!(matches!(scheduler.tick().unwrap(), TickOutcome::Presented { .. }));
    assert!(!scheduler.is_minimized());
    assert_eq!(*resets.borrow(), vec![Resolution::new(1024, 768)]);
    assert_eq!(scheduler.targets().resolution(), Resolution::new(1024, 768));
    // 2 slots x 3 images + depth, nothing leaked from the first size
    assert_eq!(device.live_attachments(), 7);
}

// =============================================================================
// FAILURE & SHUTDOWN
// =============================================================================

#[test]
fn submit_failure_is_reported() {
    let (device, mut scheduler) = harness(2);
    scheduler.tick().unwrap();
    device.inject_submit_failure();
    let err = scheduler.tick().unwrap_err();
    assert!(format!("{:#}", err).contains("DEVICE_LOST"));
}

#[test]
fn shutdown_drains_before_releasing() {
    let (device, mut scheduler) = harness(3);
    scheduler.scene().write().add_object(Arc::new(Mesh { position: Vec3::ZERO }), Blend::Opaque, false);
    scheduler.tick().unwrap();
    scheduler.tick().unwrap();
    device.clear_calls();

    scheduler.shutdown().unwrap();
    let calls = device.calls();
    assert!(matches!(calls.first(), Some(GpuCall::WaitIdle)));
    assert_eq!(device.live_fences(), 0);
    assert_eq!(device.live_semaphores(), 0);
    assert_eq!(device.live_attachments(), 0);

    // Second call is a no-op
    device.clear_calls();
    scheduler.shutdown().unwrap();
    assert!(device.calls().is_empty());
}
