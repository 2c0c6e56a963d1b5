// =============================================================================
// CADENCE DEMO - Frame scheduler driving a real window
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop                                               │
// │    └── FrameScheduler (one tick per redraw)                     │
// │          ├── VulkanDevice (graphics + compute queue)            │
// │          ├── Swapchain (owns the surface)                       │
// │          └── Scene (shared with the update callback)            │
// └─────────────────────────────────────────────────────────────────┘
//
// The scene starts empty, so every frame is the clear color run through the
// full batch chain. config.toml is watched: fps and bloom settings apply live.
//
// =============================================================================

use anyhow::{Context, Result};
use cadence::backend::{Resolution, Swapchain, VulkanDevice};
use cadence::config::{Config, ConfigWatcher};
use cadence::frame::{FrameScheduler, SchedulerSettings, TickOutcome};
use cadence::scene::Scene;
use glam::Vec3;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const CONFIG_PATH: &str = "config.toml";

type Scheduler = FrameScheduler<VulkanDevice, Swapchain>;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config)?;
    log::info!("Starting Cadence");
    log::info!(
        "Window: {}x{} ({}), {} frames in flight",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" },
        config.graphics.max_frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, optionally into `debug.log_file`
fn init_logging(config: &Config) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level());
    // RUST_LOG still wins
    builder.parse_default_env();

    if config.debug.log_to_file {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        writeln!(file, "=== Cadence Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init()?;
    Ok(())
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The scheduler owns the surface,
/// so it must go before the window.
struct App {
    config: Config,
    watcher: Option<ConfigWatcher>,
    scheduler: Option<Scheduler>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // FPS TRACKING
    last_title_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let watcher = ConfigWatcher::new(CONFIG_PATH)
            .map_err(|e| log::warn!("Config hot reload disabled: {:#}", e))
            .ok();
        Self {
            config,
            watcher,
            scheduler: None,
            window: None,
            is_fullscreen,
            last_title_update: Instant::now(),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&self, window: &Window) -> Result<Scheduler> {
        log::info!("Initializing Vulkan...");

        let display_handle = window.display_handle().context("Failed to get display handle")?.as_raw();
        let window_handle = window.window_handle().context("Failed to get window handle")?.as_raw();

        // Validation only in debug builds
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let surface_extensions = ash_window::enumerate_required_extensions(display_handle)?;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, surface_extensions)?;

        let surface = unsafe {
            ash_window::create_surface(&device.entry, &device.instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;
        let surface_loader = ash::khr::surface::Instance::new(&device.entry, &device.instance);

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            surface_loader,
            Resolution::new(size.width, size.height),
            self.config.get_present_mode(),
        )?;

        let scene = Scene::shared();
        let mut scheduler = FrameScheduler::new(
            device,
            swapchain,
            scene,
            SchedulerSettings::from_config(&self.config),
        )?;

        // Orbit the camera so transparent sorting has something to do
        scheduler.on_update(|ctx| {
            let t = ctx.frame_number as f32 * 0.01;
            ctx.scene.set_camera_eye(Vec3::new(t.cos() * 5.0, 2.0, t.sin() * 5.0));
        });
        scheduler.on_reset(|resolution| {
            log::debug!("Output is now {}x{}", resolution.width, resolution.height);
        });

        log::info!("Vulkan initialized successfully!");
        Ok(scheduler)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows triggers the reset
        }
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    fn poll_config(&mut self) {
        let Some(config) = self.watcher.as_ref().and_then(ConfigWatcher::poll) else {
            return;
        };
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.apply_frame_config(&config.frame);
        }
        self.config.frame = config.frame;
        self.config.debug.show_fps = config.debug.show_fps;
    }

    fn update_title(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let (Some(window), Some(scheduler)) = (&self.window, &self.scheduler) else {
            return;
        };

        // Update title every second
        if self.last_title_update.elapsed().as_secs_f32() < 1.0 {
            return;
        }
        self.last_title_update = Instant::now();

        let fps = scheduler.fps();
        let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
        window.set_title(&format!(
            "{} - {:.0} FPS ({:.0} unlimited) [{}]",
            self.config.window.title, fps.limited, fps.real, mode
        ));
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match self.init_vulkan(&window) {
            Ok(scheduler) => self.scheduler = Some(scheduler),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
                return;
            }
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.request_resize(Resolution::new(size.width, size.height));
                }
            }

            WindowEvent::RedrawRequested => {
                self.poll_config();
                let Some(scheduler) = self.scheduler.as_mut() else {
                    return;
                };
                match scheduler.tick() {
                    Ok(TickOutcome::Presented { .. }) => self.update_title(),
                    Ok(TickOutcome::Skipped) => {}
                    Err(e) => {
                        log::error!("Frame failed: {:?}", e);
                        event_loop.exit();
                    }
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Continuous redraws; pacing happens inside the scheduler.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up...");
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.shutdown() {
                log::error!("Shutdown failed: {:?}", e);
            }
        }
        log::info!("Cleanup complete");
    }
}
