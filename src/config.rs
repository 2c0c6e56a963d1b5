// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults, so a partial (or missing) file is
// fine. `ConfigWatcher` re-reads the file when it changes; only the frame
// pacing and bloom settings are applied live, the rest needs a restart.

use anyhow::{bail, Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub frame: FrameConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Cadence".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Per-frame scheduling settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameConfig {
    /// 0 = unlimited
    pub desired_fps: u32,
    /// 0 = one per core
    pub worker_threads: usize,
    pub bloom_passes: u32,
    pub depth_bias_constant: f32,
    pub depth_bias_slope: f32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            desired_fps: 60,
            worker_threads: 0,
            bloom_passes: 10,
            depth_bias_constant: 1.25,
            depth_bias_slope: 1.75,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "cadence.log".to_string(),
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let frames = self.graphics.max_frames_in_flight;
        if !(1..=4).contains(&frames) {
            bail!("graphics.max_frames_in_flight must be between 1 and 4, got {}", frames);
        }
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    /// `log::LevelFilter` from `debug.log_level`, `Info` when unknown.
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

/// Watches the config file and hands out freshly parsed configs.
pub struct ConfigWatcher {
    path: PathBuf,
    events: Receiver<notify::Result<Event>>,
    // Dropping the watcher stops the notifications
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .context("Failed to create config watcher")?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", path))?;
        log::info!("Watching {:?} for changes", path);
        Ok(Self {
            path,
            events: rx,
            _watcher: watcher,
        })
    }

    /// Non-blocking. Returns the new config when the file changed and parses;
    /// a broken edit is logged and skipped.
    pub fn poll(&self) -> Option<Config> {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(Ok(event)) => {
                    changed |= matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
                }
                Ok(Err(e)) => log::warn!("Config watcher error: {}", e),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if !changed {
            return None;
        }
        match Config::load_from_path(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring config change: {:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            [frame]
            desired_fps = 144
            "#,
        )
        .unwrap();
        assert_eq!(config.frame.desired_fps, 144);
        assert_eq!(config.frame.bloom_passes, FrameConfig::default().bloom_passes);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
    }

    #[test]
    fn frames_in_flight_out_of_range_is_rejected() {
        assert!(Config::parse("[graphics]\nmax_frames_in_flight = 0").is_err());
        assert!(Config::parse("[graphics]\nmax_frames_in_flight = 5").is_err());
        assert!(Config::parse("[graphics]\nmax_frames_in_flight = 3").is_ok());
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync-ish".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        config.graphics.present_mode = "Immediate".to_string();
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn log_level_parses_or_defaults() {
        let mut config = Config::default();
        config.debug.log_level = "trace".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Trace);
        config.debug.log_level = "chatty".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.frame, FrameConfig::default());
    }
}
