//! Configuration management for the hark listener
//!
//! Static configuration is layered: defaults, then the TOML file, then
//! `HARK_*` environment variables, then CLI flags (applied by the binary).
//! Live listener settings are owned by the settings endpoint instead.

mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use file::{HarkConfigFile, config_file_path, load_config_file};

use crate::settings::ListenerConfig;
use crate::supervisor::SupervisorConfig;
use crate::voice::{DEFAULT_FRAME_MS, SAMPLE_RATE, VadConfig};
use crate::{Error, Result};

/// Default settings endpoint
pub const DEFAULT_SETTINGS_URL: &str = "http://127.0.0.1:5000/api/settings";

/// Default trigger endpoint
pub const DEFAULT_TRIGGER_URL: &str = "http://127.0.0.1:5000/api/wake";

/// Listener configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Settings endpoint polled for live listener settings
    pub settings_url: String,

    /// Endpoint wake triggers are POSTed to
    pub trigger_url: String,

    /// Time between settings polls
    pub poll_interval: Duration,

    /// Settings request timeout
    pub poll_timeout: Duration,

    /// Trigger request timeout
    pub dispatch_timeout: Duration,

    /// Triggers buffered ahead of the dispatcher
    pub dispatch_queue: usize,

    /// Capture configuration
    pub audio: AudioConfig,

    /// Voice activity gate tuning
    pub vad: VadConfig,

    /// Restart policy
    pub supervisor: SupervisorConfig,

    /// Listener settings used until the endpoint answers
    pub listener: ListenerConfig,

    /// Directory holding recorded keyword samples
    pub template_dir: Option<PathBuf>,

    /// PID file enforcing a single instance
    pub pid_path: PathBuf,
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Preferred capture rate in Hz
    pub sample_rate: u32,

    /// Frame duration in milliseconds
    pub frame_ms: u32,

    /// Silence from the backend tolerated before the stream counts as lost
    pub stall_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_ms: DEFAULT_FRAME_MS,
            stall_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_url: DEFAULT_SETTINGS_URL.to_string(),
            trigger_url: DEFAULT_TRIGGER_URL.to_string(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(2),
            dispatch_timeout: Duration::from_secs(1),
            dispatch_queue: 8,
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            supervisor: SupervisorConfig::default(),
            listener: ListenerConfig::default(),
            template_dir: default_template_dir(),
            pid_path: default_pid_path(),
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or the
    /// result is invalid
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = load_config_file(config_path)?;
        let mut config = Self::from_file(file);
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay a config file on the defaults
    #[must_use]
    pub fn from_file(file: HarkConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(url) = file.settings_url {
            config.settings_url = url;
        }
        if let Some(url) = file.trigger_url {
            config.trigger_url = url;
        }
        if let Some(secs) = file.poll_interval_secs {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = file.poll_timeout_ms {
            config.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.dispatch_timeout_ms {
            config.dispatch_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = file.template_dir {
            config.template_dir = Some(dir);
        }
        if let Some(path) = file.pid_file {
            config.pid_path = path;
        }

        if let Some(rate) = file.audio.sample_rate {
            config.audio.sample_rate = rate;
        }
        if let Some(ms) = file.audio.frame_ms {
            config.audio.frame_ms = ms;
        }
        if let Some(ms) = file.audio.stall_timeout_ms {
            config.audio.stall_timeout = Duration::from_millis(ms);
        }

        let listener = file.listener;
        if let Some(enabled) = listener.enabled {
            config.listener.enabled = enabled;
        }
        if let Some(keyword) = listener.keyword {
            config.listener.keyword = keyword;
        }
        if let Some(sensitivity) = listener.sensitivity {
            config.listener.sensitivity = sensitivity;
        }
        if let Some(index) = listener.device_index {
            config.listener.device_index = Some(index);
        }
        if let Some(ms) = listener.cooldown_ms {
            config.listener.cooldown_ms = ms;
        }

        if let Some(vad) = file.vad {
            config.vad = vad;
        }
        if let Some(supervisor) = file.supervisor {
            config.supervisor = supervisor;
        }

        config
    }

    /// Apply `HARK_*` environment overrides read through `lookup`
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("HARK_SETTINGS_URL") {
            self.settings_url = url;
        }
        if let Some(url) = lookup("HARK_TRIGGER_URL") {
            self.trigger_url = url;
        }
        if let Some(secs) = parse_env::<u64>(&lookup, "HARK_POLL_INTERVAL_SECS") {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(keyword) = lookup("HARK_KEYWORD") {
            self.listener.keyword = keyword;
        }
        if let Some(index) = parse_env::<usize>(&lookup, "HARK_DEVICE") {
            self.listener.device_index = Some(index);
        }
        if let Some(dir) = lookup("HARK_TEMPLATE_DIR") {
            self.template_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("HARK_PID_FILE") {
            self.pid_path = PathBuf::from(path);
        }
    }

    /// Check invariants the runtime relies on
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        if self.audio.sample_rate == 0 || self.audio.frame_ms == 0 {
            return Err(Error::Config(
                "sample rate and frame duration must be positive".to_string(),
            ));
        }
        if self.audio.stall_timeout.is_zero() {
            return Err(Error::Config("stall timeout must be positive".to_string()));
        }
        for url in [&self.settings_url, &self.trigger_url] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!("not an http url: {url}")));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// Recorded keyword samples: `~/.local/share/omni/hark/keywords` on Linux
fn default_template_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "omni")
        .map(|d| d.data_dir().join("hark").join("keywords"))
}

/// PID file under the runtime dir, else the data dir
fn default_pid_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "omni", "omni").map_or_else(
        || std::env::temp_dir().join("hark.pid"),
        |d| {
            d.runtime_dir()
                .map_or_else(|| d.data_dir().join("hark"), |dir| dir.join("hark"))
                .join("hark.pid")
        },
    )
}
