//! TOML configuration file loading
//!
//! Supports `~/.config/omni/hark/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::supervisor::SupervisorConfig;
use crate::voice::VadConfig;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HarkConfigFile {
    /// Settings endpoint URL
    pub settings_url: Option<String>,

    /// Trigger delivery URL
    pub trigger_url: Option<String>,

    /// Seconds between settings polls
    pub poll_interval_secs: Option<u64>,

    /// Settings request timeout in milliseconds
    pub poll_timeout_ms: Option<u64>,

    /// Trigger request timeout in milliseconds
    pub dispatch_timeout_ms: Option<u64>,

    /// Directory holding recorded keyword samples
    pub template_dir: Option<PathBuf>,

    /// PID file location
    pub pid_file: Option<PathBuf>,

    /// Capture configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Listener defaults used until the endpoint answers
    #[serde(default)]
    pub listener: ListenerFileConfig,

    /// Voice activity gate tuning
    pub vad: Option<VadConfig>,

    /// Restart policy
    pub supervisor: Option<SupervisorConfig>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Preferred capture rate in Hz
    pub sample_rate: Option<u32>,

    /// Frame duration in milliseconds
    pub frame_ms: Option<u32>,

    /// Milliseconds without audio before the stream counts as lost
    pub stall_timeout_ms: Option<u64>,
}

/// Listener defaults
#[derive(Debug, Default, Deserialize)]
pub struct ListenerFileConfig {
    pub enabled: Option<bool>,
    pub keyword: Option<String>,
    pub sensitivity: Option<f32>,
    pub device_index: Option<usize>,
    pub cooldown_ms: Option<u64>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path is
/// tried and a missing or unparseable file falls back to defaults.
///
/// # Errors
///
/// Returns error if an explicit path cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<HarkConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(HarkConfigFile::default());
    };

    if !path.exists() {
        return Ok(HarkConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(HarkConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(HarkConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/omni/hark/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("hark")
            .join("config.toml")
    })
}
