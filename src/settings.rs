//! Live listener settings
//!
//! The settings endpoint owns these values; the poller merges each response
//! over the last snapshot and swaps it in whole. Pipeline stages load the
//! current snapshot without locking and keep using it for in-flight frames.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::voice::template::normalize_keyword;
use crate::{Error, Result};

/// Keyword used until the endpoint provides one
pub const DEFAULT_KEYWORD: &str = "hey hark";

/// Sensitivity used until the endpoint provides one, and for NaN inputs
pub const DEFAULT_SENSITIVITY: f32 = 0.5;

/// Cooldown between dispatched triggers
pub const DEFAULT_COOLDOWN_MS: u64 = 2000;

/// Listener settings snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Whether the listener should capture and evaluate audio
    pub enabled: bool,

    /// Wake phrase
    pub keyword: String,

    /// Detection sensitivity, 0.0 (strict) to 1.0 (lenient)
    pub sensitivity: f32,

    /// Input device index, `None` for the system default
    pub device_index: Option<usize>,

    /// Minimum gap between dispatched triggers
    pub cooldown_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyword: DEFAULT_KEYWORD.to_string(),
            sensitivity: DEFAULT_SENSITIVITY,
            device_index: None,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

impl ListenerConfig {
    /// Sensitivity clamped to `[0, 1]`
    #[must_use]
    pub fn clamped_sensitivity(&self) -> f32 {
        clamp_sensitivity(self.sensitivity)
    }

    /// Cooldown as a duration
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Clamp a sensitivity into `[0, 1]`, mapping NaN to the default
#[must_use]
pub fn clamp_sensitivity(value: f32) -> f32 {
    if value.is_nan() {
        DEFAULT_SENSITIVITY
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Partial settings update parsed from an endpoint response
///
/// `None` means "keep the last known value". For the device index,
/// `Some(None)` selects the system default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    /// `wakeword_enabled`
    pub enabled: Option<bool>,
    /// `wakeword_keyword`, already normalised
    pub keyword: Option<String>,
    /// `wakeword_sensitivity`, clamped to `[0, 1]`
    pub sensitivity: Option<f32>,
    /// `wakeword_device_index`; null or negative selects the default device
    pub device_index: Option<Option<usize>>,
    /// `wakeword_cooldown_ms`
    pub cooldown_ms: Option<u64>,
}

impl SettingsPatch {
    /// Parse an endpoint response body
    ///
    /// Unknown keys are ignored and keys with an unexpected type are skipped
    /// individually.
    ///
    /// # Errors
    ///
    /// Returns `ConfigFetch` if the body is not a JSON object
    pub fn from_json(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::ConfigFetch(format!("malformed settings json: {e}")))?;

        let Value::Object(map) = value else {
            return Err(Error::ConfigFetch(
                "settings response is not a json object".to_string(),
            ));
        };

        let mut patch = Self::default();

        if let Some(v) = map.get("wakeword_enabled") {
            match v.as_bool() {
                Some(b) => patch.enabled = Some(b),
                None => tracing::debug!(key = "wakeword_enabled", "ignoring setting with unexpected type"),
            }
        }

        if let Some(v) = map.get("wakeword_keyword") {
            match v.as_str().map(normalize_keyword) {
                Some(k) if !k.is_empty() => patch.keyword = Some(k),
                _ => tracing::debug!(key = "wakeword_keyword", "ignoring empty or non-string keyword"),
            }
        }

        if let Some(v) = map.get("wakeword_sensitivity") {
            match v.as_f64() {
                #[allow(clippy::cast_possible_truncation)]
                Some(s) => patch.sensitivity = Some(clamp_sensitivity(s as f32)),
                None => tracing::debug!(key = "wakeword_sensitivity", "ignoring setting with unexpected type"),
            }
        }

        if let Some(v) = map.get("wakeword_device_index") {
            match v {
                Value::Null => patch.device_index = Some(None),
                Value::Number(n) => match n.as_i64() {
                    // Negative indices select the system default
                    Some(i) if i < 0 => patch.device_index = Some(None),
                    Some(i) => patch.device_index = usize::try_from(i).ok().map(Some),
                    None => tracing::debug!(key = "wakeword_device_index", "ignoring non-integer device index"),
                },
                _ => tracing::debug!(key = "wakeword_device_index", "ignoring setting with unexpected type"),
            }
        }

        if let Some(v) = map.get("wakeword_cooldown_ms") {
            match v.as_u64() {
                Some(ms) => patch.cooldown_ms = Some(ms),
                None => tracing::debug!(key = "wakeword_cooldown_ms", "ignoring setting with unexpected type"),
            }
        }

        Ok(patch)
    }

    /// Merge this patch over `base`
    #[must_use]
    pub fn apply(&self, base: &ListenerConfig) -> ListenerConfig {
        ListenerConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            keyword: self.keyword.clone().unwrap_or_else(|| base.keyword.clone()),
            sensitivity: self.sensitivity.unwrap_or(base.sensitivity),
            device_index: self.device_index.unwrap_or(base.device_index),
            cooldown_ms: self.cooldown_ms.unwrap_or(base.cooldown_ms),
        }
    }
}

/// Shared handle to the listener settings
pub type SharedSettings = Arc<Settings>;

/// Process-wide listener settings with atomic snapshot swap
pub struct Settings {
    current: ArcSwap<ListenerConfig>,
    revision: watch::Sender<u64>,
}

impl Settings {
    /// Create settings seeded with `initial`
    #[must_use]
    pub fn new(initial: ListenerConfig) -> Self {
        let mut initial = initial;
        initial.sensitivity = initial.clamped_sensitivity();
        let (revision, _) = watch::channel(0);
        Self {
            current: ArcSwap::from_pointee(initial),
            revision,
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<ListenerConfig> {
        self.current.load_full()
    }

    /// Replace the snapshot, returning whether anything changed
    pub fn replace(&self, mut next: ListenerConfig) -> bool {
        next.sensitivity = next.clamped_sensitivity();
        if *self.current.load_full() == next {
            return false;
        }

        tracing::info!(
            enabled = next.enabled,
            keyword = %next.keyword,
            sensitivity = next.sensitivity,
            device_index = ?next.device_index,
            cooldown_ms = next.cooldown_ms,
            "listener settings updated"
        );

        self.current.store(Arc::new(next));
        self.revision.send_modify(|r| *r += 1);
        true
    }

    /// Merge a patch over the current snapshot
    pub fn apply(&self, patch: &SettingsPatch) -> bool {
        let next = patch.apply(&self.current.load());
        self.replace(next)
    }

    /// Number of snapshot replacements so far
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Subscribe to snapshot replacements
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("current", &self.current.load())
            .field("revision", &self.revision())
            .finish()
    }
}
