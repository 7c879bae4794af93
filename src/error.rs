//! Error types for the hark listener

use thiserror::Error;

/// Result type alias for listener operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the listener
#[derive(Debug, Error)]
pub enum Error {
    /// No usable input device (missing, out of range, or access denied)
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The audio stream failed after it was opened
    #[error("audio stream error: {0}")]
    Stream(String),

    /// Settings endpoint unreachable or returned an unusable body
    #[error("config fetch error: {0}")]
    ConfigFetch(String),

    /// Trigger could not be delivered to the assistant
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// Static configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Keyword template could not be derived
    #[error("template error: {0}")]
    Template(String),

    /// Another listener instance holds the lock
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(u32),

    /// Supervisor gave up restarting the audio source
    #[error("audio restarts exhausted after {attempts} attempts: {last}")]
    RestartsExhausted {
        /// Consecutive failed attempts
        attempts: u32,
        /// Last error observed
        last: String,
    },

    /// Service manager error
    #[error("service error: {0}")]
    Service(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether the supervisor should reopen the audio source after this error
    #[must_use]
    pub const fn is_restartable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable(_) | Self::Stream(_))
    }
}
