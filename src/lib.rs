//! Hark - resident wake-word listener for a local assistant
//!
//! Continuously samples the microphone, gates it on voice activity, matches
//! speech against the configured wake phrase and notifies the assistant
//! process when it hears it. Listener settings are polled from the
//! assistant's settings endpoint and applied without a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   chunks   ┌──────────────────────────────────────────┐
//! │ Audio Source ├───────────►│ Pipeline                                 │
//! │ (cpal thread)│            │ frames → VAD → keyword DTW → debounce    │
//! └──────────────┘            └───────────────────┬──────────────────────┘
//!        ▲ open/close                             │ triggers
//! ┌──────┴───────┐  snapshot  ┌──────────────┐    ▼
//! │  Supervisor  │◄───────────┤   Settings   │  ┌────────────┐
//! └──────────────┘            └──────▲───────┘  │ Dispatcher ├──► assistant
//!                                    │          └────────────┘
//!                             ┌──────┴───────┐
//!                             │    Poller    │◄── settings endpoint
//!                             └──────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod lifecycle;
pub mod pipeline;
pub mod poller;
pub mod settings;
pub mod supervisor;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use settings::{ListenerConfig, Settings, SettingsPatch, SharedSettings};
