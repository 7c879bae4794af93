//! Voice processing module
//!
//! Handles audio capture, framing, voice activity gating, keyword matching
//! and trigger debouncing.

mod capture;
mod debounce;
pub mod dtw;
pub mod features;
mod frame;
pub mod template;
mod vad;
mod wake_word;

pub use capture::{AudioSource, AudioStream, CpalSource, CpalStream, SAMPLE_RATE, list_input_devices};
pub use debounce::{DebounceController, DebouncePhase};
pub use frame::{AudioFrame, DEFAULT_FRAME_MS, FrameSegmenter, frame_len};
pub use template::{KeywordTemplate, TemplateSource};
pub use vad::{Activity, VadConfig, VoiceActivityGate};
pub use wake_word::{DetectionEvent, WakeWordEvaluator, confidence_from_cost, threshold_for};
