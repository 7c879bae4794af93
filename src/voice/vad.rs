//! Voice activity gate
//!
//! Cheap per-frame energy classifier in front of the wake word evaluator.
//! A frame is raw speech when its RMS clears both an absolute floor and a
//! multiple of the adaptive noise floor; the gate reports speech while the
//! majority of the last `window` raw decisions are speech. Short pauses
//! inside an utterance are bridged by the caller using `hangover_ms`.

use std::collections::VecDeque;

use serde::Deserialize;

use super::AudioFrame;

/// How quickly the noise floor follows non-speech frames
const NOISE_ADAPT_RATE: f32 = 0.05;

/// Gate decision for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Stream is currently speaking
    Speech,
    /// Silence or background noise
    NonSpeech,
}

/// Voice activity gate tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Frames in the rolling majority window
    pub window: usize,

    /// Absolute RMS floor (raw i16 units) below which a frame is never speech
    pub energy_floor: f32,

    /// Required ratio of frame RMS to the adaptive noise floor
    pub noise_ratio: f32,

    /// Silence tolerated inside an utterance before it counts as ended
    pub hangover_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            window: 5,
            energy_floor: 500.0,
            noise_ratio: 3.0,
            hangover_ms: 300,
        }
    }
}

/// Rolling-majority energy gate
#[derive(Debug)]
pub struct VoiceActivityGate {
    config: VadConfig,
    history: VecDeque<bool>,
    noise_floor: Option<f32>,
    speaking: bool,
    voiced: bool,
}

impl VoiceActivityGate {
    /// Create a gate
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        let window = config.window.max(1);
        Self {
            config: VadConfig { window, ..config },
            history: VecDeque::with_capacity(window),
            noise_floor: None,
            speaking: false,
            voiced: false,
        }
    }

    /// Classify one frame, updating the rolling window
    pub fn classify(&mut self, frame: &AudioFrame) -> Activity {
        let energy = frame.rms();
        let raw = energy > self.threshold();
        self.voiced = raw;

        if !raw {
            self.noise_floor = Some(match self.noise_floor {
                None => energy,
                Some(floor) => floor + (energy - floor) * NOISE_ADAPT_RATE,
            });
        }

        if self.history.len() == self.config.window {
            self.history.pop_front();
        }
        self.history.push_back(raw);

        let votes = self.history.iter().filter(|&&v| v).count();
        let speaking = votes * 2 > self.config.window;

        if speaking != self.speaking {
            tracing::trace!(
                seq = frame.seq(),
                energy,
                noise_floor = self.noise_floor,
                speaking,
                "voice activity changed"
            );
            self.speaking = speaking;
        }

        if speaking {
            Activity::Speech
        } else {
            Activity::NonSpeech
        }
    }

    /// Energy a frame must exceed to count as raw speech
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.noise_floor.map_or(self.config.energy_floor, |floor| {
            (floor * self.config.noise_ratio).max(self.config.energy_floor)
        })
    }

    /// Whether the last classified frame was inside speech
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Whether the last classified frame cleared the energy threshold on its own
    #[must_use]
    pub const fn is_voiced(&self) -> bool {
        self.voiced
    }

    /// Hangover length in whole frames of `frame_ms`
    #[must_use]
    pub fn hangover_frames(&self, frame_ms: u32) -> usize {
        usize::try_from(self.config.hangover_ms.div_ceil(frame_ms.max(1))).unwrap_or(usize::MAX)
    }

    /// Current adaptive noise floor
    #[must_use]
    pub const fn noise_floor(&self) -> Option<f32> {
        self.noise_floor
    }

    /// Rolling window length
    #[must_use]
    pub const fn window(&self) -> usize {
        self.config.window
    }

    /// Forget all session state
    pub fn reset(&mut self) {
        self.history.clear();
        self.noise_floor = None;
        self.speaking = false;
        self.voiced = false;
    }
}
