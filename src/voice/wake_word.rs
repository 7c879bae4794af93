//! Wake word evaluation
//!
//! Matches the newest speech frames against the keyword template with
//! band-limited DTW over cosine distance. The best normalised path cost maps
//! linearly onto a confidence in `[0, 1]`; a detection is emitted when the
//! confidence clears the sensitivity-derived threshold.
//!
//! Nothing is scored until the buffer holds at least a full template's worth
//! of frames, so a phrase cut short never fires on its opening.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};

use super::dtw::Dtw;
use super::features::{self, FeatureVector};
use super::template::{KeywordTemplate, normalize_keyword};
use super::AudioFrame;
use crate::settings::{ListenerConfig, clamp_sensitivity};

/// Normalised path cost at which confidence reaches zero
const COST_CEILING: f32 = 0.2;

/// Window lengths tried, as fractions of the template length
const WINDOW_SCALES: [f32; 3] = [0.85, 1.0, 1.15];

/// A candidate wake word match
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    /// Monotonic time of detection
    pub at: Instant,
    /// Wall-clock time of detection
    pub timestamp: DateTime<Utc>,
    /// Match confidence in `[0, 1]`
    pub confidence: f32,
    /// Keyword that matched
    pub keyword: String,
}

/// Confidence required for a given sensitivity
///
/// Sensitivity 1.0 accepts anything at or above 0.5; sensitivity 0.0
/// requires a perfect match.
#[must_use]
pub fn threshold_for(sensitivity: f32) -> f32 {
    0.5f32.mul_add(1.0 - clamp_sensitivity(sensitivity), 0.5)
}

/// Map a normalised DTW cost onto a confidence
#[must_use]
pub fn confidence_from_cost(cost: f32) -> f32 {
    if cost.is_finite() {
        (1.0 - cost / COST_CEILING).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Rolling-buffer keyword matcher
pub struct WakeWordEvaluator {
    sample_rate: u32,
    frame_ms: u32,
    template_dir: Option<PathBuf>,
    template: Option<KeywordTemplate>,
    // Keyword the current template (or failed derivation) belongs to
    derived_for: Option<String>,
    buffer: VecDeque<FeatureVector>,
    capacity: usize,
}

impl WakeWordEvaluator {
    /// Create an evaluator; the template is derived on the first `refresh`
    #[must_use]
    pub const fn new(sample_rate: u32, frame_ms: u32, template_dir: Option<PathBuf>) -> Self {
        Self {
            sample_rate,
            frame_ms,
            template_dir,
            template: None,
            derived_for: None,
            buffer: VecDeque::new(),
            capacity: 0,
        }
    }

    /// Switch to a new stream sample rate, forcing the template to be re-derived
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.template = None;
            self.derived_for = None;
            self.buffer.clear();
        }
    }

    /// Re-derive the template if the snapshot's keyword changed
    ///
    /// Returns whether a derivation was attempted.
    pub fn refresh(&mut self, config: &ListenerConfig) -> bool {
        let keyword = normalize_keyword(&config.keyword);
        if self.derived_for.as_deref() == Some(keyword.as_str()) {
            return false;
        }

        self.buffer.clear();
        match KeywordTemplate::derive(
            &keyword,
            self.sample_rate,
            self.frame_ms,
            self.template_dir.as_deref(),
        ) {
            Ok(template) => {
                tracing::info!(
                    keyword = %keyword,
                    frames = template.len(),
                    "wake word template ready"
                );
                self.capacity = window_lengths(template.len())[2];
                self.template = Some(template);
            }
            Err(e) => {
                tracing::warn!(error = %e, keyword = %keyword, "cannot derive wake word template, matching paused");
                self.template = None;
                self.capacity = 0;
            }
        }
        self.derived_for = Some(keyword);
        true
    }

    /// Append a speech frame to the rolling buffer
    pub fn push(&mut self, frame: &AudioFrame) {
        if self.template.is_none() {
            return;
        }

        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(features::extract(frame));
    }

    /// Best confidence over the current buffer
    ///
    /// `None` until the buffer is at least as long as the template.
    #[must_use]
    pub fn score(&self) -> Option<f32> {
        let template = self.template.as_ref()?;
        if self.buffer.len() < template.len() {
            return None;
        }
        let dtw = Dtw::new(features::cosine_distance);
        let band = (template.len() / 4).max(2);
        let reference: Vec<&FeatureVector> = template.frames().iter().collect();

        window_lengths(template.len())
            .into_iter()
            .filter(|&len| len <= self.buffer.len())
            .map(|len| {
                let window: Vec<&FeatureVector> =
                    self.buffer.iter().skip(self.buffer.len() - len).collect();
                confidence_from_cost(dtw.normalized_cost(&reference, &window, band))
            })
            .reduce(f32::max)
    }

    /// Evaluate the buffer against the snapshot's keyword and sensitivity
    ///
    /// Clears the buffer on detection so one utterance yields one event.
    pub fn evaluate(&mut self, config: &ListenerConfig) -> Option<DetectionEvent> {
        self.refresh(config);

        let confidence = self.score()?;
        let threshold = threshold_for(config.sensitivity);
        tracing::trace!(confidence, threshold, "wake word evaluated");

        if confidence < threshold {
            return None;
        }

        let keyword = self.template.as_ref()?.keyword().to_string();
        self.buffer.clear();
        tracing::debug!(keyword = %keyword, confidence, threshold, "wake word detected");

        Some(DetectionEvent {
            at: Instant::now(),
            timestamp: Utc::now(),
            confidence,
            keyword,
        })
    }

    /// Drop buffered speech (end of utterance)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Keyword of the active template
    #[must_use]
    pub fn keyword(&self) -> Option<&str> {
        self.template.as_ref().map(KeywordTemplate::keyword)
    }

    /// Active template
    #[must_use]
    pub const fn template(&self) -> Option<&KeywordTemplate> {
        self.template.as_ref()
    }

    /// Frames currently buffered
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Window lengths to compare, shortest first
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn window_lengths(template_len: usize) -> [usize; 3] {
    WINDOW_SCALES.map(|scale| ((template_len as f32 * scale).round() as usize).max(1))
}
