//! Keyword templates
//!
//! A template is the feature sequence the evaluator matches speech against.
//! It comes from a recorded sample of the keyword when one exists
//! (`<template_dir>/<keyword>.wav`), otherwise from a deterministic formant
//! rendering of the phrase: each letter becomes a 100 ms pair of tones at two
//! band centres.

use std::path::{Path, PathBuf};

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::features::{self, BAND_CENTRES_HZ, FeatureVector};
use super::frame::FrameSegmenter;
use crate::{Error, Result};

/// Duration of one rendered letter
pub const UNIT_MS: u32 = 100;

/// Peak amplitude of each rendered tone, as a fraction of full scale
const TONE_AMPLITUDE: f64 = 0.3;

/// Recorded frames quieter than this fraction of the loudest are dropped
const TRIM_RATIO: f32 = 0.1;

/// Band index pairs (low, high) for `a` through `z`
const LETTER_BANDS: [(usize, usize); 26] = [
    (7, 11),  // a
    (0, 6),   // b
    (10, 20), // c
    (3, 16),  // d
    (5, 15),  // e
    (18, 23), // f
    (2, 12),  // g
    (13, 22), // h
    (1, 17),  // i
    (6, 19),  // j
    (9, 21),  // k
    (4, 10),  // l
    (0, 8),   // m
    (1, 12),  // n
    (4, 8),   // o
    (3, 13),  // p
    (9, 18),  // q
    (6, 14),  // r
    (21, 23), // s
    (12, 20), // t
    (2, 9),   // u
    (5, 14),  // v
    (2, 7),   // w
    (11, 22), // x
    (0, 16),  // y
    (19, 22), // z
];

/// Where a template came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Recorded WAV sample
    Recorded(PathBuf),
    /// Formant rendering of the phrase
    Rendered,
}

/// Feature sequence for one keyword at one sample rate
#[derive(Debug, Clone)]
pub struct KeywordTemplate {
    keyword: String,
    sample_rate: u32,
    frames: Vec<FeatureVector>,
    source: TemplateSource,
}

impl KeywordTemplate {
    /// Derive the template for `keyword`
    ///
    /// Prefers a recorded sample under `template_dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the recorded sample cannot be read or the keyword
    /// yields no frames
    pub fn derive(
        keyword: &str,
        sample_rate: u32,
        frame_ms: u32,
        template_dir: Option<&Path>,
    ) -> Result<Self> {
        let keyword = normalize_keyword(keyword);

        if let Some(path) = template_dir.map(|dir| template_path(dir, &keyword)) {
            if path.exists() {
                let samples = read_wav(&path, sample_rate)?;
                let frames = trim_quiet(feature_frames(&samples, sample_rate, frame_ms)?);
                return Self::build(keyword, sample_rate, frames, TemplateSource::Recorded(path));
            }
        }

        let samples = render_phrase(&keyword, sample_rate);
        let frames = feature_frames(&samples, sample_rate, frame_ms)?
            .into_iter()
            .map(|(features, _)| features)
            .collect();
        Self::build(keyword, sample_rate, frames, TemplateSource::Rendered)
    }

    fn build(
        keyword: String,
        sample_rate: u32,
        frames: Vec<FeatureVector>,
        source: TemplateSource,
    ) -> Result<Self> {
        if frames.is_empty() {
            return Err(Error::Template(format!(
                "keyword \"{keyword}\" produced an empty template"
            )));
        }

        tracing::debug!(
            keyword = %keyword,
            frames = frames.len(),
            sample_rate,
            source = ?source,
            "keyword template derived"
        );

        Ok(Self {
            keyword,
            sample_rate,
            frames,
            source,
        })
    }

    /// Normalised keyword
    #[must_use]
    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// Sample rate the template was derived at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Template feature frames
    #[must_use]
    pub fn frames(&self) -> &[FeatureVector] {
        &self.frames
    }

    /// Number of frames
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the template is empty (never true for a built template)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Where the template came from
    #[must_use]
    pub const fn source(&self) -> &TemplateSource {
        &self.source
    }
}

/// Lowercase, trim and collapse whitespace
#[must_use]
pub fn normalize_keyword(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Path of the recorded sample for a keyword
#[must_use]
pub fn template_path(dir: &Path, keyword: &str) -> PathBuf {
    dir.join(format!("{}.wav", normalize_keyword(keyword).replace(' ', "_")))
}

/// Render a phrase as formant tones
///
/// Letters map to fixed tone pairs; everything else is skipped.
#[must_use]
pub fn render_phrase(phrase: &str, sample_rate: u32) -> Vec<i16> {
    let unit = (sample_rate as usize * UNIT_MS as usize) / 1000;
    let nyquist = sample_rate / 2;
    let letters: Vec<(usize, usize)> = phrase.chars().filter_map(letter_bands).collect();
    let mut out = Vec::with_capacity(letters.len() * unit);
    let mut n = 0u64;

    for (low, high) in letters {
        let tones = [BAND_CENTRES_HZ[low], BAND_CENTRES_HZ[high]];
        for _ in 0..unit {
            #[allow(clippy::cast_precision_loss)]
            let t = n as f64 / f64::from(sample_rate);
            let value: f64 = tones
                .iter()
                .filter(|&&f| f < nyquist)
                .map(|&f| TONE_AMPLITUDE * (2.0 * std::f64::consts::PI * f64::from(f) * t).sin())
                .sum();
            #[allow(clippy::cast_possible_truncation)]
            out.push((value * 32767.0) as i16);
            n += 1;
        }
    }

    out
}

fn letter_bands(c: char) -> Option<(usize, usize)> {
    let c = c.to_ascii_lowercase();
    c.is_ascii_lowercase()
        .then(|| LETTER_BANDS[(c as u8 - b'a') as usize])
}

fn feature_frames(
    samples: &[i16],
    sample_rate: u32,
    frame_ms: u32,
) -> Result<Vec<(FeatureVector, f32)>> {
    let mut segmenter = FrameSegmenter::new(sample_rate, frame_ms)?;
    let frames = segmenter
        .push(samples)
        .iter()
        .map(|frame| (features::extract(frame), frame.rms()))
        .collect();
    segmenter.finish();
    Ok(frames)
}

/// Keep only voiced frames, dropping pauses between words as well as the edges
///
/// Live matching skips unvoiced frames too, so the gap a speaker leaves
/// between words never has to line up with the recording.
fn trim_quiet(frames: Vec<(FeatureVector, f32)>) -> Vec<FeatureVector> {
    let peak = frames.iter().map(|(_, rms)| *rms).fold(0.0f32, f32::max);
    let floor = peak * TRIM_RATIO;

    frames
        .into_iter()
        .filter(|(_, rms)| *rms > floor)
        .map(|(features, _)| features)
        .collect()
}

/// Read a WAV file as mono i16 at `target_rate`
fn read_wav(path: &Path, target_rate: u32) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            #[allow(clippy::cast_precision_loss)]
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| {
                    #[allow(clippy::cast_precision_loss)]
                    let v = v as f32;
                    v / scale
                }))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    #[allow(clippy::cast_precision_loss)]
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    let mono = resample(&mono, spec.sample_rate, target_rate)?;

    #[allow(clippy::cast_possible_truncation)]
    let samples = mono
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect();

    tracing::debug!(path = %path.display(), from_rate = spec.sample_rate, target_rate, "loaded recorded template");
    Ok(samples)
}

/// Resample a mono buffer between rates
fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input.len(), 1)
        .map_err(|e| Error::Template(format!("resampler setup failed: {e}")))?;

    let waves_out = resampler
        .process(&[input], None)
        .map_err(|e| Error::Template(format!("resampling failed: {e}")))?;

    Ok(waves_out.into_iter().next().unwrap_or_default())
}
