//! Per-frame spectral features
//!
//! Each frame is reduced to magnitudes at fixed band centres, computed with
//! the Goertzel algorithm. Centres sit on multiples of 50 Hz so a 20 ms frame
//! lands every centre exactly on a DFT bin.

use super::AudioFrame;

/// Number of spectral bands per feature vector
pub const BANDS: usize = 24;

/// Band centre frequencies in Hz
pub const BAND_CENTRES_HZ: [u32; BANDS] = [
    250, 300, 350, 400, 450, 500, 600, 700, 800, 900, 1000, 1150, 1300, 1500, 1700, 1900, 2100,
    2350, 2600, 2900, 3200, 3500, 3800, 4000,
];

/// Spectral magnitudes for one frame
pub type FeatureVector = [f32; BANDS];

/// Extract the feature vector of a frame
#[must_use]
pub fn extract(frame: &AudioFrame) -> FeatureVector {
    extract_samples(frame.samples(), frame.sample_rate())
}

/// Extract features from raw samples
#[must_use]
pub fn extract_samples(samples: &[i16], sample_rate: u32) -> FeatureVector {
    let mut features = [0.0; BANDS];
    let nyquist = sample_rate / 2;

    for (slot, &centre) in features.iter_mut().zip(BAND_CENTRES_HZ.iter()) {
        if centre < nyquist {
            *slot = goertzel_magnitude(samples, centre, sample_rate);
        }
    }

    features
}

/// Magnitude of a single frequency component, normalised by length
#[allow(clippy::cast_precision_loss)]
fn goertzel_magnitude(samples: &[i16], freq_hz: u32, sample_rate: u32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let omega = 2.0 * std::f32::consts::PI * freq_hz as f32 / sample_rate as f32;
    let coeff = 2.0 * omega.cos();
    let mut s_prev = 0.0f32;
    let mut s_prev2 = 0.0f32;

    for &sample in samples {
        let x = f32::from(sample) / 32768.0;
        let s = x + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }

    let power = coeff.mul_add(-s_prev * s_prev2, s_prev.mul_add(s_prev, s_prev2 * s_prev2));
    power.max(0.0).sqrt() / samples.len() as f32
}

/// Cosine distance between two feature vectors, in `[0, 1]` for magnitudes
///
/// Two silent vectors are identical; a silent vector is maximally distant
/// from any non-silent one.
#[must_use]
pub fn cosine_distance(a: &FeatureVector, b: &FeatureVector) -> f32 {
    let mut dot_ab = 0.0f32;
    let mut dot_a = 0.0f32;
    let mut dot_b = 0.0f32;

    for (&x, &y) in a.iter().zip(b.iter()) {
        dot_ab += x * y;
        dot_a += x * x;
        dot_b += y * y;
    }

    let magnitude = (dot_a * dot_b).sqrt();
    if magnitude == 0.0 {
        return if dot_a == dot_b { 0.0 } else { 1.0 };
    }

    (1.0 - dot_ab / magnitude).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn tone(freq: u32, len: usize, sample_rate: u32) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let t = n as f32 / sample_rate as f32;
                (10_000.0 * (2.0 * std::f32::consts::PI * freq as f32 * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn tone_peaks_in_its_band() {
        let samples = tone(1000, 320, 16_000);
        let features = extract_samples(&samples, 16_000);

        let peak = features
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(BAND_CENTRES_HZ[peak], 1000);

        // Bin-aligned tone leaks almost nothing into other bands
        let others: f32 = features
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != peak)
            .map(|(_, v)| v)
            .sum();
        assert!(others < features[peak] * 0.05);
    }

    #[test]
    fn bands_above_nyquist_are_zero() {
        let samples = tone(1000, 160, 8_000);
        let features = extract_samples(&samples, 8_000);
        assert!(features[BANDS - 1].abs() < f32::EPSILON);
    }

    #[test]
    fn cosine_distance_bounds() {
        let mut a = [0.0; BANDS];
        let mut b = [0.0; BANDS];
        a[3] = 1.0;
        b[7] = 1.0;

        assert!(cosine_distance(&a, &a) < 1e-6);
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
        assert!(cosine_distance(&[0.0; BANDS], &[0.0; BANDS]) < f32::EPSILON);
        assert!((cosine_distance(&a, &[0.0; BANDS]) - 1.0).abs() < f32::EPSILON);
    }
}
