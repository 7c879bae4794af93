//! Fixed-duration analysis frames

/// Default frame duration
pub const DEFAULT_FRAME_MS: u32 = 20;

/// One analysis frame of mono PCM audio
///
/// Always exactly `frame_len(sample_rate, frame_ms)` samples long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Box<[i16]>,
    sample_rate: u32,
    seq: u64,
}

impl AudioFrame {
    /// Wrap samples as a frame
    #[must_use]
    pub fn new(samples: impl Into<Box<[i16]>>, sample_rate: u32, seq: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            seq,
        }
    }

    /// Frame samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Sequence number within the stream
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// RMS energy in raw sample units
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f64 = self
            .samples
            .iter()
            .map(|&s| f64::from(s) * f64::from(s))
            .sum();
        #[allow(clippy::cast_possible_truncation)]
        let rms = (sum_squares / self.samples.len() as f64).sqrt() as f32;
        rms
    }
}

/// Samples per frame for a given rate and duration
#[must_use]
pub const fn frame_len(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate as usize * frame_ms as usize) / 1000
}

/// Slices arbitrary-length chunks into whole frames
///
/// Remainder samples are carried to the next call. A trailing partial frame
/// is never emitted.
#[derive(Debug)]
pub struct FrameSegmenter {
    sample_rate: u32,
    frame_len: usize,
    pending: Vec<i16>,
    next_seq: u64,
}

impl FrameSegmenter {
    /// Create a segmenter
    ///
    /// # Errors
    ///
    /// Returns error if the rate and duration yield an empty frame
    pub fn new(sample_rate: u32, frame_ms: u32) -> crate::Result<Self> {
        let frame_len = frame_len(sample_rate, frame_ms);
        if frame_len == 0 {
            return Err(crate::Error::Config(format!(
                "frame of {frame_ms} ms at {sample_rate} Hz holds no samples"
            )));
        }

        Ok(Self {
            sample_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            next_seq: 0,
        })
    }

    /// Samples per emitted frame
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Sample rate of emitted frames
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples buffered towards the next frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffer a chunk and return every frame it completes
    pub fn push(&mut self, chunk: &[i16]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(chunk);

        let whole = self.pending.len() / self.frame_len * self.frame_len;
        if whole == 0 {
            return Vec::new();
        }

        let first_seq = self.next_seq;
        let frames: Vec<AudioFrame> = self.pending[..whole]
            .chunks_exact(self.frame_len)
            .zip(first_seq..)
            .map(|(samples, seq)| AudioFrame::new(samples, self.sample_rate, seq))
            .collect();

        self.next_seq += frames.len() as u64;
        self.pending.drain(..whole);
        frames
    }

    /// End of stream: discard the trailing partial frame
    ///
    /// Returns the number of samples dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            tracing::trace!(dropped, "discarded trailing partial frame");
        }
        dropped
    }
}
