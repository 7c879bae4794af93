//! Listening pipeline
//!
//! Audio chunks flow through framing, the voice activity gate, the keyword
//! evaluator and the debounce controller; accepted detections are queued for
//! dispatch. One `ListenerConfig` snapshot is loaded per chunk.
//!
//! An utterance opens when the gate reports speech and closes once silence
//! outlasts the hangover, so pauses between words stay inside it. Only
//! voiced frames reach the evaluator; templates drop their pauses the same
//! way, which keeps pause length out of the match.

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::sync::watch;

use crate::Result;
use crate::dispatch::{TriggerQueue, WakeTrigger};
use crate::settings::{ListenerConfig, SharedSettings};
use crate::voice::{
    Activity, AudioFrame, AudioStream, DebounceController, FrameSegmenter, SAMPLE_RATE, VadConfig,
    VoiceActivityGate, WakeWordEvaluator,
};

/// Why a pipeline run returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was signalled
    Shutdown,
    /// Listening was disabled by the settings endpoint
    Disabled,
    /// The configured input device changed
    DeviceChanged,
    /// The audio stream ended on its own
    Ended,
}

/// Static pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Frame duration in milliseconds
    pub frame_ms: u32,
    /// Voice activity gate tuning
    pub vad: VadConfig,
    /// Directory holding recorded keyword samples
    pub template_dir: Option<PathBuf>,
}

/// Running totals for a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames segmented
    pub frames: u64,
    /// Frames the gate classified as speech
    pub speech_frames: u64,
    /// Keyword evaluations run
    pub evaluations: u64,
    /// Raw detections from the evaluator
    pub detections: u64,
    /// Detections accepted by debounce and queued
    pub triggers: u64,
    /// Detections discarded during cooldown
    pub suppressed: u64,
}

/// Frame-by-frame wake word pipeline
pub struct Pipeline {
    settings: SharedSettings,
    queue: TriggerQueue,
    frame_ms: u32,
    segmenter: FrameSegmenter,
    gate: VoiceActivityGate,
    evaluator: WakeWordEvaluator,
    debounce: DebounceController,
    pre_roll: VecDeque<(AudioFrame, bool)>,
    in_speech: bool,
    hangover_frames: usize,
    quiet_run: usize,
    stats: PipelineStats,
}

impl Pipeline {
    /// Create a pipeline feeding `queue`
    ///
    /// # Errors
    ///
    /// Returns error if the frame duration is unusable
    pub fn new(
        settings: SharedSettings,
        queue: TriggerQueue,
        options: PipelineOptions,
    ) -> Result<Self> {
        let cooldown = settings.snapshot().cooldown();
        let window = options.vad.window.max(1);
        let gate = VoiceActivityGate::new(options.vad);
        let hangover_frames = gate.hangover_frames(options.frame_ms);

        Ok(Self {
            settings,
            queue,
            frame_ms: options.frame_ms,
            segmenter: FrameSegmenter::new(SAMPLE_RATE, options.frame_ms)?,
            gate,
            evaluator: WakeWordEvaluator::new(SAMPLE_RATE, options.frame_ms, options.template_dir),
            debounce: DebounceController::new(cooldown),
            pre_roll: VecDeque::with_capacity(window),
            in_speech: false,
            hangover_frames,
            quiet_run: 0,
            stats: PipelineStats::default(),
        })
    }

    /// Prepare for a freshly opened stream
    ///
    /// Session state is cleared; the debounce window survives so a restart
    /// cannot re-trigger inside the cooldown.
    ///
    /// # Errors
    ///
    /// Returns error if the sample rate yields an empty frame
    pub fn reset_stream(&mut self, sample_rate: u32) -> Result<()> {
        self.segmenter = FrameSegmenter::new(sample_rate, self.frame_ms)?;
        self.gate.reset();
        self.evaluator.set_sample_rate(sample_rate);
        self.evaluator.reset();
        self.pre_roll.clear();
        self.in_speech = false;
        self.quiet_run = 0;
        Ok(())
    }

    /// Process one chunk against `config`
    ///
    /// Returns the number of triggers queued.
    pub fn process_chunk(&mut self, chunk: &[i16], config: &ListenerConfig) -> usize {
        self.evaluator.refresh(config);
        self.debounce.set_cooldown(config.cooldown());

        let mut triggered = 0;
        for frame in self.segmenter.push(chunk) {
            if self.process_frame(frame, config) {
                triggered += 1;
            }
        }
        triggered
    }

    fn process_frame(&mut self, frame: AudioFrame, config: &ListenerConfig) -> bool {
        self.stats.frames += 1;

        let activity = self.gate.classify(&frame);
        let voiced = self.gate.is_voiced();

        if activity == Activity::Speech {
            self.stats.speech_frames += 1;
            self.quiet_run = 0;
            if !self.in_speech {
                self.in_speech = true;
                tracing::trace!(seq = frame.seq(), pre_roll = self.pre_roll.len(), "speech started");
                for (earlier, earlier_voiced) in self.pre_roll.drain(..) {
                    if earlier_voiced {
                        self.evaluator.push(&earlier);
                    }
                }
            }
        } else if self.in_speech {
            self.quiet_run += 1;
            if self.quiet_run >= self.hangover_frames {
                self.in_speech = false;
                self.quiet_run = 0;
                self.evaluator.reset();
                tracing::trace!(seq = frame.seq(), "speech ended");
            }
        }

        if !self.in_speech {
            if self.pre_roll.len() == self.gate.window() {
                self.pre_roll.pop_front();
            }
            self.pre_roll.push_back((frame, voiced));
            return false;
        }

        // Pauses inside the utterance are skipped, not matched
        if !voiced {
            return false;
        }

        self.evaluator.push(&frame);
        self.stats.evaluations += 1;

        let Some(event) = self.evaluator.evaluate(config) else {
            return false;
        };
        self.stats.detections += 1;

        match self.debounce.offer(event) {
            Some(event) => {
                self.stats.triggers += 1;
                self.queue.submit(WakeTrigger::from(&event));
                true
            }
            None => {
                self.stats.suppressed += 1;
                false
            }
        }
    }

    /// Drive the pipeline from `stream` until it should stop
    ///
    /// Returns early when listening is disabled or the device index no
    /// longer matches `device_index`, so the caller can release the device.
    ///
    /// # Errors
    ///
    /// Returns `Stream` if the stream fails
    pub async fn run(
        &mut self,
        stream: &mut dyn AudioStream,
        shutdown: &mut watch::Receiver<bool>,
        device_index: Option<usize>,
    ) -> Result<RunOutcome> {
        self.reset_stream(stream.sample_rate())?;
        let mut revisions = self.settings.subscribe();

        loop {
            let config = self.settings.snapshot();
            if !config.enabled {
                return Ok(RunOutcome::Disabled);
            }
            if config.device_index != device_index {
                return Ok(RunOutcome::DeviceChanged);
            }

            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return Ok(RunOutcome::Shutdown),
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return Ok(RunOutcome::Shutdown);
                    }
                }
                chunk = stream.next_chunk() => match chunk? {
                    Some(chunk) => {
                        self.process_chunk(&chunk, &config);
                    }
                    None => {
                        let discarded = self.segmenter.finish();
                        tracing::debug!(discarded, "audio stream ended");
                        return Ok(RunOutcome::Ended);
                    }
                },
            }
        }
    }

    /// Running totals
    #[must_use]
    pub const fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Whether the gate currently reports speech
    #[must_use]
    pub const fn in_speech(&self) -> bool {
        self.in_speech
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::{ChannelDispatcher, spawn_dispatcher};
    use crate::settings::Settings;
    use crate::voice::template::render_phrase;

    fn options() -> PipelineOptions {
        PipelineOptions {
            frame_ms: 20,
            vad: VadConfig::default(),
            template_dir: None,
        }
    }

    fn listener(keyword: &str) -> ListenerConfig {
        ListenerConfig {
            keyword: keyword.to_string(),
            ..ListenerConfig::default()
        }
    }

    fn utterance(phrase: &str) -> Vec<i16> {
        spoken(&[phrase], 0)
    }

    /// Words separated by `gap_frames` of silence, ending past the hangover
    fn spoken(words: &[&str], gap_frames: usize) -> Vec<i16> {
        let mut samples = vec![0i16; 320 * 10];
        for (i, word) in words.iter().enumerate() {
            if i > 0 {
                samples.extend(vec![0i16; 320 * gap_frames]);
            }
            samples.extend(render_phrase(word, SAMPLE_RATE));
        }
        samples.extend(vec![0i16; 320 * 20]);
        samples
    }

    fn pipeline(config: &ListenerConfig) -> Pipeline {
        let settings = Arc::new(Settings::new(config.clone()));
        let (dispatcher, _rx) = ChannelDispatcher::new(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, _handle) = spawn_dispatcher(Arc::new(dispatcher), 8, stop_rx);
        Pipeline::new(settings, queue, options()).unwrap()
    }

    #[tokio::test]
    async fn keyword_utterance_queues_one_trigger() {
        let config = listener("hey steve");
        let settings = Arc::new(Settings::new(config.clone()));
        let (dispatcher, mut rx) = ChannelDispatcher::new(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, _handle) = spawn_dispatcher(Arc::new(dispatcher), 8, stop_rx);

        let mut pipeline = Pipeline::new(settings, queue, options()).unwrap();
        assert_eq!(pipeline.process_chunk(&utterance("hey steve"), &config), 1);

        let trigger = rx.recv().await.unwrap();
        assert_eq!(trigger.keyword, "hey steve");
        assert_eq!(pipeline.stats().triggers, 1);
        assert!(!pipeline.in_speech());
    }

    #[tokio::test]
    async fn pause_inside_hangover_keeps_utterance_open() {
        let config = listener("hey steve");
        let mut pipeline = pipeline(&config);

        // 200 ms between the words, under the 300 ms hangover
        assert_eq!(pipeline.process_chunk(&spoken(&["hey", "steve"], 10), &config), 1);
        assert!(!pipeline.in_speech());
        // Only voiced frames were matched
        assert_eq!(pipeline.stats().evaluations, 40);
    }

    #[tokio::test]
    async fn silence_past_hangover_ends_utterance() {
        let config = listener("hey steve");
        let mut pipeline = pipeline(&config);

        pipeline.process_chunk(&spoken(&["hey"], 0)[..320 * 25], &config);
        assert!(pipeline.in_speech());

        // Three frames for the gate to flip, then the hangover
        let hangover = pipeline.gate.hangover_frames(20);
        pipeline.process_chunk(&vec![0i16; 320 * (3 + hangover)], &config);
        assert!(!pipeline.in_speech());
        assert_eq!(pipeline.evaluator.buffered(), 0);
    }

    #[tokio::test]
    async fn silence_never_reaches_evaluator() {
        let config = listener("hey steve");
        let settings = Arc::new(Settings::new(config.clone()));
        let (dispatcher, _rx) = ChannelDispatcher::new(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, _handle) = spawn_dispatcher(Arc::new(dispatcher), 8, stop_rx);

        let mut pipeline = Pipeline::new(settings, queue, options()).unwrap();
        pipeline.process_chunk(&vec![0i16; 16_000], &config);

        assert_eq!(pipeline.stats().frames, 50);
        assert_eq!(pipeline.stats().evaluations, 0);
    }

    #[tokio::test]
    async fn repeats_within_cooldown_are_suppressed() {
        let config = ListenerConfig {
            cooldown_ms: 60_000,
            ..listener("hey steve")
        };
        let settings = Arc::new(Settings::new(config.clone()));
        let (dispatcher, _rx) = ChannelDispatcher::new(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, _handle) = spawn_dispatcher(Arc::new(dispatcher), 8, stop_rx);

        let mut pipeline = Pipeline::new(settings, queue, options()).unwrap();
        for _ in 0..3 {
            pipeline.process_chunk(&utterance("hey steve"), &config);
        }

        assert_eq!(pipeline.stats().detections, 3);
        assert_eq!(pipeline.stats().triggers, 1);
        assert_eq!(pipeline.stats().suppressed, 2);
    }
}
