//! Audio source supervision
//!
//! Owns the open/run/close cycle of the audio stream. Device and stream
//! failures are retried with capped exponential backoff; a run that stayed
//! healthy long enough resets the failure count.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use tokio::sync::watch;

use crate::pipeline::{Pipeline, RunOutcome};
use crate::settings::SharedSettings;
use crate::voice::{AudioSource, AudioStream};
use crate::{Error, Result};

/// Restart policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Consecutive failed runs tolerated before giving up
    pub max_restarts: u32,
    /// Delay before the first restart
    #[serde(with = "millis")]
    pub backoff_initial: Duration,
    /// Upper bound on the restart delay
    #[serde(with = "millis")]
    pub backoff_max: Duration,
    /// Run length after which the failure count resets
    #[serde(with = "millis")]
    pub stable_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Supervisor counters
#[derive(Debug, Default)]
pub struct SupervisorStats {
    opens: AtomicU64,
    restarts: AtomicU64,
}

impl SupervisorStats {
    /// Streams opened successfully
    #[must_use]
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Restarts scheduled after a failure
    #[must_use]
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

/// Keeps the pipeline listening across device faults and settings changes
pub struct Supervisor {
    source: Arc<dyn AudioSource>,
    settings: SharedSettings,
    pipeline: Pipeline,
    config: SupervisorConfig,
    stats: Arc<SupervisorStats>,
}

impl Supervisor {
    /// Create a supervisor driving `pipeline` from `source`
    #[must_use]
    pub fn new(
        source: Arc<dyn AudioSource>,
        settings: SharedSettings,
        pipeline: Pipeline,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            source,
            settings,
            pipeline,
            config,
            stats: Arc::new(SupervisorStats::default()),
        }
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> Arc<SupervisorStats> {
        Arc::clone(&self.stats)
    }

    /// Supervise until shutdown
    ///
    /// # Errors
    ///
    /// Returns `RestartsExhausted` once consecutive failures exceed
    /// `max_restarts`, or any non-restartable error from the pipeline
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let config = self.settings.snapshot();
            if !config.enabled {
                tracing::info!("listening disabled, audio device released");
                if !self.wait_until_enabled(&mut shutdown).await {
                    return Ok(());
                }
                tracing::info!("listening re-enabled");
                continue;
            }

            let started = Instant::now();
            let outcome = self.run_once(config.device_index, &mut shutdown).await;
            if started.elapsed() >= self.config.stable_after {
                failures = 0;
            }

            let error = match outcome {
                Ok(RunOutcome::Shutdown) => return Ok(()),
                Ok(RunOutcome::Disabled) => continue,
                Ok(RunOutcome::DeviceChanged) => {
                    tracing::info!("input device changed, reopening");
                    continue;
                }
                Ok(RunOutcome::Ended) => Error::Stream("audio stream ended".to_string()),
                Err(e) if e.is_restartable() => e,
                Err(e) => return Err(e),
            };

            failures += 1;
            if failures > self.config.max_restarts {
                tracing::error!(
                    attempts = failures,
                    error = %error,
                    "audio restarts exhausted, giving up"
                );
                return Err(Error::RestartsExhausted {
                    attempts: failures,
                    last: error.to_string(),
                });
            }

            let delay = backoff_delay(&self.config, failures);
            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                error = %error,
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "audio pipeline failed, restarting"
            );

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(
        &mut self,
        device_index: Option<usize>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let source = Arc::clone(&self.source);
        let mut stream: Box<dyn AudioStream> =
            tokio::task::spawn_blocking(move || source.open(device_index))
                .await
                .map_err(|e| Error::DeviceUnavailable(format!("open task failed: {e}")))??;

        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            device_index = ?device_index,
            sample_rate = stream.sample_rate(),
            "audio device opened, listening"
        );

        let outcome = self.pipeline.run(stream.as_mut(), shutdown, device_index).await;
        stream.close();
        tracing::debug!(outcome = ?outcome.as_ref().ok(), "audio device closed");
        outcome
    }

    async fn wait_until_enabled(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut revisions = self.settings.subscribe();

        loop {
            if self.settings.snapshot().enabled {
                return true;
            }

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return false,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Delay before restart `attempt` (1-based), with up to 25% jitter
fn backoff_delay(config: &SupervisorConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config
        .backoff_initial
        .saturating_mul(1 << exponent)
        .min(config.backoff_max);

    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let jitter = rand::thread_rng().gen_range(0..=base_ms / 4);
    Duration::from_millis(base_ms.saturating_add(jitter))
}
