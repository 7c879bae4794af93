//! Settings endpoint poller
//!
//! Periodically fetches listener settings over loopback HTTP and swaps them
//! into the shared snapshot. A failed poll keeps the previous snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::settings::{SettingsPatch, SharedSettings};
use crate::{Error, Result};

/// Poll outcome counters
#[derive(Debug, Default)]
pub struct PollStats {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl PollStats {
    /// Polls that fetched and applied settings
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Polls that kept the previous snapshot
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Timer-driven settings fetcher
pub struct ConfigPoller {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    settings: SharedSettings,
    stats: Arc<PollStats>,
}

impl ConfigPoller {
    /// Create a poller for `url`
    ///
    /// Each request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        settings: SharedSettings,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
            interval,
            settings,
            stats: Arc::new(PollStats::default()),
        })
    }

    /// Shared poll counters
    #[must_use]
    pub fn stats(&self) -> Arc<PollStats> {
        Arc::clone(&self.stats)
    }

    /// Fetch and parse the settings endpoint once
    ///
    /// # Errors
    ///
    /// Returns `ConfigFetch` if the endpoint is unreachable, answers with a
    /// non-success status, or returns a body that is not a JSON object
    pub async fn fetch(&self) -> Result<SettingsPatch> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::ConfigFetch(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ConfigFetch(format!("{} returned {status}", self.url)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::ConfigFetch(format!("{}: {e}", self.url)))?;

        SettingsPatch::from_json(&body)
    }

    /// Run one poll, applying the result
    ///
    /// Returns whether the snapshot changed. Failures are logged once and
    /// counted; they never propagate.
    pub async fn poll_once(&self) -> bool {
        match self.fetch().await {
            Ok(patch) => {
                self.stats.successes.fetch_add(1, Ordering::Relaxed);
                self.settings.apply(&patch)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "settings poll failed, keeping last config");
                false
            }
        }
    }

    /// Poll until shutdown is signalled
    ///
    /// The first poll runs immediately. Shutdown aborts an in-flight request.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            url = %self.url,
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            "settings poller started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = self.poll_once() => {}
            }
        }

        tracing::debug!(
            successes = self.stats.successes(),
            failures = self.stats.failures(),
            "settings poller stopped"
        );
    }
}
