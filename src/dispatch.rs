//! Wake trigger delivery
//!
//! Triggers are queued by the pipeline and delivered by a dedicated task, so
//! a slow or unreachable assistant never stalls audio processing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::voice::DetectionEvent;
use crate::{Error, Result};

/// Wake notification sent to the assistant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WakeTrigger {
    /// Always `"wake"`
    pub event: &'static str,
    /// Detection time
    pub timestamp: DateTime<Utc>,
    /// Keyword that matched
    pub keyword: String,
    /// Match confidence in `[0, 1]`
    pub confidence: f32,
}

impl From<&DetectionEvent> for WakeTrigger {
    fn from(event: &DetectionEvent) -> Self {
        Self {
            event: "wake",
            timestamp: event.timestamp,
            keyword: event.keyword.clone(),
            confidence: event.confidence,
        }
    }
}

/// Delivers wake triggers to the assistant process
#[async_trait]
pub trait TriggerDispatcher: Send + Sync {
    /// Deliver one trigger
    ///
    /// # Errors
    ///
    /// Returns `Dispatch` if the receiver is unreachable
    async fn dispatch(&self, trigger: &WakeTrigger) -> Result<()>;
}

/// POSTs triggers as JSON to a loopback URL
pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpDispatcher {
    /// Create a dispatcher for `url` with a per-request timeout
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TriggerDispatcher for HttpDispatcher {
    async fn dispatch(&self, trigger: &WakeTrigger) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(trigger)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Dispatch(format!("{} returned {status}", self.url)));
        }

        Ok(())
    }
}

/// Hands triggers to an in-process receiver
pub struct ChannelDispatcher {
    tx: mpsc::Sender<WakeTrigger>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and its receiving end
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WakeTrigger>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TriggerDispatcher for ChannelDispatcher {
    async fn dispatch(&self, trigger: &WakeTrigger) -> Result<()> {
        self.tx
            .send(trigger.clone())
            .await
            .map_err(|_| Error::Dispatch("trigger receiver closed".to_string()))
    }
}

/// Delivery counters for the dispatcher task
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl DispatchStats {
    /// Triggers delivered
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Triggers the receiver rejected or never saw
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Triggers dropped because the queue was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Non-blocking handle the pipeline queues triggers on
#[derive(Clone)]
pub struct TriggerQueue {
    tx: mpsc::Sender<WakeTrigger>,
    stats: Arc<DispatchStats>,
}

impl TriggerQueue {
    /// Queue a trigger without waiting
    ///
    /// Returns whether the trigger was queued.
    pub fn submit(&self, trigger: WakeTrigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(trigger)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(keyword = %trigger.keyword, "dispatch queue full, trigger dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("dispatcher stopped, trigger dropped");
                false
            }
        }
    }

    /// Shared delivery counters
    #[must_use]
    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }
}

/// Spawn the dispatcher task
///
/// The task drains the queue until shutdown is signalled or every queue
/// handle is dropped.
pub fn spawn_dispatcher(
    dispatcher: Arc<dyn TriggerDispatcher>,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (TriggerQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WakeTrigger>(capacity.max(1));
    let stats = Arc::new(DispatchStats::default());
    let task_stats = Arc::clone(&stats);

    let handle = tokio::spawn(async move {
        loop {
            let trigger = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            match dispatcher.dispatch(&trigger).await {
                Ok(()) => {
                    task_stats.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        keyword = %trigger.keyword,
                        confidence = trigger.confidence,
                        "wake trigger dispatched"
                    );
                }
                Err(e) => {
                    task_stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "wake trigger dispatch failed");
                }
            }
        }
        tracing::debug!("dispatcher stopped");
    });

    (TriggerQueue { tx, stats }, handle)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn trigger() -> WakeTrigger {
        WakeTrigger::from(&DetectionEvent {
            at: Instant::now(),
            timestamp: Utc::now(),
            confidence: 0.8,
            keyword: "hey steve".to_string(),
        })
    }

    struct Unreachable;

    #[async_trait]
    impl TriggerDispatcher for Unreachable {
        async fn dispatch(&self, _trigger: &WakeTrigger) -> Result<()> {
            Err(Error::Dispatch("connection refused".to_string()))
        }
    }

    #[test]
    fn trigger_serializes_as_wake_event() {
        let json = serde_json::to_value(trigger()).unwrap();
        assert_eq!(json["event"], "wake");
        assert_eq!(json["keyword"], "hey steve");
        assert!(json["timestamp"].is_string());
        assert!(json["confidence"].as_f64().unwrap() > 0.79);
    }

    #[tokio::test]
    async fn queued_triggers_reach_channel() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(4);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, handle) = spawn_dispatcher(Arc::new(dispatcher), 4, stop_rx);

        assert!(queue.submit(trigger()));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.keyword, "hey steve");

        let stats = queue.stats();
        drop(queue);
        handle.await.unwrap();
        assert_eq!(stats.delivered(), 1);
        assert_eq!(stats.failed(), 0);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (queue, handle) = spawn_dispatcher(Arc::new(Unreachable), 4, stop_rx);

        assert!(queue.submit(trigger()));
        assert!(queue.submit(trigger()));

        let stats = queue.stats();
        drop(queue);
        handle.await.unwrap();
        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.delivered(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_dispatcher() {
        let (dispatcher, _rx) = ChannelDispatcher::new(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (queue, handle) = spawn_dispatcher(Arc::new(dispatcher), 1, stop_rx);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!queue.submit(trigger()));
        assert_eq!(queue.stats().dropped(), 1);
    }
}
