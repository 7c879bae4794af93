//! Daemon - the resident listener service
//!
//! Wires the single-instance lock, shared settings, dispatcher, supervised
//! audio pipeline and settings poller together, and tears them down on
//! shutdown.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::dispatch::{HttpDispatcher, TriggerDispatcher, spawn_dispatcher};
use crate::instance::InstanceLock;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::poller::ConfigPoller;
use crate::settings::Settings;
use crate::supervisor::Supervisor;
use crate::voice::{AudioSource, CpalSource};
use crate::{Error, Result};

/// The hark daemon - listens for the wake word and notifies the assistant
pub struct Daemon {
    config: Config,
    source: Arc<dyn AudioSource>,
    dispatcher: Arc<dyn TriggerDispatcher>,
}

impl Daemon {
    /// Create a daemon capturing from cpal and delivering over HTTP
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: Config) -> Result<Self> {
        let source = Arc::new(CpalSource::new(
            config.audio.sample_rate,
            config.audio.stall_timeout,
        ));
        let dispatcher = Arc::new(HttpDispatcher::new(
            config.trigger_url.clone(),
            config.dispatch_timeout,
        )?);

        Ok(Self::with_parts(config, source, dispatcher))
    }

    /// Create a daemon from explicit audio source and dispatcher
    #[must_use]
    pub fn with_parts(
        config: Config,
        source: Arc<dyn AudioSource>,
        dispatcher: Arc<dyn TriggerDispatcher>,
    ) -> Self {
        Self {
            config,
            source,
            dispatcher,
        }
    }

    /// Run until Ctrl-C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns error if startup fails or audio restarts are exhausted
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` completes
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if another instance holds the lock, or
    /// `RestartsExhausted` if the audio source cannot be kept open
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let Self {
            config,
            source,
            dispatcher,
        } = self;

        let lock = InstanceLock::acquire(&config.pid_path)?;
        tracing::info!(
            pid = std::process::id(),
            pid_file = %lock.path().display(),
            settings_url = %config.settings_url,
            trigger_url = %config.trigger_url,
            "starting hark"
        );

        let settings = Arc::new(Settings::new(config.listener.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let (queue, dispatch_task) =
            spawn_dispatcher(dispatcher, config.dispatch_queue, stop_rx.clone());

        let pipeline = Pipeline::new(
            Arc::clone(&settings),
            queue,
            PipelineOptions {
                frame_ms: config.audio.frame_ms,
                vad: config.vad.clone(),
                template_dir: config.template_dir.clone(),
            },
        )?;
        let supervisor = Supervisor::new(
            source,
            Arc::clone(&settings),
            pipeline,
            config.supervisor.clone(),
        );
        let mut supervisor_task = tokio::spawn(supervisor.run(stop_rx.clone()));

        let poller = ConfigPoller::new(
            config.settings_url.clone(),
            config.poll_interval,
            config.poll_timeout,
            Arc::clone(&settings),
        )?;
        let poll_stats = poller.stats();
        let poller_task = tokio::spawn(poller.run(stop_rx));

        tokio::pin!(shutdown);
        let joined = tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown requested");
                let _ = stop_tx.send(true);
                supervisor_task.await
            }
            joined = &mut supervisor_task => {
                let _ = stop_tx.send(true);
                joined
            }
        };

        let result = joined
            .map_err(|e| Error::Stream(format!("supervisor task failed: {e}")))
            .and_then(|result| result);

        if let Err(e) = poller_task.await {
            tracing::warn!(error = %e, "settings poller task failed");
        }
        if let Err(e) = dispatch_task.await {
            tracing::warn!(error = %e, "dispatcher task failed");
        }

        tracing::info!(
            polls_ok = poll_stats.successes(),
            polls_failed = poll_stats.failures(),
            "hark stopped"
        );

        drop(lock);
        result
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
