//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use hark::dispatch::{TriggerDispatcher, WakeTrigger, spawn_dispatcher};
use hark::pipeline::{Pipeline, PipelineOptions};
use hark::supervisor::{Supervisor, SupervisorConfig, SupervisorStats};
use hark::voice::template::render_phrase;
use hark::voice::{AudioSource, AudioStream, SAMPLE_RATE, VadConfig};
use hark::{Error, ListenerConfig, Result, Settings, SharedSettings};

/// Samples per 20 ms frame at 16 kHz
pub const FRAME: usize = 320;

/// Wall time between scripted chunks
const CHUNK_PERIOD: Duration = Duration::from_millis(1);

/// Keyword audio surrounded by silence, with low-level background noise
///
/// Every section is a whole number of frames, and the trailing silence
/// outlasts the default hangover so the utterance has ended.
pub fn fixture(phrase: &str, seed: u64) -> Vec<i16> {
    spaced(&[phrase], 0, seed)
}

/// Words separated by `gap_frames` of silence, otherwise like `fixture`
pub fn spaced(words: &[&str], gap_frames: usize, seed: u64) -> Vec<i16> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = vec![0i16; FRAME * 15];
    for (i, word) in words.iter().enumerate() {
        if i > 0 {
            samples.extend(vec![0i16; FRAME * gap_frames]);
        }
        samples.extend(render_phrase(word, SAMPLE_RATE));
    }
    samples.extend(vec![0i16; FRAME * 20]);

    for sample in &mut samples {
        *sample = sample.saturating_add(rng.gen_range(-300..=300));
    }
    samples
}

/// Listener settings for `keyword` with no cooldown
pub fn listener(keyword: &str) -> ListenerConfig {
    ListenerConfig {
        keyword: keyword.to_string(),
        cooldown_ms: 0,
        ..ListenerConfig::default()
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// How scripted streams misbehave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Streams run until closed
    None,
    /// Every open fails with `DeviceUnavailable`
    OpenFails,
    /// Every stream fails with `Stream` after this many chunks
    StreamFailsAfter(usize),
}

/// Audio source fed from a shared sample queue
///
/// Streams emit one frame per chunk, padding with silence when the queue is
/// empty, so audio keeps flowing like a live microphone.
pub struct ScriptedSource {
    feed: Arc<Mutex<VecDeque<i16>>>,
    fault: Fault,
    attempts: AtomicUsize,
    live: Arc<AtomicUsize>,
    devices: Mutex<Vec<Option<usize>>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Self::with_fault(Fault::None)
    }

    pub fn with_fault(fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            feed: Arc::new(Mutex::new(VecDeque::new())),
            fault,
            attempts: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            devices: Mutex::new(Vec::new()),
        })
    }

    /// Queue samples for the open stream
    pub fn feed(&self, samples: &[i16]) {
        self.feed.lock().unwrap().extend(samples.iter().copied());
    }

    /// Samples not yet delivered
    pub fn pending(&self) -> usize {
        self.feed.lock().unwrap().len()
    }

    /// Open attempts, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Streams currently open
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Device index requested by each successful open
    pub fn opened_devices(&self) -> Vec<Option<usize>> {
        self.devices.lock().unwrap().clone()
    }
}

impl AudioSource for ScriptedSource {
    fn open(&self, device_index: Option<usize>) -> Result<Box<dyn AudioStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = match self.fault {
            Fault::OpenFails => {
                return Err(Error::DeviceUnavailable("no input device available".to_string()));
            }
            Fault::StreamFailsAfter(chunks) => Some(chunks),
            Fault::None => None,
        };

        self.devices.lock().unwrap().push(device_index);
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedStream {
            feed: Arc::clone(&self.feed),
            remaining,
            live: Arc::clone(&self.live),
            closed: false,
        }))
    }
}

struct ScriptedStream {
    feed: Arc<Mutex<VecDeque<i16>>>,
    remaining: Option<usize>,
    live: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl AudioStream for ScriptedStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<i16>>> {
        if self.closed {
            return Ok(None);
        }

        tokio::time::sleep(CHUNK_PERIOD).await;

        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(Error::Stream("device unplugged".to_string()));
            }
            *remaining -= 1;
        }

        let mut chunk: Vec<i16> = {
            let mut feed = self.feed.lock().unwrap();
            let take = feed.len().min(FRAME);
            feed.drain(..take).collect()
        };
        chunk.resize(FRAME, 0);
        Ok(Some(chunk))
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Dispatcher that records every trigger
#[derive(Default)]
pub struct RecordingDispatcher {
    triggers: Mutex<Vec<WakeTrigger>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.triggers.lock().unwrap().len()
    }

    pub fn keywords(&self) -> Vec<String> {
        self.triggers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.keyword.clone())
            .collect()
    }
}

#[async_trait]
impl TriggerDispatcher for RecordingDispatcher {
    async fn dispatch(&self, trigger: &WakeTrigger) -> Result<()> {
        self.triggers.lock().unwrap().push(trigger.clone());
        Ok(())
    }
}

/// Pipeline options used throughout the tests
pub fn pipeline_options() -> PipelineOptions {
    PipelineOptions {
        frame_ms: 20,
        vad: VadConfig::default(),
        template_dir: None,
    }
}

/// A running supervisor wired to a scripted source and recording dispatcher
pub struct Harness {
    pub settings: SharedSettings,
    pub source: Arc<ScriptedSource>,
    pub recorder: Arc<RecordingDispatcher>,
    pub stats: Arc<SupervisorStats>,
    pub task: JoinHandle<Result<()>>,
    stop: watch::Sender<bool>,
}

impl Harness {
    pub fn start(
        initial: ListenerConfig,
        source: Arc<ScriptedSource>,
        policy: SupervisorConfig,
    ) -> Self {
        let settings = Arc::new(Settings::new(initial));
        let recorder = RecordingDispatcher::new();
        let (stop, stop_rx) = watch::channel(false);

        let (queue, _dispatch_task) = spawn_dispatcher(recorder.clone(), 8, stop_rx.clone());
        let pipeline = Pipeline::new(Arc::clone(&settings), queue, pipeline_options()).unwrap();
        let supervisor = Supervisor::new(source.clone(), Arc::clone(&settings), pipeline, policy);
        let stats = supervisor.stats();
        let task = tokio::spawn(supervisor.run(stop_rx));

        Self {
            settings,
            source,
            recorder,
            stats,
            task,
            stop,
        }
    }

    /// Signal shutdown and wait for the supervisor, bounded by `timeout`
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        let _ = self.stop.send(true);
        tokio::time::timeout(timeout, self.task)
            .await
            .expect("supervisor did not stop in time")
            .expect("supervisor task panicked")
    }
}

/// Settings endpoint served on loopback
pub struct SettingsServer {
    pub url: String,
    state: Arc<ServerState>,
    _task: JoinHandle<()>,
}

#[derive(Default)]
struct ServerState {
    response: Mutex<(u16, String)>,
    hits: AtomicUsize,
}

impl SettingsServer {
    pub async fn start(body: serde_json::Value) -> Self {
        let state = Arc::new(ServerState {
            response: Mutex::new((200, body.to_string())),
            hits: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/api/settings", get(serve_settings))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/api/settings"),
            state,
            _task: task,
        }
    }

    pub fn set_json(&self, body: serde_json::Value) {
        *self.state.response.lock().unwrap() = (200, body.to_string());
    }

    pub fn set_raw(&self, status: u16, body: &str) {
        *self.state.response.lock().unwrap() = (status, body.to_string());
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

async fn serve_settings(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let (status, body) = state.response.lock().unwrap().clone();
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
}

/// Trigger endpoint served on loopback, recording every JSON body
pub struct TriggerServer {
    pub url: String,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
    _task: JoinHandle<()>,
}

impl TriggerServer {
    pub async fn start() -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));

        let app = Router::new()
            .route("/api/wake", post(receive_trigger))
            .with_state(Arc::clone(&received));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/api/wake"),
            received,
            _task: task,
        }
    }

    pub fn received(&self) -> Vec<serde_json::Value> {
        self.received.lock().unwrap().clone()
    }
}

async fn receive_trigger(
    State(received): State<Arc<Mutex<Vec<serde_json::Value>>>>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> StatusCode {
    received.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}
