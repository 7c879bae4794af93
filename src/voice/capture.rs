//! Audio capture from microphone
//!
//! The cpal stream is not `Send`, so each open stream lives on its own
//! capture thread. Chunks and backend errors reach the async side over a
//! bounded channel.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Preferred sample rate for capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Chunks buffered between the capture thread and the pipeline
const CHANNEL_CAPACITY: usize = 64;

type ChunkMessage = std::result::Result<Vec<i16>, String>;

/// An open input stream delivering mono i16 chunks
#[async_trait]
pub trait AudioStream: Send {
    /// Next chunk of samples
    ///
    /// Returns `Ok(None)` when the stream ended.
    ///
    /// # Errors
    ///
    /// Returns `Stream` when the device failed mid-stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<i16>>>;

    /// Actual sample rate of delivered chunks
    fn sample_rate(&self) -> u32;

    /// Release the device; idempotent
    fn close(&mut self);
}

/// Opens input streams
pub trait AudioSource: Send + Sync {
    /// Open the input device at `device_index`, or the default device
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if no usable device can be opened
    fn open(&self, device_index: Option<usize>) -> Result<Box<dyn AudioStream>>;
}

/// cpal-backed audio source
#[derive(Debug, Clone)]
pub struct CpalSource {
    sample_rate: u32,
    stall_timeout: Duration,
}

impl CpalSource {
    /// Create a source preferring `sample_rate`
    ///
    /// A stream that delivers nothing for `stall_timeout` is treated as lost.
    #[must_use]
    pub const fn new(sample_rate: u32, stall_timeout: Duration) -> Self {
        Self {
            sample_rate,
            stall_timeout,
        }
    }
}

impl AudioSource for CpalSource {
    fn open(&self, device_index: Option<usize>) -> Result<Box<dyn AudioStream>> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<ChunkMessage>(CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let preferred_rate = self.sample_rate;

        let thread = std::thread::Builder::new()
            .name("hark-capture".to_string())
            .spawn(move || {
                let stream = match start_stream(device_index, preferred_rate, chunk_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Hold the device until asked to stop or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        let sample_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::DeviceUnavailable(
                    "capture thread exited during startup".to_string(),
                ));
            }
        };

        Ok(Box::new(CpalStream {
            rx: chunk_rx,
            sample_rate,
            stall_timeout: self.stall_timeout,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

/// Input stream held open by a capture thread
pub struct CpalStream {
    rx: mpsc::Receiver<ChunkMessage>,
    sample_rate: u32,
    stall_timeout: Duration,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

#[async_trait]
impl AudioStream for CpalStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<i16>>> {
        if self.stop_tx.is_none() {
            return Ok(None);
        }

        match tokio::time::timeout(self.stall_timeout, self.rx.recv()).await {
            Err(_) => Err(Error::Stream(format!(
                "no audio delivered for {} ms",
                self.stall_timeout.as_millis()
            ))),
            Ok(None) => Ok(None),
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => Err(Error::Stream(e)),
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// List input devices as `(index, name)` pairs
///
/// # Errors
///
/// Returns error if the host cannot enumerate devices
pub fn list_input_devices() -> Result<Vec<(usize, String)>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok(devices
        .enumerate()
        .map(|(i, d)| (i, d.name().unwrap_or_else(|_| "<unnamed>".to_string())))
        .collect())
}

fn select_device(device_index: Option<usize>) -> Result<Device> {
    let host = cpal::default_host();

    match device_index {
        None => host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string())),
        Some(index) => host
            .input_devices()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .nth(index)
            .ok_or_else(|| Error::DeviceUnavailable(format!("no input device at index {index}"))),
    }
}

fn start_stream(
    device_index: Option<usize>,
    preferred_rate: u32,
    tx: mpsc::Sender<ChunkMessage>,
) -> Result<(Stream, u32)> {
    let device = select_device(device_index)?;

    // Prefer the speech rate with the fewest channels, else the device default
    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(preferred_rate)
                && c.max_sample_rate() >= SampleRate(preferred_rate)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .map(|c| c.with_sample_rate(SampleRate(preferred_rate)));

    let supported = match supported {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?,
    };

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels.max(1));

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels,
        format = ?sample_format,
        "audio capture initialized"
    );

    let stream = match sample_format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, tx),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, tx),
        SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, tx),
        other => Err(Error::DeviceUnavailable(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    Ok((stream, config.sample_rate.0))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    tx: mpsc::Sender<ChunkMessage>,
) -> Result<Stream>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let err_tx = tx.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let mono: Vec<i16> = data
                    .chunks(channels)
                    .map(|frame| {
                        let sum: i32 = frame
                            .iter()
                            .map(|&s| i32::from(<i16 as cpal::Sample>::from_sample(s)))
                            .sum();
                        (sum / frame.len() as i32) as i16
                    })
                    .collect();

                if tx.try_send(Ok(mono)).is_err() {
                    tracing::trace!("audio chunk dropped, pipeline behind");
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = err_tx.try_send(Err(err.to_string()));
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))
}
