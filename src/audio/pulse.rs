//! PulseAudio microphone and speaker
//!
//! Both devices use the simple API on a dedicated OS thread. The record
//! thread pushes 100 ms blocks into a tokio channel. The playback thread runs
//! [`playback_loop`] over a stream whose server-side buffer is kept short, so
//! a flush after an interrupt silences the model almost at once.

use crate::audio::device::{
    Held, MicrophoneHandle, MicrophoneSource, PlaybackDevice, PlaybackSink, Release,
};
use crate::audio::output::{playback_loop, OutputJob, PcmWriter, QueuedSink};
use crate::config::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Target playback latency held by the server.
const PLAYBACK_TARGET_MS: u32 = 100;

fn open_simple(
    app_name: &str,
    device: Option<&str>,
    direction: Direction,
    description: &str,
    rate: u32,
    attr: Option<&BufferAttr>,
) -> Result<Simple> {
    let spec = Spec {
        format: Format::S16le,
        channels: 1,
        rate,
    };
    Simple::new(None, app_name, direction, device, description, &spec, None, attr)
        .map_err(|e| EngineError::DeviceUnavailable(format!("PulseAudio {}: {}", description, e)))
}

/// Default (or named) PulseAudio source at 16 kHz mono.
pub struct PulseMicrophone {
    app_name: String,
    device: Option<String>,
    block_samples: usize,
}

impl PulseMicrophone {
    pub fn new(app_name: &str, device: Option<&str>) -> Self {
        Self {
            app_name: app_name.to_string(),
            device: device.map(str::to_string),
            block_samples: CAPTURE_SAMPLE_RATE as usize / 10,
        }
    }
}

#[async_trait]
impl MicrophoneSource for PulseMicrophone {
    async fn acquire(&self) -> Result<Held<dyn MicrophoneHandle>> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (tx, rx) = mpsc::channel(32);
        let stop = Arc::new(AtomicBool::new(false));

        let app_name = self.app_name.clone();
        let device = self.device.clone();
        let block_samples = self.block_samples;
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("pulse-record".to_string())
            .spawn(move || {
                let simple = match open_simple(
                    &app_name,
                    device.as_deref(),
                    Direction::Record,
                    "record",
                    CAPTURE_SAMPLE_RATE,
                    None,
                ) {
                    Ok(simple) => simple,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                record_loop(simple, block_samples, tx, thread_stop);
            })
            .map_err(|e| EngineError::DeviceUnavailable(format!("record thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| EngineError::DeviceUnavailable("record thread exited".to_string()))??;
        info!("PulseAudio microphone opened");

        let handle: Box<dyn MicrophoneHandle> = Box::new(PulseMicHandle { rx, stop });
        Ok(Held::new(handle))
    }
}

fn record_loop(
    simple: Simple,
    block_samples: usize,
    tx: mpsc::Sender<Result<Vec<f32>>>,
    stop: Arc<AtomicBool>,
) {
    let mut bytes = vec![0u8; block_samples * 2];
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut bytes) {
            error!("Audio read error: {}", e);
            let _ = tx.blocking_send(Err(EngineError::DeviceUnavailable(e.to_string())));
            break;
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();
        if tx.blocking_send(Ok(samples)).is_err() {
            break;
        }
    }
    debug!("Record thread terminated");
}

struct PulseMicHandle {
    rx: mpsc::Receiver<Result<Vec<f32>>>,
    stop: Arc<AtomicBool>,
}

impl Release for PulseMicHandle {
    fn release(&mut self) {
        // the thread notices on its next block and closes the stream
        self.stop.store(true, Ordering::Relaxed);
        self.rx.close();
        info!("PulseAudio microphone released");
    }
}

#[async_trait]
impl MicrophoneHandle for PulseMicHandle {
    async fn next_block(&mut self) -> Option<Result<Vec<f32>>> {
        self.rx.recv().await
    }
}

/// Default (or named) PulseAudio sink at 24 kHz mono.
pub struct PulseSpeaker {
    app_name: String,
    device: Option<String>,
}

impl PulseSpeaker {
    pub fn new(app_name: &str, device: Option<&str>) -> Self {
        Self {
            app_name: app_name.to_string(),
            device: device.map(str::to_string),
        }
    }
}

/// Short server-side buffer; `u32::MAX` leaves the rest to the server.
fn playback_buffer_attr() -> BufferAttr {
    let bytes_per_ms = PLAYBACK_SAMPLE_RATE / 1000 * 2;
    BufferAttr {
        maxlength: u32::MAX,
        tlength: PLAYBACK_TARGET_MS * bytes_per_ms,
        prebuf: u32::MAX,
        minreq: u32::MAX,
        fragsize: u32::MAX,
    }
}

struct PulseWriter(Simple);

impl PcmWriter for PulseWriter {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.0
            .write(pcm)
            .map_err(|e| EngineError::DeviceUnavailable(format!("PulseAudio write: {}", e)))
    }

    fn flush(&mut self) -> Result<()> {
        self.0
            .flush()
            .map_err(|e| EngineError::DeviceUnavailable(format!("PulseAudio flush: {}", e)))
    }
}

#[async_trait]
impl PlaybackDevice for PulseSpeaker {
    async fn acquire(&self) -> Result<Held<dyn PlaybackSink>> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (jobs_tx, jobs_rx) = std_mpsc::channel::<OutputJob>();

        let app_name = self.app_name.clone();
        let device = self.device.clone();
        std::thread::Builder::new()
            .name("pulse-playback".to_string())
            .spawn(move || {
                let attr = playback_buffer_attr();
                let simple = match open_simple(
                    &app_name,
                    device.as_deref(),
                    Direction::Playback,
                    "playback",
                    PLAYBACK_SAMPLE_RATE,
                    Some(&attr),
                ) {
                    Ok(simple) => simple,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // 20 ms of 16-bit mono
                let slice_bytes = (PLAYBACK_SAMPLE_RATE as usize / 50) * 2;
                playback_loop(PulseWriter(simple), jobs_rx, slice_bytes);
            })
            .map_err(|e| EngineError::DeviceUnavailable(format!("playback thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| EngineError::DeviceUnavailable("playback thread exited".to_string()))??;
        info!("PulseAudio speaker opened");

        let sink: Box<dyn PlaybackSink> = Box::new(QueuedSink::new(jobs_tx));
        Ok(Held::new(sink))
    }
}
