//! Writer-thread playback
//!
//! For sound APIs that only offer a blocking "write PCM" call. Buffers are
//! played back to back on a dedicated thread. Cancelling a buffer also posts
//! a flush, so audio already handed to the device is dropped even when the
//! thread is idle waiting for the next job.

use crate::audio::device::{PlaybackHandle, PlaybackSink, Release};
use crate::audio::frame::{to_pcm16_le, AudioFrame};
use crate::error::{EngineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Blocking PCM output owned by the playback thread.
pub trait PcmWriter {
    /// Write little-endian 16-bit PCM, blocking while the device buffer is full.
    fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Discard everything written but not yet heard.
    fn flush(&mut self) -> Result<()>;
}

pub enum OutputJob {
    Play {
        pcm: Vec<u8>,
        cancelled: Arc<AtomicBool>,
    },
    Flush,
}

/// Play jobs until every sender is gone. A cancelled buffer stops at the
/// next slice boundary; its `Flush` job clears what the device still holds.
pub fn playback_loop<W: PcmWriter>(mut writer: W, jobs: mpsc::Receiver<OutputJob>, slice_bytes: usize) {
    let slice_bytes = slice_bytes.max(2);
    // written since the last flush
    let mut dirty = false;

    while let Ok(job) = jobs.recv() {
        match job {
            OutputJob::Play { pcm, cancelled } => {
                for slice in pcm.chunks(slice_bytes) {
                    if cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = writer.write(slice) {
                        error!("Audio write error: {}", e);
                        return;
                    }
                    dirty = true;
                }
            }
            OutputJob::Flush => {
                if dirty {
                    flush(&mut writer);
                    dirty = false;
                }
            }
        }
    }

    if dirty {
        flush(&mut writer);
    }
    debug!("Playback thread terminated");
}

fn flush<W: PcmWriter>(writer: &mut W) {
    if let Err(e) = writer.flush() {
        warn!("Failed to flush playback buffer: {}", e);
    }
}

/// [`PlaybackSink`] feeding a thread that runs [`playback_loop`].
pub struct QueuedSink {
    jobs: Option<mpsc::Sender<OutputJob>>,
    origin: Instant,
}

impl QueuedSink {
    pub fn new(jobs: mpsc::Sender<OutputJob>) -> Self {
        Self {
            jobs: Some(jobs),
            origin: Instant::now(),
        }
    }
}

impl Release for QueuedSink {
    fn release(&mut self) {
        // the thread exits once the outstanding handles are dropped too
        self.jobs = None;
        debug!("Playback sink released");
    }
}

impl PlaybackSink for QueuedSink {
    fn clock_now(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Writes play back to back, so `start_at` only matters to the
    /// scheduler's cursor.
    fn schedule(&mut self, frame: &AudioFrame, _start_at: Duration) -> Result<Box<dyn PlaybackHandle>> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| EngineError::DeviceUnavailable("speaker released".to_string()))?;
        let cancelled = Arc::new(AtomicBool::new(false));
        jobs.send(OutputJob::Play {
            pcm: to_pcm16_le(frame.samples()),
            cancelled: cancelled.clone(),
        })
        .map_err(|_| EngineError::DeviceUnavailable("playback thread stopped".to_string()))?;
        Ok(Box::new(QueuedHandle {
            cancelled,
            jobs: jobs.clone(),
        }))
    }
}

struct QueuedHandle {
    cancelled: Arc<AtomicBool>,
    jobs: mpsc::Sender<OutputJob>,
}

impl PlaybackHandle for QueuedHandle {
    fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::Relaxed) {
            let _ = self.jobs.send(OutputJob::Flush);
        }
    }
}
