//! Microphone capture loop
//!
//! Runs in its own task and owns the microphone for the whole session.
//! Raw device blocks are regrouped into fixed-size frames; each frame gets a
//! level reading and its wire encoding before being handed to the engine.

use crate::audio::device::{Held, MicrophoneHandle};
use crate::audio::frame::{encode_frame, AudioFrame, EncodedFrame};
use crate::audio::level::LevelMeter;
use crate::error::EngineError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A captured frame, already encoded for the wire.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub encoded: EncodedFrame,
    pub level: f32,
}

/// Output of the capture task
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(CapturedFrame),
    /// The microphone failed or stopped producing; capture has ended.
    Stopped(EngineError),
}

/// Regroups variable-length device blocks into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append a block and return every frame it completed.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(block);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            frames.push(self.pending.drain(..self.frame_samples).collect());
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

pub struct CaptureLoop {
    mic: Held<dyn MicrophoneHandle>,
    assembler: FrameAssembler,
    sample_rate: u32,
    meter: LevelMeter,
    tx: mpsc::Sender<CaptureEvent>,
}

impl CaptureLoop {
    pub fn new(
        mic: Held<dyn MicrophoneHandle>,
        frame_samples: usize,
        sample_rate: u32,
        meter: LevelMeter,
        tx: mpsc::Sender<CaptureEvent>,
    ) -> Self {
        Self {
            mic,
            assembler: FrameAssembler::new(frame_samples),
            sample_rate,
            meter,
            tx,
        }
    }

    /// Run on a tokio task. Aborting the task drops the loop, which
    /// releases the microphone.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Capture loop started ({} Hz)", self.sample_rate);
        loop {
            let block = match self.mic.next_block().await {
                Some(Ok(block)) => block,
                Some(Err(e)) => {
                    warn!("Microphone error: {}", e);
                    let _ = self.tx.send(CaptureEvent::Stopped(e)).await;
                    break;
                }
                None => {
                    let _ = self
                        .tx
                        .send(CaptureEvent::Stopped(EngineError::DeviceUnavailable(
                            "microphone stopped producing audio".to_string(),
                        )))
                        .await;
                    break;
                }
            };

            for samples in self.assembler.push(&block) {
                let level = self.meter.level(&samples);
                let frame = AudioFrame::mono(samples, self.sample_rate);
                let encoded = encode_frame(&frame);
                if self
                    .tx
                    .send(CaptureEvent::Frame(CapturedFrame { encoded, level }))
                    .await
                    .is_err()
                {
                    debug!("Capture receiver dropped, stopping capture loop");
                    return;
                }
            }
        }
        info!("Capture loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::Release;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct ScriptedMic {
        blocks: VecDeque<Vec<f32>>,
        released: Arc<AtomicBool>,
    }

    impl Release for ScriptedMic {
        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MicrophoneHandle for ScriptedMic {
        async fn next_block(&mut self) -> Option<Result<Vec<f32>>> {
            self.blocks.pop_front().map(Ok)
        }
    }

    #[test]
    fn test_assembler_regroups_blocks() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(assembler.buffered(), 1);
    }

    #[tokio::test]
    async fn test_capture_emits_frames_then_reports_end() {
        let released = Arc::new(AtomicBool::new(false));
        let mic = ScriptedMic {
            blocks: VecDeque::from(vec![vec![0.25; 3], vec![0.25; 5]]),
            released: released.clone(),
        };
        let mic: Box<dyn MicrophoneHandle> = Box::new(mic);
        let (tx, mut rx) = mpsc::channel(8);
        let capture = CaptureLoop::new(
            Held::new(mic),
            4,
            16_000,
            LevelMeter::new(2.0, 1.0),
            tx,
        );
        capture.spawn().await.unwrap();

        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                CaptureEvent::Frame(frame) => {
                    assert_eq!(frame.encoded.sample_count, 4);
                    assert!((frame.level - 0.5).abs() < 1e-6);
                }
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        match rx.recv().await.unwrap() {
            CaptureEvent::Stopped(EngineError::DeviceUnavailable(_)) => {}
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(released.load(Ordering::SeqCst));
    }
}
