//! In-memory collaborators for engine scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use livevoice::audio::{
    AudioFrame, Held, MicrophoneHandle, MicrophoneSource, PlaybackDevice, PlaybackHandle,
    PlaybackSink, Release,
};
use livevoice::tools::{ActionExecutor, ExternalAction, PermissionSet};
use livevoice::tools::ToolResult;
use livevoice::{
    ClientEvent, ConversationBackend, ConversationState, EngineConfig, EngineDeps, EngineError,
    Result, ServerEvent, SessionSetup, StreamHandle, VoiceEngine,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// The server side of one opened stream.
pub struct RemotePeer {
    pub outbound: mpsc::UnboundedReceiver<ClientEvent>,
    pub events: mpsc::Sender<ServerEvent>,
}

impl RemotePeer {
    pub async fn send(&self, event: ServerEvent) {
        self.events.send(event).await.expect("engine dropped the stream");
    }

    /// Everything the engine has sent so far.
    pub fn drain_outbound(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.outbound.try_recv() {
            events.push(event);
        }
        events
    }

    /// Next tool result, skipping audio frames.
    pub async fn next_tool_result(&mut self) -> ToolResult {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for a tool result")
                .expect("stream closed before a tool result");
            if let ClientEvent::ToolResult(result) = event {
                return result;
            }
        }
    }
}

pub struct MockBackend {
    peers: mpsc::UnboundedSender<RemotePeer>,
    pub hang: AtomicBool,
    pub setups: Mutex<Vec<SessionSetup>>,
}

#[async_trait]
impl ConversationBackend for MockBackend {
    async fn open(&self, setup: &SessionSetup) -> Result<StreamHandle> {
        self.setups.lock().push(setup.clone());
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.peers.send(RemotePeer {
            outbound: out_rx,
            events: in_tx,
        });
        Ok(StreamHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Microphone that yields `blocks` blocks, one per `interval`, then goes quiet.
pub struct MockMicrophone {
    blocks: usize,
    block_samples: usize,
    interval: Duration,
    deny: bool,
    hang: bool,
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl MockMicrophone {
    pub fn new(blocks: usize, block_samples: usize, interval: Duration) -> Self {
        Self {
            blocks,
            block_samples,
            interval,
            deny: false,
            hang: false,
            acquired: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn silent() -> Self {
        Self::new(0, 0, Duration::from_millis(100))
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::silent()
        }
    }

    /// `acquire` never resolves, like an unanswered permission prompt.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::silent()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct MockMicHandle {
    remaining: usize,
    block_samples: usize,
    interval: Duration,
    released: Arc<AtomicUsize>,
}

impl Release for MockMicHandle {
    fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MicrophoneHandle for MockMicHandle {
    async fn next_block(&mut self) -> Option<Result<Vec<f32>>> {
        if self.remaining == 0 {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.interval).await;
        self.remaining -= 1;
        let block = (0..self.block_samples)
            .map(|n| if n % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        Some(Ok(block))
    }
}

#[async_trait]
impl MicrophoneSource for MockMicrophone {
    async fn acquire(&self) -> Result<Held<dyn MicrophoneHandle>> {
        if self.deny {
            return Err(EngineError::PermissionDenied("microphone".into()));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let handle: Box<dyn MicrophoneHandle> = Box::new(MockMicHandle {
            remaining: self.blocks,
            block_samples: self.block_samples,
            interval: self.interval,
            released: self.released.clone(),
        });
        Ok(Held::new(handle))
    }
}

#[derive(Debug, Default)]
pub struct SpeakerState {
    pub acquired: usize,
    pub released: usize,
    /// `(start_at, duration)` of every scheduled buffer
    pub scheduled: Vec<(Duration, Duration)>,
    pub cancelled: usize,
    /// Make every `schedule` fail as if the device went away.
    pub fail_schedule: bool,
}

#[derive(Default)]
pub struct MockSpeaker {
    pub state: Arc<Mutex<SpeakerState>>,
}

struct MockSink {
    origin: Instant,
    state: Arc<Mutex<SpeakerState>>,
}

struct MockHandle {
    state: Arc<Mutex<SpeakerState>>,
}

impl PlaybackHandle for MockHandle {
    fn cancel(&mut self) {
        self.state.lock().cancelled += 1;
    }
}

impl Release for MockSink {
    fn release(&mut self) {
        self.state.lock().released += 1;
    }
}

impl PlaybackSink for MockSink {
    fn clock_now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn schedule(&mut self, frame: &AudioFrame, start_at: Duration) -> Result<Box<dyn PlaybackHandle>> {
        let mut state = self.state.lock();
        if state.fail_schedule {
            return Err(EngineError::DeviceUnavailable("speaker unplugged".into()));
        }
        state.scheduled.push((start_at, frame.duration()));
        drop(state);
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl PlaybackDevice for MockSpeaker {
    async fn acquire(&self) -> Result<Held<dyn PlaybackSink>> {
        self.state.lock().acquired += 1;
        let sink: Box<dyn PlaybackSink> = Box::new(MockSink {
            origin: Instant::now(),
            state: self.state.clone(),
        });
        Ok(Held::new(sink))
    }
}

#[derive(Default)]
pub struct RecordingExecutor {
    pub actions: Mutex<Vec<ExternalAction>>,
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: ExternalAction) -> Result<String> {
        let text = format!("done: {}", action.kind());
        self.actions.lock().push(action);
        Ok(text)
    }
}

pub struct Harness {
    pub engine: VoiceEngine,
    pub backend: Arc<MockBackend>,
    pub peers: mpsc::UnboundedReceiver<RemotePeer>,
    pub mic: Arc<MockMicrophone>,
    pub speaker: Arc<MockSpeaker>,
    pub executor: Arc<RecordingExecutor>,
}

pub fn harness(mic: MockMicrophone, permissions: PermissionSet) -> Harness {
    harness_with(EngineConfig::default(), mic, permissions)
}

pub fn harness_with(config: EngineConfig, mic: MockMicrophone, permissions: PermissionSet) -> Harness {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let backend = Arc::new(MockBackend {
        peers: peers_tx,
        hang: AtomicBool::new(false),
        setups: Mutex::new(Vec::new()),
    });
    let mic = Arc::new(mic);
    let speaker = Arc::new(MockSpeaker::default());
    let executor = Arc::new(RecordingExecutor::default());

    let deps = EngineDeps {
        backend: backend.clone(),
        microphone: mic.clone(),
        speaker: speaker.clone(),
        executor: executor.clone(),
        permissions: Arc::new(permissions),
    };
    let engine = VoiceEngine::spawn(config, deps, SessionSetup::default());

    Harness {
        engine,
        backend,
        peers,
        mic,
        speaker,
        executor,
    }
}

impl Harness {
    /// Start a session and return the server side of its stream.
    pub async fn connect(&mut self) -> RemotePeer {
        self.engine.start().await.expect("session should start");
        self.peers.recv().await.expect("backend should have opened a stream")
    }

    pub async fn wait_for_state(&self, state: ConversationState) {
        let mut watch = self.engine.watch();
        tokio::time::timeout(Duration::from_secs(30), watch.wait_for(|s| s.state == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
            .expect("engine task stopped");
    }
}

/// `millis` of 24 kHz 16-bit mono PCM.
pub fn model_audio(millis: u64) -> Vec<u8> {
    let samples = (24 * millis) as usize;
    let mut bytes = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        bytes.extend_from_slice(&1000i16.to_le_bytes());
    }
    bytes
}
