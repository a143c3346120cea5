//! The voice engine actor
//!
//! One task owns every piece of mutable session state: the state machine,
//! the playback scheduler, the transcript and the open channel. Capture
//! frames, inbound server events, finished tool calls, the drain timer and
//! user commands all arrive through a single `select!` loop, so a drain
//! timer can never race an interrupt and a tool result can never be sent
//! after `stop()` has returned.

use crate::audio::capture::{CaptureEvent, CaptureLoop};
use crate::audio::device::{Held, MicrophoneHandle, MicrophoneSource, PlaybackDevice, PlaybackSink};
use crate::audio::frame::decode_pcm16_le;
use crate::audio::level::LevelMeter;
use crate::audio::playback::PlaybackScheduler;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::session::{ConversationBackend, ServerEvent, SessionChannel, SessionSetup, StreamHandle};
use crate::state::{ConversationState, StateMachine, Trigger};
use crate::tools::actions::{ActionExecutor, PermissionStore};
use crate::tools::dispatcher::{ActionLogEntry, Dispatched, ToolDispatcher};
use crate::tools::schema::ToolDeclaration;
use crate::transcript::{Speaker, TranscriptionAggregator, Turn};
use serde::Serialize;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_DEPTH: usize = 16;
const NOTICE_CHANNEL_DEPTH: usize = 64;

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct EngineDeps {
    pub backend: Arc<dyn ConversationBackend>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub speaker: Arc<dyn PlaybackDevice>,
    pub executor: Arc<dyn ActionExecutor>,
    pub permissions: Arc<dyn PermissionStore>,
}

/// What a UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub state: ConversationState,
    /// Microphone level of the last captured frame, `0.0..=max_level`.
    pub input_level: f32,
    pub user_text: String,
    pub model_text: String,
    pub recent_actions: Vec<ActionLogEntry>,
    pub last_error: Option<String>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            state: ConversationState::Idle,
            input_level: 0.0,
            user_text: String::new(),
            model_text: String::new(),
            recent_actions: Vec::new(),
            last_error: None,
        }
    }
}

/// Discrete things that happened, for subscribers that keep history.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    TurnCompleted(Turn),
    ToolHandled {
        call_id: String,
        entry: ActionLogEntry,
    },
    Error(String),
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
}

/// Handle to a running engine. Dropping it stops the session.
pub struct VoiceEngine {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<EngineSnapshot>,
    notices: broadcast::Sender<EngineNotice>,
    tools: Vec<ToolDeclaration>,
    task: JoinHandle<()>,
}

impl VoiceEngine {
    /// Spawn the engine with the built-in tool set. If `setup.tools` is
    /// empty it is filled with the built-in declarations.
    pub fn spawn(config: EngineConfig, deps: EngineDeps, setup: SessionSetup) -> Self {
        let dispatcher = ToolDispatcher::with_builtin_tools(
            deps.executor.clone(),
            deps.permissions.clone(),
            config.recent_actions_capacity,
        );
        Self::spawn_with_dispatcher(config, deps, setup, dispatcher)
    }

    /// Spawn the engine with a caller-assembled dispatcher.
    pub fn spawn_with_dispatcher(
        config: EngineConfig,
        deps: EngineDeps,
        mut setup: SessionSetup,
        dispatcher: ToolDispatcher,
    ) -> Self {
        if setup.tools.is_empty() {
            setup.tools = dispatcher.declarations();
        }
        let tools = setup.tools.clone();

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());
        let (notices_tx, _) = broadcast::channel(NOTICE_CHANNEL_DEPTH);

        let actor = EngineActor {
            meter: LevelMeter::new(config.level_scale, config.max_level),
            config,
            deps,
            setup,
            dispatcher: Arc::new(dispatcher),
            commands: commands_rx,
            snapshot: snapshot_tx,
            notices: notices_tx.clone(),
            machine: StateMachine::new(),
            transcript: TranscriptionAggregator::new(),
            connecting: None,
            pending_start: None,
            session: None,
            drain: None,
            input_level: 0.0,
            last_error: None,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            notices: notices_tx,
            tools,
            task,
        }
    }

    /// Open a session. Resolves once the engine is listening, or with the
    /// error that prevented it.
    pub async fn start(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Start(tx))
            .await
            .map_err(|_| EngineError::Channel("engine task has stopped".to_string()))?;
        rx.await.map_err(|_| EngineError::Cancelled)?
    }

    /// Tear the session down. Idempotent; when it returns the microphone and
    /// speaker are released and no further events are processed.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop(tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Stop the session and wait for the engine task to exit.
    pub async fn shutdown(self) {
        self.stop().await;
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            error!("Engine task ended abnormally: {}", e);
        }
    }

    pub fn state(&self) -> ConversationState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// Tool declarations announced at session setup.
    pub fn tools(&self) -> &[ToolDeclaration] {
        &self.tools
    }
}

/// Resources acquired by a connect attempt.
struct Connected {
    mic: Held<dyn MicrophoneHandle>,
    sink: Held<dyn PlaybackSink>,
    stream: StreamHandle,
}

/// One live conversation.
struct Session {
    channel: SessionChannel,
    scheduler: PlaybackScheduler,
    capture: JoinHandle<()>,
    capture_rx: mpsc::Receiver<CaptureEvent>,
    tools: JoinSet<Dispatched>,
}

enum SessionInput {
    Server(Option<ServerEvent>),
    Capture(Option<CaptureEvent>),
    Tool(std::result::Result<Dispatched, JoinError>),
}

struct EngineActor {
    config: EngineConfig,
    deps: EngineDeps,
    setup: SessionSetup,
    meter: LevelMeter,
    dispatcher: Arc<ToolDispatcher>,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<EngineSnapshot>,
    notices: broadcast::Sender<EngineNotice>,
    machine: StateMachine,
    transcript: TranscriptionAggregator,
    connecting: Option<JoinHandle<Result<Connected>>>,
    pending_start: Option<oneshot::Sender<Result<()>>>,
    session: Option<Session>,
    drain: Option<Pin<Box<Sleep>>>,
    input_level: f32,
    last_error: Option<String>,
}

impl EngineActor {
    async fn run(mut self) {
        debug!("Engine task started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start(reply)) => self.start(reply),
                    Some(Command::Stop(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                connected = connect_finished(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connected(connected);
                }
                input = next_session_input(&mut self.session) => match input {
                    SessionInput::Server(event) => self.on_server_event(event).await,
                    SessionInput::Capture(event) => self.on_capture(event).await,
                    SessionInput::Tool(done) => self.on_tool_done(done),
                },
                _ = drain_elapsed(&mut self.drain) => {
                    self.drain = None;
                    self.on_drained();
                }
            }
        }
        debug!("Engine task terminated");
    }

    fn start(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.machine.state().is_active() {
            let _ = reply.send(Err(EngineError::SessionActive));
            return;
        }
        self.last_error = None;
        self.transcript.clear();
        self.transition(Trigger::Start);

        let microphone = self.deps.microphone.clone();
        let speaker = self.deps.speaker.clone();
        let backend = self.deps.backend.clone();
        let setup = self.setup.clone();
        let mic_timeout = self.config.mic_acquire_timeout();

        info!("Starting session with {}", setup.model);
        self.connecting = Some(tokio::spawn(async move {
            let mic = tokio::time::timeout(mic_timeout, microphone.acquire())
                .await
                .map_err(|_| {
                    EngineError::DeviceUnavailable("timed out waiting for the microphone".to_string())
                })??;
            let sink = speaker.acquire().await?;
            let stream = backend.open(&setup).await?;
            Ok(Connected { mic, sink, stream })
        }));
        self.pending_start = Some(reply);
        self.publish();
    }

    fn on_connected(&mut self, connected: std::result::Result<Result<Connected>, JoinError>) {
        let connected = match connected {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return self.fail_connect(e),
            Err(e) => return self.fail_connect(EngineError::Channel(format!("connect task failed: {}", e))),
        };

        let (capture_tx, capture_rx) = mpsc::channel(self.config.capture_channel_depth.max(1));
        let capture = CaptureLoop::new(
            connected.mic,
            self.config.capture_frame_samples,
            self.config.capture_sample_rate,
            self.meter,
            capture_tx,
        )
        .spawn();

        self.session = Some(Session {
            channel: SessionChannel::new(connected.stream),
            scheduler: PlaybackScheduler::new(connected.sink),
            capture,
            capture_rx,
            tools: JoinSet::new(),
        });
        self.transition(Trigger::Connected);
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Ok(()));
        }
        self.publish();
    }

    fn fail_connect(&mut self, e: EngineError) {
        error!("Failed to start session: {}", e);
        self.record_error(&e);
        self.transition(Trigger::Fail);
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(e));
        }
        self.publish();
    }

    async fn stop(&mut self) {
        self.teardown().await;
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(EngineError::Cancelled));
        }
        self.transition(Trigger::Stop);
        self.publish();
    }

    /// Release everything the session holds. Safe to call with no session.
    async fn teardown(&mut self) {
        self.drain = None;

        if let Some(connecting) = self.connecting.take() {
            // dropping the attempt releases whatever it had acquired
            connecting.abort();
            let _ = connecting.await;
        }

        if let Some(mut session) = self.session.take() {
            session.capture.abort();
            let _ = (&mut session.capture).await;
            session.capture_rx.close();

            if !session.tools.is_empty() {
                debug!("Cancelling {} in-flight tool calls", session.tools.len());
            }
            session.tools.shutdown().await;

            let flushed = session.scheduler.flush();
            if flushed > 0 {
                debug!("Dropped {} scheduled buffers on teardown", flushed);
            }
            session.channel.close();
            info!("Session closed");
        }

        self.transcript.clear();
        self.input_level = 0.0;
    }

    async fn fail_session(&mut self, e: EngineError) {
        error!("Session failed: {}", e);
        self.teardown().await;
        self.record_error(&e);
        self.transition(Trigger::Fail);
        self.publish();
    }

    async fn on_server_event(&mut self, event: Option<ServerEvent>) {
        let Some(event) = event else {
            return self
                .fail_session(EngineError::Channel("stream ended without close".to_string()))
                .await;
        };

        match event {
            ServerEvent::InputTranscript(text) => {
                self.transcript.push(Speaker::User, &text);
                self.publish();
            }
            ServerEvent::OutputTranscript(text) => {
                self.transcript.push(Speaker::Model, &text);
                self.publish();
            }
            ServerEvent::OutputText(text) => {
                self.transcript.push(Speaker::Model, &text);
                self.on_model_output();
                self.publish();
            }
            ServerEvent::AudioDelta(bytes) => {
                if let Err(e) = self.on_audio(&bytes) {
                    if e.is_fatal() {
                        return self.fail_session(e).await;
                    }
                    warn!("Dropping model audio: {}", e);
                }
            }
            ServerEvent::TurnComplete => self.on_turn_complete(),
            ServerEvent::Interrupted => self.on_interrupted(),
            ServerEvent::ToolCalls(calls) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                for call in calls {
                    info!("Model requested {} ({})", call.name, call.id);
                    let dispatcher = self.dispatcher.clone();
                    session
                        .tools
                        .spawn(async move { dispatcher.dispatch_answered(call).await });
                }
            }
            ServerEvent::ToolCallCancellation(ids) => {
                info!("Server cancelled tool calls {:?}", ids);
            }
            ServerEvent::GoAway => {
                warn!("Server is about to close the session");
            }
            ServerEvent::Error(message) => {
                self.fail_session(EngineError::Channel(message)).await;
            }
            ServerEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                self.fail_session(EngineError::Channel(format!("stream closed: {}", reason)))
                    .await;
            }
        }
    }

    /// First audible or visible output of a turn moves us to speaking and
    /// cancels a pending drain.
    fn on_model_output(&mut self) {
        if self.drain.take().is_some() {
            debug!("New model output, cancelling pending drain");
        }
        if self.machine.state() == ConversationState::Listening {
            self.transition(Trigger::ModelOutput);
        }
    }

    fn on_audio(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = decode_pcm16_le(bytes, self.config.playback_sample_rate);
        if frame.is_empty() {
            return Ok(());
        }
        self.on_model_output();
        if let Some(session) = self.session.as_mut() {
            session.scheduler.enqueue(&frame)?;
        }
        self.publish();
        Ok(())
    }

    fn on_turn_complete(&mut self) {
        let turn = self.transcript.complete_turn();
        if !turn.is_empty() {
            let _ = self.notices.send(EngineNotice::TurnCompleted(turn));
        }

        if self.machine.state() == ConversationState::Speaking {
            let remaining = self
                .session
                .as_ref()
                .map(|s| s.scheduler.remaining())
                .unwrap_or_default();
            if remaining.is_zero() {
                self.transition(Trigger::Drained);
            } else {
                let wait = remaining + self.config.drain_guard();
                debug!("Turn complete, draining for {:?}", wait);
                self.drain = Some(Box::pin(tokio::time::sleep(wait)));
            }
        }
        self.publish();
    }

    fn on_drained(&mut self) {
        if self.machine.state() == ConversationState::Speaking {
            self.transition(Trigger::Drained);
            self.publish();
        }
    }

    fn on_interrupted(&mut self) {
        self.drain = None;
        let flushed = self
            .session
            .as_mut()
            .map(|s| s.scheduler.flush())
            .unwrap_or(0);
        info!("Interrupted by user, flushed {} buffers", flushed);
        if self.machine.state() == ConversationState::Speaking {
            self.transition(Trigger::Interrupted);
        }
        self.publish();
    }

    async fn on_capture(&mut self, event: Option<CaptureEvent>) {
        let frame = match event {
            Some(CaptureEvent::Frame(frame)) => frame,
            Some(CaptureEvent::Stopped(e)) => return self.fail_session(e).await,
            None => {
                return self
                    .fail_session(EngineError::DeviceUnavailable("capture task ended".to_string()))
                    .await
            }
        };

        self.input_level = frame.level;
        let forward = match self.machine.state() {
            ConversationState::Listening => true,
            ConversationState::Speaking => self.config.stream_while_speaking,
            _ => false,
        };
        if forward {
            if let Some(session) = self.session.as_ref() {
                session.channel.send_audio(frame.encoded);
            }
        }
        self.publish();
    }

    fn on_tool_done(&mut self, done: std::result::Result<Dispatched, JoinError>) {
        let dispatched = match done {
            Ok(dispatched) => dispatched,
            // only teardown aborts these, and the channel is gone by then
            Err(e) => {
                warn!("Tool task did not finish: {}", e);
                return;
            }
        };
        if let Some(session) = self.session.as_ref() {
            session.channel.send_tool_result(dispatched.result.clone());
        }
        let _ = self.notices.send(EngineNotice::ToolHandled {
            call_id: dispatched.result.id,
            entry: ActionLogEntry {
                tool: dispatched.result.name,
                status: dispatched.status,
                description: dispatched.log,
            },
        });
        self.publish();
    }

    fn transition(&mut self, trigger: Trigger) {
        match self.machine.apply(trigger) {
            Ok((from, to)) if from != to => {
                info!("State {} -> {}", from, to);
                let _ = self.notices.send(EngineNotice::StateChanged { from, to });
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring {}", e),
        }
    }

    fn record_error(&mut self, e: &EngineError) {
        let message = e.to_string();
        self.last_error = Some(message.clone());
        let _ = self.notices.send(EngineNotice::Error(message));
    }

    fn publish(&self) {
        self.snapshot.send_replace(EngineSnapshot {
            state: self.machine.state(),
            input_level: self.input_level,
            user_text: self.transcript.user_text().to_string(),
            model_text: self.transcript.model_text().to_string(),
            recent_actions: self.dispatcher.recent_actions(),
            last_error: self.last_error.clone(),
        });
    }
}

async fn connect_finished(
    task: &mut Option<JoinHandle<Result<Connected>>>,
) -> std::result::Result<Result<Connected>, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn next_session_input(session: &mut Option<Session>) -> SessionInput {
    let Some(session) = session else {
        return pending().await;
    };
    tokio::select! {
        event = session.channel.next_event() => SessionInput::Server(event),
        Some(done) = session.tools.join_next() => SessionInput::Tool(done),
        event = session.capture_rx.recv() => SessionInput::Capture(event),
    }
}

async fn drain_elapsed(drain: &mut Option<Pin<Box<Sleep>>>) {
    match drain {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
