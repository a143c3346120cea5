//! Session channel: the engine's view of the remote conversational stream
//!
//! A backend opens the stream with a [`SessionSetup`] and hands back a pair of
//! channels. Outbound messages are [`ClientEvent`]s; inbound traffic is
//! already demultiplexed into the tagged [`ServerEvent`] union.

use crate::audio::frame::EncodedFrame;
use crate::error::Result;
use crate::tools::schema::{ToolCall, ToolDeclaration, ToolResult};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything the remote endpoint needs to start a conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub language: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
    /// Ask the server to transcribe both directions.
    pub transcription: bool,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.0-flash-live-001".to_string(),
            voice: "Puck".to_string(),
            language: "en-US".to_string(),
            system_instruction: "You are a helpful voice assistant. Keep answers short and conversational.".to_string(),
            tools: Vec::new(),
            transcription: true,
        }
    }
}

/// Client -> server messages
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Audio(EncodedFrame),
    ToolResult(ToolResult),
}

/// Server -> client events
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    InputTranscript(String),
    OutputTranscript(String),
    /// Model text output (not a transcript of its audio).
    OutputText(String),
    /// Raw little-endian 16-bit PCM at the playback rate.
    AudioDelta(Vec<u8>),
    TurnComplete,
    Interrupted,
    ToolCalls(Vec<ToolCall>),
    ToolCallCancellation(Vec<String>),
    /// Server is about to disconnect.
    GoAway,
    Error(String),
    Closed(Option<String>),
}

/// Channels of an open stream. Dropping `outbound` closes the stream.
pub struct StreamHandle {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::Receiver<ServerEvent>,
}

/// A remote endpoint that can open conversation streams.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Open a stream and wait for the server to accept the setup.
    async fn open(&self, setup: &SessionSetup) -> Result<StreamHandle>;
}

/// One open stream, owned by the engine for the duration of a session.
pub struct SessionChannel {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::Receiver<ServerEvent>,
}

impl SessionChannel {
    pub fn new(handle: StreamHandle) -> Self {
        Self {
            outbound: handle.outbound,
            inbound: handle.inbound,
        }
    }

    /// Forward a captured frame. Returns false if the stream is gone.
    pub fn send_audio(&self, frame: EncodedFrame) -> bool {
        self.send(ClientEvent::Audio(frame))
    }

    /// Answer a tool call. A closed stream makes this a no-op.
    pub fn send_tool_result(&self, result: ToolResult) -> bool {
        self.send(ClientEvent::ToolResult(result))
    }

    fn send(&self, event: ClientEvent) -> bool {
        if self.outbound.send(event).is_err() {
            debug!("Session stream already closed, dropping outbound message");
            return false;
        }
        true
    }

    /// Next inbound event; `None` once the backend side has gone away.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    /// Close the outbound half and stop reading.
    pub fn close(self) {
        let Self {
            outbound,
            mut inbound,
        } = self;
        inbound.close();
        drop(outbound);
    }
}
