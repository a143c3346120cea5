//! LiveVoice - streaming voice conversation engine
//!
//! Keeps one bidirectional session open with a remote conversational model:
//! microphone audio streams up in small PCM frames, model audio streams back
//! and is played gaplessly, user speech can barge in on the model, and tool
//! calls from the model are dispatched to local handlers and answered.

#![forbid(unsafe_code)]

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod gemini;
pub mod session;
pub mod state;
pub mod tools;
pub mod transcript;

pub use config::EngineConfig;
pub use engine::{EngineDeps, EngineNotice, EngineSnapshot, VoiceEngine};
pub use error::{EngineError, Result};
pub use gemini::{GeminiBackend, GeminiConfig};
pub use session::{ClientEvent, ConversationBackend, ServerEvent, SessionChannel, SessionSetup, StreamHandle};
pub use state::{ConversationState, StateMachine, Trigger};
pub use transcript::{Speaker, TranscriptionAggregator, Turn};
