//! Per-turn transcription accumulation

use serde::Serialize;

/// Who produced a transcript delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

/// Text of one user/model exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub user_text: String,
    pub model_text: String,
}

impl Turn {
    pub fn is_empty(&self) -> bool {
        self.user_text.is_empty() && self.model_text.is_empty()
    }
}

/// Accumulates streamed partial text until the server closes the turn.
///
/// Deltas are appended in the order they are pushed; the engine pushes them
/// in stream arrival order.
#[derive(Debug, Default)]
pub struct TranscriptionAggregator {
    current: Turn,
}

impl TranscriptionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, speaker: Speaker, delta: &str) {
        match speaker {
            Speaker::User => self.current.user_text.push_str(delta),
            Speaker::Model => self.current.model_text.push_str(delta),
        }
    }

    pub fn user_text(&self) -> &str {
        &self.current.user_text
    }

    pub fn model_text(&self) -> &str {
        &self.current.model_text
    }

    /// Close the current turn: returns its text and starts an empty one.
    pub fn complete_turn(&mut self) -> Turn {
        std::mem::take(&mut self.current)
    }

    pub fn clear(&mut self) {
        self.current = Turn::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_accumulate_per_speaker_in_order() {
        let mut aggregator = TranscriptionAggregator::new();
        aggregator.push(Speaker::User, "What's the ");
        aggregator.push(Speaker::Model, "It is ");
        aggregator.push(Speaker::User, "weather?");
        aggregator.push(Speaker::Model, "sunny.");
        assert_eq!(aggregator.user_text(), "What's the weather?");
        assert_eq!(aggregator.model_text(), "It is sunny.");
    }

    #[test]
    fn test_complete_turn_returns_text_and_resets() {
        let mut aggregator = TranscriptionAggregator::new();
        aggregator.push(Speaker::User, "hi");
        aggregator.push(Speaker::Model, "hello");

        let turn = aggregator.complete_turn();
        assert_eq!(turn.user_text, "hi");
        assert_eq!(turn.model_text, "hello");
        assert_eq!(aggregator.user_text(), "");
        assert_eq!(aggregator.model_text(), "");
        assert!(aggregator.complete_turn().is_empty());
    }
}
