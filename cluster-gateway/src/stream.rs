//! Turns cumulative worker output into OpenAI-style incremental deltas.

use cluster_common::chat::{ChatCompletionStreamResponse, DeltaMessage};
use cluster_common::{FinishReason, ModelOutput};

const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// Tracks what one choice has already sent.
#[derive(Debug, Default)]
pub struct ChoiceAssembler {
    sent: String,
    sent_chars: usize,
}

impl ChoiceAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text not yet sent, given the cumulative `text` so far.
    ///
    /// Replacement characters (from multi-byte sequences split across chunks) are dropped
    /// first. A text no longer than what was already sent yields an empty delta and leaves
    /// the state untouched.
    pub fn delta(&mut self, text: &str) -> String {
        let cleaned: String = text.chars().filter(|c| *c != REPLACEMENT_CHAR).collect();
        let chars = cleaned.chars().count();
        if chars <= self.sent_chars {
            return String::new();
        }
        let delta: String = cleaned.chars().skip(self.sent_chars).collect();
        self.sent = cleaned;
        self.sent_chars = chars;
        delta
    }

    pub fn sent(&self) -> &str {
        &self.sent
    }
}

/// What to do with one worker chunk of choice `index`.
#[derive(Debug, Clone)]
pub enum ChunkAction {
    Emit(ChatCompletionStreamResponse),
    /// Finish marker with no new content; sent after every choice's content.
    Defer(ChatCompletionStreamResponse),
    Skip,
}

/// Builds the frames of one streamed completion.
#[derive(Debug)]
pub struct StreamAssembler {
    id: String,
    created: i64,
    model: String,
    choices: Vec<ChoiceAssembler>,
}

impl StreamAssembler {
    pub fn new(id: String, created: i64, model: String, n: usize) -> Self {
        Self {
            id,
            created,
            model,
            choices: (0..n).map(|_| ChoiceAssembler::new()).collect(),
        }
    }

    /// First frame of a choice: the role only.
    pub fn role_chunk(&self, index: usize) -> ChatCompletionStreamResponse {
        self.chunk(
            index,
            DeltaMessage {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        )
    }

    pub fn push(&mut self, index: usize, output: &ModelOutput) -> ChunkAction {
        let Some(choice) = self.choices.get_mut(index) else {
            return ChunkAction::Skip;
        };
        let delta = choice.delta(&output.text);
        match (delta.is_empty(), output.finish_reason) {
            (true, None) => ChunkAction::Skip,
            (true, Some(reason)) => {
                ChunkAction::Defer(self.chunk(index, DeltaMessage::default(), Some(reason)))
            }
            (false, finish_reason) => ChunkAction::Emit(self.chunk(
                index,
                DeltaMessage {
                    role: None,
                    content: Some(delta),
                },
                finish_reason,
            )),
        }
    }

    fn chunk(
        &self,
        index: usize,
        delta: DeltaMessage,
        finish_reason: Option<FinishReason>,
    ) -> ChatCompletionStreamResponse {
        ChatCompletionStreamResponse::single(
            &self.id,
            self.created,
            &self.model,
            index as u32,
            delta,
            finish_reason,
        )
    }
}
