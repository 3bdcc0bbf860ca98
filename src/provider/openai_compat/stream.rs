use crate::error::LLMError;
use crate::stream::ChunkMapper;
use crate::types::{ChunkChoice, ChunkDelta, CompletionChunk};

use super::error::parse_stream_error;
use super::types::TextCompletionChunk;

const ASSISTANT_ROLE: &str = "assistant";

/// Mapper for chat-completions streams, whose chunks already have the normalized shape.
///
/// Some compatible backends report a running choice with `"finish_reason": ""`
/// instead of `null`; those are normalized to `None`.
#[derive(Debug, Clone)]
pub struct ChatChunkMapper {
    provider: &'static str,
}

impl ChatChunkMapper {
    pub fn new(provider: &'static str) -> Self {
        Self { provider }
    }
}

impl ChunkMapper for ChatChunkMapper {
    fn map_chunk(&mut self, payload: &str) -> Result<CompletionChunk, LLMError> {
        let mut chunk: CompletionChunk = serde_json::from_str(payload).map_err(|err| {
            LLMError::decode(self.provider, format!("failed to parse stream chunk: {err}"))
        })?;
        for choice in &mut chunk.choices {
            choice.finish_reason = normalize_finish_reason(choice.finish_reason.take());
        }
        Ok(chunk)
    }

    fn map_error(&self, body: &str) -> Option<LLMError> {
        parse_stream_error(self.provider, body)
    }
}

/// Mapper for prompt-continuation streams (`choices[].text`).
///
/// The text becomes `delta.content`, and the first chunk carrying non-empty text
/// also gets `delta.role = "assistant"` so consumers see the same shape as a chat
/// stream.
#[derive(Debug, Clone)]
pub struct TextCompletionMapper {
    provider: &'static str,
    role_sent: bool,
}

impl TextCompletionMapper {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            role_sent: false,
        }
    }
}

impl ChunkMapper for TextCompletionMapper {
    fn map_chunk(&mut self, payload: &str) -> Result<CompletionChunk, LLMError> {
        let raw: TextCompletionChunk = serde_json::from_str(payload).map_err(|err| {
            LLMError::decode(self.provider, format!("failed to parse completion chunk: {err}"))
        })?;

        let mut choices = Vec::with_capacity(raw.choices.len());
        for choice in raw.choices {
            let mut delta = ChunkDelta::default();
            if !choice.text.is_empty() {
                if !self.role_sent {
                    self.role_sent = true;
                    delta.role = Some(ASSISTANT_ROLE.to_string());
                }
                delta.content = Some(choice.text);
            }
            choices.push(ChunkChoice {
                index: choice.index,
                delta,
                finish_reason: normalize_finish_reason(choice.finish_reason),
            });
        }

        Ok(CompletionChunk {
            id: raw.id,
            model: raw.model,
            choices,
            usage: raw.usage,
        })
    }

    fn map_error(&self, body: &str) -> Option<LLMError> {
        parse_stream_error(self.provider, body)
    }
}

fn normalize_finish_reason(reason: Option<String>) -> Option<String> {
    reason.filter(|reason| !reason.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_mapper_normalizes_empty_finish_reason() {
        let mut mapper = ChatChunkMapper::new("openai_chat");
        let chunk = mapper
            .map_chunk(r#"{"id":"1","choices":[{"index":0,"delta":{"content":"a"},"finish_reason":""}]}"#)
            .expect("chunk");
        assert!(chunk.choices[0].finish_reason.is_none());

        let last = mapper
            .map_chunk(r#"{"id":"1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#)
            .expect("chunk");
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn chat_mapper_reports_decode_errors() {
        let mut mapper = ChatChunkMapper::new("openai_chat");
        match mapper.map_chunk("{not json}") {
            Err(LLMError::Decode { provider, message }) => {
                assert_eq!(provider, "openai_chat");
                assert!(message.contains("failed to parse stream chunk"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn text_mapper_synthesizes_role_once() {
        let mut mapper = TextCompletionMapper::new("openai_completions");

        let empty = mapper
            .map_chunk(r#"{"id":"c","model":"m","choices":[{"index":0,"text":""}]}"#)
            .expect("chunk");
        assert_eq!(empty.choices[0].delta, ChunkDelta::default());

        let first = mapper
            .map_chunk(r#"{"id":"c","model":"m","choices":[{"index":0,"text":"Once"}]}"#)
            .expect("chunk");
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Once"));

        let second = mapper
            .map_chunk(r#"{"id":"c","model":"m","choices":[{"index":0,"text":" upon","finish_reason":"length"}]}"#)
            .expect("chunk");
        assert!(second.choices[0].delta.role.is_none());
        assert_eq!(second.choices[0].finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn text_mapper_keeps_usage_only_when_present() {
        let mut mapper = TextCompletionMapper::new("openai_completions");
        let chunk = mapper
            .map_chunk(r#"{"id":"c","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#)
            .expect("chunk");
        assert_eq!(chunk.usage.map(|u| u.total()), Some(8));

        let chunk = mapper
            .map_chunk(r#"{"id":"c","choices":[{"index":0,"text":"x"}]}"#)
            .expect("chunk");
        assert!(chunk.usage.is_none());
    }
}
