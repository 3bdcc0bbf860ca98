//! Normalized request, response and streaming chunk types.
//!
//! Provider adapters map their wire formats into these shapes so the decoder, the
//! callback registry and application code never see provider-specific JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque completion request.
///
/// The payload is forwarded to the provider unchanged apart from the `model` and
/// `stream` fields, which the provider stamps in. Request transformation is the
/// caller's responsibility.
///
/// # Examples
///
/// ```
/// # use llmux::types::CompletionRequest;
/// # use serde_json::json;
/// let request = CompletionRequest::new("gpt-4o-mini")
///     .with_field("messages", json!([{"role": "user", "content": "Hi"}]))
///     .with_field("temperature", json!(0.2));
/// assert_eq!(request.payload.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier; empty means "use the provider default".
    #[serde(default)]
    pub model: String,
    /// Provider-native body fields.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            payload: Map::new(),
        }
    }

    /// Sets one payload field, replacing any previous value.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Full response body as returned by the provider. `Null` for streamed responses.
    #[serde(default)]
    pub body: Value,
}

/// One normalized fragment of a streamed completion.
///
/// Every field except `choices[].index` is optional on the wire; `usage` stays
/// `None` unless the provider attached it, which it normally does only on the
/// final chunk.
///
/// # Examples
///
/// ```
/// # use llmux::types::CompletionChunk;
/// let chunk: CompletionChunk =
///     serde_json::from_str(r#"{"id":"1","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#)
///         .unwrap();
/// assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
/// assert!(chunk.usage.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl CompletionChunk {
    /// Concatenates the content deltas of every choice, in choice order.
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|choice| choice.delta.content.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Incremental message content carried by a [`ChunkChoice`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Delta describing an in-progress tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call within the assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument text appended by this delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Token usage metrics collected from the provider.
///
/// # Examples
///
/// ```
/// # use llmux::types::TokenUsage;
/// let usage = TokenUsage {
///     prompt_tokens: Some(1200),
///     completion_tokens: Some(200),
///     total_tokens: Some(1400),
/// };
/// assert_eq!(usage.total(), 1400);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Total tokens, falling back to prompt + completion when the provider omits the total.
    pub fn total(&self) -> u64 {
        self.total_tokens.unwrap_or_else(|| {
            self.prompt_tokens
                .unwrap_or(0)
                .saturating_add(self.completion_tokens.unwrap_or(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_parses_tool_call_deltas() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"ci"}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .expect("chunk");

        let calls = chunk.choices[0].delta.tool_calls.as_ref().expect("tool calls");
        assert_eq!(calls[0].kind.as_deref(), Some("function"));
        assert_eq!(
            calls[0].function.as_ref().and_then(|f| f.arguments.as_deref()),
            Some("{\"ci")
        );
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[test]
    fn chunk_text_joins_choices() {
        let chunk: CompletionChunk = serde_json::from_value(json!({
            "choices": [
                {"index": 0, "delta": {"content": "Hel"}},
                {"index": 1, "delta": {}},
                {"index": 2, "delta": {"content": "lo"}}
            ]
        }))
        .expect("chunk");
        assert_eq!(chunk.text(), "Hello");
    }

    #[test]
    fn usage_total_falls_back_to_sum() {
        let usage = TokenUsage {
            prompt_tokens: Some(7),
            completion_tokens: Some(3),
            total_tokens: None,
        };
        assert_eq!(usage.total(), 10);
        assert_eq!(TokenUsage::default().total(), 0);
    }

    #[test]
    fn total_saturates_on_oversized_counts() {
        let usage = TokenUsage {
            prompt_tokens: Some(u64::MAX),
            completion_tokens: Some(7),
            total_tokens: None,
        };
        assert_eq!(usage.total(), u64::MAX);
    }

    #[test]
    fn missing_usage_stays_absent_after_serialization() {
        let chunk = CompletionChunk {
            id: "1".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&chunk).expect("serialize");
        assert!(value.get("usage").is_none());
    }
}
