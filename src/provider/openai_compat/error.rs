use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::error::LLMError;

use super::types::{ErrorBody, InnerError};

/// Maps a non-2xx response body to an [`LLMError`].
pub(crate) fn parse_openai_error(
    provider: &'static str,
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> LLMError {
    let Some(error) = parse_error_body(body) else {
        return LLMError::Provider {
            provider,
            message: format!("status {status}: {body}"),
        };
    };
    let message = error_message(&error);
    match status {
        401 | 403 => LLMError::Auth { message },
        429 => LLMError::RateLimit {
            message,
            retry_after: retry_after_from_headers(headers),
        },
        400 | 404 | 422 => LLMError::Validation { message },
        _ => LLMError::Provider { provider, message },
    }
}

/// Maps an `{"error": ...}` document embedded in an SSE stream.
///
/// There is no status code mid-stream, so the error `type` decides the variant.
pub(crate) fn parse_stream_error(provider: &'static str, body: &str) -> Option<LLMError> {
    let error = parse_error_body(body)?;
    let message = error_message(&error);
    let kind = error.kind.as_deref().unwrap_or_default();
    Some(match kind {
        "authentication_error" | "invalid_api_key" | "permission_error" => {
            LLMError::Auth { message }
        }
        "rate_limit_error" | "rate_limit_exceeded" | "insufficient_quota" => LLMError::RateLimit {
            message,
            retry_after: None,
        },
        "invalid_request_error" => LLMError::Validation { message },
        _ => LLMError::Provider { provider, message },
    })
}

fn parse_error_body(body: &str) -> Option<InnerError> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    serde_json::from_str::<ErrorBody>(body).ok()?.error
}

fn error_message(error: &InnerError) -> String {
    let message = error
        .message
        .clone()
        .unwrap_or_else(|| "unknown error".to_string());
    match &error.code {
        Some(Value::Null) | None => message,
        Some(Value::String(code)) => format!("{message} ({code})"),
        Some(code) => format!("{message} ({code})"),
    }
}

/// Extracts a numeric `Retry-After` header.
fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .and_then(|(_, value)| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
