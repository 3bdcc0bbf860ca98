use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a [`crate::context::RequestContext`] stopped a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The context was cancelled explicitly.
    Cancelled,
    /// The context deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("context canceled"),
            Self::DeadlineExceeded => f.write_str("context deadline exceeded"),
        }
    }
}

/// Aggregates every failure mode exposed by the client, the stream decoder and the
/// callback registry.
///
/// The enum is `Clone` because a stream replays its terminal error on every call
/// after it has finished.
#[derive(Debug, Clone, Error)]
pub enum LLMError {
    /// Represents transport-layer or networking failures.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Reports invalid or missing credentials.
    #[error("auth failure: {message}")]
    Auth { message: String },
    /// Indicates that the provider throttled the request.
    #[error("rate limited: {message}")]
    RateLimit {
        /// Raw message returned by the upstream provider.
        message: String,
        /// Optional wait duration suggested by the provider before retrying.
        retry_after: Option<Duration>,
    },
    /// Signals validation failures in the request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
    /// The governing request context was cancelled or timed out.
    ///
    /// Returned unwrapped so callers can match on the reason directly.
    #[error("{0}")]
    Cancelled(CancelReason),
    /// The provider sent a stream payload that could not be decoded.
    #[error("provider {provider} sent an undecodable stream chunk: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
    /// The stream was closed before it reached its natural end.
    #[error("stream closed: {message}")]
    StreamClosed { message: String },
    /// One or more before-request callbacks rejected the request.
    #[error("request vetoed: {}", .failures.join("; "))]
    Vetoed {
        /// Failure messages in callback registration order.
        failures: Vec<String>,
    },
    /// Wraps provider-defined errors that cannot be normalized.
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Name of the provider, such as `openai_chat`.
        provider: &'static str,
        /// Human-readable error message returned by the provider.
        message: String,
    },
    /// Catches opaque or unexpected failures.
    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use llmux::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Provider`] with the given provider name and message.
    pub fn provider<T: Into<String>>(provider: &'static str, message: T) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Decode`] for a malformed stream payload.
    pub fn decode<T: Into<String>>(provider: &'static str, message: T) -> Self {
        Self::Decode {
            provider,
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::StreamClosed`].
    pub fn stream_closed<T: Into<String>>(message: T) -> Self {
        Self::StreamClosed {
            message: message.into(),
        }
    }

    /// Returns the cancellation reason when this error came from a cancelled context.
    ///
    /// ```
    /// use llmux::error::{CancelReason, LLMError};
    ///
    /// let err = LLMError::Cancelled(CancelReason::DeadlineExceeded);
    /// assert_eq!(err.cancel_reason(), Some(CancelReason::DeadlineExceeded));
    /// assert_eq!(LLMError::transport("eof").cancel_reason(), None);
    /// ```
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veto_message_lists_failures_in_order() {
        let err = LLMError::Vetoed {
            failures: vec!["e1".to_string(), "e2".to_string()],
        };
        assert_eq!(err.to_string(), "request vetoed: e1; e2");
    }

    #[test]
    fn cancellation_displays_reason_verbatim() {
        assert_eq!(
            LLMError::Cancelled(CancelReason::Cancelled).to_string(),
            "context canceled"
        );
        assert_eq!(
            LLMError::Cancelled(CancelReason::DeadlineExceeded).to_string(),
            "context deadline exceeded"
        );
    }

    #[test]
    fn decode_errors_are_distinct_from_provider_errors() {
        let err = LLMError::decode("openai_chat", "expected value at line 1");
        assert!(matches!(err, LLMError::Decode { provider: "openai_chat", .. }));
        assert!(err.to_string().contains("undecodable"));
    }
}
