use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LLMError;
use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse};

/// Lifecycle point at which a callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BeforeRequest,
    Success,
    Failure,
    Stream,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforeRequest => "before_request",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Stream => "stream",
        })
    }
}

/// Fields shared by every lifecycle event of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub request_id: String,
    pub model: String,
    pub provider: String,
}

impl EventMeta {
    /// Creates metadata with a fresh random request id.
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            model: model.into(),
            provider: provider.into(),
        }
    }
}

/// Fired before the request is sent. Callbacks can veto it but only see a shared view.
#[derive(Debug, Clone)]
pub struct BeforeRequestEvent {
    pub meta: EventMeta,
    pub request: Arc<CompletionRequest>,
    pub start_time: DateTime<Utc>,
}

impl BeforeRequestEvent {
    pub fn new(meta: EventMeta, request: Arc<CompletionRequest>) -> Self {
        Self {
            meta,
            request,
            start_time: Utc::now(),
        }
    }
}

/// Fired once when a request completed successfully.
#[derive(Debug, Clone)]
pub struct SuccessEvent {
    pub meta: EventMeta,
    pub request: Arc<CompletionRequest>,
    pub response: Arc<CompletionResponse>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
    /// Always 0.0 unless a pricing layer fills it in.
    pub cost: f64,
    /// Total tokens reported by the provider, 0 when unknown.
    pub tokens: u64,
}

impl SuccessEvent {
    /// Stamps the end time now and derives duration and token count.
    pub fn new(
        meta: EventMeta,
        request: Arc<CompletionRequest>,
        response: Arc<CompletionResponse>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let end_time = Utc::now();
        let tokens = response.usage.as_ref().map_or(0, |usage| usage.total());
        Self {
            meta,
            request,
            response,
            start_time,
            end_time,
            duration: elapsed(start_time, end_time),
            cost: 0.0,
            tokens,
        }
    }
}

/// Fired once when a request failed, was vetoed, or its stream ended abnormally.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub meta: EventMeta,
    pub request: Arc<CompletionRequest>,
    pub error: LLMError,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,
}

impl FailureEvent {
    pub fn new(
        meta: EventMeta,
        request: Arc<CompletionRequest>,
        error: LLMError,
        start_time: DateTime<Utc>,
    ) -> Self {
        let end_time = Utc::now();
        Self {
            meta,
            request,
            error,
            start_time,
            end_time,
            duration: elapsed(start_time, end_time),
        }
    }
}

/// Fired for every chunk a stream yields.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub meta: EventMeta,
    pub chunk: CompletionChunk,
    /// Zero-based position of the chunk in its stream.
    pub index: usize,
    pub arrival_time: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(meta: EventMeta, chunk: CompletionChunk, index: usize) -> Self {
        Self {
            meta,
            chunk,
            index,
            arrival_time: Utc::now(),
        }
    }
}

/// Any lifecycle event, tagged by stage.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    BeforeRequest(BeforeRequestEvent),
    Success(SuccessEvent),
    Failure(FailureEvent),
    Stream(StreamEvent),
}

impl LifecycleEvent {
    pub fn stage(&self) -> Stage {
        match self {
            Self::BeforeRequest(_) => Stage::BeforeRequest,
            Self::Success(_) => Stage::Success,
            Self::Failure(_) => Stage::Failure,
            Self::Stream(_) => Stage::Stream,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::BeforeRequest(event) => &event.meta,
            Self::Success(event) => &event.meta,
            Self::Failure(event) => &event.meta,
            Self::Stream(event) => &event.meta,
        }
    }
}

impl From<BeforeRequestEvent> for LifecycleEvent {
    fn from(event: BeforeRequestEvent) -> Self {
        Self::BeforeRequest(event)
    }
}

impl From<SuccessEvent> for LifecycleEvent {
    fn from(event: SuccessEvent) -> Self {
        Self::Success(event)
    }
}

impl From<FailureEvent> for LifecycleEvent {
    fn from(event: FailureEvent) -> Self {
        Self::Failure(event)
    }
}

impl From<StreamEvent> for LifecycleEvent {
    fn from(event: StreamEvent) -> Self {
        Self::Stream(event)
    }
}

fn elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenUsage;

    #[test]
    fn request_ids_are_unique() {
        let a = EventMeta::new("m", "p");
        let b = EventMeta::new("m", "p");
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn success_event_counts_tokens_and_defaults_cost() {
        let response = CompletionResponse {
            usage: Some(TokenUsage {
                prompt_tokens: Some(2),
                completion_tokens: Some(3),
                total_tokens: None,
            }),
            ..Default::default()
        };
        let event = SuccessEvent::new(
            EventMeta::new("m", "p"),
            Arc::new(CompletionRequest::default()),
            Arc::new(response),
            Utc::now(),
        );
        assert_eq!(event.tokens, 5);
        assert_eq!(event.cost, 0.0);
        assert!(event.end_time >= event.start_time);
    }

    #[test]
    fn missing_usage_counts_zero_tokens() {
        let event = SuccessEvent::new(
            EventMeta::new("m", "p"),
            Arc::new(CompletionRequest::default()),
            Arc::new(CompletionResponse::default()),
            Utc::now(),
        );
        assert_eq!(event.tokens, 0);
    }

    #[test]
    fn lifecycle_event_reports_stage() {
        let event: LifecycleEvent =
            StreamEvent::new(EventMeta::new("m", "p"), CompletionChunk::default(), 3).into();
        assert_eq!(event.stage(), Stage::Stream);
        assert_eq!(event.stage().to_string(), "stream");
        assert_eq!(event.meta().model, "m");
    }
}
