use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::LLMError;
use crate::http::{DynHttpTransport, post_json_stream_with_headers, post_json_with_headers};
use crate::provider::LLMProvider;
use crate::stream::{ChunkMapper, StreamDecoder, StreamOptions};
use crate::types::{CompletionRequest, CompletionResponse, TokenUsage};

use super::error::parse_openai_error;
use super::stream::{ChatChunkMapper, TextCompletionMapper};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Which OpenAI-style endpoint the provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatApi {
    /// `/v1/chat/completions`
    Chat,
    /// `/v1/completions`, prompt continuation
    Completions,
}

/// OpenAI-compatible provider.
///
/// The request payload is forwarded as-is; the provider only stamps `model` and
/// `stream` into it, picks the endpoint and the matching [`ChunkMapper`].
pub struct OpenAiCompatProvider {
    transport: DynHttpTransport,
    api: CompatApi,
    base_url: String,
    api_key: String,
    api_key_header: Option<String>,
    organization: Option<String>,
    default_model: Option<String>,
    stream_options: StreamOptions,
}

impl OpenAiCompatProvider {
    /// 创建 Chat Completions Provider
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            api: CompatApi::Chat,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            api_key_header: None,
            organization: None,
            default_model: None,
            stream_options: StreamOptions::default(),
        }
    }

    /// 创建 Completions Provider
    pub fn completions(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            api: CompatApi::Completions,
            ..Self::new(transport, api_key)
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sends the key in a custom header instead of `Authorization: Bearer`.
    pub fn with_api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = Some(header.into());
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.stream_options = options;
        self
    }

    pub fn api(&self) -> CompatApi {
        self.api
    }

    pub(crate) fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = match self.api {
            CompatApi::Chat => "chat/completions",
            CompatApi::Completions => "completions",
        };
        if base.ends_with("/v1") {
            format!("{base}/{path}")
        } else {
            format!("{base}/v1/{path}")
        }
    }

    fn build_headers(&self, stream: bool) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        match &self.api_key_header {
            Some(header) => headers.insert(header.clone(), self.api_key.clone()),
            None => headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
        };
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        headers.insert("Accept".to_string(), accept.to_string());
        if let Some(org) = &self.organization {
            headers.insert("OpenAI-Organization".to_string(), org.clone());
        }
        headers
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Result<Value, LLMError> {
        let model = if request.model.is_empty() {
            self.default_model.clone().ok_or_else(|| LLMError::Validation {
                message: format!("model is required for {}", self.name()),
            })?
        } else {
            request.model.clone()
        };
        let mut body = request.payload.clone();
        body.insert("model".to_string(), Value::String(model));
        if stream {
            body.insert("stream".to_string(), Value::Bool(true));
        } else {
            body.remove("stream");
        }
        Ok(Value::Object(body))
    }

    fn mapper(&self) -> Box<dyn ChunkMapper> {
        match self.api {
            CompatApi::Chat => Box::new(ChatChunkMapper::new(self.name())),
            CompatApi::Completions => Box::new(TextCompletionMapper::new(self.name())),
        }
    }

    fn parse_response(&self, text: &str) -> Result<CompletionResponse, LLMError> {
        let body: Value = serde_json::from_str(text).map_err(|err| LLMError::Provider {
            provider: self.name(),
            message: format!("failed to parse response: {err}"),
        })?;
        let field = |name: &str| {
            body.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let usage = body
            .get("usage")
            .cloned()
            .and_then(|usage| serde_json::from_value::<TokenUsage>(usage).ok());
        let id = field("id");
        let model = field("model");
        Ok(CompletionResponse {
            id,
            model,
            usage,
            body,
        })
    }
}

#[async_trait]
impl LLMProvider for OpenAiCompatProvider {
    async fn complete(
        &self,
        ctx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LLMError> {
        ctx.check()?;
        let body = self.build_body(request, false)?;
        let send = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(false),
            &body,
            ctx.remaining(),
        );
        let response = tokio::select! {
            reason = ctx.done() => return Err(LLMError::Cancelled(reason)),
            response = send => response?,
        };

        let status = response.status;
        let success = response.is_success();
        let headers = response.headers.clone();
        let text = response.into_string()?;
        if !success {
            return Err(parse_openai_error(self.name(), status, &headers, &text));
        }
        self.parse_response(&text)
    }

    async fn stream(
        &self,
        ctx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<StreamDecoder, LLMError> {
        ctx.check()?;
        let body = self.build_body(request, true)?;
        let send = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(true),
            &body,
            ctx.remaining(),
        );
        let response = tokio::select! {
            reason = ctx.done() => return Err(LLMError::Cancelled(reason)),
            response = send => response?,
        };

        if !response.is_success() {
            let status = response.status;
            let headers = response.headers.clone();
            let text = tokio::select! {
                reason = ctx.done() => return Err(LLMError::Cancelled(reason)),
                text = response.collect_text(self.name()) => text?,
            };
            return Err(parse_openai_error(self.name(), status, &headers, &text));
        }
        Ok(
            StreamDecoder::new(ctx.clone(), response.body, self.name(), self.mapper())
                .with_options(self.stream_options),
        )
    }

    fn name(&self) -> &'static str {
        match self.api {
            CompatApi::Chat => "openai_chat",
            CompatApi::Completions => "openai_completions",
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::http::reqwest::default_dyn_transport;

    fn provider(api: CompatApi) -> OpenAiCompatProvider {
        let transport = default_dyn_transport().expect("transport");
        match api {
            CompatApi::Chat => OpenAiCompatProvider::new(transport, "sk-test"),
            CompatApi::Completions => OpenAiCompatProvider::completions(transport, "sk-test"),
        }
    }

    #[test]
    fn endpoint_avoids_duplicate_version_segment() {
        let chat = provider(CompatApi::Chat).with_base_url("https://proxy.local/v1/");
        assert_eq!(chat.endpoint(), "https://proxy.local/v1/chat/completions");

        let completions = provider(CompatApi::Completions);
        assert_eq!(completions.endpoint(), "https://api.openai.com/v1/completions");
    }

    #[test]
    fn body_stamps_model_and_stream_flag() {
        let provider = provider(CompatApi::Chat).with_default_model("gpt-4o-mini");
        let request = CompletionRequest::default()
            .with_field("messages", json!([{"role": "user", "content": "hi"}]))
            .with_field("stream", json!(true));

        let streaming = provider.build_body(&request, true).expect("body");
        assert_eq!(streaming["model"], "gpt-4o-mini");
        assert_eq!(streaming["stream"], true);

        let buffered = provider.build_body(&request, false).expect("body");
        assert!(buffered.get("stream").is_none());
    }

    #[test]
    fn missing_model_is_a_validation_error() {
        let provider = provider(CompatApi::Completions);
        match provider.build_body(&CompletionRequest::default(), false) {
            Err(LLMError::Validation { message }) => assert!(message.contains("openai_completions")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn custom_key_header_replaces_bearer() {
        let provider = provider(CompatApi::Chat)
            .with_api_key_header("api-key")
            .with_organization("org-1");
        let headers = provider.build_headers(true);
        assert_eq!(headers.get("api-key"), Some(&"sk-test".to_string()));
        assert!(!headers.contains_key("Authorization"));
        assert_eq!(headers.get("Accept"), Some(&"text/event-stream".to_string()));
        assert_eq!(headers.get("OpenAI-Organization"), Some(&"org-1".to_string()));
    }

    #[test]
    fn parse_response_extracts_usage() {
        let provider = provider(CompatApi::Chat);
        let response = provider
            .parse_response(r#"{"id":"r1","model":"m","choices":[],"usage":{"total_tokens":12}}"#)
            .expect("response");
        assert_eq!(response.id, "r1");
        assert_eq!(response.usage.map(|u| u.total()), Some(12));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits_before_transport() {
        let provider = provider(CompatApi::Chat).with_default_model("m");
        let ctx = RequestContext::background();
        ctx.cancel();
        let result = provider.complete(&ctx, &CompletionRequest::default()).await;
        assert!(matches!(result, Err(LLMError::Cancelled(_))));
    }
}
