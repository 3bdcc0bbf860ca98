use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::callback::{
    BeforeRequestEvent, CallbackRegistry, EventMeta, FailureEvent, StreamEvent, SuccessEvent,
};
use crate::context::RequestContext;
use crate::error::LLMError;
use crate::provider::DynProvider;
use crate::stream::{ChunkStream, StreamCloser, StreamDecoder};
use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse, TokenUsage};

/// LLM 调用入口 负责维护已注册的 Provider 与生命周期回调
///
/// Every request that passes handle lookup fires one BeforeRequest event and is
/// concluded by exactly one Success or Failure event. Streamed chunks fire Stream
/// events before the conclusion.
///
/// Concluding events run under a detached context, so a cancelled request still
/// reports its Failure.
pub struct LLMClient {
    providers: HashMap<String, DynProvider>,
    callbacks: Arc<CallbackRegistry>,
}

impl LLMClient {
    /// 创建 Builder 便于后续注册 Provider
    pub fn builder() -> LLMClientBuilder {
        LLMClientBuilder {
            providers: HashMap::new(),
        }
    }

    /// 当前客户端的回调注册表
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// 发送完整请求
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        handle: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LLMError> {
        let provider = self.get_provider(handle)?;
        let lifecycle = Lifecycle::begin(
            self.callbacks.clone(),
            ctx,
            provider.name(),
            Arc::new(request),
        )?;

        match provider.complete(ctx, &lifecycle.request).await {
            Ok(response) => {
                let response = Arc::new(response);
                lifecycle.succeed(response.clone());
                Ok(Arc::try_unwrap(response).unwrap_or_else(|shared| (*shared).clone()))
            }
            Err(err) => {
                lifecycle.fail(err.clone());
                Err(err)
            }
        }
    }

    /// 发起流式请求
    ///
    /// Failing to open the stream concludes the request with a Failure before
    /// returning the error.
    pub async fn stream(
        &self,
        ctx: &RequestContext,
        handle: &str,
        request: CompletionRequest,
    ) -> Result<ObservedStream, LLMError> {
        let provider = self.get_provider(handle)?;
        let lifecycle = Lifecycle::begin(
            self.callbacks.clone(),
            ctx,
            provider.name(),
            Arc::new(request),
        )?;

        match provider.stream(ctx, &lifecycle.request).await {
            Ok(decoder) => Ok(ObservedStream::new(ctx.clone(), decoder, lifecycle)),
            Err(err) => {
                lifecycle.fail(err.clone());
                Err(err)
            }
        }
    }

    /// 返回当前已注册的句柄
    pub fn handles(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    fn get_provider(&self, handle: &str) -> Result<DynProvider, LLMError> {
        self.providers
            .get(handle)
            .cloned()
            .ok_or_else(|| LLMError::Validation {
                message: format!("unknown model handle: {handle}"),
            })
    }
}

/// 负责注册 Provider 的 Builder
pub struct LLMClientBuilder {
    providers: HashMap<String, DynProvider>,
}

impl LLMClientBuilder {
    /// 注册一个句柄对应的 Provider
    pub fn register_handle<S: Into<String>>(mut self, handle: S, provider: DynProvider) -> Self {
        self.providers.insert(handle.into(), provider);
        self
    }

    /// 构建最终的 LLMClient
    pub fn build(self) -> LLMClient {
        LLMClient {
            providers: self.providers,
            callbacks: Arc::new(CallbackRegistry::new()),
        }
    }
}

/// Bookkeeping for one request between its BeforeRequest and concluding events.
struct Lifecycle {
    callbacks: Arc<CallbackRegistry>,
    meta: EventMeta,
    request: Arc<CompletionRequest>,
    start_time: DateTime<Utc>,
}

impl Lifecycle {
    /// Fires BeforeRequest. A veto concludes the request with a Failure right away.
    fn begin(
        callbacks: Arc<CallbackRegistry>,
        ctx: &RequestContext,
        provider: &'static str,
        request: Arc<CompletionRequest>,
    ) -> Result<Self, LLMError> {
        let meta = EventMeta::new(request.model.clone(), provider);
        let event = BeforeRequestEvent::new(meta.clone(), request.clone());
        let lifecycle = Self {
            callbacks,
            meta,
            request,
            start_time: event.start_time,
        };

        if let Err(err) = lifecycle.callbacks.execute_before_request(ctx, &event) {
            debug!(
                request_id = %lifecycle.meta.request_id,
                provider,
                error = %err,
                "request blocked before sending"
            );
            lifecycle.fail(err.clone());
            return Err(err);
        }
        Ok(lifecycle)
    }

    fn succeed(&self, response: Arc<CompletionResponse>) {
        let event = SuccessEvent::new(
            self.meta.clone(),
            self.request.clone(),
            response,
            self.start_time,
        );
        self.callbacks
            .execute_success(&RequestContext::background(), &event);
    }

    fn fail(&self, error: LLMError) {
        let event = FailureEvent::new(
            self.meta.clone(),
            self.request.clone(),
            error,
            self.start_time,
        );
        self.callbacks
            .execute_failure(&RequestContext::background(), &event);
    }
}

/// Stream wrapper that reports every chunk and the stream's conclusion to the
/// client's callbacks.
///
/// Closing or dropping a stream that has not reached its end concludes it with
/// [`LLMError::StreamClosed`].
pub struct ObservedStream {
    ctx: RequestContext,
    decoder: StreamDecoder,
    lifecycle: Lifecycle,
    index: usize,
    id: String,
    model: String,
    usage: Option<TokenUsage>,
    concluded: bool,
}

impl ObservedStream {
    fn new(ctx: RequestContext, decoder: StreamDecoder, lifecycle: Lifecycle) -> Self {
        Self {
            ctx,
            decoder,
            lifecycle,
            index: 0,
            id: String::new(),
            model: String::new(),
            usage: None,
            concluded: false,
        }
    }

    /// 本次请求的唯一标识
    pub fn request_id(&self) -> &str {
        &self.lifecycle.meta.request_id
    }

    pub fn closer(&self) -> StreamCloser {
        self.decoder.closer()
    }

    /// Same contract as [`StreamDecoder::recv`], with Stream events for each chunk
    /// and a single Success or Failure once the terminal result is first seen.
    pub async fn recv(&mut self) -> Result<Option<CompletionChunk>, LLMError> {
        let result = self.decoder.recv().await;
        match &result {
            Ok(Some(chunk)) => self.observe(chunk),
            Ok(None) => self.conclude(None),
            Err(err) => self.conclude(Some(err.clone())),
        }
        result
    }

    /// Closes the underlying decoder. Idempotent.
    pub fn close(&mut self) -> Result<(), LLMError> {
        self.decoder.close()?;
        self.conclude(Some(closed_early()));
        Ok(())
    }

    pub fn into_stream(self) -> ChunkStream {
        Box::pin(futures_util::stream::unfold(
            Some(self),
            |state| async move {
                let mut stream = state?;
                match stream.recv().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), Some(stream))),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), None)),
                }
            },
        ))
    }

    fn observe(&mut self, chunk: &CompletionChunk) {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if self.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage.clone();
        }

        let event = StreamEvent::new(self.lifecycle.meta.clone(), chunk.clone(), self.index);
        self.index += 1;
        self.lifecycle.callbacks.execute_stream(&self.ctx, &event);
    }

    fn conclude(&mut self, error: Option<LLMError>) {
        if self.concluded {
            return;
        }
        self.concluded = true;
        match error {
            None => {
                let response = CompletionResponse {
                    id: std::mem::take(&mut self.id),
                    model: std::mem::take(&mut self.model),
                    usage: self.usage.take(),
                    body: serde_json::Value::Null,
                };
                self.lifecycle.succeed(Arc::new(response));
            }
            Some(err) => self.lifecycle.fail(err),
        }
    }
}

impl Drop for ObservedStream {
    fn drop(&mut self) {
        if !self.concluded {
            self.conclude(Some(closed_early()));
        }
    }
}

fn closed_early() -> LLMError {
    LLMError::stream_closed("stream was closed before it finished")
}
