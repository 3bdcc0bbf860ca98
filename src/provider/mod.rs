use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::LLMError;
use crate::stream::StreamDecoder;
use crate::types::{CompletionRequest, CompletionResponse};

pub mod openai_compat;

/// 统一的 Provider Trait 所有后端实现该接口即可接入 [`crate::client::LLMClient`]
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// 提交完整请求并等待完整响应
    async fn complete(
        &self,
        ctx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, LLMError>;

    /// 发起流式请求 返回的解码器只在 2xx 响应时构建
    async fn stream(
        &self,
        ctx: &RequestContext,
        request: &CompletionRequest,
    ) -> Result<StreamDecoder, LLMError>;

    /// 供应商名称
    fn name(&self) -> &'static str;
}

/// 线程安全 Provider
pub type DynProvider = Arc<dyn LLMProvider>;
