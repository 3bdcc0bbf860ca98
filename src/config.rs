use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::LLMClient;
use crate::error::LLMError;
use crate::http::DynHttpTransport;
use crate::provider::DynProvider;
use crate::provider::openai_compat::OpenAiCompatProvider;
use crate::stream::StreamOptions;

/// 模型配置 描述一个可调用后端
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 自定义句柄 例如 `default-openai`
    pub handle: String,
    pub provider: ProviderKind,
    pub credential: Credential,
    pub default_model: Option<String>,
    pub base_url: Option<String>,
    /// 附加设置 例如 organization
    #[serde(default)]
    pub extra: HashMap<String, Value>,
    /// 流式解码参数
    #[serde(default)]
    pub stream: StreamOptions,
}

/// 供应商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// `/v1/chat/completions`
    OpenAiChat,
    /// `/v1/completions`
    OpenAiCompletions,
}

impl ProviderKind {
    fn name(self) -> &'static str {
        match self {
            Self::OpenAiChat => "openai_chat",
            Self::OpenAiCompletions => "openai_completions",
        }
    }
}

/// 鉴权信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// 简单 API Key
    ApiKey {
        /// header 名称 留空时使用 `Authorization: Bearer`
        header: Option<String>,
        /// 密钥
        key: String,
    },
    /// Bearer Token
    Bearer { token: String },
    /// 无需鉴权的本地 provider
    None,
}

/// 根据一组模型配置构建 LLMClient
pub fn build_client_from_configs(
    configs: &[ModelConfig],
    transport: DynHttpTransport,
) -> Result<LLMClient, LLMError> {
    let mut builder = LLMClient::builder();

    for config in configs {
        if config.handle.trim().is_empty() {
            return Err(LLMError::InvalidConfig {
                field: "handle".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let provider = build_provider_from_config(config, transport.clone())?;
        builder = builder.register_handle(config.handle.clone(), provider);
    }

    Ok(builder.build())
}

fn build_provider_from_config(
    config: &ModelConfig,
    transport: DynHttpTransport,
) -> Result<DynProvider, LLMError> {
    let name = config.provider.name();
    let (api_key, header) = extract_api_key(&config.credential, name)?;
    let mut provider = match config.provider {
        ProviderKind::OpenAiChat => OpenAiCompatProvider::new(transport, api_key),
        ProviderKind::OpenAiCompletions => OpenAiCompatProvider::completions(transport, api_key),
    };

    if let Some(header) = header {
        provider = provider.with_api_key_header(header);
    }
    if let Some(base_url) = &config.base_url {
        provider = provider.with_base_url(base_url.clone());
    }
    if let Some(model) = &config.default_model {
        provider = provider.with_default_model(model.clone());
    }
    if let Some(Value::String(org)) = config.extra.get("organization") {
        provider = provider.with_organization(org.clone());
    }
    provider = provider.with_stream_options(config.stream);

    Ok(Arc::new(provider))
}

fn extract_api_key(
    credential: &Credential,
    provider: &'static str,
) -> Result<(String, Option<String>), LLMError> {
    match credential {
        Credential::ApiKey { key, header } => Ok((key.clone(), header.clone())),
        Credential::Bearer { token } => Ok((token.clone(), None)),
        Credential::None => Err(LLMError::Auth {
            message: format!("provider {provider} requires credential"),
        }),
    }
}
