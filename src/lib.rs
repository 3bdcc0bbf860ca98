//! LLM 统一调用库 流式响应解码与生命周期回调

pub mod callback;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod provider;
pub mod stream;
pub mod types;

pub use callback::{CallbackRegistry, LifecycleEvent, Stage};
pub use client::{LLMClient, ObservedStream};
pub use context::RequestContext;
pub use error::{CancelReason, LLMError};
pub use provider::LLMProvider;
pub use stream::{ChunkMapper, StreamCloser, StreamDecoder, StreamOptions};
pub use types::*;
