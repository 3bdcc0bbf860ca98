//! Providers speaking the OpenAI chat-completions or legacy completions protocol.

mod error;
mod provider;
mod stream;
mod types;

pub use provider::{CompatApi, OpenAiCompatProvider};
pub use stream::{ChatChunkMapper, TextCompletionMapper};
