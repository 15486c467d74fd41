//! LLM integration.
//!
//! - [`LlmProvider`]: a raw chat completion backend ([`OpenAiChatProvider`])
//! - [`RateLimiter`]: call spacing and cooldown windows
//! - [`CompletionClient`]: the provider behind the throttling policy, always
//!   producing a user-facing string

mod client;
mod openai;
mod provider;
mod rate_limit;

pub use client::{COOLDOWN_ENTERED_MESSAGE, CompletionClient};
pub use openai::OpenAiChatProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
pub use rate_limit::RateLimiter;

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::LlmError;

/// Create the completion provider from configuration.
pub fn create_llm_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    tracing::info!("Using OpenAI Chat Completions API with model {}", config.model);
    Ok(Arc::new(OpenAiChatProvider::new(config.clone())?))
}
