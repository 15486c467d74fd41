//! Completion client with pacing, retry and cooldown.
//!
//! `CompletionClient::complete` never fails: every outcome, including
//! throttling and API errors, is turned into text that can go straight back
//! into the room.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;
use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::llm::rate_limit::{RateLimiter, uniform};

/// Reply sent after retries run out and the cooldown starts.
pub const COOLDOWN_ENTERED_MESSAGE: &str = "I've hit the API rate limit. I'm entering cooldown mode for 1 minute to avoid further rate limiting. Please try again later.";

/// Wraps an [`LlmProvider`] with the bot's throttling policy.
pub struct CompletionClient {
    provider: Arc<dyn LlmProvider>,
    limiter: RateLimiter,
    system_prompt: String,
    max_retries: u32,
    base_backoff: Duration,
    backoff_jitter: Duration,
    cooldown: Duration,
}

impl CompletionClient {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        system_prompt: impl Into<String>,
        config: &RateLimitConfig,
    ) -> Self {
        Self {
            provider,
            limiter: RateLimiter::from_config(config),
            system_prompt: system_prompt.into(),
            max_retries: config.max_retries.max(1),
            base_backoff: config.base_backoff,
            backoff_jitter: config.backoff_jitter,
            cooldown: config.cooldown,
        }
    }

    /// The limiter guarding this client.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Get a reply for `user_text`.
    ///
    /// Successful replies are returned verbatim. Rate-limit failures are
    /// retried with exponential backoff; when the attempts run out the client
    /// enters cooldown. Any other failure is reported without retrying.
    pub async fn complete(&self, user_text: &str) -> String {
        if let Err(e) = self.limiter.acquire().await {
            return failure_message(&e);
        }

        for attempt in 0..self.max_retries {
            tracing::info!(
                "Attempt {}/{} to call {}",
                attempt + 1,
                self.max_retries,
                self.provider.model_name()
            );

            let request = CompletionRequest::new(vec![
                ChatMessage::system(&self.system_prompt),
                ChatMessage::user(user_text),
            ]);

            match self.provider.complete(request).await {
                Ok(response) => {
                    tracing::debug!(
                        finish_reason = ?response.finish_reason,
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        "Completion received"
                    );
                    if response.finish_reason != FinishReason::Stop {
                        tracing::warn!(
                            "Completion ended early ({:?}), relaying partial reply",
                            response.finish_reason
                        );
                    }
                    return response.content;
                }
                Err(e) if e.is_rate_limited() => {
                    if attempt + 1 < self.max_retries {
                        let wait = self.retry_wait(attempt, &e);
                        tracing::warn!(
                            "Rate limit hit. Waiting {:.2} seconds before retry.",
                            wait.as_secs_f64()
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        tracing::error!(
                            "Rate limit exceeded after {} attempts: {}",
                            self.max_retries,
                            e
                        );
                        self.limiter.enter_cooldown(self.cooldown);
                        return COOLDOWN_ENTERED_MESSAGE.to_string();
                    }
                }
                Err(e) => {
                    tracing::error!("Error getting AI response: {}", e);
                    return failure_message(&e);
                }
            }
        }

        // max_retries is at least 1, so the loop always returns.
        COOLDOWN_ENTERED_MESSAGE.to_string()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .saturating_add(uniform(self.backoff_jitter))
    }

    /// Backoff for `attempt`, stretched to the server's `Retry-After` hint.
    /// The hint is capped at the cooldown period.
    fn retry_wait(&self, attempt: u32, error: &LlmError) -> Duration {
        let backoff = self.backoff(attempt);
        match error {
            LlmError::RateLimited {
                retry_after: Some(hint),
                ..
            } => backoff.max((*hint).min(self.cooldown)),
            _ => backoff,
        }
    }
}

/// User-facing text for a failed completion.
fn failure_message(error: &LlmError) -> String {
    match error {
        LlmError::CoolingDown { remaining } => format!(
            "I'm currently in cooldown mode due to rate limiting. Please try again in {} seconds.",
            remaining.as_secs()
        ),
        LlmError::RateLimited { .. } => COOLDOWN_ENTERED_MESSAGE.to_string(),
        other => format!(
            "Sorry, I couldn't process that request due to an API error: {}",
            other
        ),
    }
}
