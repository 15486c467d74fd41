//! Pacing and cooldown for outbound completion calls.
//!
//! Every call waits until at least `min_delay` plus a random jitter has passed
//! since the previous call, so bursts of chat don't line up into synchronized
//! request spikes. After the client gives up on a throttled request it puts the
//! limiter into cooldown, during which `acquire` refuses immediately.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::LlmError;

const MAX_COOLDOWN: Duration = Duration::from_secs(86_400);

#[derive(Debug, Default)]
struct RateState {
    last_call_at: Option<Instant>,
    /// `Some` while a cooldown is active.
    cooldown_until: Option<Instant>,
}

/// Spaces out completion calls and enforces cooldown windows.
#[derive(Debug)]
pub struct RateLimiter {
    min_delay: Duration,
    jitter: Duration,
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(min_delay: Duration, jitter: Duration) -> Self {
        Self {
            min_delay,
            jitter,
            state: Mutex::new(RateState::default()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.min_delay, config.jitter)
    }

    // Never held across an await.
    fn state(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the next call is allowed.
    ///
    /// Returns `LlmError::CoolingDown` straight away while a cooldown is in
    /// effect. Otherwise sleeps off whatever is left of the required spacing
    /// and records the call time once the sleep is over.
    pub async fn acquire(&self) -> Result<(), LlmError> {
        let wait = {
            let mut state = self.state();
            let now = Instant::now();

            if let Some(until) = state.cooldown_until {
                if now < until {
                    return Err(LlmError::CoolingDown {
                        remaining: until - now,
                    });
                }
                tracing::info!("Rate limit cooldown expired");
                state.cooldown_until = None;
            }

            let required = self.min_delay.saturating_add(uniform(self.jitter));
            match state.last_call_at {
                Some(last) => required.saturating_sub(now - last),
                None => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            tracing::info!(
                "Rate limiting: waiting {:.2} seconds before API call",
                wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;
        }

        self.state().last_call_at = Some(Instant::now());
        Ok(())
    }

    /// Suppress calls for `period` from now.
    ///
    /// A period past what the clock can represent is clamped to one day.
    pub fn enter_cooldown(&self, period: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(period)
            .unwrap_or_else(|| now + MAX_COOLDOWN);
        self.state().cooldown_until = Some(until);
        tracing::warn!("Entering rate limit cooldown for {:?}", period);
    }

    /// Time left in the current cooldown, if one is active.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let until = self.state().cooldown_until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }
}

/// A uniformly random duration in `[0, max]`.
pub(crate) fn uniform(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::thread_rng().gen_range(0.0..=max.as_secs_f64());
    Duration::from_secs_f64(secs)
}
