//! roomrelay: a Matrix room relay bot.
//!
//! The bot joins one room, forwards new messages to a chat completion API and
//! relays the reply. A reply of exactly `{"time":<seconds>}` schedules a timer
//! instead; when it fires the bot calls a Particle device function and posts
//! "Timer expired!" to the room.
//!
//! The pieces, leaf first:
//! - [`llm::RateLimiter`] and [`llm::CompletionClient`]: call pacing, retry
//!   and cooldown around an [`llm::LlmProvider`]
//! - [`agent::IntentParser`]: timer directive or plain text
//! - [`agent::TimerRegistry`]: pending timers with exactly-once expiry
//! - [`agent::SyncGate`]: the cutoff between backlog and live traffic
//! - [`agent::MessageRouter`]: the control loop tying them together

pub mod agent;
pub mod channels;
pub mod config;
pub mod device;
pub mod error;
pub mod llm;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Error, Result};
