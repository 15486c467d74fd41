//! Error types for roomrelay.

use std::time::Duration;

/// Top-level error type for startup and the binary edge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),
}

/// Configuration errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variables: {}", .vars.join(", "))]
    MissingEnvVar { vars: Vec<String> },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Chat transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Login to {name} failed: {reason}")]
    LoginFailed { name: String, reason: String },

    #[error("Channel {name} is not logged in")]
    NotLoggedIn { name: String },

    #[error("Failed to join room {room}: {reason}")]
    JoinFailed { room: String, reason: String },

    #[error("Failed to send message on {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Sync failed on {name}: {reason}")]
    SyncFailed { name: String, reason: String },

    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Invalid response from {name}: {reason}")]
    InvalidResponse { name: String, reason: String },
}

/// Completion API errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Still cooling down, retry in {} seconds", .remaining.as_secs())]
    CoolingDown { remaining: Duration },
}

impl LlmError {
    /// Whether this failure belongs to the rate-limit class that earns a retry.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

/// Device trigger errors. Logged, never surfaced to the room.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device trigger not configured: {reason}")]
    NotConfigured { reason: String },

    #[error("Device request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Device call returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid device response: {reason}")]
    InvalidResponse { reason: String },
}

/// Timer scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("Timer duration of {seconds} seconds is out of range")]
    DurationOutOfRange { seconds: u64 },

    #[error("Timer registry is shut down")]
    ShutDown,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
