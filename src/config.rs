//! Configuration loaded from the environment.
//!
//! Call `dotenvy::dotenv()` before `Config::from_env()` to pick up a local
//! `.env` file. Credential-class variables are required; everything else has
//! a default.

use std::ops::RangeInclusive;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a lighthearted chatbot. Respond specifically if the user says anything about setting a timer, or even mentions what
sounds like a time duration with this JSON (and nothing else)

{"time":<integer which is the time in seconds}

For example, the response to 'set timer for 15 minutes' would be

{"time":900}

If the message has nothing to do with time or timer, just say something friendly.
"#;

/// Upper bound for every seconds-valued setting: one day.
const MAX_SECS: f64 = 86_400.0;

/// Full bot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub matrix: MatrixConfig,
    pub llm: LlmConfig,
    pub rate_limit: RateLimitConfig,
    pub device: DeviceConfig,
    pub status: StatusConfig,
    /// Random delay before logging in, so a restart loop doesn't hammer the APIs.
    pub startup_delay: RangeInclusive<f64>,
}

/// Matrix homeserver settings.
#[derive(Debug, Clone)]
pub struct MatrixConfig {
    pub homeserver_url: String,
    pub user_id: String,
    pub password: SecretString,
    pub room_alias: String,
    /// Long-poll timeout passed to `/sync`.
    pub sync_timeout: Duration,
}

/// Completion API settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
    pub system_prompt: String,
}

/// Outbound call pacing and throttling recovery.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between completion calls.
    pub min_delay: Duration,
    /// Upper bound of the random extra spacing.
    pub jitter: Duration,
    /// Attempts per request before entering cooldown.
    pub max_retries: u32,
    /// Base of the exponential retry backoff.
    pub base_backoff: Duration,
    /// Upper bound of the random extra backoff.
    pub backoff_jitter: Duration,
    /// How long requests are suppressed after retries run out.
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(3),
            jitter: Duration::from_secs(2),
            max_retries: 5,
            base_backoff: Duration::from_secs(2),
            backoff_jitter: Duration::from_secs(2),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Particle device function settings.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: Option<String>,
    pub access_token: Option<SecretString>,
    pub function_name: String,
    pub api_url: String,
}

impl DeviceConfig {
    /// Whether both the device id and its access token are present.
    pub fn is_configured(&self) -> bool {
        self.device_id.is_some() && self.access_token.is_some()
    }
}

/// Optional HTTP status server.
#[derive(Debug, Clone, Default)]
pub struct StatusConfig {
    pub port: Option<u16>,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let or_default =
            |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let password = get("MATRIX_PASSWORD");
        let api_key = get("BOT_OPENAI_API_KEY");

        let missing: Vec<String> = [
            ("MATRIX_PASSWORD", password.is_none()),
            ("BOT_OPENAI_API_KEY", api_key.is_none()),
        ]
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| name.to_string())
        .collect();

        let (Some(password), Some(api_key)) = (password, api_key) else {
            return Err(ConfigError::MissingEnvVar { vars: missing });
        };

        let matrix = MatrixConfig {
            homeserver_url: or_default("MATRIX_SERVER", "https://matrix.org")
                .trim_end_matches('/')
                .to_string(),
            user_id: or_default("MATRIX_USER", "@steely-dan:matrix.org"),
            password: SecretString::from(password),
            room_alias: or_default("MATRIX_ROOM_ALIAS", "#Bots_sdc2:matrix.org"),
            sync_timeout: Duration::from_millis(parse_or(
                "MATRIX_SYNC_TIMEOUT_MS",
                get("MATRIX_SYNC_TIMEOUT_MS"),
                30_000u64,
            )?),
        };

        let llm = LlmConfig {
            api_key: SecretString::from(api_key),
            model: or_default("OPENAI_MODEL", "gpt-4.1-nano"),
            base_url: or_default("OPENAI_BASE_URL", "https://api.openai.com")
                .trim_end_matches('/')
                .to_string(),
            system_prompt: get("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        let defaults = RateLimitConfig::default();
        let secs = |key: &str, default: Duration| secs_or(key, get(key), default);
        let rate_limit = RateLimitConfig {
            min_delay: secs("RATE_LIMIT_MIN_DELAY_SECS", defaults.min_delay)?,
            jitter: secs("RATE_LIMIT_JITTER_SECS", defaults.jitter)?,
            max_retries: parse_or(
                "RATE_LIMIT_MAX_RETRIES",
                get("RATE_LIMIT_MAX_RETRIES"),
                defaults.max_retries,
            )?,
            cooldown: secs("RATE_LIMIT_COOLDOWN_SECS", defaults.cooldown)?,
            ..defaults
        };
        if rate_limit.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RATE_LIMIT_MAX_RETRIES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let device = DeviceConfig {
            device_id: get("PARTICLE_DEVICE_ID"),
            access_token: get("PARTICLE_ACCESS_TOKEN").map(SecretString::from),
            function_name: or_default("PARTICLE_FUNCTION_NAME", "timerExpired"),
            api_url: or_default("PARTICLE_API_URL", "https://api.particle.io")
                .trim_end_matches('/')
                .to_string(),
        };

        let status = StatusConfig {
            port: get("STATUS_PORT")
                .map(|v| parse_value::<u16>("STATUS_PORT", &v))
                .transpose()?,
        };

        let delay_min: f64 =
            parse_or("STARTUP_DELAY_MIN_SECS", get("STARTUP_DELAY_MIN_SECS"), 5.0)?;
        let delay_max: f64 =
            parse_or("STARTUP_DELAY_MAX_SECS", get("STARTUP_DELAY_MAX_SECS"), 10.0)?;
        let finite = delay_min.is_finite() && delay_max.is_finite();
        if !finite || delay_min < 0.0 || delay_max < delay_min {
            return Err(ConfigError::InvalidValue {
                key: "STARTUP_DELAY_MAX_SECS".to_string(),
                message: format!("range {delay_min}..={delay_max} is empty or negative"),
            });
        }
        if delay_max > MAX_SECS {
            return Err(ConfigError::InvalidValue {
                key: "STARTUP_DELAY_MAX_SECS".to_string(),
                message: format!("must be at most {MAX_SECS} seconds"),
            });
        }

        Ok(Self {
            matrix,
            llm,
            rate_limit,
            device,
            status,
            startup_delay: delay_min..=delay_max,
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

fn secs_or(key: &str, raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let secs: f64 = parse_value(key, &raw)?;
    if secs > MAX_SECS {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at most {MAX_SECS} seconds"),
        });
    }
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
