//! Booth service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default realtime WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:6042";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default pub/sub channel shared by every booth instance.
pub const DEFAULT_BUS_CHANNEL: &str = "booth:events";

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "booth";

/// Default lifetime of an unredeemed handshake token.
pub const DEFAULT_AUTH_TOKEN_TTL_SECONDS: u64 = 60;

/// Default window a guest has to present its token.
pub const DEFAULT_AUTH_WINDOW_SECONDS: u64 = 30;

/// Default time a lost session is kept before the participant goes offline.
pub const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default keepalive interval. Connections idle for half of it get a ping.
pub const DEFAULT_PING_INTERVAL_SECONDS: u64 = 10;

/// Default number of messages buffered for a lost participant.
pub const DEFAULT_LOST_QUEUE_CAPACITY: usize = 100;

/// Default advance lease TTL in milliseconds.
pub const DEFAULT_ADVANCE_LOCK_TTL_MS: u64 = 2000;

/// Default guest recount debounce in milliseconds.
pub const DEFAULT_GUEST_RECOUNT_DEBOUNCE_MS: u64 = 1000;

/// Booth service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (shared store and event bus).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Realtime WebSocket bind address (default: "0.0.0.0:6042").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this process. Owns lost sessions and guest counts.
    pub instance_id: String,

    /// Pub/sub channel name.
    pub bus_channel: String,

    /// Optional JSON file seeding the in-memory user directory.
    pub directory_seed: Option<String>,

    /// Timing and capacity knobs shared with the core components.
    pub tuning: Tuning,
}

/// Timing and capacity parameters.
///
/// Separate from [`Config`] so tests can build one without a Redis URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub auth_token_ttl: Duration,
    pub auth_window: Duration,
    pub grace_period: Duration,
    pub ping_interval: Duration,
    pub lost_queue_capacity: usize,
    pub advance_lock_ttl: Duration,
    pub guest_recount_debounce: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            auth_token_ttl: Duration::from_secs(DEFAULT_AUTH_TOKEN_TTL_SECONDS),
            auth_window: Duration::from_secs(DEFAULT_AUTH_WINDOW_SECONDS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECONDS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECONDS),
            lost_queue_capacity: DEFAULT_LOST_QUEUE_CAPACITY,
            advance_lock_ttl: Duration::from_millis(DEFAULT_ADVANCE_LOCK_TTL_MS),
            guest_recount_debounce: Duration::from_millis(DEFAULT_GUEST_RECOUNT_DEBOUNCE_MS),
        }
    }
}

impl Tuning {
    /// Idle time after which a connection is pinged.
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        self.ping_interval / 2
    }

    /// Lifetime of an instance's reported guest count. Refreshed every ping
    /// interval, so it outlives a few missed refreshes.
    #[must_use]
    pub fn guest_count_ttl(&self) -> Duration {
        self.ping_interval * 3
    }
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("bus_channel", &self.bus_channel)
            .field("directory_seed", &self.directory_seed)
            .field("tuning", &self.tuning)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}

fn parse_nonzero(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = parse_or(vars, key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!("{key} must be positive")));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let bind_address = vars
            .get("BOOTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("BOOTH_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let bus_channel = vars
            .get("BOOTH_BUS_CHANNEL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BUS_CHANNEL.to_string());

        let directory_seed = vars
            .get("BOOTH_DIRECTORY_SEED")
            .filter(|path| !path.is_empty())
            .cloned();

        let tuning = Tuning {
            auth_token_ttl: Duration::from_secs(parse_nonzero(
                vars,
                "BOOTH_AUTH_TOKEN_TTL_SECONDS",
                DEFAULT_AUTH_TOKEN_TTL_SECONDS,
            )?),
            auth_window: Duration::from_secs(parse_nonzero(
                vars,
                "BOOTH_AUTH_WINDOW_SECONDS",
                DEFAULT_AUTH_WINDOW_SECONDS,
            )?),
            grace_period: Duration::from_secs(parse_nonzero(
                vars,
                "BOOTH_GRACE_PERIOD_SECONDS",
                DEFAULT_GRACE_PERIOD_SECONDS,
            )?),
            ping_interval: Duration::from_secs(parse_nonzero(
                vars,
                "BOOTH_PING_INTERVAL_SECONDS",
                DEFAULT_PING_INTERVAL_SECONDS,
            )?),
            lost_queue_capacity: parse_or(
                vars,
                "BOOTH_LOST_QUEUE_CAPACITY",
                DEFAULT_LOST_QUEUE_CAPACITY,
            )?,
            advance_lock_ttl: Duration::from_millis(parse_nonzero(
                vars,
                "BOOTH_ADVANCE_LOCK_TTL_MS",
                DEFAULT_ADVANCE_LOCK_TTL_MS,
            )?),
            guest_recount_debounce: Duration::from_millis(parse_or(
                vars,
                "BOOTH_GUEST_RECOUNT_DEBOUNCE_MS",
                DEFAULT_GUEST_RECOUNT_DEBOUNCE_MS,
            )?),
        };

        let instance_id = vars.get("BOOTH_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}")
        });

        Ok(Config {
            redis_url,
            bind_address,
            health_bind_address,
            instance_id,
            bus_channel,
            directory_seed,
            tuning,
        })
    }
}
