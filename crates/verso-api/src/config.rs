//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use verso_core::{Error, Result, RetryPolicy};
use verso_store::DatabaseConfig;

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default deadline for one pull from the upstream export query.
pub const DEFAULT_STREAM_TIMEOUT_MS: u64 = 30_000;

/// Default number of export queries allowed in flight at once.
pub const DEFAULT_STREAM_WORKERS: usize = 8;

/// Default number of frames buffered between producer and transport.
pub const DEFAULT_STREAM_CHANNEL_CAPACITY: usize = 64;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled, `RequestContext` is read from the `X-Workspace-Id` /
    /// `X-User-Name` headers. When disabled, a verified bearer token is required.
    pub debug: bool,

    /// JWT verification settings.
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Write retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Streaming export settings.
    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            debug: false,
            jwt: JwtConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

/// JWT configuration for production authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default)]
    pub hs256_secret: Option<String>,

    /// Optional issuer (`iss`) to enforce.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Optional audience (`aud`) to enforce.
    #[serde(default)]
    pub audience: Option<String>,

    /// Claim name that contains the workspace identifier.
    #[serde(default = "default_workspace_claim")]
    pub workspace_claim: String,

    /// Claim name that contains the caller's user name.
    #[serde(default = "default_user_claim")]
    pub user_claim: String,
}

fn default_workspace_claim() -> String {
    "workspace".to_string()
}

fn default_user_claim() -> String {
    "sub".to_string()
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            hs256_secret: None,
            issuer: None,
            audience: None,
            workspace_claim: default_workspace_claim(),
            user_claim: default_user_claim(),
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of pooled connections.
    pub size: usize,
    /// Maximum wait for a free connection, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            size: defaults.pool_size,
            acquire_timeout_ms: u64::try_from(defaults.acquire_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

impl PoolConfig {
    /// Returns the engine configuration for these settings.
    #[must_use]
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            pool_size: self.size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

/// Retry configuration for writes that hit transient connectivity failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_backoff_ms: u64,
    /// Upper bound for a single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_backoff_ms: u64::try_from(defaults.base_backoff.as_millis()).unwrap_or(u64::MAX),
            max_backoff_ms: u64::try_from(defaults.max_backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl RetryConfig {
    /// Returns the retry policy for these settings.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// Streaming export configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Deadline for each pull from the upstream query, in milliseconds.
    pub timeout_ms: u64,
    /// Maximum number of export queries in flight.
    pub worker_pool_size: usize,
    /// Frames buffered between producer and transport.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_STREAM_TIMEOUT_MS,
            worker_pool_size: DEFAULT_STREAM_WORKERS,
            channel_capacity: DEFAULT_STREAM_CHANNEL_CAPACITY,
        }
    }
}

impl StreamConfig {
    /// Returns the per-pull deadline.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `VERSO_HTTP_PORT`
    /// - `VERSO_DEBUG`
    /// - `VERSO_JWT_SECRET`
    /// - `VERSO_JWT_ISSUER`
    /// - `VERSO_JWT_AUDIENCE`
    /// - `VERSO_JWT_WORKSPACE_CLAIM`
    /// - `VERSO_JWT_USER_CLAIM`
    /// - `VERSO_POOL_SIZE`
    /// - `VERSO_POOL_ACQUIRE_TIMEOUT_MS`
    /// - `VERSO_RETRY_MAX_ATTEMPTS`
    /// - `VERSO_RETRY_BASE_BACKOFF_MS`
    /// - `VERSO_RETRY_MAX_BACKOFF_MS`
    /// - `VERSO_STREAM_TIMEOUT_MS`
    /// - `VERSO_STREAM_WORKERS`
    /// - `VERSO_STREAM_CHANNEL_CAPACITY`
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_u16("VERSO_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env_bool("VERSO_DEBUG")? {
            config.debug = debug;
        }

        config.jwt.hs256_secret = env_string("VERSO_JWT_SECRET");
        config.jwt.issuer = env_string("VERSO_JWT_ISSUER");
        config.jwt.audience = env_string("VERSO_JWT_AUDIENCE");
        if let Some(claim) = env_string("VERSO_JWT_WORKSPACE_CLAIM") {
            config.jwt.workspace_claim = claim;
        }
        if let Some(claim) = env_string("VERSO_JWT_USER_CLAIM") {
            config.jwt.user_claim = claim;
        }

        if let Some(size) = env_usize("VERSO_POOL_SIZE")? {
            config.pool.size = size;
        }
        if let Some(ms) = env_u64("VERSO_POOL_ACQUIRE_TIMEOUT_MS")? {
            config.pool.acquire_timeout_ms = ms;
        }

        if let Some(attempts) = env_u32("VERSO_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = env_u64("VERSO_RETRY_BASE_BACKOFF_MS")? {
            config.retry.base_backoff_ms = ms;
        }
        if let Some(ms) = env_u64("VERSO_RETRY_MAX_BACKOFF_MS")? {
            config.retry.max_backoff_ms = ms;
        }

        if let Some(ms) = env_u64("VERSO_STREAM_TIMEOUT_MS")? {
            config.stream.timeout_ms = ms;
        }
        if let Some(workers) = env_usize("VERSO_STREAM_WORKERS")? {
            config.stream.worker_pool_size = workers;
        }
        if let Some(capacity) = env_usize("VERSO_STREAM_CHANNEL_CAPACITY")? {
            config.stream.channel_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks settings that would otherwise fail at first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.pool.size == 0 {
            return Err(Error::InvalidInput("pool.size must be at least 1".to_string()));
        }
        if self.stream.worker_pool_size == 0 {
            return Err(Error::InvalidInput(
                "stream.worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.stream.channel_capacity == 0 {
            return Err(Error::InvalidInput(
                "stream.channel_capacity must be at least 1".to_string(),
            ));
        }
        if !self.debug && self.jwt.hs256_secret.is_none() {
            return Err(Error::InvalidInput(
                "jwt.hs256_secret is required when debug=false".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u16(name: &str) -> Result<Option<u16>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u16>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u32>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<usize>()
        .map(Some)
        .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_true_values() {
        assert!(parse_bool("TEST", "true").unwrap());
        assert!(parse_bool("TEST", "1").unwrap());
        assert!(parse_bool("TEST", "yes").unwrap());
        assert!(parse_bool("TEST", "TRUE").unwrap());
    }

    #[test]
    fn parse_bool_accepts_false_values() {
        assert!(!parse_bool("TEST", "false").unwrap());
        assert!(!parse_bool("TEST", "0").unwrap());
        assert!(!parse_bool("TEST", "no").unwrap());
        assert!(!parse_bool("TEST", "FALSE").unwrap());
    }

    #[test]
    fn parse_bool_rejects_invalid_values() {
        assert!(parse_bool("TEST", "maybe").is_err());
        assert!(parse_bool("TEST", "").is_err());
    }

    #[test]
    fn defaults_follow_store_defaults() {
        let config = Config::default();
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(config.pool.database_config(), DatabaseConfig::default());
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.stream.timeout(), Duration::from_secs(30));
        assert_eq!(config.jwt.user_claim, "sub");
    }

    #[test]
    fn production_requires_jwt_secret() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("hs256_secret")));

        let debug = Config {
            debug: true,
            ..Config::default()
        };
        assert!(debug.validate().is_ok());
    }

    #[test]
    fn zero_sized_pools_are_rejected() {
        let config = Config {
            debug: true,
            stream: StreamConfig {
                worker_pool_size: 0,
                ..StreamConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            debug: true,
            pool: PoolConfig {
                size: 0,
                ..PoolConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
