//! Process configuration read from the environment (optionally seeded from `.env`).

use crate::error::{EngineError, Result};
use crate::services::websocket::auth::Credential;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const DEFAULT_PASSWORD: &str = "change_me_please";

/// Deployment environment name (`APP_ENV`), `sandbox` when unset.
pub fn get_environment() -> String {
    env::var("APP_ENV").unwrap_or_else(|_| "sandbox".to_string())
}

/// Connection settings for the relational store.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    /// Host and database of the connection string, without credentials, for logs.
    pub fn redacted(&self) -> String {
        match url::Url::parse(&self.url) {
            Ok(parsed) => format!(
                "{}:{}{}",
                parsed.host_str().unwrap_or("localhost"),
                parsed.port().unwrap_or(5432),
                parsed.path()
            ),
            Err(_) => "<unparsable database url>".to_string(),
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.redacted())
            .finish()
    }
}

/// Which exchanges' signals qualify. Binance is exchange 1, Bybit exchange 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeFilter {
    pub binance: bool,
    pub bybit: bool,
}

impl ExchangeFilter {
    pub fn exchange_ids(&self) -> Vec<i32> {
        let mut ids = Vec::new();
        if self.binance {
            ids.push(1);
        }
        if self.bybit {
            ids.push(2);
        }
        ids
    }
}

impl Default for ExchangeFilter {
    fn default() -> Self {
        Self {
            binance: true,
            bybit: true,
        }
    }
}

/// Reconciliation and polling cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub window: Duration,
    pub use_notify: bool,
    pub notify_channel: String,
    pub lightweight_interval: Duration,
    pub safety_net_interval: Duration,
    pub fetch_retry_attempts: usize,
    pub fetch_retry_min_delay: Duration,
    pub degraded_after_failures: u32,
    /// Failed passes before the source is declared unavailable. 0 never escalates.
    pub fatal_after_failures: u32,
    pub listener_backoff_min: Duration,
    pub listener_backoff_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(32 * 60),
            use_notify: true,
            notify_channel: "new_signals".to_string(),
            lightweight_interval: Duration::from_secs(1),
            safety_net_interval: Duration::from_secs(60),
            fetch_retry_attempts: 3,
            fetch_retry_min_delay: Duration::from_millis(200),
            degraded_after_failures: 3,
            fatal_after_failures: 30,
            listener_backoff_min: Duration::from_secs(1),
            listener_backoff_max: Duration::from_secs(30),
        }
    }
}

/// Per-connection limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    pub backpressure_grace: Duration,
    pub auth_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            backpressure_grace: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub bind_addr: SocketAddr,
    /// 0 disables the health/metrics endpoint.
    pub http_port: u16,
    pub credential: Credential,
    pub database: DatabaseConfig,
    pub exchanges: ExchangeFilter,
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Reads the process environment after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("APP_ENV").unwrap_or_else(|| "sandbox".to_string());

        let host = lookup("WS_SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_or(&lookup, "WS_SERVER_PORT", 8765)?;
        let bind_addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid bind address {}:{}: {}", host, port, e)))?;
        let http_port: u16 = parse_or(&lookup, "HTTP_PORT", 8080)?;

        let password = match lookup("WS_AUTH_PASSWORD") {
            Some(p) if !p.is_empty() => p,
            _ => {
                warn!("WS_AUTH_PASSWORD not set, falling back to the default shared credential");
                DEFAULT_PASSWORD.to_string()
            }
        };
        let credential = Credential::from_secret(&password);

        let database = DatabaseConfig {
            url: lookup("DATABASE_URL").unwrap_or_else(|| database_url_from_parts(&lookup)),
        };

        let exchanges = ExchangeFilter {
            binance: parse_bool_or(&lookup, "BINANCE_ENABLED", true)?,
            bybit: parse_bool_or(&lookup, "BYBIT_ENABLED", true)?,
        };

        let defaults = EngineConfig::default();
        let window_minutes: u64 = parse_or(&lookup, "SIGNAL_WINDOW_MINUTES", 32)?;
        let engine = EngineConfig {
            window: Duration::from_secs(window_minutes.checked_mul(60).ok_or_else(|| {
                EngineError::Config(format!("SIGNAL_WINDOW_MINUTES is too large: {}", window_minutes))
            })?),
            use_notify: parse_bool_or(&lookup, "USE_NOTIFY", true)?,
            notify_channel: lookup("NOTIFY_CHANNEL").unwrap_or(defaults.notify_channel),
            lightweight_interval: Duration::from_secs(parse_or(&lookup, "LIGHTWEIGHT_CHECK_INTERVAL", 1)?),
            safety_net_interval: Duration::from_secs(parse_or(&lookup, "NOTIFY_FALLBACK_INTERVAL", 60)?),
            fetch_retry_attempts: parse_or(&lookup, "FETCH_RETRY_ATTEMPTS", defaults.fetch_retry_attempts)?,
            fetch_retry_min_delay: defaults.fetch_retry_min_delay,
            degraded_after_failures: parse_or(&lookup, "DEGRADED_AFTER_FAILURES", defaults.degraded_after_failures)?,
            fatal_after_failures: parse_or(&lookup, "FATAL_AFTER_FAILURES", defaults.fatal_after_failures)?,
            listener_backoff_min: Duration::from_millis(parse_or(&lookup, "LISTENER_BACKOFF_MIN_MS", 1000)?),
            listener_backoff_max: Duration::from_millis(parse_or(&lookup, "LISTENER_BACKOFF_MAX_MS", 30_000)?),
        };

        let session = SessionConfig {
            queue_capacity: parse_or(&lookup, "OUTBOUND_QUEUE_CAPACITY", 256)?,
            backpressure_grace: Duration::from_secs(parse_or(&lookup, "BACKPRESSURE_GRACE_SECONDS", 5)?),
            auth_timeout: Duration::from_secs(parse_or(&lookup, "AUTH_TIMEOUT_SECONDS", 30)?),
            keepalive_interval: Duration::from_secs(parse_or(&lookup, "KEEPALIVE_INTERVAL_SECONDS", 20)?),
            idle_timeout: Duration::from_secs(parse_or(&lookup, "IDLE_TIMEOUT_SECONDS", 90)?),
        };

        let config = Self {
            environment,
            bind_addr,
            http_port,
            credential,
            database,
            exchanges,
            engine,
            session,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.window.is_zero() {
            return Err(EngineError::Config("SIGNAL_WINDOW_MINUTES must be > 0".into()));
        }
        if engine.lightweight_interval.is_zero() || engine.safety_net_interval.is_zero() {
            return Err(EngineError::Config("poll intervals must be > 0".into()));
        }
        if engine.safety_net_interval < engine.lightweight_interval {
            return Err(EngineError::Config(
                "NOTIFY_FALLBACK_INTERVAL must not be shorter than LIGHTWEIGHT_CHECK_INTERVAL".into(),
            ));
        }
        if engine.listener_backoff_min.is_zero() || engine.listener_backoff_max < engine.listener_backoff_min {
            return Err(EngineError::Config("listener backoff bounds are inconsistent".into()));
        }
        if !is_valid_channel(&engine.notify_channel) {
            return Err(EngineError::Config(format!(
                "NOTIFY_CHANNEL '{}' is not a plain identifier",
                engine.notify_channel
            )));
        }
        if self.exchanges.exchange_ids().is_empty() {
            return Err(EngineError::Config(
                "At least one exchange must be enabled (BINANCE_ENABLED or BYBIT_ENABLED)".into(),
            ));
        }
        let session = &self.session;
        if session.queue_capacity == 0 {
            return Err(EngineError::Config("OUTBOUND_QUEUE_CAPACITY must be > 0".into()));
        }
        if session.auth_timeout.is_zero() || session.keepalive_interval.is_zero() || session.idle_timeout.is_zero() {
            return Err(EngineError::Config("session timeouts must be > 0".into()));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "prod")
    }
}

/// Channel names are interpolated into `LISTEN`, so only plain identifiers pass.
pub fn is_valid_channel(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn database_url_from_parts<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let host = lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string());
    let port = lookup("DB_PORT").unwrap_or_else(|| "5432".to_string());
    let name = lookup("DB_NAME").unwrap_or_else(|| "postgres".to_string());
    let user = lookup("DB_USER").unwrap_or_else(|| "postgres".to_string());
    match lookup("DB_PASSWORD") {
        Some(password) => format!("postgres://{}:{}@{}:{}/{}", user, password, host, port, name),
        None => format!("postgres://{}@{}:{}/{}", user, host, port, name),
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{}='{}': {}", key, raw, e))),
        _ => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(EngineError::Config(format!("{}='{}' is not a boolean", key, v))),
        },
    }
}
