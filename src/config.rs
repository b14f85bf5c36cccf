//! Process configuration.
//!
//! Every setting has a default and can be overridden by a `NOTIFY_*`
//! environment variable. Only the HMAC secret is required. A variable that is
//! set but unparsable is an error, never a silent fallback to the default.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::dispatch::DEFAULT_CALLBACK_TIMEOUT_SECS;
use crate::dispatch::pool::DEFAULT_WORKERS;
use crate::matcher::DEFAULT_LEASE_TTL_MINS;
use crate::template::DEFAULT_THEME;

/// Default HTTP bind address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Default endpoint callback paths are appended to.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000/callback";

/// Default store snapshot file.
pub const DEFAULT_STATE_PATH: &str = "./state/subscriptions.json";

/// Default template root.
pub const DEFAULT_TEMPLATE_DIR: &str = "./templates";

/// Default short system name used in subjects.
pub const DEFAULT_SYSTEM_NAME: &str = "Notify";

/// Default matcher tick interval (1 minute).
pub const DEFAULT_TICK_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Complete process configuration.
#[derive(Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub base_url: Url,
    pub state_path: PathBuf,
    /// JSON fixture for the in-memory catalog; empty catalog if unset.
    pub resources_path: Option<PathBuf>,
    pub template_dir: PathBuf,
    pub theme: String,
    pub system_name: String,
    /// HMAC secret for caller identity signatures.
    pub secret: String,
    pub tick_interval: Duration,
    pub workers: usize,
    pub callback_timeout: Duration,
    pub lease_ttl: chrono::Duration,
    pub failure_backoff: Option<chrono::Duration>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen_addr", &self.listen_addr)
            .field("base_url", &self.base_url.as_str())
            .field("state_path", &self.state_path)
            .field("resources_path", &self.resources_path)
            .field("template_dir", &self.template_dir)
            .field("theme", &self.theme)
            .field("system_name", &self.system_name)
            .field("secret", &"<redacted>")
            .field("tick_interval", &self.tick_interval)
            .field("workers", &self.workers)
            .field("callback_timeout", &self.callback_timeout)
            .field("lease_ttl", &self.lease_ttl)
            .field("failure_backoff", &self.failure_backoff)
            .finish()
    }
}

impl Config {
    /// Creates a `Config` from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `NOTIFY_LISTEN_ADDR` | `0.0.0.0:3000` |
    /// | `NOTIFY_BASE_URL` | `http://127.0.0.1:3000/callback` |
    /// | `NOTIFY_STATE_PATH` | `./state/subscriptions.json` |
    /// | `NOTIFY_RESOURCES_PATH` | unset |
    /// | `NOTIFY_TEMPLATE_DIR` | `./templates` |
    /// | `NOTIFY_THEME` | `default` |
    /// | `NOTIFY_SYSTEM_NAME` | `Notify` |
    /// | `NOTIFY_SECRET` | required |
    /// | `NOTIFY_TICK_SECS` | `60` |
    /// | `NOTIFY_WORKERS` | `4` |
    /// | `NOTIFY_CALLBACK_TIMEOUT_SECS` | `120` |
    /// | `NOTIFY_LEASE_TTL_MINS` | `30` |
    /// | `NOTIFY_FAILURE_BACKOFF_MINS` | unset |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Creates a `Config` reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let text = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let secret = var("NOTIFY_SECRET").ok_or(ConfigError::Missing("NOTIFY_SECRET"))?;

        let tick_secs = positive(parse(&var, "NOTIFY_TICK_SECS")?, "NOTIFY_TICK_SECS")?;
        let workers = positive(parse(&var, "NOTIFY_WORKERS")?, "NOTIFY_WORKERS")?;
        let timeout_secs = positive(
            parse(&var, "NOTIFY_CALLBACK_TIMEOUT_SECS")?,
            "NOTIFY_CALLBACK_TIMEOUT_SECS",
        )?;
        let lease_mins: Option<i64> =
            positive(parse(&var, "NOTIFY_LEASE_TTL_MINS")?, "NOTIFY_LEASE_TTL_MINS")?;
        let backoff_mins: Option<i64> = positive(
            parse(&var, "NOTIFY_FAILURE_BACKOFF_MINS")?,
            "NOTIFY_FAILURE_BACKOFF_MINS",
        )?;

        let config = Config {
            listen_addr: required(parse(&var, "NOTIFY_LISTEN_ADDR")?, DEFAULT_LISTEN_ADDR)?,
            base_url: required(parse(&var, "NOTIFY_BASE_URL")?, DEFAULT_BASE_URL)?,
            state_path: PathBuf::from(text("NOTIFY_STATE_PATH", DEFAULT_STATE_PATH)),
            resources_path: var("NOTIFY_RESOURCES_PATH").map(PathBuf::from),
            template_dir: PathBuf::from(text("NOTIFY_TEMPLATE_DIR", DEFAULT_TEMPLATE_DIR)),
            theme: text("NOTIFY_THEME", DEFAULT_THEME),
            system_name: text("NOTIFY_SYSTEM_NAME", DEFAULT_SYSTEM_NAME),
            secret,
            tick_interval: Duration::from_secs(tick_secs.unwrap_or(DEFAULT_TICK_SECS)),
            workers: workers.unwrap_or(DEFAULT_WORKERS),
            callback_timeout: Duration::from_secs(
                timeout_secs.unwrap_or(DEFAULT_CALLBACK_TIMEOUT_SECS),
            ),
            lease_ttl: chrono::Duration::minutes(lease_mins.unwrap_or(DEFAULT_LEASE_TTL_MINS)),
            failure_backoff: backoff_mins.map(chrono::Duration::minutes),
        };

        // A lease must outlive the callback it covers.
        if config.callback_timeout.as_secs() >= config.lease_ttl.num_seconds().unsigned_abs() {
            return Err(ConfigError::Invalid {
                var: "NOTIFY_CALLBACK_TIMEOUT_SECS",
                value: config.callback_timeout.as_secs().to_string(),
                reason: format!(
                    "must be shorter than the lease TTL ({} minutes)",
                    config.lease_ttl.num_minutes()
                ),
            });
        }
        Ok(config)
    }
}

/// Parses `name` if set.
fn parse<T>(var: impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    var(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e: T::Err| ConfigError::Invalid {
                var: name,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Rejects zero and negative values.
fn positive<T>(value: Option<T>, name: &'static str) -> Result<Option<T>>
where
    T: Default + PartialOrd + fmt::Display,
{
    match value {
        Some(v) if v <= T::default() => Err(ConfigError::Invalid {
            var: name,
            value: v.to_string(),
            reason: "must be positive".to_string(),
        }),
        other => Ok(other),
    }
}

/// Falls back to parsing a built-in default.
fn required<T>(value: Option<T>, default: &'static str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(v) => Ok(v),
        None => default.parse::<T>().map_err(|e: T::Err| ConfigError::Invalid {
            var: "default",
            value: default.to_string(),
            reason: e.to_string(),
        }),
    }
}
