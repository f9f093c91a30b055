//! Runtime configuration.
//!
//! Every setting has a default and can be overridden through a `LIFTLOG_*`
//! environment variable:
//!
//! | Variable                        | Default        |
//! |---------------------------------|----------------|
//! | `LIFTLOG_DATA_DIR`              | `./liftlog-data` |
//! | `LIFTLOG_REMOTE_URL`            | unset          |
//! | `LIFTLOG_REMOTE_TOKEN`          | unset          |
//! | `LIFTLOG_USER_ID`               | unset          |
//! | `LIFTLOG_SYNC_INTERVAL_SECS`    | 60             |
//! | `LIFTLOG_PUSH_BATCH_SIZE`       | 500            |
//! | `LIFTLOG_DRAIN_BATCH_SIZE`      | 20             |
//! | `LIFTLOG_POLL_INTERVAL_SECS`    | 15             |
//! | `LIFTLOG_PROBE_INTERVAL_SECS`   | 10             |
//! | `LIFTLOG_REQUEST_TIMEOUT_SECS`  | 10             |
//! | `LIFTLOG_METRICS_ADDR`          | unset          |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use liftlog_core::DRAIN_BATCH_SIZE;
use thiserror::Error;
use url::Url;

use crate::http::HttpRemoteConfig;

/// Remote batch-write limit per commit.
pub const PUSH_BATCH_SIZE: usize = 500;

/// Shortest period any background ticker runs at.
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable was set to a value that could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// The remote URL is malformed.
    #[error("invalid remote URL {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),
    /// A size or interval was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Engine timing and batching.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the drain + push timer.
    pub sync_interval: Duration,
    /// Documents per remote commit during push.
    pub push_batch_size: usize,
    /// Pending operations per replay batch.
    pub drain_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            push_batch_size: PUSH_BATCH_SIZE,
            drain_batch_size: DRAIN_BATCH_SIZE,
        }
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of the local store and the pending log.
    pub data_dir: PathBuf,
    /// Remote store base URL.
    pub remote_url: Option<Url>,
    /// Bearer token for the remote store.
    pub remote_token: Option<String>,
    /// User to sign in as at startup.
    pub user_id: Option<String>,
    /// Engine timing and batching.
    pub engine: EngineConfig,
    /// Watch poll period for the HTTP remote.
    pub poll_interval: Duration,
    /// Connectivity probe period.
    pub probe_interval: Duration,
    /// HTTP request timeout.
    pub request_timeout: Duration,
    /// Address for the Prometheus endpoint.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./liftlog-data"),
            remote_url: None,
            remote_token: None,
            user_id: None,
            engine: EngineConfig::default(),
            poll_interval: Duration::from_secs(15),
            probe_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            metrics_addr: None,
        }
    }
}

impl SyncConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let remote_url = text("LIFTLOG_REMOTE_URL")
            .map(|raw| Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl(raw, e)))
            .transpose()?;

        let config = Self {
            data_dir: text("LIFTLOG_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            remote_url,
            remote_token: text("LIFTLOG_REMOTE_TOKEN"),
            user_id: text("LIFTLOG_USER_ID"),
            engine: EngineConfig {
                sync_interval: secs(
                    &lookup,
                    "LIFTLOG_SYNC_INTERVAL_SECS",
                    defaults.engine.sync_interval,
                )?,
                push_batch_size: parse(
                    &lookup,
                    "LIFTLOG_PUSH_BATCH_SIZE",
                    defaults.engine.push_batch_size,
                )?,
                drain_batch_size: parse(
                    &lookup,
                    "LIFTLOG_DRAIN_BATCH_SIZE",
                    defaults.engine.drain_batch_size,
                )?,
            },
            poll_interval: secs(&lookup, "LIFTLOG_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            probe_interval: secs(
                &lookup,
                "LIFTLOG_PROBE_INTERVAL_SECS",
                defaults.probe_interval,
            )?,
            request_timeout: secs(
                &lookup,
                "LIFTLOG_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout,
            )?,
            metrics_addr: text("LIFTLOG_METRICS_ADDR")
                .map(|raw| {
                    raw.parse().map_err(|_| ConfigError::Invalid {
                        var: "LIFTLOG_METRICS_ADDR",
                        value: raw,
                    })
                })
                .transpose()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Settings for the HTTP remote client.
    #[must_use]
    pub fn http_remote(&self) -> HttpRemoteConfig {
        HttpRemoteConfig {
            token: self.remote_token.clone(),
            timeout: self.request_timeout,
            poll_interval: self.poll_interval,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("LIFTLOG_SYNC_INTERVAL_SECS", self.engine.sync_interval.is_zero()),
            ("LIFTLOG_PUSH_BATCH_SIZE", self.engine.push_batch_size == 0),
            ("LIFTLOG_DRAIN_BATCH_SIZE", self.engine.drain_batch_size == 0),
            ("LIFTLOG_POLL_INTERVAL_SECS", self.poll_interval.is_zero()),
            ("LIFTLOG_PROBE_INTERVAL_SECS", self.probe_interval.is_zero()),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((var, _)) => Err(ConfigError::Zero(var)),
            None => Ok(()),
        }
    }
}

fn parse<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
        _ => Ok(default),
    }
}

fn secs<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, var, default.as_secs()).map(Duration::from_secs)
}
