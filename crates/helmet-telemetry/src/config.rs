//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Telemetry link, frame decoding and fan-out."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Client configuration.
//!
//! Every default is the shipped deployment, so an empty file (or no file at
//! all) yields a working client. Topics are not configurable.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use helmet_logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::error::LinkError;

fn default_broker_url() -> String {
    "ws://ionlypfw.thddns.net:2025".to_owned()
}

fn default_username() -> String {
    "smarthelmet".to_owned()
}

fn default_password() -> String {
    "smarthelmet".to_owned()
}

fn default_client_id_prefix() -> String {
    "helmet".to_owned()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reconnect_period() -> Duration {
    Duration::from_millis(1000)
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_capacity() -> usize {
    100
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Broker address and credentials.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Keep-alive, timeouts and the reconnect policy.
    #[serde(default)]
    pub session: SessionConfig,
    /// Distance memo bounds.
    #[serde(default)]
    pub distance_cache: DistanceCacheConfig,
    /// Tracing setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedClientConfig {
    /// Parsed configuration.
    pub config: ClientConfig,
    /// File it was read from; `None` when defaults were used.
    pub source: Option<PathBuf>,
}

impl ClientConfig {
    /// Environment variable naming an explicit configuration file.
    pub const ENV_CONFIG_PATH: &'static str = "HELMET_CONFIG";

    /// Load from `HELMET_CONFIG`, else the first existing candidate, else defaults.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedClientConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedClientConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedClientConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using compiled-in defaults");
        Ok(LoadedClientConfig {
            config: Self::default(),
            source: None,
        })
    }

    /// Read and validate a TOML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Check structural invariants.
    pub fn validate(&self) -> std::result::Result<(), LinkError> {
        self.broker.endpoint()?;
        if self.broker.client_id_prefix.trim().is_empty() {
            return Err(LinkError::Config("broker.client_id_prefix must not be empty".into()));
        }
        if self.session.keep_alive.is_zero() {
            return Err(LinkError::Config("session.keep_alive must be positive".into()));
        }
        if self.session.connect_timeout.is_zero() {
            return Err(LinkError::Config("session.connect_timeout must be positive".into()));
        }
        if self.distance_cache.capacity == 0 {
            return Err(LinkError::Config("distance_cache.capacity must be positive".into()));
        }
        Ok(())
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialise configuration")
    }
}

impl std::str::FromStr for ClientConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ClientConfig =
            toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Broker address and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `mqtt://`, `tcp://` or `ws://` URL.
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Broker username.
    #[serde(default = "default_username")]
    pub username: String,
    /// Broker password.
    #[serde(default = "default_password")]
    pub password: String,
    /// Client ids are this prefix plus a random suffix.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            username: default_username(),
            password: default_password(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

impl BrokerConfig {
    /// Parse the broker URL.
    pub fn endpoint(&self) -> std::result::Result<BrokerEndpoint, LinkError> {
        BrokerEndpoint::parse(&self.url)
    }
}

/// Wire protocol carrying MQTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// Plain TCP.
    Tcp,
    /// MQTT over WebSocket.
    WebSocket,
}

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Wire protocol.
    pub scheme: BrokerScheme,
    /// Host name or address.
    pub host: String,
    /// Port, defaulted per scheme.
    pub port: u16,
    /// Normalised URL.
    pub url: String,
}

impl BrokerEndpoint {
    /// Parse and validate a broker URL.
    pub fn parse(raw: &str) -> std::result::Result<Self, LinkError> {
        let url = Url::parse(raw)
            .map_err(|err| LinkError::Config(format!("invalid broker url {raw:?}: {err}")))?;
        let (scheme, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (BrokerScheme::Tcp, 1883),
            "ws" => (BrokerScheme::WebSocket, 80),
            other => {
                return Err(LinkError::Config(format!(
                    "unsupported broker scheme {other:?}; expected mqtt, tcp or ws"
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| LinkError::Config(format!("broker url {raw:?} has no host")))?
            .to_owned();
        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(default_port),
            url: url.to_string(),
        })
    }
}

/// Keep-alive, timeouts and the reconnect policy.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// MQTT keep-alive interval.
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    /// How long `connect()` waits for the subscription acknowledgement.
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Fixed delay between redials after a drop.
    #[serde(default = "default_reconnect_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_period: Duration,
    /// Redials tolerated before the link gives up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            reconnect_period: default_reconnect_period(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Distance memo bounds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceCacheConfig {
    /// Entry lifetime.
    #[serde(default = "default_cache_ttl")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ttl: Duration,
    /// Maximum entries held.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for DistanceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}
