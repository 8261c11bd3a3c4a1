//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `UHTTPD_*`
//! environment variables, command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::http::{Alias, Captive, ConnectionConfig};
use crate::rpc::GatewayConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/uhttpd-gw.toml";
pub const ENV_PREFIX: &str = "UHTTPD_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasConfig {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptiveConfig {
    pub host: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listen address, `host:port`
    pub listen: String,
    pub max_connections: usize,
    /// Read buffer size per connection, bytes
    pub max_request_size: usize,
    /// Seconds
    pub network_timeout: u64,
    /// Seconds between keep-alive requests; 0 disables keep-alive
    pub http_keepalive: u64,
    /// Seconds allowed for each backend call
    pub script_timeout: u64,
    /// URL prefix of the JSON-RPC gateway; unset disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ubus_prefix: Option<String>,
    pub ubus_noauth: bool,
    /// Bus bridge address, `host:port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ubus_socket: Option<String>,
    /// Serve from the in-process simulated bus
    pub simulation: bool,
    pub log_json: bool,
    pub verbose: bool,
    // Tables last so the TOML rendering stays valid.
    pub aliases: Vec<AliasConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captive: Option<CaptiveConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_connections: 100,
            max_request_size: 4096,
            network_timeout: 30,
            http_keepalive: 20,
            script_timeout: 60,
            ubus_prefix: None,
            ubus_noauth: false,
            ubus_socket: None,
            simulation: false,
            log_json: false,
            verbose: false,
            aliases: Vec::new(),
            captive: None,
        }
    }
}

impl AppConfig {
    /// Load and validate the effective configuration.
    ///
    /// `path` must exist when given; otherwise [`DEFAULT_CONFIG_PATH`] is
    /// read if present. `overrides` holds command-line values, with unset
    /// flags left out of its serialization.
    pub fn new<T: Serialize>(path: Option<&Path>, overrides: Option<&T>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
        }
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));
        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_request_size < 64 {
            return Err(ConfigError::Invalid(
                "max_request_size must be at least 64".into(),
            ));
        }
        if self.network_timeout == 0 {
            return Err(ConfigError::Invalid("network_timeout must be positive".into()));
        }
        if self.script_timeout == 0 {
            return Err(ConfigError::Invalid("script_timeout must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if let Some(prefix) = &self.ubus_prefix {
            if !prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "ubus_prefix must start with '/': {}",
                    prefix
                )));
            }
            if self.ubus_socket.is_none() && !self.simulation {
                return Err(ConfigError::Invalid(
                    "ubus_prefix requires ubus_socket or simulation".into(),
                ));
            }
        }
        for alias in &self.aliases {
            if !alias.from.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "alias must start with '/': {}",
                    alias.from
                )));
            }
        }
        Ok(())
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_request_size: self.max_request_size,
            network_timeout: Duration::from_secs(self.network_timeout),
            http_keepalive: Duration::from_secs(self.http_keepalive),
        }
    }

    /// Gateway settings, if a prefix is configured.
    pub fn gateway_config(&self) -> Option<GatewayConfig> {
        let prefix = self.ubus_prefix.as_ref()?;
        Some(GatewayConfig {
            prefix: prefix.clone(),
            noauth: self.ubus_noauth,
            script_timeout: Duration::from_secs(self.script_timeout),
            ..GatewayConfig::default()
        })
    }

    pub fn aliases(&self) -> Vec<Alias> {
        self.aliases
            .iter()
            .map(|a| Alias::new(a.from.clone(), a.to.clone()))
            .collect()
    }

    pub fn captive(&self) -> Option<Captive> {
        self.captive.as_ref().map(|c| Captive {
            host: c.host.clone(),
            url: c.url.clone(),
        })
    }
}
