/// Configuration management for the router
///
/// Routes are TOML sections under `[routes.<name>]`; the section key becomes
/// the route name `routing:<name>`. Validation errors propagate; a bad
/// option never degrades silently into a default.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::address::RouteAddress;
use crate::core::route::{Route, RouteSettings};
use crate::core::{AccessMode, DEFAULT_BIND_ADDRESS};
use crate::error::ConfigError;
use crate::net::SocketOps;
use crate::protocol::ProtocolKind;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One route section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// TCP listener address; may carry its own port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
    /// TCP listener port; required when bind_address has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_port: Option<u16>,
    /// Local-domain listener path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
    /// CSV destination list or metadata-cache URI
    pub destinations: String,
    /// read-write | read-only
    pub mode: String,
    /// classic | x
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Backend dial timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    /// Handshake-phase client timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_connect_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connect_errors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_buffer_length: Option<usize>,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Validate every section without building live routes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::invalid(format!("Invalid log level: {}", other)));
            }
        }
        if self.routes.is_empty() {
            return Err(ConfigError::invalid("No routes configured"));
        }
        for (name, route) in &self.routes {
            route
                .settings(name)
                .map_err(|e| ConfigError::invalid(format!("route '{}': {}", name, e)))?;
            route
                .check_destinations(name)
                .map_err(|e| ConfigError::invalid(format!("route '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Write an example configuration file.
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let mut routes = BTreeMap::new();
        routes.insert(
            "primary".to_string(),
            RouteConfig {
                bind_address: Some("127.0.0.1".to_string()),
                bind_port: Some(7001),
                socket: None,
                destinations: "10.0.1.10:3306,10.0.1.11:3306".to_string(),
                mode: "read-write".to_string(),
                protocol: Some("classic".to_string()),
                connect_timeout: Some(1),
                client_connect_timeout: Some(9),
                max_connections: Some(512),
                max_connect_errors: Some(100),
                net_buffer_length: Some(16384),
            },
        );
        routes.insert(
            "cluster_ro".to_string(),
            RouteConfig {
                bind_address: Some("127.0.0.1".to_string()),
                bind_port: Some(7002),
                socket: None,
                destinations: "metadata-cache://cluster/default?role=SECONDARY".to_string(),
                mode: "read-only".to_string(),
                protocol: Some("classic".to_string()),
                connect_timeout: None,
                client_connect_timeout: None,
                max_connections: None,
                max_connect_errors: None,
                net_buffer_length: None,
            },
        );
        let config = Config {
            logging: LoggingConfig::default(),
            routes,
        };
        config.save_to_file(path)
    }
}

impl RouteConfig {
    /// Resolve this section into route settings. The route name becomes
    /// `routing:<section>`.
    pub fn settings(&self, name: &str) -> Result<RouteSettings, ConfigError> {
        let access_mode = AccessMode::from_name(&self.mode).ok_or_else(|| {
            ConfigError::invalid(format!(
                "Invalid mode '{}'; valid are: read-write, read-only",
                self.mode
            ))
        })?;
        let protocol = match self.protocol.as_deref() {
            None => ProtocolKind::Classic,
            Some(p) => ProtocolKind::from_config(p).ok_or_else(|| {
                ConfigError::invalid(format!("Invalid protocol '{}'; valid are: classic, x", p))
            })?,
        };

        let mut settings =
            RouteSettings::new(format!("routing:{}", name), access_mode, protocol);

        settings.bind_tcp = self.bind_tcp()?;
        settings.bind_socket = self.socket.clone();
        if settings.bind_tcp.is_none() && settings.bind_socket.is_none() {
            return Err(ConfigError::invalid(
                "A route needs bind_address/bind_port or socket",
            ));
        }

        if let Some(secs) = self.connect_timeout {
            if secs == 0 {
                return Err(ConfigError::invalid("connect_timeout must be greater than 0"));
            }
            settings.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.client_connect_timeout {
            if secs == 0 {
                return Err(ConfigError::invalid(
                    "client_connect_timeout must be greater than 0",
                ));
            }
            settings.client_connect_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err(ConfigError::invalid("max_connections must be greater than 0"));
            }
            settings.max_connections = max;
        }
        if let Some(max) = self.max_connect_errors {
            if max == 0 {
                return Err(ConfigError::invalid(
                    "max_connect_errors must be greater than 0",
                ));
            }
            settings.max_connect_errors = max;
        }
        if let Some(len) = self.net_buffer_length {
            if len == 0 {
                return Err(ConfigError::invalid(
                    "net_buffer_length must be greater than 0",
                ));
            }
            settings.net_buffer_length = len;
        }
        Ok(settings)
    }

    fn bind_tcp(&self) -> Result<Option<RouteAddress>, ConfigError> {
        if self.bind_address.is_none() && self.bind_port.is_none() {
            return Ok(None);
        }
        let text = self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS);
        let parsed =
            RouteAddress::parse(text).map_err(|e| ConfigError::invalid(e.to_string()))?;
        let port = match (parsed.port, self.bind_port) {
            (0, Some(port)) => port,
            (0, None) => {
                return Err(ConfigError::invalid(
                    "option bind_port is required when bind_address has no port",
                ));
            }
            (port, None) => port,
            (port, Some(other)) if port == other => port,
            (port, Some(other)) => {
                return Err(ConfigError::invalid(format!(
                    "bind_address port {} and bind_port {} disagree",
                    port, other
                )));
            }
        };
        Ok(Some(RouteAddress::new(parsed.host, port)))
    }

    /// Parse-check the destination option without keeping the result.
    fn check_destinations(&self, name: &str) -> Result<(), ConfigError> {
        let settings = self.settings(name)?;
        if self.destinations.contains("://") {
            crate::core::destination::DestinationSet::from_uri(&self.destinations).map(|_| ())
        } else {
            crate::core::destination::DestinationSet::from_csv(
                &self.destinations,
                settings.protocol,
                settings.bind_tcp.as_ref(),
            )
            .map(|_| ())
        }
    }

    /// Build a ready-to-start route from this section.
    pub fn build(&self, name: &str, ops: Arc<dyn SocketOps>) -> Result<Route, ConfigError> {
        let settings = self.settings(name)?;
        let mut route = Route::new(settings, ops)?;
        if self.destinations.contains("://") {
            route.set_destinations_from_uri(&self.destinations)?;
        } else {
            route.set_destinations_from_csv(&self.destinations)?;
        }
        Ok(route)
    }
}
