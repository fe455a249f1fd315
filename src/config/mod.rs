//! Configuration management
//!
//! A config file describes one connection template. Layers are listed
//! innermost first, in the order they are pushed on the context:
//!
//! ```toml
//! [connection]
//! uri = "tcp://149.154.167.51:443"
//! dc = "2"
//!
//! [[connection.layers]]
//! kind = "transport"
//!
//! [[connection.layers]]
//! kind = "socks5"
//! extra = { address = "127.0.0.1", port = 1080 }
//! ```

use crate::context::ConnectionContext;
use crate::layer::LayerDescriptor;
use crate::transport::TransportConfig;
use crate::LayerKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection template
    pub connection: ConnectionConfig,
    /// Socket options
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Build the connection template described by this configuration
    pub fn build_context(&self) -> Result<ConnectionContext, crate::Error> {
        let mut ctx = self.connection.build_context()?;
        ctx.set_socket_config(self.transport.clone());
        Ok(ctx)
    }
}

/// Connection template configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Target URI
    pub uri: String,
    /// DC identifier (`2`, `2_media`, `2_cdn`)
    pub dc: String,
    /// Wrap the socket in TLS
    #[serde(default)]
    pub secure: bool,
    /// Use test servers
    #[serde(default)]
    pub test: bool,
    /// Prefer IPv6
    #[serde(default)]
    pub ipv6: bool,
    /// Layer stack, innermost first
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "tcp://149.154.167.51:443".to_string(),
            dc: "2".to_string(),
            secure: false,
            test: false,
            ipv6: false,
            layers: vec![
                LayerDescriptor::new(LayerKind::Transport, None),
                LayerDescriptor::new(LayerKind::Obfuscation, None),
            ],
        }
    }
}

impl ConnectionConfig {
    /// Build a context with this template's target, flags and layers
    pub fn build_context(&self) -> Result<ConnectionContext, crate::Error> {
        if self.layers.is_empty() {
            return Err(crate::Error::Config("no layers configured".to_string()));
        }
        if self.layers[0].kind != LayerKind::Transport {
            return Err(crate::Error::Config(
                "the innermost layer must be a transport".to_string(),
            ));
        }

        let mut ctx = ConnectionContext::new();
        ctx.set_uri_str(&self.uri)?;
        ctx.set_dc(&self.dc)?;
        ctx.set_secure(self.secure)
            .set_test(self.test)
            .set_ipv6(self.ipv6);
        for layer in &self.layers {
            ctx.add_layer(layer.kind, layer.extra.clone());
        }
        Ok(ctx)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
