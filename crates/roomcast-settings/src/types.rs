//! Server settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Network, transport, and dispatch settings for one server instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Host name or address to bind.
    pub hostname: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Serve over TLS. Requires `cert_file` and `key_file`.
    pub secure: bool,
    /// PEM certificate chain used when `secure` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// PEM private key used when `secure` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// HTTP path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Upgrades beyond this many live connections get `503`.
    pub max_connections: usize,
    /// Largest accepted inbound message, in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length. Frames beyond it are dropped.
    pub send_queue_capacity: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before the connection is closed.
    pub heartbeat_timeout_secs: u64,
    /// Emit the application event even when a middleware halted the chain.
    pub dispatch_on_halt: bool,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 8000,
            secure: false,
            cert_file: None,
            key_file: None,
            ws_path: "/".to_string(),
            max_connections: 1024,
            max_message_size: 16 * 1024 * 1024,
            send_queue_capacity: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            dispatch_on_halt: true,
            log_level: "info".to_string(),
        }
    }
}

impl ServerSettings {
    /// `hostname:port` as passed to the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Check the settings before the server binds.
    pub fn validate(&self) -> Result<()> {
        if self.secure {
            if self.cert_file.is_none() {
                return Err(SettingsError::MissingTlsMaterial("certFile"));
            }
            if self.key_file.is_none() {
                return Err(SettingsError::MissingTlsMaterial("keyFile"));
            }
        }
        if !self.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "wsPath must start with '/', got {:?}",
                self.ws_path
            )));
        }
        if self.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sendQueueCapacity must be greater than 0".into(),
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeatIntervalSecs must be greater than 0".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "heartbeatTimeoutSecs must not be shorter than heartbeatIntervalSecs".into(),
            ));
        }
        Ok(())
    }
}
