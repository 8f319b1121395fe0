//! Session Configuration
//!
//! Fixed virtual-network parameters, lifecycle timings, probe tuning
//! and the optional static fallback profile. Loaded from TOML or JSON
//! (chosen by file extension) and serializable back out to produce a
//! sample file.

use crate::node::NodeFilter;
use crate::probe::ProbeConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Parameters handed to the OS when creating the tunnel device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelParams {
    /// Session name shown by the OS
    pub session_name: String,
    /// Virtual address of this device
    pub address: IpAddr,
    /// Prefix length of the virtual subnet
    pub prefix_len: u8,
    /// Captured route (default route)
    pub route: IpAddr,
    /// Prefix length of the captured route
    pub route_prefix: u8,
    /// DNS forwarders inside the tunnel
    pub dns: Vec<IpAddr>,
    /// Device MTU
    pub mtu: u16,
    /// Blocking descriptor mode
    pub blocking: bool,
    /// Application excluded from capture (the controlling process)
    pub disallowed_application: String,
}

impl Default for TunnelParams {
    fn default() -> Self {
        Self {
            session_name: "FlowVPN".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            prefix_len: 24,
            route: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            route_prefix: 0,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            mtu: 1500,
            blocking: false,
            disallowed_application: "flowvpn".to_string(),
        }
    }
}

/// Lifecycle timings of the session controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimings {
    /// Settle time between closing the device and stopping the engine (ms)
    pub teardown_grace_ms: u64,
    /// Backoff between engine status polls during a switch (ms)
    pub stop_poll_interval_ms: u64,
    /// Status polls before giving up on the old instance
    pub stop_poll_attempts: u32,
}

impl SessionTimings {
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            teardown_grace_ms: 500,
            stop_poll_interval_ms: 200,
            stop_poll_attempts: 5,
        }
    }
}

/// Statically configured shadowsocks endpoint
///
/// Used when no subscription is configured or the subscription
/// cannot be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticProfile {
    /// Display name reported as the active node
    #[serde(default = "default_static_name")]
    pub name: String,
    pub server: String,
    pub port: u16,
    /// Cipher method (engine default when absent)
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Payload prefix understood by the engine's shadowsocks outbound
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_static_name() -> String {
    "static".to_string()
}

impl StaticProfile {
    /// Create a profile for `server:port`
    pub fn new(server: &str, port: u16) -> Self {
        Self {
            name: default_static_name(),
            server: server.to_string(),
            port,
            method: None,
            password: None,
            prefix: None,
        }
    }
}

/// Persisted user choices, read-only from the session's perspective
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Subscription document URL
    pub subscription_url: Option<String>,
    /// Prefer the subscription over the static profile
    pub use_subscription: bool,
    /// Last node picked by the user
    pub selected_node: Option<String>,
}

impl LocalSettings {
    /// Subscription URL to use, if the subscription is enabled and set
    pub fn active_subscription(&self) -> Option<&str> {
        if !self.use_subscription {
            return None;
        }
        self.subscription_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Complete session configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tunnel: TunnelParams,
    pub timings: SessionTimings,
    pub probe: ProbeConfig,
    pub filter: NodeFilter,
    pub settings: LocalSettings,
    pub static_profile: Option<StaticProfile>,
}

impl SessionConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;

        let config = match format {
            ConfigFormat::Toml => Self::from_toml(&content)?,
            ConfigFormat::Json => Self::from_json(&content)?,
        };

        info!("Loaded session config from {}", path.display());
        Ok(config)
    }

    /// Parse TOML
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let config: Self = toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        let config: Self = serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, SettingsError> {
        serde_json::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Render in the format implied by `path`
    pub fn render_for(&self, path: &Path) -> Result<String, SettingsError> {
        match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => self.to_toml(),
            ConfigFormat::Json => self.to_json(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SettingsError> {
        let tunnel = &self.tunnel;
        let max_prefix = |ip: &IpAddr| if ip.is_ipv4() { 32 } else { 128 };

        if tunnel.prefix_len > max_prefix(&tunnel.address) || tunnel.route_prefix > max_prefix(&tunnel.route) {
            return Err(SettingsError::Invalid("prefix length out of range".into()));
        }
        if tunnel.mtu < 576 {
            return Err(SettingsError::Invalid(format!("MTU {} too small", tunnel.mtu)));
        }
        if tunnel.dns.is_empty() {
            return Err(SettingsError::Invalid("at least one DNS forwarder required".into()));
        }
        if self.probe.window == 0 {
            return Err(SettingsError::Invalid("probe window must be positive".into()));
        }
        if self.timings.stop_poll_attempts == 0 {
            return Err(SettingsError::Invalid("stop poll attempts must be positive".into()));
        }
        if let Some(profile) = &self.static_profile {
            if profile.server.trim().is_empty() || profile.port == 0 {
                return Err(SettingsError::Invalid("static profile needs server and port".into()));
            }
        }
        Ok(())
    }
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(SettingsError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
