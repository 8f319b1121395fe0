//! Engine Config Translation
//!
//! Turns a subscription (or the static profile) into the JSON document
//! the engine consumes:
//!
//! - One `tun` inbound bound to the tunnel descriptor
//! - Exactly two outbounds: the selected proxy and direct egress
//! - One rule sending the proxy server's own address direct
//!
//! Translation never performs DNS; it only reads what the resolver
//! already has cached.

use crate::config::StaticProfile;
use crate::engine::TunnelFd;
use crate::node::{NodeFilter, ProxyNode};
use crate::subscription::SubscriptionConfig;
use flowvpn_network::HostResolver;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

/// Tag of the proxy outbound
pub const PROXY_TAG: &str = "ss-out";
/// Tag of the direct outbound
pub const DIRECT_TAG: &str = "direct-out";
/// Cipher used when a node does not name one
pub const DEFAULT_CIPHER: &str = "aes-128-gcm";

/// Translation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("Subscription contains no nodes")]
    NoNodes,
}

/// Engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub router: Router,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
    pub tag: String,
    pub settings: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub rules: Vec<RouterRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRule {
    pub ip: Vec<String>,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub output: String,
}

impl EngineConfig {
    /// Serialize for the engine start primitive
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Pretty form for display
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The proxy outbound
    pub fn proxy_outbound(&self) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == PROXY_TAG)
    }
}

/// Result of a translation
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub config: EngineConfig,
    /// Name of the node the proxy outbound points at
    pub node_name: String,
}

/// Builds engine configs
#[derive(Debug, Clone)]
pub struct ConfigTranslator {
    filter: NodeFilter,
    mtu: u16,
}

impl ConfigTranslator {
    pub fn new(filter: NodeFilter, mtu: u16) -> Self {
        Self { filter, mtu }
    }

    pub fn filter(&self) -> &NodeFilter {
        &self.filter
    }

    /// Pick the node a session should use
    ///
    /// An explicit name matches any listed node the engine can drive,
    /// decorative or not. Without a match the first eligible node wins,
    /// then the first node of any kind.
    pub fn select<'a>(&self, config: &'a SubscriptionConfig, selected: Option<&str>) -> Option<&'a ProxyNode> {
        selected
            .filter(|name| !name.is_empty())
            .and_then(|name| config.find(name))
            .filter(|node| node.kind.is_supported())
            .or_else(|| config.eligible(&self.filter).next())
            .or_else(|| config.nodes().first())
    }

    /// Build the engine config for a subscription node
    pub fn translate(
        &self,
        config: &SubscriptionConfig,
        fd: TunnelFd,
        selected: Option<&str>,
        resolver: &HostResolver,
    ) -> Result<Translation, TranslateError> {
        let node = self.select(config, selected).ok_or(TranslateError::NoNodes)?;
        let address = resolver.address_for(&node.server);
        debug!("Selected node {} ({} -> {})", node.name, node.server, address);

        let mut settings = Map::new();
        settings.insert("address".into(), json!(address));
        settings.insert("port".into(), json!(node.port));
        settings.insert("method".into(), json!(node.cipher.as_deref().unwrap_or(DEFAULT_CIPHER)));
        settings.insert("password".into(), json!(node.password.as_deref().unwrap_or("")));

        Ok(Translation {
            config: self.assemble(fd, address, settings),
            node_name: node.name.clone(),
        })
    }

    /// Build the engine config for the static profile
    pub fn translate_static(&self, profile: &StaticProfile, fd: TunnelFd, resolver: &HostResolver) -> EngineConfig {
        let address = resolver.address_for(&profile.server);
        debug!("Static profile {} ({} -> {})", profile.name, profile.server, address);

        let mut settings = Map::new();
        settings.insert("address".into(), json!(address));
        settings.insert("port".into(), json!(profile.port));
        settings.insert("method".into(), json!(profile.method.as_deref().unwrap_or(DEFAULT_CIPHER)));
        settings.insert("password".into(), json!(profile.password.as_deref().unwrap_or("")));
        if let Some(prefix) = &profile.prefix {
            settings.insert("prefix".into(), json!(prefix));
        }

        self.assemble(fd, address, settings)
    }

    fn assemble(&self, fd: TunnelFd, proxy_address: String, proxy_settings: Map<String, Value>) -> EngineConfig {
        let mut tun = Map::new();
        tun.insert("fd".into(), json!(fd));
        tun.insert("auto".into(), json!(false));
        tun.insert("mtu".into(), json!(self.mtu));

        EngineConfig {
            inbounds: vec![Inbound {
                protocol: "tun".into(),
                address: Some("127.0.0.1".into()),
                port: Some(0),
                settings: tun,
            }],
            outbounds: vec![
                Outbound {
                    protocol: "shadowsocks".into(),
                    tag: PROXY_TAG.into(),
                    settings: proxy_settings,
                },
                Outbound {
                    protocol: "direct".into(),
                    tag: DIRECT_TAG.into(),
                    settings: Map::new(),
                },
            ],
            router: Router {
                rules: vec![RouterRule {
                    ip: vec![proxy_address],
                    target: DIRECT_TAG.into(),
                }],
            },
            log: LogConfig {
                level: "debug".into(),
                output: "console".into(),
            },
        }
    }
}

impl Default for ConfigTranslator {
    fn default() -> Self {
        Self::new(NodeFilter::default(), 1500)
    }
}
