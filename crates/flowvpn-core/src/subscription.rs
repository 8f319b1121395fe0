//! Subscription Store
//!
//! Downloads a Clash-style subscription document, parses it into a
//! `SubscriptionConfig` and keeps exactly one cached copy.
//!
//! # Caching
//!
//! - Single entry keyed by URL, no TTL
//! - `fetch` serves the cache when the URL matches
//! - `refresh` always hits the network but is single-flight
//! - A successful download replaces the whole node list; failures
//!   leave the previous entry untouched

use crate::node::{NodeFilter, NodeKind, ProxyNode};
use flowvpn_network::{HttpClient, HttpClientConfig, HttpError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Subscription errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] HttpError),

    #[error("Subscription server answered {0}")]
    Status(u16),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Named group of nodes from the subscription (routing hint)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub proxies: Vec<String>,
}

/// One parsed subscription document
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubscriptionConfig {
    /// Every node in document order, decorative entries included
    nodes: Vec<ProxyNode>,
    /// Proxy groups as listed
    proxy_groups: Vec<ProxyGroup>,
    /// Raw rule lines
    rules: Vec<String>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    proxies: Option<Vec<RawProxy>>,
    #[serde(default, rename = "proxy-groups")]
    proxy_groups: Option<Vec<ProxyGroup>>,
    #[serde(default)]
    rules: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct RawProxy {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    server: String,
    port: u16,
    #[serde(default, deserialize_with = "lenient_string")]
    cipher: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    password: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    protocol: Option<String>,
    #[serde(default, rename = "protocol-param", deserialize_with = "lenient_string")]
    protocol_param: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    obfs: Option<String>,
    #[serde(default, rename = "obfs-param", deserialize_with = "lenient_string")]
    obfs_param: Option<String>,
    #[serde(default)]
    udp: Option<bool>,
}

/// Accept scalars of any type for optional text fields
///
/// Numeric passwords are common; non-scalars are treated as absent.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

impl From<RawProxy> for ProxyNode {
    fn from(raw: RawProxy) -> Self {
        Self {
            name: raw.name,
            kind: NodeKind::from_type(&raw.kind),
            server: raw.server,
            port: raw.port,
            cipher: raw.cipher,
            password: raw.password,
            protocol: raw.protocol,
            protocol_param: raw.protocol_param,
            obfs: raw.obfs,
            obfs_param: raw.obfs_param,
            udp: raw.udp.unwrap_or(true),
        }
    }
}

impl SubscriptionConfig {
    /// Parse a subscription document
    ///
    /// Every entry must carry `name`, `type`, `server` and `port`.
    /// Later entries reusing an earlier name are dropped.
    pub fn from_yaml(content: &str) -> Result<Self, StoreError> {
        let doc: RawDocument =
            serde_yaml::from_str(content).map_err(|e| StoreError::Parse(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for raw in doc.proxies.unwrap_or_default() {
            if !seen.insert(raw.name.clone()) {
                warn!("Dropping duplicate node name: {}", raw.name);
                continue;
            }
            nodes.push(ProxyNode::from(raw));
        }

        debug!("Parsed subscription with {} nodes", nodes.len());

        Ok(Self {
            nodes,
            proxy_groups: doc.proxy_groups.unwrap_or_default(),
            rules: doc.rules.unwrap_or_default(),
        })
    }

    /// Build directly from nodes (names are deduplicated the same way)
    pub fn from_nodes(nodes: Vec<ProxyNode>) -> Self {
        let mut seen = HashSet::new();
        let nodes = nodes
            .into_iter()
            .filter(|n| seen.insert(n.name.clone()))
            .collect();
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// All nodes, decorative entries included
    pub fn nodes(&self) -> &[ProxyNode] {
        &self.nodes
    }

    /// Proxy groups
    pub fn proxy_groups(&self) -> &[ProxyGroup] {
        &self.proxy_groups
    }

    /// Rule lines
    pub fn rules(&self) -> &[String] {
        &self.rules
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// No nodes at all?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find a node by name
    pub fn find(&self, name: &str) -> Option<&ProxyNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes a session may use, in document order
    pub fn eligible<'a>(&'a self, filter: &NodeFilter) -> impl Iterator<Item = &'a ProxyNode> {
        self.nodes.iter().filter(move |n| filter.is_eligible(n))
    }

    /// Server hostnames of all nodes (may repeat)
    pub fn server_hosts(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.server.as_str())
    }
}

/// The cached subscription
#[derive(Debug, Clone)]
pub struct CachedSubscription {
    /// URL the document was fetched from
    pub url: String,
    /// Parsed document
    pub config: Arc<SubscriptionConfig>,
    /// When the download completed
    pub fetched_at: Instant,
}

/// Result of a background refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Cache replaced; carries the new node count
    Updated(usize),
    /// Another refresh was already running
    Skipped,
    /// Download or parse failed; cache unchanged
    Failed,
}

/// Subscription download + single-entry cache
pub struct ConfigStore {
    /// Transport
    client: HttpClient,
    /// Current entry
    cache: RwLock<Option<CachedSubscription>>,
    /// Is a refresh in flight?
    refreshing: AtomicBool,
}

/// Clears the in-flight flag when the refresh ends, however it ends
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConfigStore {
    /// Create a store around an HTTP client
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            cache: RwLock::new(None),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Create with default transport settings
    pub fn with_defaults() -> Self {
        Self::new(HttpClient::new(HttpClientConfig::default()))
    }

    /// Fetch a subscription, serving the cache when the URL matches
    pub async fn fetch(&self, url: &str) -> Result<Arc<SubscriptionConfig>, StoreError> {
        if let Some(entry) = self.cached_entry() {
            if entry.url == url {
                debug!("Using cached subscription for {}", url);
                return Ok(entry.config);
            }
        }

        info!("Fetching subscription: {}", url);
        self.download(url).await
    }

    /// Re-download unconditionally; a no-op if a refresh is running
    pub async fn refresh(&self, url: &str) -> RefreshOutcome {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Subscription refresh already running, skipping");
            return RefreshOutcome::Skipped;
        }
        let _guard = RefreshGuard(&self.refreshing);

        info!("Refreshing subscription: {}", url);
        match self.download(url).await {
            Ok(config) => RefreshOutcome::Updated(config.len()),
            Err(e) => {
                warn!("Subscription refresh failed: {}", e);
                RefreshOutcome::Failed
            }
        }
    }

    /// Snapshot of the cached document, whatever its URL
    pub fn cached(&self) -> Option<Arc<SubscriptionConfig>> {
        self.cached_entry().map(|e| e.config)
    }

    /// Snapshot of the full cache entry
    pub fn cached_entry(&self) -> Option<CachedSubscription> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Is a refresh currently in flight?
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Download, parse and, on success, replace the cache entry
    async fn download(&self, url: &str) -> Result<Arc<SubscriptionConfig>, StoreError> {
        let response = self.client.get(url).await?;
        if !response.is_success() {
            warn!("Subscription fetch failed with status {}", response.status);
            return Err(StoreError::Status(response.status.as_u16()));
        }

        let body = response
            .into_text()
            .map_err(|e| StoreError::Parse(format!("body is not UTF-8: {}", e)))?;
        debug!("Subscription body: {} bytes", body.len());

        let config = Arc::new(SubscriptionConfig::from_yaml(&body)?);

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(CachedSubscription {
            url: url.to_string(),
            config: config.clone(),
            fetched_at: Instant::now(),
        });

        info!("Subscription cached ({} nodes)", config.len());
        Ok(config)
    }
}
