//! Proxy Host Resolver
//!
//! Resolves proxy server hostnames with:
//! - A process-lifetime cache (append-only, never invalidated)
//! - A hard per-lookup timeout
//! - Graceful fallback to the original hostname on failure
//!
//! Cached answers let the engine config pin literal IPs in its
//! routing rules without repeating DNS work on every node switch.

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// DNS resolution errors
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("Resolution of {0} timed out")]
    Timeout(String),

    #[error("No addresses found for domain")]
    NoAddresses,

    #[error("Resolver error: {0}")]
    ResolverError(String),
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Whether to use system DNS or a public resolver
    pub use_system_dns: bool,
    /// Timeout for a single hostname lookup
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            use_system_dns: true,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Hostname resolver with a process-lifetime cache
///
/// Cloning is cheap; clones share the cache.
#[derive(Clone)]
pub struct HostResolver {
    /// Underlying resolver
    resolver: TokioAsyncResolver,
    /// hostname -> first resolved address
    cache: Arc<RwLock<HashMap<String, IpAddr>>>,
    /// Configuration
    config: DnsConfig,
}

impl HostResolver {
    /// Create a new resolver
    pub async fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout;

        let resolver = if config.use_system_dns {
            match hickory_resolver::system_conf::read_system_conf() {
                Ok((system, mut system_opts)) => {
                    system_opts.timeout = config.timeout;
                    TokioAsyncResolver::tokio(system, system_opts)
                }
                Err(e) => {
                    warn!("System DNS config unavailable ({}), using Cloudflare", e);
                    TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts)
                }
            }
        } else {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts)
        };

        info!("Host resolver initialized (timeout: {:?})", config.timeout);

        Ok(Self {
            resolver,
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    /// Create with default configuration
    pub async fn with_defaults() -> Result<Self, DnsError> {
        Self::new(DnsConfig::default()).await
    }

    /// Resolve a hostname, falling back to the hostname itself
    ///
    /// Literal IPs are returned unchanged. Failures and timeouts are
    /// logged and never cached, so a later call retries the lookup.
    pub async fn resolve(&self, host: &str) -> String {
        match self.lookup(host).await {
            Ok(ip) => ip.to_string(),
            Err(e) => {
                warn!("Failed to resolve {}: {}, using hostname", host, e);
                host.to_string()
            }
        }
    }

    /// Resolve a hostname to a single address
    pub async fn lookup(&self, host: &str) -> Result<IpAddr, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let normalized = host.to_lowercase();
        if let Some(ip) = self.get_cached(&normalized) {
            debug!("DNS cache hit for: {}", host);
            return Ok(ip);
        }

        debug!("DNS lookup for: {}", host);
        let lookup = tokio::time::timeout(self.config.timeout, self.resolver.lookup_ip(normalized.as_str()))
            .await
            .map_err(|_| DnsError::Timeout(host.to_string()))?
            .map_err(|e| DnsError::ResolutionFailed(e.to_string()))?;

        let ip = lookup.iter().next().ok_or(DnsError::NoAddresses)?;

        // First answer wins; a concurrent lookup that finished earlier keeps its entry
        let ip = *self
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(normalized)
            .or_insert(ip);

        debug!("Resolved {} -> {}", host, ip);
        Ok(ip)
    }

    /// Cached address for a host without any network activity
    ///
    /// Literal IPs count as cached.
    pub fn cached(&self, host: &str) -> Option<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        self.get_cached(&host.to_lowercase())
    }

    /// Address to put on the wire for `host`: cached IP or the hostname
    pub fn address_for(&self, host: &str) -> String {
        self.cached(host)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| host.to_string())
    }

    /// Seed the cache with a known answer (e.g. restored from disk)
    pub fn preload(&self, host: &str, ip: IpAddr) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(host.to_lowercase())
            .or_insert(ip);
    }

    /// Resolve every distinct non-literal hostname concurrently
    ///
    /// Best effort: failures are logged and skipped. Returns
    /// `(attempted, resolved)` counts, excluding literals and hosts
    /// that were already cached.
    pub async fn pre_resolve_all<'a, I>(&self, hosts: I) -> (usize, usize)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();

        for host in hosts {
            if host.parse::<IpAddr>().is_ok() || self.cached(host).is_some() {
                continue;
            }
            if !seen.insert(host.to_lowercase()) {
                continue;
            }
            let resolver = self.clone();
            let host = host.to_string();
            tasks.spawn(async move { resolver.lookup(&host).await.map_err(|e| (host, e)) });
        }

        let attempted = seen.len();
        let mut resolved = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => resolved += 1,
                Ok(Err((host, e))) => warn!("Pre-resolve failed for {}: {}", host, e),
                Err(e) => warn!("Pre-resolve task failed: {}", e),
            }
        }

        info!("Pre-resolved {}/{} hostnames", resolved, attempted);
        (attempted, resolved)
    }

    /// Number of cached hostnames
    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn get_cached(&self, normalized: &str) -> Option<IpAddr> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(normalized)
            .copied()
    }
}
