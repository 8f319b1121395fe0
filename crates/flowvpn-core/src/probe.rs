//! Node Latency Probing
//!
//! Measures TCP connect time to each eligible node in bounded
//! batches and records the results in a shared `LatencyTable`.
//!
//! # Concurrency
//!
//! - At most `window` probes are in flight at once
//! - A short pause separates consecutive batches
//! - Each probe has its own connect timeout, so one dead node
//!   cannot stall a batch
//!
//! Probes never touch the table themselves: each returns a
//! `ProbeResult` and the coordinating task merges it, which keeps
//! progress reports strictly ordered.

use crate::node::{Latency, NodeFilter, ProxyNode};
use crate::subscription::SubscriptionConfig;
use flowvpn_network::HostResolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Probe tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Maximum probes in flight
    pub window: usize,
    /// Pause between batches (ms)
    pub batch_pause_ms: u64,
    /// Per-probe connect timeout (ms)
    pub connect_timeout_ms: u64,
}

impl ProbeConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            window: 10,
            batch_pause_ms: 100,
            connect_timeout_ms: 3000,
        }
    }
}

/// Opens a connection to measure reachability
pub trait Connector: Send + Sync + 'static {
    /// Connect to `host:port`; the connection is dropped immediately
    fn connect(&self, host: &str, port: u16) -> impl Future<Output = io::Result<()>> + Send;
}

/// Plain TCP connect
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<()> {
        TcpStream::connect((host, port)).await.map(drop)
    }
}

/// Progress of a probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeProgress {
    pub completed: usize,
    pub total: usize,
}

impl ProbeProgress {
    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub name: String,
    pub latency: Latency,
}

/// Summary of a probe run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub total: usize,
    pub reachable: usize,
    pub timed_out: usize,
}

/// Probe state of one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeProbe {
    pub latency: Latency,
    pub probing: bool,
}

/// Latest probe state per node name
///
/// Cloning is cheap; clones share the table. Readers always see a
/// whole `NodeProbe`, never a half-written one.
#[derive(Debug, Clone, Default)]
pub struct LatencyTable {
    entries: Arc<RwLock<HashMap<String, NodeProbe>>>,
}

impl LatencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe state of a node (default: unmeasured, idle)
    pub fn get(&self, name: &str) -> NodeProbe {
        self.read().get(name).copied().unwrap_or_default()
    }

    /// Latency of a node
    pub fn latency(&self, name: &str) -> Latency {
        self.get(name).latency
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> HashMap<String, NodeProbe> {
        self.read().clone()
    }

    /// Drop all results (e.g. after the subscription changed)
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Nodes of `config` in display order (fastest first)
    pub fn sorted<'a>(&self, config: &'a SubscriptionConfig) -> Vec<&'a ProxyNode> {
        let entries = self.read();
        let latency = |n: &ProxyNode| entries.get(&n.name).map(|p| p.latency).unwrap_or_default();
        let mut nodes: Vec<&ProxyNode> = config.nodes().iter().collect();
        nodes.sort_by(|a, b| latency(*a).display_cmp(&latency(*b)));
        nodes
    }

    /// Eligible node with the lowest measured latency
    pub fn fastest<'a>(&self, config: &'a SubscriptionConfig, filter: &NodeFilter) -> Option<&'a ProxyNode> {
        let entries = self.read();
        config
            .eligible(filter)
            .filter_map(|n| {
                let ms = entries.get(&n.name)?.latency.millis()?;
                Some((ms, n))
            })
            .min_by_key(|(ms, _)| *ms)
            .map(|(_, n)| n)
    }

    fn mark_probing(&self, names: &[&ProxyNode]) {
        let mut entries = self.write();
        for node in names {
            entries.entry(node.name.clone()).or_default().probing = true;
        }
    }

    fn record(&self, result: &ProbeResult) {
        self.write().insert(
            result.name.clone(),
            NodeProbe {
                latency: result.latency,
                probing: false,
            },
        );
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, NodeProbe>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, NodeProbe>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded-concurrency latency prober
pub struct LatencyProber<C: Connector = TcpConnector> {
    resolver: HostResolver,
    connector: Arc<C>,
    config: ProbeConfig,
    table: LatencyTable,
}

impl LatencyProber<TcpConnector> {
    /// Create a prober that uses plain TCP connects
    pub fn new(resolver: HostResolver, config: ProbeConfig) -> Self {
        Self::with_connector(resolver, TcpConnector, config)
    }
}

impl<C: Connector> LatencyProber<C> {
    /// Create a prober with a custom connector
    pub fn with_connector(resolver: HostResolver, connector: C, config: ProbeConfig) -> Self {
        Self {
            resolver,
            connector: Arc::new(connector),
            config,
            table: LatencyTable::new(),
        }
    }

    /// Shared results table
    pub fn table(&self) -> &LatencyTable {
        &self.table
    }

    /// Probe every eligible node
    pub async fn test_all(
        &self,
        config: &SubscriptionConfig,
        filter: &NodeFilter,
        progress: Option<&mpsc::UnboundedSender<ProbeProgress>>,
    ) -> ProbeSummary {
        let nodes: Vec<&ProxyNode> = config.eligible(filter).collect();
        self.run(&nodes, progress).await
    }

    /// Probe only eligible nodes that are unmeasured, timed out or slow
    pub async fn retest_failed(
        &self,
        config: &SubscriptionConfig,
        filter: &NodeFilter,
        progress: Option<&mpsc::UnboundedSender<ProbeProgress>>,
    ) -> ProbeSummary {
        let nodes: Vec<&ProxyNode> = config
            .eligible(filter)
            .filter(|n| self.table.latency(&n.name).needs_retest())
            .collect();
        self.run(&nodes, progress).await
    }

    /// Probe a single node
    pub async fn probe_one(&self, node: &ProxyNode) -> Latency {
        self.table.mark_probing(&[node]);
        let result = measure(
            self.resolver.clone(),
            self.connector.clone(),
            node.name.clone(),
            node.server.clone(),
            node.port,
            self.config.connect_timeout(),
        )
        .await;
        self.table.record(&result);
        result.latency
    }

    async fn run(
        &self,
        nodes: &[&ProxyNode],
        progress: Option<&mpsc::UnboundedSender<ProbeProgress>>,
    ) -> ProbeSummary {
        let total = nodes.len();
        let mut summary = ProbeSummary {
            total,
            ..Default::default()
        };
        if total == 0 {
            return summary;
        }

        info!("Probing {} nodes (window {})", total, self.config.window);
        let started = Instant::now();
        let window = self.config.window.max(1);
        let mut completed = 0;

        for (index, batch) in nodes.chunks(window).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_pause()).await;
            }

            self.table.mark_probing(batch);
            let mut tasks = JoinSet::new();
            for node in batch {
                tasks.spawn(measure(
                    self.resolver.clone(),
                    self.connector.clone(),
                    node.name.clone(),
                    node.server.clone(),
                    node.port,
                    self.config.connect_timeout(),
                ));
            }

            while let Some(joined) = tasks.join_next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(e) => {
                        // Cannot tell which node panicked; its entry stays "probing"
                        // until the batch cleanup below.
                        warn!("Probe task failed: {}", e);
                        completed += 1;
                        report(progress, completed, total);
                        continue;
                    }
                };

                match result.latency {
                    Latency::Measured(_) => summary.reachable += 1,
                    _ => summary.timed_out += 1,
                }
                self.table.record(&result);
                completed += 1;
                report(progress, completed, total);
            }

            // Anything still flagged belongs to a failed task
            for node in batch {
                let mut probe = self.table.get(&node.name);
                if probe.probing {
                    probe.probing = false;
                    probe.latency = Latency::Timeout;
                    summary.timed_out += 1;
                    self.table.record(&ProbeResult {
                        name: node.name.clone(),
                        latency: probe.latency,
                    });
                }
            }
        }

        info!(
            "Probe run finished in {:?}: {} reachable, {} timed out",
            started.elapsed(),
            summary.reachable,
            summary.timed_out
        );
        summary
    }
}

fn report(progress: Option<&mpsc::UnboundedSender<ProbeProgress>>, completed: usize, total: usize) {
    if let Some(tx) = progress {
        // Receiver gone means nobody is watching; keep probing
        let _ = tx.send(ProbeProgress { completed, total });
    }
}

/// Resolve and time one TCP connect
async fn measure<C: Connector>(
    resolver: HostResolver,
    connector: Arc<C>,
    name: String,
    server: String,
    port: u16,
    timeout: Duration,
) -> ProbeResult {
    let address = resolver.resolve(&server).await;

    let start = Instant::now();
    let latency = match tokio::time::timeout(timeout, connector.connect(&address, port)).await {
        Ok(Ok(())) => Latency::from_millis(start.elapsed().as_millis()),
        Ok(Err(e)) => {
            debug!("Probe of {} ({}:{}) failed: {}", name, address, port, e);
            Latency::Timeout
        }
        Err(_) => {
            debug!("Probe of {} ({}:{}) timed out", name, address, port);
            Latency::Timeout
        }
    };

    debug!("Node {} latency: {}", name, latency);
    ProbeResult { name, latency }
}
