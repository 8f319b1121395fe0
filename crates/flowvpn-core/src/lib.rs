//! FlowVPN Core - Subscription-Driven Tunnel Sessions
//!
//! Manages the lifecycle of a VPN session backed by a remotely hosted
//! subscription: fetch the node list, probe the nodes, translate the
//! chosen one into an engine config and drive the external engine.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     SessionController                      │
//! │                                                            │
//! │  ┌───────────────┐   ┌──────────────────┐   ┌───────────┐  │
//! │  │  ConfigStore  │──▶│ ConfigTranslator │──▶│  Engine   │  │
//! │  │   (cache)     │   │  (JSON config)   │   │ (handle)  │  │
//! │  └───────┬───────┘   └────────┬─────────┘   └─────┬─────┘  │
//! │          ▼                    ▼                   │ fd     │
//! │  ┌───────────────┐   ┌──────────────────┐   ┌─────▼─────┐  │
//! │  │ LatencyProber │──▶│   HostResolver   │   │  Tunnel   │  │
//! │  └───────────────┘   └──────────────────┘   │  Device   │  │
//! │                                             └───────────┘  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single-flight refresh**: concurrent refreshes collapse into one download
//! - **Bounded probing**: at most `window` latency probes in flight
//! - **Strict teardown ordering**: indicator, device, grace, engine
//! - **Hot node switch**: one engine instance at a time, same descriptor

mod config;
mod engine;
mod indicator;
mod manager;
mod node;
mod probe;
mod subscription;
mod translate;

pub use config::{ConfigFormat, LocalSettings, SessionConfig, SessionTimings, SettingsError, StaticProfile, TunnelParams};
pub use engine::{DeviceError, Engine, EngineError, EngineInstance, TunnelBuilder, TunnelDevice, TunnelFd};
pub use indicator::RunningIndicator;
pub use manager::{ConnectedVia, SessionController, SessionError, SessionState};
pub use node::{Latency, LatencyGrade, NodeFilter, NodeKind, ProxyNode, SLOW_LATENCY_MS};
pub use probe::{
    Connector, LatencyProber, LatencyTable, NodeProbe, ProbeConfig, ProbeProgress, ProbeResult, ProbeSummary,
    TcpConnector,
};
pub use subscription::{CachedSubscription, ConfigStore, ProxyGroup, RefreshOutcome, StoreError, SubscriptionConfig};
pub use translate::{
    ConfigTranslator, EngineConfig, Inbound, LogConfig, Outbound, Router, RouterRule, TranslateError, Translation,
    DEFAULT_CIPHER, DIRECT_TAG, PROXY_TAG,
};
