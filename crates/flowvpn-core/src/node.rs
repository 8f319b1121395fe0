//! Proxy Node Model
//!
//! One `ProxyNode` per entry of a subscription document, plus the
//! eligibility predicate and the latency vocabulary shared by the
//! prober and the presentation layer.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Proxy protocol of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum NodeKind {
    /// `ss` - the only protocol the session can drive
    Shadowsocks,
    /// `ssr` - listed for display only
    ShadowsocksR,
    /// Anything else the subscription carries
    Other(String),
}

impl NodeKind {
    /// Map a subscription `type` value
    pub fn from_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => NodeKind::Shadowsocks,
            "ssr" | "shadowsocksr" => NodeKind::ShadowsocksR,
            _ => NodeKind::Other(value.to_string()),
        }
    }

    /// Subscription `type` value
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Shadowsocks => "ss",
            NodeKind::ShadowsocksR => "ssr",
            NodeKind::Other(other) => other,
        }
    }

    /// Can a session be established through this kind of node?
    pub fn is_supported(&self) -> bool {
        matches!(self, NodeKind::Shadowsocks)
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single candidate proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyNode {
    /// Display name, unique within a subscription
    pub name: String,
    /// Protocol
    pub kind: NodeKind,
    /// Hostname or literal IP
    pub server: String,
    /// Server port
    pub port: u16,
    /// Cipher method
    pub cipher: Option<String>,
    /// Secret
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// SSR protocol name
    pub protocol: Option<String>,
    /// SSR protocol parameter
    pub protocol_param: Option<String>,
    /// SSR obfuscation name
    pub obfs: Option<String>,
    /// SSR obfuscation parameter
    pub obfs_param: Option<String>,
    /// UDP relay enabled
    pub udp: bool,
}

impl ProxyNode {
    /// Create a shadowsocks node
    pub fn shadowsocks(name: &str, server: &str, port: u16, cipher: &str, password: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: NodeKind::Shadowsocks,
            server: server.to_string(),
            port,
            cipher: Some(cipher.to_string()),
            password: Some(password.to_string()),
            protocol: None,
            protocol_param: None,
            obfs: None,
            obfs_param: None,
            udp: true,
        }
    }

    /// Is the server a literal IP address?
    pub fn has_literal_address(&self) -> bool {
        self.server.parse::<std::net::IpAddr>().is_ok()
    }
}

/// Default name fragments of promotional entries
///
/// Providers disguise traffic quotas, expiry dates and website
/// adverts as node names; none of them are connectable.
const DEFAULT_DENYLIST: &[&str] = &[
    "剩余流量",
    "距离",
    "套餐",
    "官网",
    "❤️",
    "特殊时期",
    "速度节点",
    "节点红了",
    "更新",
    "订阅",
    "到期",
    "流量",
];

fn default_denylist() -> Vec<String> {
    DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect()
}

/// Name-based exclusion of decorative entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Case-insensitive name fragments that mark a node as decorative
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

impl NodeFilter {
    /// Create a filter with a custom denylist
    pub fn new(denylist: Vec<String>) -> Self {
        Self { denylist }
    }

    /// Does the name look like promotional text?
    pub fn is_decorative(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.denylist
            .iter()
            .any(|fragment| name.contains(&fragment.to_lowercase()))
    }

    /// Supported protocol and not decorative
    pub fn is_eligible(&self, node: &ProxyNode) -> bool {
        node.kind.is_supported() && !self.is_decorative(&node.name)
    }
}

impl Default for NodeFilter {
    fn default() -> Self {
        Self {
            denylist: default_denylist(),
        }
    }
}

/// Latency above which a node counts as degraded
pub const SLOW_LATENCY_MS: u32 = 300;

/// Result of the most recent probe of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Latency {
    /// Never probed
    #[default]
    Unmeasured,
    /// Probe timed out or the connection failed
    Timeout,
    /// Connect time in milliseconds (always > 0)
    Measured(u32),
}

impl Latency {
    /// Build from a measured connect time, clamping to at least 1ms
    pub fn from_millis(ms: u128) -> Self {
        Latency::Measured(ms.clamp(1, u32::MAX as u128) as u32)
    }

    /// Decode the `-1 / 0 / >0` wire representation
    pub fn from_raw(raw: i64) -> Self {
        match raw {
            r if r < 0 => Latency::Unmeasured,
            0 => Latency::Timeout,
            r => Latency::Measured(r.min(u32::MAX as i64) as u32),
        }
    }

    /// Encode as `-1` (unmeasured), `0` (timeout) or milliseconds
    pub fn to_raw(self) -> i64 {
        match self {
            Latency::Unmeasured => -1,
            Latency::Timeout => 0,
            Latency::Measured(ms) => ms as i64,
        }
    }

    /// Measured milliseconds, if any
    pub fn millis(self) -> Option<u32> {
        match self {
            Latency::Measured(ms) => Some(ms),
            _ => None,
        }
    }

    /// Should this node be probed again?
    pub fn needs_retest(self) -> bool {
        match self {
            Latency::Unmeasured | Latency::Timeout => true,
            Latency::Measured(ms) => ms > SLOW_LATENCY_MS,
        }
    }

    /// Quality bucket for display
    pub fn grade(self) -> LatencyGrade {
        match self {
            Latency::Unmeasured => LatencyGrade::Unknown,
            Latency::Timeout => LatencyGrade::Bad,
            Latency::Measured(ms) if ms <= 100 => LatencyGrade::Good,
            Latency::Measured(ms) if ms <= 200 => LatencyGrade::Fair,
            Latency::Measured(ms) if ms <= SLOW_LATENCY_MS => LatencyGrade::Poor,
            Latency::Measured(_) => LatencyGrade::Bad,
        }
    }

    /// Short label: `untested`, `timeout` or `42ms`
    pub fn label(self) -> String {
        match self {
            Latency::Unmeasured => "untested".to_string(),
            Latency::Timeout => "timeout".to_string(),
            Latency::Measured(ms) => format!("{}ms", ms),
        }
    }

    /// Display order: measured ascending, then timeouts, then unmeasured
    pub fn display_cmp(&self, other: &Latency) -> Ordering {
        fn rank(l: &Latency) -> (u8, u32) {
            match l {
                Latency::Measured(ms) => (0, *ms),
                Latency::Timeout => (1, 0),
                Latency::Unmeasured => (2, 0),
            }
        }
        rank(self).cmp(&rank(other))
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Signal-strength style latency bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyGrade {
    Good,
    Fair,
    Poor,
    Bad,
    Unknown,
}
