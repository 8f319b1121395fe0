//! Engine and Tunnel Device Boundaries
//!
//! The packet-forwarding engine and the OS tunnel device are external
//! collaborators. Both are modelled as synchronous traits; the session
//! controller always calls them from a blocking thread.

use crate::config::TunnelParams;
use thiserror::Error;

/// Raw OS descriptor of the tunnel device
pub type TunnelFd = i32;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine rejected the configuration (handle {0})")]
    StartRejected(i64),

    #[error("Engine start failed: {0}")]
    StartFailed(String),

    #[error("Engine status query failed: {0}")]
    StatusQuery(String),

    #[error("Engine stop failed: {0}")]
    StopFailed(String),

    #[error("Engine instance {0} still running after stop")]
    StillRunning(i64),

    #[error("Engine config encoding failed: {0}")]
    Encode(String),
}

/// Packet-forwarding engine primitives
pub trait Engine: Send + Sync + 'static {
    /// Start an instance; a positive handle denotes success
    fn start(&self, config_json: &str, fd: TunnelFd) -> Result<i64, EngineError>;

    /// Ask an instance to stop; completion must be polled
    fn stop(&self, handle: i64) -> Result<(), EngineError>;

    /// Is the instance still running?
    fn is_running(&self, handle: i64) -> Result<bool, EngineError>;
}

/// Live engine instance
///
/// Only constructible from a positive handle and deliberately not
/// `Clone`: whoever holds it owns the instance.
#[derive(Debug, PartialEq, Eq)]
pub struct EngineInstance {
    handle: i64,
}

impl EngineInstance {
    /// Wrap an engine-issued handle
    pub fn from_handle(handle: i64) -> Option<Self> {
        (handle > 0).then_some(Self { handle })
    }

    pub fn handle(&self) -> i64 {
        self.handle
    }
}

/// Tunnel device errors
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("Tunnel device creation failed: {0}")]
    Establish(String),

    #[error("Tunnel device close failed: {0}")]
    Close(String),
}

/// Open OS tunnel device
pub trait TunnelDevice: Send + 'static {
    /// Raw descriptor handed to the engine
    fn fd(&self) -> TunnelFd;

    /// Release the descriptor
    fn close(self: Box<Self>) -> Result<(), DeviceError>;
}

/// Creates tunnel devices
pub trait TunnelBuilder: Send + Sync + 'static {
    fn establish(&self, params: &TunnelParams) -> Result<Box<dyn TunnelDevice>, DeviceError>;
}
