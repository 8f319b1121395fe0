//! Running Indicator
//!
//! The externally visible "VPN is running" signal (status-bar
//! notification, tray icon). The session raises it once an engine
//! instance is live and drops it first thing on teardown, before any
//! resource is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Shared running indicator
///
/// Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct RunningIndicator {
    /// Is the indicator shown?
    shown: Arc<AtomicBool>,
    /// Text shown next to it (active node)
    label: Arc<RwLock<Option<String>>>,
}

impl RunningIndicator {
    /// Create a hidden indicator
    pub fn new() -> Self {
        Self::default()
    }

    /// Show the indicator for `label`
    pub fn show(&self, label: &str) {
        debug!("Running indicator: {}", label);
        *self.label.write().unwrap_or_else(|e| e.into_inner()) = Some(label.to_string());
        self.shown.store(true, Ordering::SeqCst);
    }

    /// Hide the indicator
    pub fn clear(&self) {
        if self.shown.swap(false, Ordering::SeqCst) {
            debug!("Running indicator cleared");
        }
        *self.label.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Is the indicator shown?
    pub fn is_shown(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }

    /// Current label
    pub fn label(&self) -> Option<String> {
        self.label.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
