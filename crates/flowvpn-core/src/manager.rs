//! Tunnel Session Controller
//!
//! Owns the running engine instance and the tunnel device, and drives
//! them through the session lifecycle:
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──▶ Connected ──disconnect──▶ Disconnecting ──▶ Idle
//!    ▲                    │            │    ▲
//!    │                    ▼            ▼    │
//!    └──disconnect───── Failed ◀── SwitchingNode
//! ```
//!
//! # Ordering
//!
//! Teardown always runs in the same order: clear the running
//! indicator, close the tunnel device, wait the grace interval, stop
//! the engine. A node switch stops the old instance and polls until
//! the engine confirms it is gone before starting the new one on the
//! same descriptor, so two instances are never live at once.
//!
//! # Serialization
//!
//! Only one transition runs at a time. Calls that arrive mid-transition
//! are rejected with `InvalidTransition`. The exceptions are
//! `disconnect` during `Connecting`, which cancels the connect, and
//! `shutdown`, which waits for any transition to settle before tearing
//! down.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::new(engine, builder, resolver, &config);
//! let node = controller.connect(subscription, Some("香港 01")).await?;
//! controller.switch_node("日本 02").await?;
//! controller.disconnect().await?;
//! ```

use crate::config::{LocalSettings, SessionConfig, SessionTimings, StaticProfile, TunnelParams};
use crate::engine::{DeviceError, Engine, EngineError, EngineInstance, TunnelBuilder, TunnelDevice, TunnelFd};
use crate::indicator::RunningIndicator;
use crate::probe::{Connector, LatencyProber};
use crate::subscription::{ConfigStore, StoreError, SubscriptionConfig};
use crate::translate::{ConfigTranslator, TranslateError};
use flowvpn_network::HostResolver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No tunnel, no engine
    Idle,
    /// Creating the device and starting the engine
    Connecting,
    /// Engine instance live
    Connected,
    /// Replacing the engine instance on the same device
    SwitchingNode,
    /// Tearing down
    Disconnecting,
    /// Last transition failed; resources released
    Failed,
}

impl SessionState {
    /// Check if traffic is flowing
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Check if a transition is running
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::SwitchingNode | SessionState::Disconnecting
        )
    }

    /// Check if `connect` is accepted
    pub fn can_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed)
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Network error: {0}")]
    Network(StoreError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("No usable node: {0}")]
    Selection(String),

    #[error("Cannot {op} while {state:?}")]
    InvalidTransition { op: &'static str, state: SessionState },

    #[error("Connect cancelled by disconnect")]
    Cancelled,
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Parse(msg) => SessionError::Parse(msg),
            other => SessionError::Network(other),
        }
    }
}

impl From<TranslateError> for SessionError {
    fn from(e: TranslateError) -> Self {
        SessionError::Selection(e.to_string())
    }
}

/// How a settings-driven connect ended up connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectedVia {
    /// Through a subscription node
    Subscription { node: String },
    /// Through the static profile
    Static,
}

/// Where the active session's nodes come from
#[derive(Debug, Clone)]
enum SessionProfile {
    Subscription(Arc<SubscriptionConfig>),
    Static,
}

/// Live engine instance bound to an open tunnel device
struct EngineSession {
    instance: EngineInstance,
    device: Box<dyn TunnelDevice>,
    active_node: String,
    profile: SessionProfile,
    connected_at: Instant,
}

/// Controller state; resources live only inside `Connected`
enum Phase {
    Idle,
    Connecting,
    Connected(EngineSession),
    SwitchingNode,
    Disconnecting,
    Failed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting => SessionState::Connecting,
            Phase::Connected(_) => SessionState::Connected,
            Phase::SwitchingNode => SessionState::SwitchingNode,
            Phase::Disconnecting => SessionState::Disconnecting,
            Phase::Failed => SessionState::Failed,
        }
    }
}

/// What to connect with
enum Target {
    Subscription {
        config: Arc<SubscriptionConfig>,
        selected: Option<String>,
    },
    Static(StaticProfile),
}

/// Resources acquired so far by connect
struct Acquired {
    node_name: String,
    profile: SessionProfile,
}

/// Holds the resources of an in-flight transition
///
/// If the transition future is dropped before finishing, the guard
/// releases whatever it holds and parks the session in `abandon`.
struct TransitionGuard<'a> {
    controller: &'a SessionController,
    device: Option<Box<dyn TunnelDevice>>,
    instance: Option<EngineInstance>,
    abandon: SessionState,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(controller: &'a SessionController, abandon: SessionState) -> Self {
        Self {
            controller,
            device: None,
            instance: None,
            abandon,
            armed: true,
        }
    }

    /// Release everything and land in `Failed`
    async fn fail(mut self, err: SessionError) -> SessionError {
        error!("Session transition failed: {}", err);
        if let Err(e) = self.controller.release(&mut self.device, &mut self.instance).await {
            warn!("Cleanup after failure incomplete: {}", e);
        }
        self.armed = false;
        self.controller.set_phase(Phase::Failed);
        err
    }

    /// Release everything and land in `Idle`
    async fn cancel(mut self) -> SessionError {
        info!("Connect cancelled, releasing resources");
        if let Err(e) = self.controller.release(&mut self.device, &mut self.instance).await {
            warn!("Cleanup after cancel incomplete: {}", e);
        }
        self.armed = false;
        self.controller.set_phase(Phase::Idle);
        SessionError::Cancelled
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Session transition abandoned, releasing resources");
        self.controller
            .release_blocking(self.device.take(), self.instance.take());
        self.controller.set_phase(match self.abandon {
            SessionState::Idle => Phase::Idle,
            _ => Phase::Failed,
        });
    }
}

/// Tunnel session controller
///
/// Share it behind an `Arc`; every operation takes `&self`.
pub struct SessionController {
    /// Packet-forwarding engine
    engine: Arc<dyn Engine>,
    /// Tunnel device factory
    builder: Arc<dyn TunnelBuilder>,
    /// Shared DNS cache
    resolver: HostResolver,
    /// Engine config builder
    translator: ConfigTranslator,
    /// Device parameters
    tunnel: TunnelParams,
    /// Lifecycle timings
    timings: SessionTimings,
    /// Externally visible running signal
    indicator: RunningIndicator,
    /// Current phase
    phase: Mutex<Phase>,
    /// State broadcast
    state_tx: watch::Sender<SessionState>,
    /// Set by `disconnect` while connecting
    cancel_connect: AtomicBool,
}

impl SessionController {
    /// Create an idle controller
    pub fn new(
        engine: Arc<dyn Engine>,
        builder: Arc<dyn TunnelBuilder>,
        resolver: HostResolver,
        config: &SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);

        Self {
            engine,
            builder,
            resolver,
            translator: ConfigTranslator::new(config.filter.clone(), config.tunnel.mtu),
            tunnel: config.tunnel.clone(),
            timings: config.timings.clone(),
            indicator: RunningIndicator::new(),
            phase: Mutex::new(Phase::Idle),
            state_tx,
            cancel_connect: AtomicBool::new(false),
        }
    }

    /// Use an existing running indicator
    pub fn with_indicator(mut self, indicator: RunningIndicator) -> Self {
        self.indicator = indicator;
        self
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Node the live engine instance points at
    pub fn active_node(&self) -> Option<String> {
        match &*self.lock_phase() {
            Phase::Connected(session) => Some(session.active_node.clone()),
            _ => None,
        }
    }

    /// Is the running indicator shown?
    pub fn is_running(&self) -> bool {
        self.indicator.is_shown()
    }

    /// Running indicator
    pub fn indicator(&self) -> &RunningIndicator {
        &self.indicator
    }

    /// Time since the current instance started
    pub fn connection_duration(&self) -> Option<Duration> {
        match &*self.lock_phase() {
            Phase::Connected(session) => Some(session.connected_at.elapsed()),
            _ => None,
        }
    }

    /// Connect through a subscription node
    ///
    /// `selected` may name any node of the document. Without a match
    /// the first eligible node is used, then the first node at all.
    /// Returns the name of the node connected to.
    pub async fn connect(
        &self,
        config: Arc<SubscriptionConfig>,
        selected: Option<&str>,
    ) -> Result<String, SessionError> {
        self.connect_target(Target::Subscription {
            config,
            selected: selected.map(str::to_string),
        })
        .await
    }

    /// Connect through the static profile
    pub async fn connect_static(&self, profile: StaticProfile) -> Result<String, SessionError> {
        self.connect_target(Target::Static(profile)).await
    }

    /// Connect the way the persisted settings ask for
    ///
    /// Uses the subscription when enabled, falling back to `fallback`
    /// if the subscription cannot be fetched.
    pub async fn connect_with_settings(
        &self,
        store: &ConfigStore,
        settings: &LocalSettings,
        fallback: Option<&StaticProfile>,
    ) -> Result<ConnectedVia, SessionError> {
        self.ensure_can_connect()?;

        if let Some(url) = settings.active_subscription() {
            match store.fetch(url).await {
                Ok(config) => {
                    let node = self.connect(config, settings.selected_node.as_deref()).await?;
                    return Ok(ConnectedVia::Subscription { node });
                }
                Err(e) if fallback.is_some() => {
                    warn!("Subscription unavailable ({}), using static profile", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let profile = fallback
            .ok_or_else(|| SessionError::Selection("no subscription or static profile configured".into()))?;
        self.connect_static(profile.clone()).await?;
        Ok(ConnectedVia::Static)
    }

    /// Probe the eligible pool and connect to the fastest node
    pub async fn connect_fastest<C: Connector>(
        &self,
        config: Arc<SubscriptionConfig>,
        prober: &LatencyProber<C>,
    ) -> Result<String, SessionError> {
        self.ensure_can_connect()?;

        let filter = self.translator.filter();
        prober.test_all(&config, filter, None).await;
        let fastest = prober.table().fastest(&config, filter).map(|n| n.name.clone());
        match &fastest {
            Some(name) => info!("Fastest node: {}", name),
            None => warn!("No node answered the probe, using default selection"),
        }

        self.connect(config, fastest.as_deref()).await
    }

    /// Replace the engine instance with one for `name`
    pub async fn switch_node(&self, name: &str) -> Result<(), SessionError> {
        let session = self.begin_switch(name)?;
        info!("Switching node: {} -> {}", session.active_node, name);

        let EngineSession {
            instance,
            device,
            profile,
            ..
        } = session;
        let mut guard = TransitionGuard::new(self, SessionState::Failed);
        guard.device = Some(device);
        guard.instance = Some(instance);

        if let Err(e) = self.replace_instance(&mut guard, &profile, name).await {
            return Err(guard.fail(e).await);
        }

        let (Some(device), Some(instance)) = (guard.device.take(), guard.instance.take()) else {
            return Err(guard
                .fail(SessionError::Engine(EngineError::StartFailed("instance lost during switch".into())))
                .await);
        };
        guard.armed = false;

        self.indicator.show(name);
        self.set_phase(Phase::Connected(EngineSession {
            instance,
            device,
            active_node: name.to_string(),
            profile,
            connected_at: Instant::now(),
        }));
        info!("Switched to node {}", name);
        Ok(())
    }

    /// Tear the session down
    ///
    /// From `Connecting` this cancels the connect and waits for it to
    /// settle. From `Failed` it only resets the state.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        enum Plan {
            Teardown(EngineSession),
            Reset,
            AwaitCancel,
        }

        let plan = {
            let mut phase = self.lock_phase();
            match phase.state() {
                SessionState::Connected => match self.transition(&mut phase, Phase::Disconnecting) {
                    Phase::Connected(session) => Plan::Teardown(session),
                    _ => Plan::Reset,
                },
                SessionState::Failed => {
                    self.transition(&mut phase, Phase::Idle);
                    Plan::Reset
                }
                SessionState::Connecting => {
                    // Read by connect under this same lock before it commits
                    self.cancel_connect.store(true, Ordering::SeqCst);
                    Plan::AwaitCancel
                }
                state => return Err(SessionError::InvalidTransition { op: "disconnect", state }),
            }
        };

        match plan {
            Plan::Teardown(session) => self.teardown(session).await,
            Plan::Reset => Ok(()),
            Plan::AwaitCancel => {
                info!("Disconnect requested while connecting, cancelling");
                let mut rx = self.subscribe();
                let settled = rx
                    .wait_for(|s| !s.is_transitioning())
                    .await
                    .map(|s| *s)
                    .unwrap_or(SessionState::Failed);

                // A connect that failed on its own still ends in Idle
                if settled == SessionState::Failed {
                    let mut phase = self.lock_phase();
                    if matches!(*phase, Phase::Failed) {
                        self.transition(&mut phase, Phase::Idle);
                    }
                }
                Ok(())
            }
        }
    }

    /// Tear down whatever is live and return only once `Idle`
    ///
    /// A running switch or teardown is allowed to settle first; a
    /// running connect is cancelled.
    pub async fn shutdown(&self) {
        let mut rx = self.subscribe();
        loop {
            let state = self.state();
            match state {
                SessionState::Idle => return,
                SessionState::SwitchingNode | SessionState::Disconnecting => {
                    debug!("Shutdown waiting for {:?} to settle", state);
                    if rx.wait_for(|s| !s.is_transitioning()).await.is_err() {
                        return;
                    }
                }
                SessionState::Connecting | SessionState::Connected | SessionState::Failed => {
                    info!("Shutting down session ({:?})", state);
                    if let Err(e) = self.disconnect().await {
                        warn!("Shutdown step incomplete: {}", e);
                    }
                }
            }
        }
    }

    async fn connect_target(&self, target: Target) -> Result<String, SessionError> {
        self.begin_connect()?;
        let mut guard = TransitionGuard::new(self, SessionState::Failed);

        let acquired = match self.bring_up(&mut guard, target).await {
            Ok(acquired) => acquired,
            Err(SessionError::Cancelled) => return Err(guard.cancel().await),
            Err(e) => return Err(guard.fail(e).await),
        };

        let node_name = acquired.node_name.clone();
        let committed = {
            let mut phase = self.lock_phase();
            if self.cancel_connect.load(Ordering::SeqCst) {
                false
            } else if let (Some(device), Some(instance)) = (guard.device.take(), guard.instance.take()) {
                guard.armed = false;
                self.indicator.show(&node_name);
                self.transition(
                    &mut phase,
                    Phase::Connected(EngineSession {
                        instance,
                        device,
                        active_node: acquired.node_name,
                        profile: acquired.profile,
                        connected_at: Instant::now(),
                    }),
                );
                true
            } else {
                false
            }
        };

        if !committed {
            return Err(guard.cancel().await);
        }
        info!("Connected via {}", node_name);
        Ok(node_name)
    }

    /// Device, DNS warm-up, translation, engine start
    async fn bring_up(&self, guard: &mut TransitionGuard<'_>, target: Target) -> Result<Acquired, SessionError> {
        let builder = self.builder.clone();
        let params = self.tunnel.clone();
        let device = off_thread(move || builder.establish(&params), DeviceError::Establish).await?;
        let fd = device.fd();
        info!("Tunnel device established (fd {})", fd);
        guard.device = Some(device);
        self.checkpoint()?;

        let (config_json, acquired) = match target {
            Target::Subscription { config, selected } => {
                if config.is_empty() {
                    return Err(TranslateError::NoNodes.into());
                }
                self.resolver.pre_resolve_all(config.server_hosts()).await;
                self.checkpoint()?;

                let translation = self
                    .translator
                    .translate(&config, fd, selected.as_deref(), &self.resolver)?;
                let json = encode(&translation.config)?;
                (
                    json,
                    Acquired {
                        node_name: translation.node_name,
                        profile: SessionProfile::Subscription(config),
                    },
                )
            }
            Target::Static(profile) => {
                self.resolver.resolve(&profile.server).await;
                self.checkpoint()?;

                let json = encode(&self.translator.translate_static(&profile, fd, &self.resolver))?;
                (
                    json,
                    Acquired {
                        node_name: profile.name,
                        profile: SessionProfile::Static,
                    },
                )
            }
        };

        guard.instance = Some(self.start_engine(config_json, fd).await?);
        self.checkpoint()?;
        Ok(acquired)
    }

    /// Stop the old instance, confirm it is gone, start the new one
    async fn replace_instance(
        &self,
        guard: &mut TransitionGuard<'_>,
        profile: &SessionProfile,
        name: &str,
    ) -> Result<(), SessionError> {
        let SessionProfile::Subscription(config) = profile else {
            return Err(SessionError::Selection("static profile has a single node".into()));
        };
        let fd = match &guard.device {
            Some(device) => device.fd(),
            None => return Err(DeviceError::Establish("tunnel device missing".into()).into()),
        };

        if let Some(old) = &guard.instance {
            let handle = old.handle();
            let engine = self.engine.clone();
            debug!("Stopping engine instance {}", handle);
            if let Err(e) = off_thread(move || engine.stop(handle), EngineError::StopFailed).await {
                warn!("Engine stop for {} reported: {}", handle, e);
            }
            self.await_stopped(handle).await?;
            guard.instance = None;
        }

        if let Some(node) = config.find(name) {
            self.resolver.resolve(&node.server).await;
        }
        let translation = self.translator.translate(config, fd, Some(name), &self.resolver)?;
        let json = encode(&translation.config)?;

        guard.instance = Some(self.start_engine(json, fd).await?);
        Ok(())
    }

    /// Poll until the engine reports the instance stopped
    async fn await_stopped(&self, handle: i64) -> Result<(), SessionError> {
        for attempt in 1..=self.timings.stop_poll_attempts {
            let engine = self.engine.clone();
            match off_thread(move || engine.is_running(handle), EngineError::StatusQuery).await {
                Ok(false) => {
                    debug!("Engine instance {} stopped after {} poll(s)", handle, attempt);
                    return Ok(());
                }
                Ok(true) => {
                    debug!("Engine instance {} still running (poll {})", handle, attempt);
                    tokio::time::sleep(self.timings.stop_poll_interval()).await;
                }
                Err(e) => {
                    warn!("Engine status query failed ({}), assuming stopped", e);
                    return Ok(());
                }
            }
        }

        error!("Engine instance {} did not stop", handle);
        Err(EngineError::StillRunning(handle).into())
    }

    async fn start_engine(&self, config_json: String, fd: TunnelFd) -> Result<EngineInstance, SessionError> {
        let engine = self.engine.clone();
        let handle = off_thread(move || engine.start(&config_json, fd), EngineError::StartFailed).await?;

        match EngineInstance::from_handle(handle) {
            Some(instance) => {
                info!("Engine started (handle {})", handle);
                Ok(instance)
            }
            None => Err(EngineError::StartRejected(handle).into()),
        }
    }

    /// Full teardown of a live session, ending in `Idle`
    async fn teardown(&self, session: EngineSession) -> Result<(), SessionError> {
        info!("Disconnecting from {}", session.active_node);
        let mut guard = TransitionGuard::new(self, SessionState::Idle);
        guard.device = Some(session.device);
        guard.instance = Some(session.instance);

        let result = self.release(&mut guard.device, &mut guard.instance).await;
        guard.armed = false;

        match result {
            Ok(()) => {
                self.set_phase(Phase::Idle);
                info!("Session disconnected");
                Ok(())
            }
            Err(e) => {
                error!("Teardown incomplete: {}", e);
                self.set_phase(Phase::Failed);
                Err(e)
            }
        }
    }

    /// Teardown ordering: indicator, device, grace, engine
    ///
    /// Every step runs even if an earlier one fails; the first error
    /// is returned. Resources leave their slot only when their step
    /// starts, so an abandoned release leaves the rest to the guard.
    async fn release(
        &self,
        device: &mut Option<Box<dyn TunnelDevice>>,
        instance: &mut Option<EngineInstance>,
    ) -> Result<(), SessionError> {
        self.indicator.clear();
        let mut first_error: Option<SessionError> = None;

        if let Some(device) = device.take() {
            debug!("Closing tunnel device (fd {})", device.fd());
            if let Err(e) = off_thread(move || device.close(), DeviceError::Close).await {
                warn!("Tunnel device close failed: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        if instance.is_some() {
            tokio::time::sleep(self.timings.teardown_grace()).await;
        }
        if let Some(instance) = instance.take() {
            let handle = instance.handle();
            let engine = self.engine.clone();
            debug!("Stopping engine instance {}", handle);
            if let Err(e) = off_thread(move || engine.stop(handle), EngineError::StopFailed).await {
                warn!("Engine stop failed: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Same ordering as `release`, on the calling thread
    ///
    /// On a multi-threaded runtime the worker hands its other tasks
    /// off for the duration; on a current-thread runtime they wait out
    /// the grace interval.
    fn release_blocking(&self, device: Option<Box<dyn TunnelDevice>>, instance: Option<EngineInstance>) {
        let release = move || {
            self.indicator.clear();
            if let Some(device) = device {
                if let Err(e) = device.close() {
                    warn!("Tunnel device close failed: {}", e);
                }
            }
            if let Some(instance) = instance {
                std::thread::sleep(self.timings.teardown_grace());
                if let Err(e) = self.engine.stop(instance.handle()) {
                    warn!("Engine stop failed: {}", e);
                }
            }
        };

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(release)
            }
            _ => release(),
        }
    }

    fn ensure_can_connect(&self) -> Result<(), SessionError> {
        let state = self.lock_phase().state();
        if state.can_connect() {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition { op: "connect", state })
        }
    }

    fn begin_connect(&self) -> Result<(), SessionError> {
        let mut phase = self.lock_phase();
        let state = phase.state();
        if !state.can_connect() {
            return Err(SessionError::InvalidTransition { op: "connect", state });
        }
        self.cancel_connect.store(false, Ordering::SeqCst);
        self.transition(&mut phase, Phase::Connecting);
        Ok(())
    }

    /// Validate the target and take the live session out of `Connected`
    fn begin_switch(&self, name: &str) -> Result<EngineSession, SessionError> {
        let mut phase = self.lock_phase();
        let Phase::Connected(session) = &*phase else {
            return Err(SessionError::InvalidTransition {
                op: "switch node",
                state: phase.state(),
            });
        };

        match &session.profile {
            SessionProfile::Static => {
                return Err(SessionError::Selection("static profile has a single node".into()));
            }
            SessionProfile::Subscription(config) => match config.find(name) {
                None => return Err(SessionError::Selection(format!("unknown node {:?}", name))),
                Some(node) if !node.kind.is_supported() => {
                    return Err(SessionError::Selection(format!(
                        "node {:?} uses unsupported protocol {}",
                        name, node.kind
                    )));
                }
                Some(_) => {}
            },
        }

        match self.transition(&mut phase, Phase::SwitchingNode) {
            Phase::Connected(session) => Ok(session),
            other => {
                let state = other.state();
                *phase = other;
                Err(SessionError::InvalidTransition { op: "switch node", state })
            }
        }
    }

    fn checkpoint(&self) -> Result<(), SessionError> {
        if self.cancel_connect.load(Ordering::SeqCst) {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_phase(&self, next: Phase) {
        let mut phase = self.lock_phase();
        self.transition(&mut phase, next);
    }

    /// Swap the phase and broadcast; returns the previous phase
    fn transition(&self, phase: &mut MutexGuard<'_, Phase>, next: Phase) -> Phase {
        let from = phase.state();
        let to = next.state();
        let previous = std::mem::replace(&mut **phase, next);
        if from != to {
            info!("Session state: {:?} -> {:?}", from, to);
        }
        self.state_tx.send_replace(to);
        previous
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let phase = std::mem::replace(
            self.phase.get_mut().unwrap_or_else(|e| e.into_inner()),
            Phase::Idle,
        );
        if let Phase::Connected(session) = phase {
            info!("Controller dropped with live session, tearing down");
            self.release_blocking(Some(session.device), Some(session.instance));
            self.state_tx.send_replace(SessionState::Idle);
        }
    }
}

fn encode(config: &crate::translate::EngineConfig) -> Result<String, SessionError> {
    config
        .to_json()
        .map_err(|e| SessionError::Engine(EngineError::Encode(e.to_string())))
}

/// Run a blocking collaborator call on the blocking pool
async fn off_thread<T, E, F>(f: F, on_panic: fn(String) -> E) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(on_panic(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, ProxyNode};
    use flowvpn_network::{DnsConfig, HttpClient, HttpClientConfig};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicI64;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Establish,
        Close { fd: TunnelFd, indicator_shown: bool },
        Start { fd: TunnelFd, handle: i64 },
        Stop(i64),
        IsRunning(i64, bool),
    }

    type Log = Arc<Mutex<Vec<(Event, Instant)>>>;

    fn record(log: &Log, event: Event) {
        log.lock().unwrap().push((event, Instant::now()));
    }

    fn events(log: &Log) -> Vec<Event> {
        log.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    /// When `event` was first seen
    fn seen_at(log: &Log, event: &Event) -> Instant {
        log.lock()
            .unwrap()
            .iter()
            .find(|(e, _)| e == event)
            .map(|(_, at)| *at)
            .unwrap()
    }

    #[derive(Default)]
    struct MockEngine {
        log: Log,
        next_handle: AtomicI64,
        /// Scripted start results, consumed in order
        start_results: Mutex<VecDeque<Result<i64, EngineError>>>,
        /// Live handles; `Some(n)` once stopped, with n polls left before it is gone
        live: Mutex<HashMap<i64, Option<u32>>>,
        /// `is_running` answers `true` this many times after `stop`
        linger_polls: u32,
        status_fails: bool,
        /// Set if a start happened while another instance was live
        overlap: AtomicBool,
        configs: Mutex<Vec<String>>,
    }

    impl MockEngine {
        fn new(log: Log) -> Self {
            Self {
                log,
                next_handle: AtomicI64::new(1),
                ..Default::default()
            }
        }
    }

    impl Engine for MockEngine {
        fn start(&self, config_json: &str, fd: TunnelFd) -> Result<i64, EngineError> {
            let handle = match self.start_results.lock().unwrap().pop_front() {
                Some(scripted) => scripted?,
                None => self.next_handle.fetch_add(1, Ordering::SeqCst),
            };
            let mut live = self.live.lock().unwrap();
            if !live.is_empty() {
                self.overlap.store(true, Ordering::SeqCst);
            }
            if handle > 0 {
                live.insert(handle, None);
            }
            self.configs.lock().unwrap().push(config_json.to_string());
            record(&self.log, Event::Start { fd, handle });
            Ok(handle)
        }

        fn stop(&self, handle: i64) -> Result<(), EngineError> {
            record(&self.log, Event::Stop(handle));
            let mut live = self.live.lock().unwrap();
            if live.contains_key(&handle) {
                if self.linger_polls == 0 {
                    live.remove(&handle);
                } else {
                    live.insert(handle, Some(self.linger_polls));
                }
            }
            Ok(())
        }

        fn is_running(&self, handle: i64) -> Result<bool, EngineError> {
            if self.status_fails {
                return Err(EngineError::StatusQuery("engine gone".into()));
            }
            let mut live = self.live.lock().unwrap();
            let running = match live.get(&handle).copied() {
                None => false,
                Some(None) | Some(Some(u32::MAX)) => true,
                Some(Some(0)) => {
                    live.remove(&handle);
                    false
                }
                Some(Some(n)) => {
                    live.insert(handle, Some(n - 1));
                    true
                }
            };
            record(&self.log, Event::IsRunning(handle, running));
            Ok(running)
        }
    }

    struct MockDevice {
        fd: TunnelFd,
        log: Log,
        indicator: RunningIndicator,
    }

    impl TunnelDevice for MockDevice {
        fn fd(&self) -> TunnelFd {
            self.fd
        }

        fn close(self: Box<Self>) -> Result<(), DeviceError> {
            record(&self.log, Event::Close {
                fd: self.fd,
                indicator_shown: self.indicator.is_shown(),
            });
            Ok(())
        }
    }

    struct MockBuilder {
        log: Log,
        indicator: RunningIndicator,
        fail: bool,
        delay: Duration,
    }

    impl TunnelBuilder for MockBuilder {
        fn establish(&self, _params: &TunnelParams) -> Result<Box<dyn TunnelDevice>, DeviceError> {
            std::thread::sleep(self.delay);
            record(&self.log, Event::Establish);
            if self.fail {
                return Err(DeviceError::Establish("permission denied".into()));
            }
            Ok(Box::new(MockDevice {
                fd: 42,
                log: self.log.clone(),
                indicator: self.indicator.clone(),
            }))
        }
    }

    struct Harness {
        controller: Arc<SessionController>,
        engine: Arc<MockEngine>,
        log: Log,
    }

    fn fast_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.timings.teardown_grace_ms = 10;
        config.timings.stop_poll_interval_ms = 5;
        config
    }

    async fn harness_with(engine: impl FnOnce(Log) -> MockEngine, fail_device: bool, delay: Duration) -> Harness {
        harness_configured(engine, fail_device, delay, fast_config()).await
    }

    async fn harness_configured(
        engine: impl FnOnce(Log) -> MockEngine,
        fail_device: bool,
        delay: Duration,
        config: SessionConfig,
    ) -> Harness {
        let log: Log = Arc::default();
        let engine = Arc::new(engine(log.clone()));
        let indicator = RunningIndicator::new();
        let builder = Arc::new(MockBuilder {
            log: log.clone(),
            indicator: indicator.clone(),
            fail: fail_device,
            delay,
        });
        let resolver = HostResolver::new(DnsConfig {
            use_system_dns: true,
            timeout: Duration::from_millis(100),
        })
        .await
        .unwrap();

        let controller = SessionController::new(engine.clone(), builder, resolver, &config)
            .with_indicator(indicator);

        Harness {
            controller: Arc::new(controller),
            engine,
            log,
        }
    }

    async fn harness() -> Harness {
        harness_with(MockEngine::new, false, Duration::ZERO).await
    }

    fn subscription() -> Arc<SubscriptionConfig> {
        let mut ssr = ProxyNode::shadowsocks("SSR 01", "192.0.2.30", 443, "aes-256-cfb", "pw");
        ssr.kind = NodeKind::ShadowsocksR;

        Arc::new(SubscriptionConfig::from_nodes(vec![
            ProxyNode::shadowsocks("剩余流量：100G", "192.0.2.1", 1, "aes-128-gcm", "pw"),
            ProxyNode::shadowsocks("香港 01", "192.0.2.10", 8388, "aes-128-gcm", "pw"),
            ssr,
            ProxyNode::shadowsocks("日本 02", "192.0.2.20", 8389, "aes-128-gcm", "pw"),
        ]))
    }

    fn proxy_address(config_json: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(config_json).unwrap();
        value["outbounds"][0]["settings"]["address"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_session_state() {
        assert!(SessionState::Connected.is_connected());
        assert!(SessionState::Failed.can_connect());
        assert!(SessionState::Idle.can_connect());
        assert!(SessionState::SwitchingNode.is_transitioning());
        assert!(!SessionState::Connected.can_connect());
    }

    #[tokio::test]
    async fn test_connect_default_selection() {
        let h = harness().await;
        let mut states = h.controller.subscribe();

        let node = h.controller.connect(subscription(), None).await.unwrap();

        assert_eq!(node, "香港 01");
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(h.controller.active_node().as_deref(), Some("香港 01"));
        assert!(h.controller.is_running());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SessionState::Connected);

        assert_eq!(
            events(&h.log),
            vec![Event::Establish, Event::Start { fd: 42, handle: 1 }]
        );
        let config: serde_json::Value =
            serde_json::from_str(&h.engine.configs.lock().unwrap()[0]).unwrap();
        assert_eq!(config["outbounds"].as_array().unwrap().len(), 2);
        assert_eq!(config["router"]["rules"].as_array().unwrap().len(), 1);
        assert_eq!(config["router"]["rules"][0]["ip"][0], "192.0.2.10");
        assert_eq!(config["router"]["rules"][0]["target"], "direct-out");
    }

    #[tokio::test]
    async fn test_connect_explicit_selection() {
        let h = harness().await;

        let node = h.controller.connect(subscription(), Some("日本 02")).await.unwrap();
        assert_eq!(node, "日本 02");

        let json = h.engine.configs.lock().unwrap()[0].clone();
        assert_eq!(proxy_address(&json), "192.0.2.20");
    }

    #[tokio::test]
    async fn test_engine_rejection_fails_session() {
        let h = harness().await;
        h.engine.start_results.lock().unwrap().push_back(Ok(-1));

        let err = h.controller.connect(subscription(), None).await.unwrap_err();

        assert!(matches!(err, SessionError::Engine(EngineError::StartRejected(-1))));
        assert_eq!(h.controller.state(), SessionState::Failed);
        assert!(h.controller.active_node().is_none());
        assert!(!h.controller.is_running());
        assert_eq!(
            events(&h.log),
            vec![
                Event::Establish,
                Event::Start { fd: 42, handle: -1 },
                Event::Close { fd: 42, indicator_shown: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_engine_error_fails_session() {
        let h = harness().await;
        h.engine
            .start_results
            .lock()
            .unwrap()
            .push_back(Err(EngineError::StartFailed("bad config".into())));

        let err = h.controller.connect(subscription(), None).await.unwrap_err();

        assert!(matches!(err, SessionError::Engine(EngineError::StartFailed(_))));
        assert_eq!(h.controller.state(), SessionState::Failed);
        assert!(events(&h.log).contains(&Event::Close { fd: 42, indicator_shown: false }));

        // Failed only leads back to Connecting
        let node = h.controller.connect(subscription(), None).await.unwrap();
        assert_eq!(node, "香港 01");
    }

    #[tokio::test]
    async fn test_device_failure() {
        let h = harness_with(MockEngine::new, true, Duration::ZERO).await;

        let err = h.controller.connect(subscription(), None).await.unwrap_err();

        assert!(matches!(err, SessionError::Device(DeviceError::Establish(_))));
        assert_eq!(h.controller.state(), SessionState::Failed);
        assert_eq!(events(&h.log), vec![Event::Establish]);
    }

    #[tokio::test]
    async fn test_empty_subscription_is_selection_error() {
        let h = harness().await;

        let err = h
            .controller
            .connect(Arc::new(SubscriptionConfig::default()), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Selection(_)));
        assert_eq!(h.controller.state(), SessionState::Failed);
        assert!(!events(&h.log).iter().any(|e| matches!(e, Event::Start { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_ordering() {
        let h = harness().await;
        h.controller.connect(subscription(), None).await.unwrap();

        h.controller.disconnect().await.unwrap();

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.controller.is_running());
        assert!(h.controller.active_node().is_none());
        assert_eq!(
            events(&h.log),
            vec![
                Event::Establish,
                Event::Start { fd: 42, handle: 1 },
                // Indicator already down when the device closes
                Event::Close { fd: 42, indicator_shown: false },
                Event::Stop(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_from_idle_is_rejected() {
        let h = harness().await;

        let err = h.controller.disconnect().await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::InvalidTransition { state: SessionState::Idle, .. }
        ));
        assert!(events(&h.log).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_from_failed_resets() {
        let h = harness().await;
        h.engine.start_results.lock().unwrap().push_back(Ok(0));
        h.controller.connect(subscription(), None).await.unwrap_err();
        let before = events(&h.log).len();

        h.controller.disconnect().await.unwrap();

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(events(&h.log).len(), before);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let h = harness().await;
        h.controller.connect(subscription(), None).await.unwrap();

        let err = h.controller.connect(subscription(), None).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::InvalidTransition { state: SessionState::Connected, .. }
        ));
        assert_eq!(h.engine.next_handle.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_switch_waits_for_old_instance() {
        let h = harness_with(
            |log| MockEngine {
                linger_polls: 2,
                ..MockEngine::new(log)
            },
            false,
            Duration::ZERO,
        )
        .await;
        h.controller.connect(subscription(), None).await.unwrap();

        h.controller.switch_node("日本 02").await.unwrap();

        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(h.controller.active_node().as_deref(), Some("日本 02"));
        assert!(h.controller.is_running());
        assert!(!h.engine.overlap.load(Ordering::SeqCst));
        assert_eq!(
            events(&h.log),
            vec![
                Event::Establish,
                Event::Start { fd: 42, handle: 1 },
                Event::Stop(1),
                Event::IsRunning(1, true),
                Event::IsRunning(1, true),
                Event::IsRunning(1, false),
                // Same descriptor for the new instance
                Event::Start { fd: 42, handle: 2 },
            ]
        );
        let json = h.engine.configs.lock().unwrap()[1].clone();
        assert_eq!(proxy_address(&json), "192.0.2.20");
    }

    #[tokio::test]
    async fn test_switch_status_error_assumes_stopped() {
        let h = harness_with(
            |log| MockEngine {
                status_fails: true,
                ..MockEngine::new(log)
            },
            false,
            Duration::ZERO,
        )
        .await;
        h.controller.connect(subscription(), None).await.unwrap();

        h.controller.switch_node("日本 02").await.unwrap();

        assert_eq!(h.controller.active_node().as_deref(), Some("日本 02"));
    }

    #[tokio::test]
    async fn test_switch_never_starts_second_instance() {
        let h = harness_with(
            |log| MockEngine {
                linger_polls: u32::MAX,
                ..MockEngine::new(log)
            },
            false,
            Duration::ZERO,
        )
        .await;
        h.controller.connect(subscription(), None).await.unwrap();

        let err = h.controller.switch_node("日本 02").await.unwrap_err();

        assert!(matches!(err, SessionError::Engine(EngineError::StillRunning(1))));
        assert_eq!(h.controller.state(), SessionState::Failed);
        let log = events(&h.log);
        let starts = log.iter().filter(|e| matches!(e, Event::Start { .. })).count();
        let polls = log.iter().filter(|e| matches!(e, Event::IsRunning(..))).count();
        assert_eq!(starts, 1);
        assert_eq!(polls, 5);
        assert!(log.contains(&Event::Close { fd: 42, indicator_shown: false }));
    }

    #[tokio::test]
    async fn test_failed_switch_closes_device() {
        let h = harness().await;
        h.controller.connect(subscription(), None).await.unwrap();
        h.engine.start_results.lock().unwrap().push_back(Ok(-1));

        let err = h.controller.switch_node("日本 02").await.unwrap_err();

        assert!(matches!(err, SessionError::Engine(EngineError::StartRejected(-1))));
        assert_eq!(h.controller.state(), SessionState::Failed);
        assert!(h.controller.active_node().is_none());
        assert!(!h.controller.is_running());
        assert_eq!(
            events(&h.log).last(),
            Some(&Event::Close { fd: 42, indicator_shown: false })
        );
    }

    #[tokio::test]
    async fn test_switch_to_unknown_node_keeps_session() {
        let h = harness().await;
        h.controller.connect(subscription(), None).await.unwrap();
        let before = events(&h.log);

        let unknown = h.controller.switch_node("火星 99").await.unwrap_err();
        let unsupported = h.controller.switch_node("SSR 01").await.unwrap_err();

        assert!(matches!(unknown, SessionError::Selection(_)));
        assert!(matches!(unsupported, SessionError::Selection(_)));
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(h.controller.active_node().as_deref(), Some("香港 01"));
        assert_eq!(events(&h.log), before);
    }

    #[tokio::test]
    async fn test_switch_while_connecting_is_rejected() {
        let h = harness_with(MockEngine::new, false, Duration::from_millis(150)).await;
        let controller = h.controller.clone();
        let connect = tokio::spawn(async move { controller.connect(subscription(), None).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.controller.state(), SessionState::Connecting);

        let err = h.controller.switch_node("日本 02").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition { state: SessionState::Connecting, .. }
        ));
        assert!(events(&h.log).is_empty());

        connect.await.unwrap().unwrap();
        assert_eq!(h.controller.state(), SessionState::Connected);
        assert_eq!(
            events(&h.log),
            vec![Event::Establish, Event::Start { fd: 42, handle: 1 }]
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect() {
        let h = harness_with(MockEngine::new, false, Duration::from_millis(150)).await;
        let controller = h.controller.clone();
        let connect = tokio::spawn(async move { controller.connect(subscription(), None).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        h.controller.disconnect().await.unwrap();

        assert!(matches!(connect.await.unwrap(), Err(SessionError::Cancelled)));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(
            events(&h.log),
            vec![Event::Establish, Event::Close { fd: 42, indicator_shown: false }]
        );
    }

    #[tokio::test]
    async fn test_abandoned_connect_lands_in_failed() {
        let h = harness_with(MockEngine::new, false, Duration::from_millis(150)).await;

        let attempt = tokio::time::timeout(
            Duration::from_millis(30),
            h.controller.connect(subscription(), None),
        )
        .await;

        assert!(attempt.is_err());
        assert_eq!(h.controller.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_static_profile_session() {
        let h = harness().await;
        let mut profile = StaticProfile::new("192.0.2.99", 12355);
        profile.prefix = Some("abcd".into());

        let node = h.controller.connect_static(profile).await.unwrap();
        assert_eq!(node, "static");

        let json = h.engine.configs.lock().unwrap()[0].clone();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["outbounds"][0]["settings"]["prefix"], "abcd");

        let err = h.controller.switch_node("香港 01").await.unwrap_err();
        assert!(matches!(err, SessionError::Selection(_)));
        assert_eq!(h.controller.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_settings_fall_back_to_static() {
        let h = harness().await;
        // Bound then released: nothing listens there
        let addr = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let store = ConfigStore::new(HttpClient::new(HttpClientConfig {
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            ..Default::default()
        }));
        let settings = LocalSettings {
            subscription_url: Some(format!("http://{}/sub", addr)),
            use_subscription: true,
            selected_node: None,
        };
        let profile = StaticProfile::new("192.0.2.99", 12355);

        let err = h
            .controller
            .connect_with_settings(&store, &settings, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Network(_)));
        assert_eq!(h.controller.state(), SessionState::Idle);

        let via = h
            .controller
            .connect_with_settings(&store, &settings, Some(&profile))
            .await
            .unwrap();
        assert_eq!(via, ConnectedVia::Static);
        assert_eq!(h.controller.active_node().as_deref(), Some("static"));
    }

    #[tokio::test]
    async fn test_settings_without_anything_configured() {
        let h = harness().await;

        let err = h
            .controller
            .connect_with_settings(&ConfigStore::with_defaults(), &LocalSettings::default(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Selection(_)));
        assert_eq!(h.controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_and_drop_release_resources() {
        let h = harness().await;
        h.controller.connect(subscription(), None).await.unwrap();
        h.controller.shutdown().await;
        assert_eq!(h.controller.state(), SessionState::Idle);

        let h = harness().await;
        h.controller.connect(subscription(), None).await.unwrap();
        let Harness { controller, log, .. } = h;
        drop(controller);

        assert_eq!(
            events(&log)[2..],
            [
                Event::Close { fd: 42, indicator_shown: false },
                Event::Stop(1),
            ]
        );
    }
    fn lingering(polls: u32) -> impl FnOnce(Log) -> MockEngine {
        move |log| MockEngine {
            linger_polls: polls,
            ..MockEngine::new(log)
        }
    }

    #[tokio::test]
    async fn test_disconnect_waits_grace_before_stop() {
        let mut config = fast_config();
        config.timings.teardown_grace_ms = 80;
        let h = harness_configured(MockEngine::new, false, Duration::ZERO, config).await;
        h.controller.connect(subscription(), None).await.unwrap();

        h.controller.disconnect().await.unwrap();

        let closed = seen_at(&h.log, &Event::Close { fd: 42, indicator_shown: false });
        let stopped = seen_at(&h.log, &Event::Stop(1));
        assert!(stopped.duration_since(closed) >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_drop_waits_grace_before_stop() {
        let mut config = fast_config();
        config.timings.teardown_grace_ms = 80;
        let h = harness_configured(MockEngine::new, false, Duration::ZERO, config).await;
        h.controller.connect(subscription(), None).await.unwrap();
        let Harness { controller, log, .. } = h;

        drop(controller);

        let closed = seen_at(&log, &Event::Close { fd: 42, indicator_shown: false });
        let stopped = seen_at(&log, &Event::Stop(1));
        assert!(stopped.duration_since(closed) >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_shutdown_during_switch_tears_down_new_instance() {
        let mut config = fast_config();
        config.timings.stop_poll_interval_ms = 50;
        let h = harness_configured(lingering(3), false, Duration::ZERO, config).await;
        h.controller.connect(subscription(), None).await.unwrap();

        let controller = h.controller.clone();
        let switch = tokio::spawn(async move { controller.switch_node("日本 02").await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.controller.state(), SessionState::SwitchingNode);

        h.controller.shutdown().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(!h.controller.is_running());
        switch.await.unwrap().unwrap();
        assert_eq!(h.controller.state(), SessionState::Idle);

        let log = events(&h.log);
        assert_eq!(
            log[log.len() - 3..],
            [
                Event::Start { fd: 42, handle: 2 },
                Event::Close { fd: 42, indicator_shown: false },
                Event::Stop(2),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_during_disconnect_waits_for_it() {
        let mut config = fast_config();
        config.timings.teardown_grace_ms = 100;
        let h = harness_configured(MockEngine::new, false, Duration::ZERO, config).await;
        h.controller.connect(subscription(), None).await.unwrap();

        let controller = h.controller.clone();
        let disconnect = tokio::spawn(async move { controller.disconnect().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.controller.state(), SessionState::Disconnecting);

        h.controller.shutdown().await;

        // Returns only after the engine is stopped
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(events(&h.log).last(), Some(&Event::Stop(1)));
        disconnect.await.unwrap().unwrap();

        let log = events(&h.log);
        assert_eq!(log.iter().filter(|e| matches!(e, Event::Stop(_))).count(), 1);
        assert_eq!(log.iter().filter(|e| matches!(e, Event::Close { .. })).count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_connect() {
        let h = harness_with(MockEngine::new, false, Duration::from_millis(150)).await;
        let controller = h.controller.clone();
        let connect = tokio::spawn(async move { controller.connect(subscription(), None).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        h.controller.shutdown().await;

        assert_eq!(h.controller.state(), SessionState::Idle);
        assert!(matches!(connect.await.unwrap(), Err(SessionError::Cancelled)));
        assert!(!events(&h.log).iter().any(|e| matches!(e, Event::Start { .. })));
    }

    #[tokio::test]
    async fn test_explicit_selection_of_unsupported_node_falls_back() {
        let h = harness().await;

        let node = h.controller.connect(subscription(), Some("SSR 01")).await.unwrap();

        // Same rule as switch_node: never hand an ssr node to the engine
        assert_eq!(node, "香港 01");
        let json = h.engine.configs.lock().unwrap()[0].clone();
        assert_eq!(proxy_address(&json), "192.0.2.10");
        assert!(matches!(
            h.controller.switch_node("SSR 01").await,
            Err(SessionError::Selection(_))
        ));
        assert_eq!(h.controller.active_node().as_deref(), Some("香港 01"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_abandoned_switch_keeps_runtime_responsive() {
        let mut config = fast_config();
        config.timings.teardown_grace_ms = 150;
        config.timings.stop_poll_interval_ms = 20;
        let h = harness_configured(lingering(u32::MAX), false, Duration::ZERO, config).await;
        h.controller.connect(subscription(), None).await.unwrap();

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ticks.lock().unwrap().push(Instant::now());
                }
            })
        };

        let controller = h.controller.clone();
        tokio::spawn(async move {
            let attempt = tokio::time::timeout(Duration::from_millis(50), controller.switch_node("日本 02")).await;
            assert!(attempt.is_err());
        })
        .await
        .unwrap();
        ticker.abort();

        assert_eq!(h.controller.state(), SessionState::Failed);
        assert!(!h.controller.is_running());

        // The old instance is stopped again after the grace interval
        let closed = seen_at(&h.log, &Event::Close { fd: 42, indicator_shown: false });
        let log = h.log.lock().unwrap().clone();
        let stopped = log
            .iter()
            .filter(|(e, _)| *e == Event::Stop(1))
            .map(|(_, at)| *at)
            .last()
            .unwrap();
        assert!(stopped.duration_since(closed) >= Duration::from_millis(150));

        // Other tasks kept running while the guard waited
        let during = ticks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| **t > closed && **t < stopped)
            .count();
        assert!(during > 0);
    }
}
