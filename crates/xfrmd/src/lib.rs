//! xfrmd - transform policy daemon
//!
//! Hosts the policy engine for one node: installs static routes, keyed
//! associations and policies from configuration, then keeps the engine's
//! housekeeping running until shutdown.

#![warn(missing_docs)]

pub mod config;

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

use xfrm_common::{AddressFamily, XfrmError};
use xfrm_policy::{
    ChannelKeyManager, InetFamily, MemoryStateStore, NegotiationWaker, Policy, PolicyExpiry,
    StateStore, XfrmEngine,
};

pub use config::DaemonConfig;

/// Daemon error types
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Invalid or unusable configuration
    #[error("config error: {0}")]
    Config(String),
    /// Rejected by the engine
    #[error("engine error: {0}")]
    Engine(#[from] XfrmError),
}

/// Daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Created, not yet configured
    Initializing,
    /// Configuration installed
    Running,
    /// Policies flushed
    Shutdown,
}

/// Policy daemon
pub struct XfrmDaemon {
    /// Configuration
    pub config: DaemonConfig,
    /// Engine
    pub engine: XfrmEngine,
    /// Association store shared with the engine
    pub states: Arc<MemoryStateStore>,
    expiries: parking_lot::Mutex<Option<UnboundedReceiver<PolicyExpiry>>>,
    state: RwLock<DaemonState>,
}

impl XfrmDaemon {
    /// Create daemon and its engine on the current runtime
    pub fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let waker = NegotiationWaker::new();
        let states = Arc::new(MemoryStateStore::new(waker.clone()));
        let (key_manager, expiries) = ChannelKeyManager::new();
        let engine = XfrmEngine::new(
            config.engine.clone(),
            Arc::clone(&states) as Arc<dyn StateStore>,
            Arc::new(key_manager),
            waker,
        )?;

        Ok(Self {
            config,
            engine,
            states,
            expiries: parking_lot::Mutex::new(Some(expiries)),
            state: RwLock::new(DaemonState::Initializing),
        })
    }

    /// Register families, seed associations and install policies
    pub fn init(&self) -> Result<(), DaemonError> {
        tracing::info!("Initializing xfrmd...");

        for family in [AddressFamily::Inet, AddressFamily::Inet6] {
            let ops = InetFamily::new(family);
            for route in self.config.routes.iter().filter(|r| AddressFamily::of(&r.destination.ip()) == family) {
                ops.add_route(route.clone())?;
            }
            self.engine.register_family(Arc::new(ops))?;
        }
        if self.config.routes.is_empty() {
            tracing::warn!("no routes configured, every outbound lookup will fail");
        }

        for state in &self.config.states {
            let state = self.states.add(state.to_state());
            tracing::debug!(spi = state.id.spi, daddr = %state.id.daddr, "association seeded");
        }

        for policy in &self.config.policies {
            let spec = policy.to_spec()?;
            let index = self
                .engine
                .insert_policy(Policy::new(spec), policy.direction, false)?;
            tracing::debug!(index, dir = ?policy.direction, "configured policy installed");
        }

        *self.state.write() = DaemonState::Running;
        tracing::info!(
            policies = self.config.policies.len(),
            states = self.states.len(),
            "xfrmd initialized"
        );
        Ok(())
    }

    /// Run housekeeping until `shutdown` resolves
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) -> Result<(), DaemonError> {
        let mut expiries = self
            .expiries
            .lock()
            .take()
            .ok_or_else(|| DaemonError::Config("daemon already running".into()))?;
        let period = Duration::from_secs(self.config.stats_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.housekeeping(),
                Some(event) = expiries.recv() => {
                    tracing::info!(index = event.index, dir = ?event.direction, hard = event.hard, "policy expiry reported");
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn housekeeping(&self) {
        let pruned = self.engine.prune_stale_bundles();
        match serde_json::to_string(&self.engine.stats()) {
            Ok(stats) => tracing::info!(pruned, %stats, "engine statistics"),
            Err(e) => tracing::warn!(error = %e, "failed to encode statistics"),
        }
    }

    /// Flush policies and wait for their reclamation
    pub async fn shutdown(&self) {
        let flushed = self.engine.flush();
        self.engine.gc_sync().await;
        *self.state.write() = DaemonState::Shutdown;
        tracing::info!(flushed, "xfrmd stopped");
    }

    /// Get current state
    pub fn state(&self) -> DaemonState {
        *self.state.read()
    }
}
