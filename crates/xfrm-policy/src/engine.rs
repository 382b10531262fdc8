//! Policy engine: administration, outbound bundle resolution and inbound
//! checks
//!
//! # Outbound lookup
//!
//! ```text
//! flow ──► socket override / lookup_best ──► none ──────────► pass through
//!                    │
//!                    ├── Block ─────────────────────────────► Blocked
//!                    ├── Allow [] ──────────────────────────► pass through
//!                    ▼
//!             cached bundle? ── hit ────────────────────────► bundle
//!                    │ miss
//!                    ▼
//!             resolve templates ── pending ──► wait, re-check generation
//!                    │
//!                    ▼
//!             build + attach ── policy died ──► restart
//! ```

use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;

use xfrm_common::{
    AddressFamily, AtomicCounter, FlowDescriptor, ResolveError, Selector, XfrmError, XfrmResult,
};

use crate::bundle::{BaseRoute, Bundle};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::family::{FamilyOps, FamilyRegistry};
use crate::gc::GarbageCollector;
use crate::km::KeyManager;
use crate::lifecycle;
use crate::policy::{Direction, Policy, PolicyAction, PolicyInfo};
use crate::resolver;
use crate::state::{NegotiationWaker, StateStore, XfrmState};
use crate::store::{PolicyStore, SocketId};
use crate::template::{Mode, Template};

/// Result of an outbound lookup
#[derive(Debug, Clone)]
pub enum FlowVerdict {
    /// Send untransformed on the base route
    PassThrough(BaseRoute),
    /// Send through this transform chain
    Bundle(Bundle),
}

/// Caller context for [`XfrmEngine::resolve_flow`]
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// Socket whose overrides take precedence
    pub socket: Option<SocketId>,
    /// Wait for pending negotiations instead of failing with `Pending`
    pub may_block: bool,
    /// Interrupts a blocking wait
    pub cancel: Option<CancelToken>,
}

impl LookupOptions {
    /// Blocking lookup
    pub fn blocking() -> Self {
        Self {
            may_block: true,
            ..Default::default()
        }
    }

    /// Apply socket overrides
    pub fn with_socket(mut self, socket: SocketId) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Attach a cancellation token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub(crate) lookups: AtomicCounter,
    pub(crate) bundle_hits: AtomicCounter,
    pub(crate) bundles_built: AtomicCounter,
    pub(crate) blocked: AtomicCounter,
    pub(crate) expired: AtomicCounter,
    pub(crate) restarts: AtomicCounter,
    pub(crate) inbound_rejects: AtomicCounter,
}

pub(crate) struct EngineShared {
    pub(crate) store: Arc<PolicyStore>,
    families: FamilyRegistry,
    states: Arc<dyn StateStore>,
    pub(crate) key_manager: Arc<dyn KeyManager>,
    waker: NegotiationWaker,
    gc: GarbageCollector,
    pub(crate) runtime: Handle,
    pub(crate) config: ArcSwap<EngineConfig>,
    pub(crate) stats: EngineCounters,
}

impl EngineShared {
    /// Mark an unlinked policy dead and hand it to the collector
    pub(crate) fn kill_policy(&self, policy: Arc<Policy>) {
        if policy.kill() {
            tracing::debug!(index = policy.index(), "policy killed");
            self.gc.enqueue(policy);
        }
    }
}

/// Security policy engine; clones share one engine
#[derive(Clone)]
pub struct XfrmEngine {
    shared: Arc<EngineShared>,
}

impl XfrmEngine {
    /// Create engine on the current tokio runtime
    pub fn new(
        config: EngineConfig,
        states: Arc<dyn StateStore>,
        key_manager: Arc<dyn KeyManager>,
        waker: NegotiationWaker,
    ) -> XfrmResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| XfrmError::Config(format!("no tokio runtime: {e}")))?;
        Self::with_runtime(runtime, config, states, key_manager, waker)
    }

    /// Create engine whose timers and collector run on `runtime`
    pub fn with_runtime(
        runtime: Handle,
        config: EngineConfig,
        states: Arc<dyn StateStore>,
        key_manager: Arc<dyn KeyManager>,
        waker: NegotiationWaker,
    ) -> XfrmResult<Self> {
        config.validate()?;
        let store = Arc::new(PolicyStore::new());
        let gc = GarbageCollector::spawn(&runtime, Arc::clone(&store));

        Ok(Self {
            shared: Arc::new(EngineShared {
                store,
                families: FamilyRegistry::new(),
                states,
                key_manager,
                waker,
                gc,
                runtime,
                config: ArcSwap::from_pointee(config),
                stats: EngineCounters::default(),
            }),
        })
    }

    /// Register network operations for a family
    pub fn register_family(&self, ops: Arc<dyn FamilyOps>) -> XfrmResult<()> {
        self.shared.families.register(ops)
    }

    /// Remove network operations for a family
    pub fn unregister_family(&self, family: AddressFamily) -> XfrmResult<()> {
        self.shared.families.unregister(family).map(drop)
    }

    /// Link a new policy, replacing one with an identical selector unless
    /// `exclusive`. Returns the policy's index.
    pub fn insert_policy(
        &self,
        policy: Arc<Policy>,
        dir: Direction,
        exclusive: bool,
    ) -> XfrmResult<u32> {
        let replaced = self
            .shared
            .store
            .insert(Arc::clone(&policy), dir, exclusive)?;
        lifecycle::arm_after_insert(&self.shared, &policy);

        let index = policy.index();
        tracing::info!(index, ?dir, priority = policy.priority(), "policy inserted");
        if let Some(old) = replaced {
            self.shared.kill_policy(old);
        }
        Ok(index)
    }

    /// Unlink the policy with this exact selector
    pub fn delete_by_selector(&self, dir: Direction, selector: &Selector) -> XfrmResult<Arc<Policy>> {
        let policy = self
            .shared
            .store
            .find_by_selector(dir, selector, true)
            .ok_or(XfrmError::NotFound)?;
        tracing::info!(index = policy.index(), ?dir, "policy deleted");
        self.shared.kill_policy(Arc::clone(&policy));
        Ok(policy)
    }

    /// Unlink the policy with this index
    pub fn delete_by_id(&self, index: u32) -> XfrmResult<Arc<Policy>> {
        let policy = self
            .shared
            .store
            .find_by_id(index, true)
            .ok_or(XfrmError::NotFound)?;
        tracing::info!(index, "policy deleted");
        self.shared.kill_policy(Arc::clone(&policy));
        Ok(policy)
    }

    /// Policy with this exact selector
    pub fn get_by_selector(&self, dir: Direction, selector: &Selector) -> XfrmResult<Arc<Policy>> {
        self.shared
            .store
            .find_by_selector(dir, selector, false)
            .ok_or(XfrmError::NotFound)
    }

    /// Policy with this index
    pub fn get_by_id(&self, index: u32) -> XfrmResult<Arc<Policy>> {
        self.shared
            .store
            .find_by_id(index, false)
            .ok_or(XfrmError::NotFound)
    }

    /// Remove every global policy, returns how many were removed
    pub fn flush(&self) -> usize {
        let removed = self.shared.store.flush_all();
        let count = removed.len();
        for policy in removed {
            self.shared.kill_policy(policy);
        }
        tracing::info!(count, "policies flushed");
        count
    }

    /// Snapshot of every global policy
    pub fn dump(&self) -> XfrmResult<Vec<PolicyInfo>> {
        let mut infos = Vec::new();
        self.shared.store.for_each(|p| infos.push(p.info()))?;
        Ok(infos)
    }

    /// Set (`Some`) or clear (`None`) a socket override
    pub fn socket_attach(
        &self,
        sock: SocketId,
        dir: Direction,
        policy: Option<Arc<Policy>>,
    ) -> XfrmResult<()> {
        let old = self
            .shared
            .store
            .socket_insert(sock, dir, policy.clone())?;
        if let Some(policy) = &policy {
            lifecycle::arm_after_insert(&self.shared, policy);
        }
        if let Some(old) = old {
            self.shared.kill_policy(old);
        }
        Ok(())
    }

    /// Drop a closing socket's overrides, returns how many were removed
    pub fn socket_detach(&self, sock: SocketId) -> usize {
        let removed = self.shared.store.socket_detach(sock);
        let count = removed.len();
        for policy in removed {
            self.shared.kill_policy(policy);
        }
        count
    }

    /// Give `to` fresh copies of every override of `from`
    pub fn socket_clone(&self, from: SocketId, to: SocketId) -> XfrmResult<()> {
        let slots = self.shared.store.socket_policies(from);
        for (policy, dir) in slots.iter().zip([Direction::In, Direction::Out]) {
            if let Some(policy) = policy {
                self.socket_attach(to, dir, Some(policy.duplicate()))?;
            }
        }
        Ok(())
    }

    /// Policy governing `flow` in `dir`: the socket override if it matches,
    /// otherwise the best global policy
    pub fn lookup_policy(
        &self,
        dir: Direction,
        flow: &FlowDescriptor,
        socket: Option<SocketId>,
    ) -> Option<Arc<Policy>> {
        let store = &self.shared.store;
        socket
            .and_then(|sock| store.socket_lookup(sock, dir, flow, flow.family))
            .or_else(|| store.lookup_best(dir, flow, flow.family))
    }

    /// Route an outbound flow and resolve its transform chain
    pub async fn resolve_output(
        &self,
        flow: &FlowDescriptor,
        opts: &LookupOptions,
    ) -> XfrmResult<FlowVerdict> {
        let route = self.shared.families.get(flow.family)?.lookup_base_route(flow)?;
        self.resolve_flow(flow, route, opts).await
    }

    /// Decide how an outbound flow leaves: untouched, through a (possibly
    /// cached) bundle, or not at all
    pub async fn resolve_flow(
        &self,
        flow: &FlowDescriptor,
        route: BaseRoute,
        opts: &LookupOptions,
    ) -> XfrmResult<FlowVerdict> {
        let shared = &self.shared;
        shared.stats.lookups.inc();
        metrics::counter!("xfrm_lookups_total").increment(1);

        'restart: loop {
            let generation = shared.store.generation();

            let Some(policy) = self.lookup_policy(Direction::Out, flow, opts.socket) else {
                return Ok(FlowVerdict::PassThrough(route));
            };
            policy.touch();

            let templates = match policy.action() {
                PolicyAction::Block => {
                    shared.stats.blocked.inc();
                    metrics::counter!("xfrm_blocked_total").increment(1);
                    return Err(XfrmError::Blocked);
                }
                PolicyAction::Allow(templates) if templates.is_empty() => {
                    return Ok(FlowVerdict::PassThrough(route));
                }
                PolicyAction::Allow(templates) => templates,
            };

            let ops = shared.families.get(flow.family)?;
            if let Some(bundle) = ops.find_cached_bundle(&policy, flow, &route) {
                shared.stats.bundle_hits.inc();
                metrics::counter!("xfrm_bundle_hits_total").increment(1);
                return Ok(FlowVerdict::Bundle(bundle));
            }

            let instances = loop {
                // Subscribe before resolving so a wake-up in between is kept
                let notified = shared.waker.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let peer = (flow.daddr, flow.saddr);
                match resolver::resolve(shared.states.as_ref(), templates, flow, peer) {
                    Ok(instances) => break instances,
                    Err(ResolveError::NoMatch) => return Err(XfrmError::NoMatch),
                    Err(ResolveError::Pending) if !opts.may_block => return Err(XfrmError::Pending),
                    Err(ResolveError::Pending) => {
                        tracing::trace!(index = policy.index(), "waiting for negotiation");
                        match &opts.cancel {
                            Some(cancel) => tokio::select! {
                                _ = notified => {}
                                _ = cancel.cancelled() => return Err(XfrmError::RestartRequested),
                            },
                            None => notified.await,
                        }
                        if shared.store.generation() != generation {
                            shared.stats.restarts.inc();
                            tracing::debug!(index = policy.index(), "policy set changed while waiting, restarting lookup");
                            continue 'restart;
                        }
                    }
                }
            };

            // Every template optional and skipped
            if instances.is_empty() {
                return Ok(FlowVerdict::PassThrough(route));
            }

            let bundle = ops.build_bundle(&policy, instances, flow, route.clone())?;
            if !policy.attach_bundle(&bundle) {
                shared.stats.restarts.inc();
                tracing::debug!(index = policy.index(), "policy died during build, restarting lookup");
                continue 'restart;
            }

            shared.stats.bundles_built.inc();
            metrics::counter!("xfrm_bundles_built_total").increment(1);
            tracing::trace!(index = policy.index(), links = bundle.len(), "bundle attached");
            return Ok(FlowVerdict::Bundle(bundle));
        }
    }

    /// Check a received packet against inbound policy. `sec_path` lists the
    /// associations that decapsulated it, outermost first.
    pub fn check_inbound(
        &self,
        dir: Direction,
        packet: &[u8],
        family: AddressFamily,
        sec_path: &[Arc<XfrmState>],
        socket: Option<SocketId>,
    ) -> XfrmResult<()> {
        let flow = self.shared.families.get(family)?.decode_session(packet)?;
        self.check_inbound_flow(dir, &flow, sec_path, socket)
    }

    /// Check an already decoded inbound flow
    pub fn check_inbound_flow(
        &self,
        dir: Direction,
        flow: &FlowDescriptor,
        sec_path: &[Arc<XfrmState>],
        socket: Option<SocketId>,
    ) -> XfrmResult<()> {
        let result = self.inbound_verdict(dir, flow, sec_path, socket);
        if result.is_err() {
            self.shared.stats.inbound_rejects.inc();
        }
        result
    }

    fn inbound_verdict(
        &self,
        dir: Direction,
        flow: &FlowDescriptor,
        sec_path: &[Arc<XfrmState>],
        socket: Option<SocketId>,
    ) -> XfrmResult<()> {
        let Some(policy) = self.lookup_policy(dir, flow, socket) else {
            // Tunnelled traffic needs a policy that asked for it
            if has_nontransport(sec_path, 0) {
                return Err(XfrmError::TemplateMismatch);
            }
            return Ok(());
        };
        policy.touch();

        let templates = match policy.action() {
            PolicyAction::Block => {
                self.shared.stats.blocked.inc();
                metrics::counter!("xfrm_blocked_total").increment(1);
                return Err(XfrmError::Blocked);
            }
            PolicyAction::Allow(templates) => templates,
        };

        // Outermost association pairs with the last template
        let mut pos = 0;
        for template in templates.iter().rev() {
            pos = template_ok(template, sec_path, pos).ok_or(XfrmError::TemplateMismatch)?;
        }
        if has_nontransport(sec_path, pos) {
            return Err(XfrmError::TemplateMismatch);
        }
        Ok(())
    }

    /// Evict bundles whose associations are no longer valid
    pub fn prune_stale_bundles(&self) -> usize {
        let mut evicted = 0;
        // An empty store simply has nothing to prune
        let _ = self.shared.store.for_each(|p| evicted += p.prune_bundles());
        if evicted > 0 {
            tracing::debug!(evicted, "stale bundles pruned");
        }
        evicted
    }

    /// Wake lookups waiting for negotiation
    pub fn notify_negotiation(&self) {
        self.shared.waker.wake();
    }

    /// Waker shared with the association store
    pub fn waker(&self) -> &NegotiationWaker {
        &self.shared.waker
    }

    /// Wait until every policy killed so far is reclaimed
    pub async fn gc_sync(&self) {
        self.shared.gc.sync().await;
    }

    /// Current configuration
    pub fn config(&self) -> Arc<EngineConfig> {
        self.shared.config.load_full()
    }

    /// Swap configuration; running timers pick it up on their next tick
    pub fn reload_config(&self, config: EngineConfig) -> XfrmResult<()> {
        config.validate()?;
        tracing::info!(?config, "engine configuration reloaded");
        self.shared.config.store(Arc::new(config));
        Ok(())
    }

    /// Store invalidation generation
    pub fn generation(&self) -> u64 {
        self.shared.store.generation()
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let stats = &self.shared.stats;
        let store = &self.shared.store;
        let lookups = stats.lookups.get();
        let hits = stats.bundle_hits.get();

        EngineStats {
            lookups,
            bundle_hits: hits,
            bundle_hit_rate: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
            bundles_built: stats.bundles_built.get(),
            blocked: stats.blocked.get(),
            expired: stats.expired.get(),
            restarts: stats.restarts.get(),
            inbound_rejects: stats.inbound_rejects.get(),
            policies_in: store.len(Direction::In),
            policies_out: store.len(Direction::Out),
            policies_fwd: store.len(Direction::Fwd),
            sockets: store.socket_count(),
            reclaimed: self.shared.gc.reclaimed(),
            generation: store.generation(),
        }
    }
}

/// Position in `sec_path` after matching `template` from `start`, `None`
/// when a mandatory template is unmatched
fn template_ok(template: &Template, sec_path: &[Arc<XfrmState>], start: usize) -> Option<usize> {
    if template.optional && template.mode == Mode::Transport {
        return Some(start);
    }
    for (idx, state) in sec_path.iter().enumerate().skip(start) {
        if template.accepts(state) {
            return Some(idx + 1);
        }
        // Tunnels cannot be skipped over
        if state.mode != Mode::Transport {
            break;
        }
    }
    template.optional.then_some(start)
}

fn has_nontransport(sec_path: &[Arc<XfrmState>], start: usize) -> bool {
    sec_path
        .iter()
        .skip(start)
        .any(|state| state.mode != Mode::Transport)
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub lookups: u64,
    pub bundle_hits: u64,
    pub bundle_hit_rate: f64,
    pub bundles_built: u64,
    pub blocked: u64,
    pub expired: u64,
    pub restarts: u64,
    pub inbound_rejects: u64,
    pub policies_in: usize,
    pub policies_out: usize,
    pub policies_fwd: usize,
    pub sockets: usize,
    pub reclaimed: u64,
    pub generation: u64,
}
