//! Policy entity
//!
//! A policy is always shared as `Arc<Policy>`. Its identity and action are
//! immutable after creation; everything that changes afterwards lives behind
//! the policy's own lock.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use xfrm_common::Selector;

use crate::bundle::Bundle;
use crate::template::Template;

/// Number of global policy directions
pub const POLICY_MAX: usize = 3;

/// Policy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Direction {
    /// Inbound traffic to this host
    In = 0,
    /// Outbound traffic from this host
    Out = 1,
    /// Forwarded traffic
    Fwd = 2,
}

impl Direction {
    /// All global directions
    pub const ALL: [Direction; POLICY_MAX] = [Self::In, Self::Out, Self::Fwd];

    /// Slot in per-direction tables
    #[inline(always)]
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// Slot in the per-socket table (`In`/`Out` only)
    #[inline]
    pub const fn socket_slot(self) -> Option<usize> {
        match self {
            Self::In => Some(0),
            Self::Out => Some(1),
            Self::Fwd => None,
        }
    }

    /// Decode the direction bits of a policy index.
    ///
    /// Returns the direction and whether the index belongs to a per-socket
    /// policy.
    pub const fn from_index(index: u32) -> Option<(Direction, bool)> {
        match index & 7 {
            0 => Some((Self::In, false)),
            1 => Some((Self::Out, false)),
            2 => Some((Self::Fwd, false)),
            3 => Some((Self::In, true)),
            4 => Some((Self::Out, true)),
            _ => None,
        }
    }
}

/// Policy action as configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Apply templates (none: pass through)
    #[default]
    Allow,
    /// Drop matching traffic
    Block,
}

/// Resolved policy action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyAction {
    /// Apply this chain, empty means pass through untouched
    Allow(Vec<Template>),
    /// Reject
    Block,
}

/// Soft and hard lifetime thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Lifetime {
    /// Renegotiation warning after insertion
    #[serde(default, with = "opt_secs")]
    pub soft_add_expires: Option<Duration>,
    /// Deletion after insertion
    #[serde(default, with = "opt_secs")]
    pub hard_add_expires: Option<Duration>,
    /// Renegotiation warning after last use
    #[serde(default, with = "opt_secs")]
    pub soft_use_expires: Option<Duration>,
    /// Deletion after last use
    #[serde(default, with = "opt_secs")]
    pub hard_use_expires: Option<Duration>,
}

impl Lifetime {
    /// Any positive threshold configured
    pub fn is_set(&self) -> bool {
        [
            self.soft_add_expires,
            self.hard_add_expires,
            self.soft_use_expires,
            self.hard_use_expires,
        ]
        .iter()
        .any(|d| d.is_some_and(|d| !d.is_zero()))
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Administrative description of a policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Lower matches first
    #[serde(default)]
    pub priority: u32,
    /// Match criteria
    pub selector: Selector,
    /// Action
    #[serde(default)]
    pub action: Action,
    /// Transform chain for `Allow`
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Lifetime thresholds
    #[serde(default)]
    pub lifetime: Lifetime,
}

impl PolicySpec {
    /// Allow spec without templates
    pub fn allow(selector: Selector, priority: u32) -> Self {
        Self {
            priority,
            selector,
            action: Action::Allow,
            templates: Vec::new(),
            lifetime: Lifetime::default(),
        }
    }

    /// Blocking spec
    pub fn block(selector: Selector, priority: u32) -> Self {
        Self {
            action: Action::Block,
            ..Self::allow(selector, priority)
        }
    }

    /// Append a template
    pub fn with_template(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    /// Set lifetime
    pub fn with_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }
}

pub(crate) struct TimerSlot {
    seq: u64,
    handle: AbortHandle,
}

struct PolicyState {
    dead: bool,
    add_time: Instant,
    use_time: Option<Instant>,
    created_at: DateTime<Utc>,
    bundles: Vec<Bundle>,
    timer: Option<TimerSlot>,
    timer_seq: u64,
}

/// Security policy
pub struct Policy {
    index: AtomicU32,
    priority: u32,
    selector: Selector,
    action: PolicyAction,
    lifetime: Lifetime,
    state: Mutex<PolicyState>,
}

impl Policy {
    /// Create an unlinked policy
    pub fn new(spec: PolicySpec) -> Arc<Self> {
        let action = match spec.action {
            Action::Allow => PolicyAction::Allow(spec.templates),
            Action::Block => PolicyAction::Block,
        };
        Arc::new(Self {
            index: AtomicU32::new(0),
            priority: spec.priority,
            selector: spec.selector,
            action,
            lifetime: spec.lifetime,
            state: Mutex::new(PolicyState {
                dead: false,
                add_time: Instant::now(),
                use_time: None,
                created_at: Utc::now(),
                bundles: Vec::new(),
                timer: None,
                timer_seq: 0,
            }),
        })
    }

    /// Fresh unlinked copy with the same match, action and lifetime
    pub fn duplicate(&self) -> Arc<Self> {
        Self::new(self.spec())
    }

    /// Administrative description
    pub fn spec(&self) -> PolicySpec {
        let (action, templates) = match &self.action {
            PolicyAction::Allow(t) => (Action::Allow, t.clone()),
            PolicyAction::Block => (Action::Block, Vec::new()),
        };
        PolicySpec {
            priority: self.priority,
            selector: self.selector,
            action,
            templates,
            lifetime: self.lifetime,
        }
    }

    /// Generated index, 0 until linked
    #[inline]
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    /// Direction encoded in the index
    pub fn direction(&self) -> Option<Direction> {
        Direction::from_index(self.index()).map(|(dir, _)| dir)
    }

    /// Linked to a socket rather than the global store
    pub fn is_socket_policy(&self) -> bool {
        Direction::from_index(self.index()).is_some_and(|(_, sk)| sk)
    }

    /// Priority, lower matches first
    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Match criteria
    #[inline]
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Action
    #[inline]
    pub fn action(&self) -> &PolicyAction {
        &self.action
    }

    /// Transform chain, empty for `Block`
    pub fn templates(&self) -> &[Template] {
        match &self.action {
            PolicyAction::Allow(t) => t,
            PolicyAction::Block => &[],
        }
    }

    /// Lifetime thresholds
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Unlinked and waiting for reclamation
    pub fn is_dead(&self) -> bool {
        self.state.lock().dead
    }

    /// Insertion time
    pub fn add_time(&self) -> Instant {
        self.state.lock().add_time
    }

    /// Last lookup hit, if any
    pub fn use_time(&self) -> Option<Instant> {
        self.state.lock().use_time
    }

    /// Number of cached bundles
    pub fn bundle_count(&self) -> usize {
        self.state.lock().bundles.len()
    }

    /// Snapshot for dumps
    pub fn info(&self) -> PolicyInfo {
        let state = self.state.lock();
        let now = Instant::now();
        PolicyInfo {
            index: self.index(),
            direction: self.direction(),
            socket: self.is_socket_policy(),
            priority: self.priority,
            selector: self.selector,
            action: match self.action {
                PolicyAction::Allow(_) => Action::Allow,
                PolicyAction::Block => Action::Block,
            },
            templates: self.templates().to_vec(),
            lifetime: self.lifetime,
            created_at: state.created_at,
            added_secs_ago: now.saturating_duration_since(state.add_time).as_secs(),
            used_secs_ago: state
                .use_time
                .map(|t| now.saturating_duration_since(t).as_secs()),
            bundles: state.bundles.len(),
            dead: state.dead,
        }
    }

    /// Find a cached bundle, evicting stale ones on the way
    pub fn find_bundle(&self, pred: impl Fn(&Bundle) -> bool) -> Option<Bundle> {
        let mut state = self.state.lock();
        state.bundles.retain(Bundle::is_valid);
        state.bundles.iter().find(|b| pred(b)).cloned()
    }

    pub(crate) fn stamp_insert(&self, index: u32) {
        let mut state = self.state.lock();
        self.index.store(index, Ordering::Release);
        state.add_time = Instant::now();
        state.use_time = None;
    }

    pub(crate) fn touch(&self) {
        self.state.lock().use_time = Some(Instant::now());
    }

    /// Mark dead; true only for the call that performed the transition
    pub(crate) fn kill(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.dead, true)
    }

    /// Cache a bundle unless the policy died meanwhile
    pub(crate) fn attach_bundle(&self, bundle: &Bundle) -> bool {
        let mut state = self.state.lock();
        if state.dead {
            return false;
        }
        state.bundles.push(bundle.clone());
        true
    }

    pub(crate) fn take_bundles(&self) -> Vec<Bundle> {
        std::mem::take(&mut self.state.lock().bundles)
    }

    pub(crate) fn prune_bundles(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.bundles.len();
        state.bundles.retain(Bundle::is_valid);
        before - state.bundles.len()
    }

    /// Replace the timer slot with a task built by `spawn`.
    ///
    /// `spawn` runs under the policy lock, so the task cannot observe its
    /// slot before it is stored. Returns false for dead policies.
    pub(crate) fn arm_timer(&self, spawn: impl FnOnce(u64) -> AbortHandle) -> bool {
        let mut state = self.state.lock();
        if state.dead {
            return false;
        }
        state.timer_seq += 1;
        let seq = state.timer_seq;
        let slot = TimerSlot {
            seq,
            handle: spawn(seq),
        };
        if let Some(old) = state.timer.replace(slot) {
            old.handle.abort();
        }
        true
    }

    /// Claim a fired timer; false if it was replaced, disarmed or the
    /// policy died
    pub(crate) fn claim_fired_timer(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        if state.dead || state.timer.as_ref().map_or(true, |t| t.seq != seq) {
            return false;
        }
        state.timer = None;
        true
    }

    /// Cancel the armed timer; true only if one was armed
    pub(crate) fn disarm_timer(&self) -> bool {
        match self.state.lock().timer.take() {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn timer_armed(&self) -> bool {
        self.state.lock().timer.is_some()
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("index", &self.index())
            .field("priority", &self.priority)
            .field("selector", &self.selector)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

impl Drop for Policy {
    fn drop(&mut self) {
        if let Some(slot) = self.state.get_mut().timer.take() {
            slot.handle.abort();
        }
        tracing::trace!(index = self.index(), "policy destroyed");
    }
}

/// Policy snapshot returned by dumps
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInfo {
    pub index: u32,
    pub direction: Option<Direction>,
    pub socket: bool,
    pub priority: u32,
    pub selector: Selector,
    pub action: Action,
    pub templates: Vec<Template>,
    pub lifetime: Lifetime,
    pub created_at: DateTime<Utc>,
    pub added_secs_ago: u64,
    pub used_secs_ago: Option<u64>,
    pub bundles: usize,
    pub dead: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfrm_common::{proto, AddressFamily};

    fn selector() -> Selector {
        Selector::any(AddressFamily::Inet).with_proto(proto::TCP)
    }

    #[test]
    fn test_direction_index_bits() {
        assert_eq!(Direction::from_index(8 | 1), Some((Direction::Out, false)));
        assert_eq!(Direction::from_index(16 | 2), Some((Direction::Fwd, false)));
        assert_eq!(Direction::from_index(8 | 4), Some((Direction::Out, true)));
        assert_eq!(Direction::from_index(8 | 7), None);
        assert_eq!(Direction::Fwd.socket_slot(), None);
    }

    #[test]
    fn test_block_drops_templates() {
        let spec = PolicySpec::block(selector(), 1).with_template(Template::transport(proto::ESP));
        let policy = Policy::new(spec);
        assert_eq!(policy.action(), &PolicyAction::Block);
        assert!(policy.templates().is_empty());
        assert_eq!(policy.spec().action, Action::Block);
    }

    #[test]
    fn test_kill_once() {
        let policy = Policy::new(PolicySpec::allow(selector(), 1));
        assert!(!policy.is_dead());
        assert!(policy.kill());
        assert!(!policy.kill());
        assert!(policy.is_dead());
    }

    #[test]
    fn test_duplicate_has_fresh_identity() {
        let policy = Policy::new(
            PolicySpec::allow(selector(), 7).with_template(Template::transport(proto::AH)),
        );
        policy.stamp_insert(8 | 1);
        let copy = policy.duplicate();
        assert_eq!(copy.index(), 0);
        assert_eq!(copy.priority(), 7);
        assert_eq!(copy.selector(), policy.selector());
        assert_eq!(copy.templates(), policy.templates());
    }

    #[test]
    fn test_lifetime_is_set() {
        assert!(!Lifetime::default().is_set());
        let zero = Lifetime {
            hard_add_expires: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(!zero.is_set());
        let soft = Lifetime {
            soft_use_expires: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert!(soft.is_set());
    }

    #[test]
    fn test_spec_from_json() {
        let json = r#"{
            "priority": 10,
            "selector": {
                "family": "Inet", "daddr": "10.0.0.0", "saddr": "0.0.0.0",
                "prefixlen_d": 8, "prefixlen_s": 0,
                "dport": 0, "dport_mask": 0, "sport": 0, "sport_mask": 0,
                "proto": 0, "ifindex": 0
            },
            "templates": [{ "proto": 50, "mode": "tunnel", "daddr": "192.0.2.1", "saddr": "192.0.2.2" }],
            "lifetime": { "hard_add_expires": 60 }
        }"#;
        let spec: PolicySpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.action, Action::Allow);
        assert_eq!(spec.templates[0].mode, crate::template::Mode::Tunnel);
        assert_eq!(spec.templates[0].algos, crate::template::ALL_ALGOS);
        assert_eq!(spec.lifetime.hard_add_expires, Some(Duration::from_secs(60)));
    }
}
