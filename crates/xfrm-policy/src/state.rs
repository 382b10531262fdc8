//! Security association contract
//!
//! The engine never negotiates keys. It asks a [`StateStore`] for an
//! association matching a template and reacts to one of three outcomes.
//! Negotiation progress is observed later through [`NegotiationWaker`].

use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use xfrm_common::{AddressFamily, FlowDescriptor};

use crate::template::{Mode, Template};

/// Association identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StateId {
    /// Remote endpoint
    pub daddr: IpAddr,
    /// Security parameter index
    pub spi: u32,
    /// Transform protocol
    pub proto: u8,
}

impl StateId {
    /// Create identity
    pub const fn new(daddr: IpAddr, spi: u32, proto: u8) -> Self {
        Self { daddr, spi, proto }
    }
}

/// Association negotiation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum StateStatus {
    /// Negotiation requested, keys not yet installed
    Acquire = 0,
    /// Usable
    Valid = 1,
    /// Negotiation failed
    Error = 2,
    /// Lifetime ran out
    Expired = 3,
    /// Removed from the store
    Dead = 4,
}

impl StateStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Acquire,
            1 => Self::Valid,
            2 => Self::Error,
            3 => Self::Expired,
            _ => Self::Dead,
        }
    }
}

/// Concrete transform instance
#[derive(Debug)]
pub struct XfrmState {
    /// Identity
    pub id: StateId,
    /// Local endpoint
    pub saddr: IpAddr,
    /// Encapsulation mode
    pub mode: Mode,
    /// Request id
    pub reqid: u32,
    /// Algorithm id, bit position in template masks
    pub algo: u8,
    /// Header bytes added per packet
    pub header_len: u32,
    /// Trailer bytes added per packet
    pub trailer_len: u32,
    status: AtomicU8,
}

impl XfrmState {
    /// New valid association
    pub fn new(id: StateId, saddr: IpAddr, mode: Mode) -> Self {
        Self {
            id,
            saddr,
            mode,
            reqid: 0,
            algo: 0,
            header_len: 0,
            trailer_len: 0,
            status: AtomicU8::new(StateStatus::Valid as u8),
        }
    }

    /// Set request id
    pub fn with_reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    /// Set algorithm id
    pub fn with_algo(mut self, algo: u8) -> Self {
        self.algo = algo;
        self
    }

    /// Set per-packet overhead
    pub fn with_overhead(mut self, header_len: u32, trailer_len: u32) -> Self {
        self.header_len = header_len;
        self.trailer_len = trailer_len;
        self
    }

    /// Set initial status
    pub fn with_status(self, status: StateStatus) -> Self {
        self.status.store(status as u8, Ordering::Release);
        self
    }

    /// Current status
    #[inline]
    pub fn status(&self) -> StateStatus {
        StateStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Change status
    pub fn set_status(&self, status: StateStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Usable for traffic
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.status() == StateStatus::Valid
    }

    /// Family of the outer header
    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.id.daddr)
    }
}

/// Outcome of an association query
#[derive(Debug, Clone)]
pub enum StateLookup {
    /// Usable association
    Valid(Arc<XfrmState>),
    /// Association exists, negotiation not finished
    Pending(Arc<XfrmState>),
    /// Nothing matches
    Absent,
}

/// External association store
pub trait StateStore: Send + Sync {
    /// Find an association for `template` between `remote` and `local`.
    ///
    /// Must not block beyond local computation.
    fn find_instance(
        &self,
        remote: IpAddr,
        local: IpAddr,
        flow: &FlowDescriptor,
        template: &Template,
    ) -> StateLookup;
}

/// Wakes lookups waiting for negotiation results
#[derive(Debug, Clone, Default)]
pub struct NegotiationWaker(Arc<Notify>);

impl NegotiationWaker {
    /// Create waker
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiting lookup
    pub fn wake(&self) {
        self.0.notify_waiters();
    }

    pub(crate) fn notified(&self) -> Notified<'_> {
        self.0.notified()
    }
}

struct StoredState {
    seq: u64,
    state: Arc<XfrmState>,
}

/// In-memory association store
pub struct MemoryStateStore {
    states: DashMap<StateId, StoredState>,
    seq: AtomicU64,
    waker: NegotiationWaker,
}

impl MemoryStateStore {
    /// Create store that wakes `waker` on every status change
    pub fn new(waker: NegotiationWaker) -> Self {
        Self {
            states: DashMap::new(),
            seq: AtomicU64::new(0),
            waker,
        }
    }

    /// Add or replace an association
    pub fn add(&self, state: XfrmState) -> Arc<XfrmState> {
        let state = Arc::new(state);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = self.states.insert(
            state.id,
            StoredState {
                seq,
                state: Arc::clone(&state),
            },
        ) {
            old.state.set_status(StateStatus::Dead);
        }
        tracing::debug!(spi = state.id.spi, status = ?state.status(), "association added");
        self.waker.wake();
        state
    }

    /// Finish negotiation of a pending association
    pub fn promote(&self, id: &StateId) -> bool {
        self.transition(id, StateStatus::Valid)
    }

    /// Mark an association expired
    pub fn expire(&self, id: &StateId) -> bool {
        self.transition(id, StateStatus::Expired)
    }

    /// Mark an association failed
    pub fn fail(&self, id: &StateId) -> bool {
        self.transition(id, StateStatus::Error)
    }

    /// Remove an association
    pub fn remove(&self, id: &StateId) -> Option<Arc<XfrmState>> {
        let (_, stored) = self.states.remove(id)?;
        stored.state.set_status(StateStatus::Dead);
        self.waker.wake();
        Some(stored.state)
    }

    /// Get an association
    pub fn get(&self, id: &StateId) -> Option<Arc<XfrmState>> {
        self.states.get(id).map(|s| Arc::clone(&s.state))
    }

    /// Number of associations
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn transition(&self, id: &StateId, status: StateStatus) -> bool {
        let Some(stored) = self.states.get(id) else {
            return false;
        };
        stored.state.set_status(status);
        drop(stored);
        tracing::debug!(spi = id.spi, ?status, "association transition");
        self.waker.wake();
        true
    }
}

impl StateStore for MemoryStateStore {
    fn find_instance(
        &self,
        remote: IpAddr,
        local: IpAddr,
        _flow: &FlowDescriptor,
        template: &Template,
    ) -> StateLookup {
        let mut valid: Option<(u64, Arc<XfrmState>)> = None;
        let mut pending: Option<Arc<XfrmState>> = None;

        for entry in self.states.iter() {
            let state = &entry.state;
            if state.id.daddr != remote || state.saddr != local || !template.accepts(state) {
                continue;
            }
            match state.status() {
                // Newest valid association wins
                StateStatus::Valid if valid.as_ref().map_or(true, |(seq, _)| entry.seq > *seq) => {
                    valid = Some((entry.seq, Arc::clone(state)));
                }
                StateStatus::Acquire => pending = Some(Arc::clone(state)),
                _ => {}
            }
        }

        match (valid, pending) {
            (Some((_, state)), _) => StateLookup::Valid(state),
            (None, Some(state)) => StateLookup::Pending(state),
            (None, None) => StateLookup::Absent,
        }
    }
}
