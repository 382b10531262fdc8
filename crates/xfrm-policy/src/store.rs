//! Policy store: priority-ordered per-direction lists and per-socket slots
//!
//! Every list and slot lives under one `RwLock`. Lookups take the read side
//! and clone the matching `Arc` out before the guard is released, so a
//! policy unlinked concurrently stays alive for the caller that found it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use xfrm_common::{AddressFamily, FlowDescriptor, Selector, XfrmError, XfrmResult};

use crate::policy::{Direction, Policy, POLICY_MAX};

/// Socket slot count (`In`, `Out`)
const SOCKET_SLOTS: usize = 2;

/// Opaque socket identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketId(pub u64);

type SocketSlots = [Option<Arc<Policy>>; SOCKET_SLOTS];

#[derive(Default)]
struct Tables {
    lists: [Vec<Arc<Policy>>; POLICY_MAX],
    sockets: HashMap<SocketId, SocketSlots>,
    next_index: u32,
}

impl Tables {
    fn index_in_use(&self, index: u32) -> bool {
        self.lists.iter().flatten().any(|p| p.index() == index)
            || self
                .sockets
                .values()
                .flatten()
                .flatten()
                .any(|p| p.index() == index)
    }

    /// Fresh index carrying `dir_bits` in its low three bits
    fn gen_index(&mut self, dir_bits: u32) -> u32 {
        loop {
            let mut index = self.next_index | dir_bits;
            self.next_index = self.next_index.wrapping_add(8);
            if index == 0 {
                index = 8;
            }
            if !self.index_in_use(index) {
                return index;
            }
        }
    }
}

/// Policy store
pub struct PolicyStore {
    tables: RwLock<Tables>,
    /// Bumped on every change, lookups compare it to detect restarts
    generation: AtomicU64,
}

impl PolicyStore {
    /// Create empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Current invalidation generation
    #[inline(always)]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Link `policy` into `dir`.
    ///
    /// A policy with an identical selector is unlinked and returned; its
    /// index carries over. With `exclusive` the collision is an error and
    /// the store is left untouched.
    pub fn insert(
        &self,
        policy: Arc<Policy>,
        dir: Direction,
        exclusive: bool,
    ) -> XfrmResult<Option<Arc<Policy>>> {
        let mut tables = self.tables.write();
        // Indices are only stamped under this lock
        if policy.index() != 0 || policy.is_dead() {
            return Err(XfrmError::AlreadyLinked);
        }
        let list = &tables.lists[dir.slot()];

        let existing = list.iter().position(|p| p.selector() == policy.selector());
        if existing.is_some() && exclusive {
            return Err(XfrmError::AlreadyExists);
        }
        let replaced = existing.map(|pos| tables.lists[dir.slot()].remove(pos));

        let index = match &replaced {
            Some(old) => old.index(),
            None => tables.gen_index(dir as u32),
        };
        policy.stamp_insert(index);

        let list = &mut tables.lists[dir.slot()];
        let pos = list
            .iter()
            .position(|p| p.priority() > policy.priority())
            .unwrap_or(list.len());
        tracing::debug!(index, ?dir, priority = policy.priority(), replaced = replaced.is_some(), "policy linked");
        list.insert(pos, policy);
        drop(tables);

        self.bump();
        Ok(replaced)
    }

    /// Find a policy by exact selector, optionally unlinking it
    pub fn find_by_selector(
        &self,
        dir: Direction,
        selector: &Selector,
        remove: bool,
    ) -> Option<Arc<Policy>> {
        if !remove {
            return self.tables.read().lists[dir.slot()]
                .iter()
                .find(|p| p.selector() == selector)
                .cloned();
        }

        let mut tables = self.tables.write();
        let list = &mut tables.lists[dir.slot()];
        let pos = list.iter().position(|p| p.selector() == selector)?;
        let policy = list.remove(pos);
        drop(tables);
        self.bump();
        Some(policy)
    }

    /// Find a global policy by index, optionally unlinking it
    pub fn find_by_id(&self, index: u32, remove: bool) -> Option<Arc<Policy>> {
        let (dir, false) = Direction::from_index(index)? else {
            return None;
        };

        if !remove {
            return self.tables.read().lists[dir.slot()]
                .iter()
                .find(|p| p.index() == index)
                .cloned();
        }

        let mut tables = self.tables.write();
        let list = &mut tables.lists[dir.slot()];
        let pos = list.iter().position(|p| p.index() == index)?;
        let policy = list.remove(pos);
        drop(tables);
        self.bump();
        Some(policy)
    }

    /// Unlink this exact policy wherever it is linked; false if it already
    /// left the store
    pub fn unlink(&self, policy: &Arc<Policy>) -> bool {
        let Some((dir, socket)) = Direction::from_index(policy.index()) else {
            return false;
        };

        let mut tables = self.tables.write();
        let removed = if socket {
            dir.socket_slot().is_some_and(|slot| {
                let mut emptied = None;
                let found = tables.sockets.iter_mut().any(|(sock, slots)| {
                    let hit = slots[slot].as_ref().is_some_and(|p| Arc::ptr_eq(p, policy));
                    if hit {
                        slots[slot] = None;
                        if slots.iter().all(Option::is_none) {
                            emptied = Some(*sock);
                        }
                    }
                    hit
                });
                if let Some(sock) = emptied {
                    tables.sockets.remove(&sock);
                }
                found
            })
        } else {
            let list = &mut tables.lists[dir.slot()];
            match list.iter().position(|p| Arc::ptr_eq(p, policy)) {
                Some(pos) => {
                    list.remove(pos);
                    true
                }
                None => false,
            }
        };
        drop(tables);

        if removed {
            self.bump();
        }
        removed
    }

    /// Unlink every global policy
    pub fn flush_all(&self) -> Vec<Arc<Policy>> {
        let mut tables = self.tables.write();
        let removed: Vec<_> = tables.lists.iter_mut().flat_map(std::mem::take).collect();
        drop(tables);
        self.bump();
        tracing::debug!(count = removed.len(), "policy store flushed");
        removed
    }

    /// Visit a snapshot of every global policy without holding the lock
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Policy>)) -> XfrmResult<()> {
        let snapshot: Vec<_> = self.tables.read().lists.iter().flatten().cloned().collect();
        if snapshot.is_empty() {
            return Err(XfrmError::Empty);
        }
        snapshot.iter().for_each(|p| visitor(p));
        Ok(())
    }

    /// Policies of one direction in match order
    pub fn policies(&self, dir: Direction) -> Vec<Arc<Policy>> {
        self.tables.read().lists[dir.slot()].clone()
    }

    /// First policy in match order whose selector matches
    #[inline]
    pub fn lookup_best(
        &self,
        dir: Direction,
        flow: &FlowDescriptor,
        family: AddressFamily,
    ) -> Option<Arc<Policy>> {
        self.tables.read().lists[dir.slot()]
            .iter()
            .find(|p| p.selector().matches(flow, family))
            .cloned()
    }

    /// Socket override for `dir` if it matches the flow
    pub fn socket_lookup(
        &self,
        sock: SocketId,
        dir: Direction,
        flow: &FlowDescriptor,
        family: AddressFamily,
    ) -> Option<Arc<Policy>> {
        let slot = dir.socket_slot()?;
        self.tables
            .read()
            .sockets
            .get(&sock)?
            .get(slot)?
            .as_ref()
            .filter(|p| p.selector().matches(flow, family))
            .cloned()
    }

    /// Set or clear a socket slot, returning the previous occupant
    pub fn socket_insert(
        &self,
        sock: SocketId,
        dir: Direction,
        policy: Option<Arc<Policy>>,
    ) -> XfrmResult<Option<Arc<Policy>>> {
        let slot = dir.socket_slot().ok_or(XfrmError::InvalidDirection)?;
        let mut tables = self.tables.write();

        let old = match policy {
            Some(policy) => {
                if policy.index() != 0 || policy.is_dead() {
                    return Err(XfrmError::AlreadyLinked);
                }
                let index = tables.gen_index(3 + slot as u32);
                policy.stamp_insert(index);
                tracing::debug!(index, ?dir, socket = sock.0, "socket policy linked");
                tables.sockets.entry(sock).or_default()[slot].replace(policy)
            }
            None => {
                let Some(slots) = tables.sockets.get_mut(&sock) else {
                    return Ok(None);
                };
                let old = slots[slot].take();
                if slots.iter().all(Option::is_none) {
                    tables.sockets.remove(&sock);
                }
                old
            }
        };
        drop(tables);

        self.bump();
        Ok(old)
    }

    /// Drop both slots of a socket
    pub fn socket_detach(&self, sock: SocketId) -> Vec<Arc<Policy>> {
        let Some(slots) = self.tables.write().sockets.remove(&sock) else {
            return Vec::new();
        };
        self.bump();
        slots.into_iter().flatten().collect()
    }

    /// Current slots of a socket, `In` then `Out`
    pub fn socket_policies(&self, sock: SocketId) -> [Option<Arc<Policy>>; SOCKET_SLOTS] {
        self.tables
            .read()
            .sockets
            .get(&sock)
            .cloned()
            .unwrap_or_default()
    }

    /// Wait until every reader that entered before this call has left
    pub fn read_barrier(&self) {
        drop(self.tables.write());
    }

    /// Number of policies in a direction
    pub fn len(&self, dir: Direction) -> usize {
        self.tables.read().lists[dir.slot()].len()
    }

    /// Total number of global policies
    pub fn total(&self) -> usize {
        self.tables.read().lists.iter().map(Vec::len).sum()
    }

    /// No global policies
    pub fn is_empty(&self) -> bool {
        self.tables.read().lists.iter().all(Vec::is_empty)
    }

    /// Number of sockets carrying overrides
    pub fn socket_count(&self) -> usize {
        self.tables.read().sockets.len()
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicySpec;
    use ipnetwork::IpNetwork;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};
    use xfrm_common::proto;

    fn flow() -> FlowDescriptor {
        FlowDescriptor::v4(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(10, 1, 2, 3),
            40000,
            443,
            proto::TCP,
        )
    }

    /// Selector on 10.1.2.3/`prefix`, all of them match `flow()`
    fn selector(prefix: u8) -> Selector {
        let any: IpNetwork = "0.0.0.0/0".parse().unwrap();
        let dst = IpNetwork::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), prefix).unwrap();
        Selector::from_networks(any, dst).unwrap()
    }

    fn policy(prefix: u8, priority: u32) -> Arc<Policy> {
        Policy::new(PolicySpec::allow(selector(prefix), priority))
    }

    #[test]
    fn test_insert_generates_direction_indices() {
        let store = PolicyStore::new();
        for dir in Direction::ALL {
            store.insert(policy(8, 1), dir, false).unwrap();
        }
        for dir in Direction::ALL {
            let p = &store.policies(dir)[0];
            assert_eq!(p.direction(), Some(dir));
            assert!(!p.is_socket_policy());
            assert_ne!(p.index(), 0);
        }
        assert_eq!(store.total(), 3);
    }

    #[test]
    fn test_exclusive_insert_leaves_store_unchanged() {
        let store = PolicyStore::new();
        let first = policy(16, 10);
        store.insert(Arc::clone(&first), Direction::Out, false).unwrap();
        let generation = store.generation();

        let result = store.insert(policy(16, 1), Direction::Out, true);
        assert!(matches!(result, Err(XfrmError::AlreadyExists)));
        assert_eq!(store.generation(), generation);
        assert_eq!(store.len(Direction::Out), 1);
        assert!(Arc::ptr_eq(&store.policies(Direction::Out)[0], &first));
    }

    #[test]
    fn test_linked_policy_rejected_once_linked() {
        let store = PolicyStore::new();
        let shared = policy(16, 1);
        let barrier = std::sync::Barrier::new(2);

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = [Direction::In, Direction::Out]
                .into_iter()
                .map(|dir| {
                    let (store, shared, barrier) = (&store, &shared, &barrier);
                    s.spawn(move || {
                        barrier.wait();
                        store.insert(Arc::clone(shared), dir, false)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(XfrmError::AlreadyLinked))));
        assert_eq!(store.total(), 1);

        let generation = store.generation();
        assert!(matches!(
            store.socket_insert(SocketId(1), Direction::Out, Some(Arc::clone(&shared))),
            Err(XfrmError::AlreadyLinked)
        ));
        assert_eq!(store.socket_count(), 0);
        assert_eq!(store.generation(), generation);
    }

    #[test]
    fn test_replace_keeps_index() {
        let store = PolicyStore::new();
        let first = policy(16, 10);
        store.insert(Arc::clone(&first), Direction::Out, false).unwrap();
        let index = first.index();

        let second = policy(16, 5);
        let replaced = store.insert(Arc::clone(&second), Direction::Out, false).unwrap();
        assert!(Arc::ptr_eq(&replaced.unwrap(), &first));
        assert_eq!(second.index(), index);
        assert_eq!(store.len(Direction::Out), 1);
        assert!(!store.unlink(&first));
    }

    #[test]
    fn test_find_and_remove() {
        let store = PolicyStore::new();
        let p = policy(24, 1);
        store.insert(Arc::clone(&p), Direction::Fwd, false).unwrap();

        assert!(store.find_by_selector(Direction::Out, &selector(24), false).is_none());
        assert!(store.find_by_selector(Direction::Fwd, &selector(24), false).is_some());
        assert!(Arc::ptr_eq(&store.find_by_id(p.index(), false).unwrap(), &p));
        // Socket bits never address the global lists
        assert!(store.find_by_id((p.index() & !7) | 3, false).is_none());

        let generation = store.generation();
        assert!(store.find_by_id(p.index(), true).is_some());
        assert!(store.generation() > generation);
        assert!(store.find_by_id(p.index(), true).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_for_each_and_flush() {
        let store = PolicyStore::new();
        assert!(matches!(store.for_each(|_| {}), Err(XfrmError::Empty)));

        store.insert(policy(8, 1), Direction::In, false).unwrap();
        store.insert(policy(8, 1), Direction::Out, false).unwrap();
        let mut seen = 0;
        store.for_each(|_| seen += 1).unwrap();
        assert_eq!(seen, 2);

        assert_eq!(store.flush_all().len(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_socket_slots() {
        let store = PolicyStore::new();
        let sock = SocketId(7);
        assert!(matches!(
            store.socket_insert(sock, Direction::Fwd, Some(policy(0, 0))),
            Err(XfrmError::InvalidDirection)
        ));

        let out = policy(32, 0);
        assert!(store.socket_insert(sock, Direction::Out, Some(Arc::clone(&out))).unwrap().is_none());
        assert!(out.is_socket_policy());
        assert_eq!(out.direction(), Some(Direction::Out));
        assert!(store.socket_lookup(sock, Direction::Out, &flow(), AddressFamily::Inet).is_some());
        assert!(store.socket_lookup(sock, Direction::In, &flow(), AddressFamily::Inet).is_none());
        assert!(store.socket_lookup(SocketId(8), Direction::Out, &flow(), AddressFamily::Inet).is_none());

        // Global lookups never see socket policies
        assert!(store.lookup_best(Direction::Out, &flow(), AddressFamily::Inet).is_none());

        let newer = policy(32, 0);
        let old = store.socket_insert(sock, Direction::Out, Some(newer)).unwrap();
        assert!(Arc::ptr_eq(&old.unwrap(), &out));

        assert_eq!(store.socket_detach(sock).len(), 1);
        assert_eq!(store.socket_count(), 0);
        assert!(store.socket_detach(sock).is_empty());
    }

    #[test]
    fn test_unlink_socket_policy() {
        let store = PolicyStore::new();
        let sock = SocketId(1);
        let p = policy(0, 0);
        store.socket_insert(sock, Direction::In, Some(Arc::clone(&p))).unwrap();
        assert!(store.unlink(&p));
        assert_eq!(store.socket_count(), 0);
        assert!(!store.unlink(&p));
    }

    #[test]
    fn test_lookup_respects_family() {
        let store = PolicyStore::new();
        store.insert(policy(0, 0), Direction::Out, false).unwrap();
        assert!(store.lookup_best(Direction::Out, &flow(), AddressFamily::Inet).is_some());
        assert!(store.lookup_best(Direction::Out, &flow(), AddressFamily::Inet6).is_none());
    }

    proptest! {
        #[test]
        fn prop_lookup_returns_first_lowest_priority(priorities in prop::collection::vec(0u32..5, 1..33)) {
            let store = PolicyStore::new();
            let policies: Vec<_> = priorities
                .iter()
                .enumerate()
                .map(|(i, &prio)| policy(i as u8, prio))
                .collect();
            for p in &policies {
                store.insert(Arc::clone(p), Direction::Out, false).unwrap();
            }

            let min = *priorities.iter().min().unwrap();
            let first = priorities.iter().position(|&p| p == min).unwrap();
            let best = store.lookup_best(Direction::Out, &flow(), AddressFamily::Inet).unwrap();
            prop_assert!(Arc::ptr_eq(&best, &policies[first]));

            let order: Vec<u32> = store.policies(Direction::Out).iter().map(|p| p.priority()).collect();
            prop_assert!(order.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
