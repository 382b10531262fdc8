//! Per-family network operations and their registry

use parking_lot::RwLock;
use std::sync::Arc;

use xfrm_common::{AddressFamily, BuildError, FlowDescriptor, XfrmError, XfrmResult};

use crate::bundle::{BaseRoute, Bundle};
use crate::policy::Policy;
use crate::state::XfrmState;

/// Capability set one address family provides to the engine
pub trait FamilyOps: Send + Sync {
    /// Family served
    fn family(&self) -> AddressFamily;

    /// Decode the flow of a packet
    fn decode_session(&self, packet: &[u8]) -> XfrmResult<FlowDescriptor>;

    /// Route for the flow's destination
    fn lookup_base_route(&self, flow: &FlowDescriptor) -> XfrmResult<BaseRoute>;

    /// Cached bundle on `policy` usable for this flow and route
    fn find_cached_bundle(
        &self,
        policy: &Policy,
        flow: &FlowDescriptor,
        base_route: &BaseRoute,
    ) -> Option<Bundle>;

    /// Materialise a chain, one link per instance, on top of `base_route`
    fn build_bundle(
        &self,
        policy: &Policy,
        instances: Vec<Arc<XfrmState>>,
        flow: &FlowDescriptor,
        base_route: BaseRoute,
    ) -> Result<Bundle, BuildError>;
}

/// Fixed-size table of family operations
pub struct FamilyRegistry {
    slots: RwLock<[Option<Arc<dyn FamilyOps>>; AddressFamily::SLOTS]>,
}

impl FamilyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Default::default()),
        }
    }

    /// Register operations; one implementation per family
    pub fn register(&self, ops: Arc<dyn FamilyOps>) -> XfrmResult<()> {
        let family = ops.family();
        let mut slots = self.slots.write();
        let slot = &mut slots[family.slot()];
        if slot.is_some() {
            return Err(XfrmError::FamilyBusy(family));
        }
        *slot = Some(ops);
        tracing::info!(?family, "family operations registered");
        Ok(())
    }

    /// Remove a family's operations
    pub fn unregister(&self, family: AddressFamily) -> XfrmResult<Arc<dyn FamilyOps>> {
        let ops = self.slots.write()[family.slot()]
            .take()
            .ok_or(XfrmError::FamilyNotSupported(family))?;
        tracing::info!(?family, "family operations unregistered");
        Ok(ops)
    }

    /// Handle for one call; the lock is released before the caller uses it
    pub fn get(&self, family: AddressFamily) -> XfrmResult<Arc<dyn FamilyOps>> {
        self.slots.read()[family.slot()]
            .clone()
            .ok_or(XfrmError::FamilyNotSupported(family))
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
