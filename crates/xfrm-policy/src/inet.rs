//! IPv4/IPv6 family operations with a static longest-prefix route table

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

use xfrm_common::{AddressFamily, BuildError, FlowDescriptor, XfrmError, XfrmResult};

use crate::bundle::{BaseRoute, Bundle, BundleLink};
use crate::family::FamilyOps;
use crate::policy::Policy;
use crate::state::XfrmState;
use crate::template::Mode;

/// Route table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination network
    pub destination: IpNetwork,
    /// Next hop
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    /// Preferred source address
    pub src: IpAddr,
    /// Output interface
    #[serde(default)]
    pub ifindex: u32,
    /// Path MTU
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

fn default_mtu() -> u32 {
    1500
}

/// Family operations for one IP family
pub struct InetFamily {
    family: AddressFamily,
    routes: RwLock<Vec<RouteEntry>>,
}

impl InetFamily {
    /// Family without routes
    pub fn new(family: AddressFamily) -> Self {
        Self {
            family,
            routes: RwLock::new(Vec::new()),
        }
    }

    /// Add a route; entries of another family are rejected
    pub fn add_route(&self, entry: RouteEntry) -> XfrmResult<()> {
        if AddressFamily::of(&entry.destination.ip()) != self.family {
            return Err(XfrmError::Config(format!(
                "route {} does not belong to {:?}",
                entry.destination, self.family
            )));
        }
        tracing::debug!(destination = %entry.destination, "route added");
        self.routes.write().push(entry);
        Ok(())
    }

    /// Remove routes for a destination network
    pub fn remove_route(&self, destination: &IpNetwork) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|r| &r.destination != destination);
        before - routes.len()
    }

    /// Longest-prefix match
    pub fn route_to(&self, dst: IpAddr) -> Option<BaseRoute> {
        let routes = self.routes.read();
        let entry = routes
            .iter()
            .filter(|r| r.destination.contains(dst))
            .max_by_key(|r| r.destination.prefix())?;
        Some(BaseRoute {
            dst,
            src: entry.src,
            gateway: entry.gateway,
            ifindex: entry.ifindex,
            mtu: entry.mtu,
        })
    }
}

impl FamilyOps for InetFamily {
    fn family(&self) -> AddressFamily {
        self.family
    }

    fn decode_session(&self, packet: &[u8]) -> XfrmResult<FlowDescriptor> {
        let flow = match self.family {
            AddressFamily::Inet => FlowDescriptor::decode_ipv4(packet)?,
            AddressFamily::Inet6 => FlowDescriptor::decode_ipv6(packet)?,
        };
        Ok(flow)
    }

    fn lookup_base_route(&self, flow: &FlowDescriptor) -> XfrmResult<BaseRoute> {
        self.route_to(flow.daddr)
            .ok_or(XfrmError::Build(BuildError::NoRoute(flow.daddr)))
    }

    fn find_cached_bundle(
        &self,
        policy: &Policy,
        flow: &FlowDescriptor,
        base_route: &BaseRoute,
    ) -> Option<Bundle> {
        policy.find_bundle(|b| {
            b.flow().daddr == flow.daddr && b.flow().saddr == flow.saddr && b.route() == base_route
        })
    }

    fn build_bundle(
        &self,
        _policy: &Policy,
        instances: Vec<Arc<XfrmState>>,
        flow: &FlowDescriptor,
        base_route: BaseRoute,
    ) -> Result<Bundle, BuildError> {
        if flow.family != self.family {
            return Err(BuildError::FamilyMismatch);
        }

        let mut route = base_route.clone();
        let mut overhead = 0u32;
        let mut links = Vec::with_capacity(instances.len());

        for state in instances {
            if !state.is_valid() {
                return Err(BuildError::StaleState(state.id.spi));
            }
            // Tunnel links leave towards the tunnel endpoint
            if state.mode == Mode::Tunnel && state.id.daddr != route.dst {
                if state.family() != self.family {
                    return Err(BuildError::FamilyMismatch);
                }
                route = self
                    .route_to(state.id.daddr)
                    .ok_or(BuildError::NoRoute(state.id.daddr))?;
            }
            overhead = overhead
                .checked_add(state.header_len)
                .and_then(|o| o.checked_add(state.trailer_len))
                .ok_or(BuildError::MtuExceeded {
                    overhead: u32::MAX,
                    mtu: route.mtu,
                })?;
            links.push(BundleLink::new(state, route.clone()));
        }

        if overhead >= route.mtu {
            return Err(BuildError::MtuExceeded {
                overhead,
                mtu: route.mtu,
            });
        }

        Ok(Bundle::new(*flow, base_route, links))
    }
}
