//! Bundles: resolved transform chains stacked on a base route

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;

use xfrm_common::FlowDescriptor;

use crate::state::XfrmState;

/// Route a flow takes before any transform is applied
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseRoute {
    /// Destination the route was resolved for
    pub dst: IpAddr,
    /// Preferred source address
    pub src: IpAddr,
    /// Next hop, `None` for directly connected destinations
    pub gateway: Option<IpAddr>,
    /// Output interface
    pub ifindex: u32,
    /// Path MTU
    pub mtu: u32,
}

impl BaseRoute {
    /// Directly connected route
    pub fn new(dst: IpAddr, src: IpAddr, ifindex: u32, mtu: u32) -> Self {
        Self {
            dst,
            src,
            gateway: None,
            ifindex,
            mtu,
        }
    }

    /// Route through a gateway
    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }
}

/// One transform applied on one route
#[derive(Debug)]
pub struct BundleLink {
    state: Arc<XfrmState>,
    route: BaseRoute,
}

impl BundleLink {
    /// Link carrying `state` over `route`
    pub fn new(state: Arc<XfrmState>, route: BaseRoute) -> Self {
        Self { state, route }
    }

    /// Association applied by this link
    pub fn state(&self) -> &Arc<XfrmState> {
        &self.state
    }

    /// Route the transformed packet takes
    pub fn route(&self) -> &BaseRoute {
        &self.route
    }

    /// Header plus trailer bytes
    pub fn overhead(&self) -> u32 {
        self.state.header_len.saturating_add(self.state.trailer_len)
    }
}

#[derive(Debug)]
struct BundleInner {
    flow: FlowDescriptor,
    route: BaseRoute,
    links: Vec<BundleLink>,
    created: Instant,
}

/// Cached transform chain; cloning shares the chain
#[derive(Debug, Clone)]
pub struct Bundle(Arc<BundleInner>);

impl Bundle {
    /// Assemble a bundle for `flow` over `route`
    pub fn new(flow: FlowDescriptor, route: BaseRoute, links: Vec<BundleLink>) -> Self {
        Self(Arc::new(BundleInner {
            flow,
            route,
            links,
            created: Instant::now(),
        }))
    }

    /// Flow the bundle was built for
    pub fn flow(&self) -> &FlowDescriptor {
        &self.0.flow
    }

    /// Base route under the chain
    pub fn route(&self) -> &BaseRoute {
        &self.0.route
    }

    /// Links, first applied first
    pub fn links(&self) -> &[BundleLink] {
        &self.0.links
    }

    /// Number of transforms
    pub fn len(&self) -> usize {
        self.0.links.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.links.is_empty()
    }

    /// Route the outermost packet leaves on
    pub fn outer_route(&self) -> &BaseRoute {
        self.0.links.last().map_or(&self.0.route, BundleLink::route)
    }

    /// Total per-packet overhead
    pub fn overhead(&self) -> u32 {
        self.0
            .links
            .iter()
            .fold(0u32, |total, link| total.saturating_add(link.overhead()))
    }

    /// MTU left for the inner packet
    pub fn mtu(&self) -> u32 {
        self.outer_route().mtu.saturating_sub(self.overhead())
    }

    /// Every link's association is still usable
    pub fn is_valid(&self) -> bool {
        self.0.links.iter().all(|l| l.state.is_valid())
    }

    /// Time since assembly
    pub fn age(&self) -> std::time::Duration {
        self.0.created.elapsed()
    }

    /// Same shared chain
    pub fn ptr_eq(&self, other: &Bundle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
