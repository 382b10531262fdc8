//! Selectors: the match half of a policy
//!
//! A zero prefix length, port mask, protocol or interface index means
//! "don't care". Two selectors are duplicates only when every field is equal.

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::{addr_to_u128, AddressFamily, FlowDescriptor, XfrmError, XfrmResult};

/// Policy match criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    /// Address family
    pub family: AddressFamily,
    /// Destination network address
    pub daddr: IpAddr,
    /// Source network address
    pub saddr: IpAddr,
    /// Destination prefix length
    pub prefixlen_d: u8,
    /// Source prefix length
    pub prefixlen_s: u8,
    /// Destination port
    pub dport: u16,
    /// Destination port mask
    pub dport_mask: u16,
    /// Source port
    pub sport: u16,
    /// Source port mask
    pub sport_mask: u16,
    /// Upper layer protocol, 0 = any
    pub proto: u8,
    /// Interface index, 0 = any
    pub ifindex: u32,
}

impl Selector {
    /// Selector matching every flow of a family
    pub const fn any(family: AddressFamily) -> Self {
        Self {
            family,
            daddr: family.unspecified(),
            saddr: family.unspecified(),
            prefixlen_d: 0,
            prefixlen_s: 0,
            dport: 0,
            dport_mask: 0,
            sport: 0,
            sport_mask: 0,
            proto: 0,
            ifindex: 0,
        }
    }

    /// Selector from source and destination networks
    pub fn from_networks(src: IpNetwork, dst: IpNetwork) -> XfrmResult<Self> {
        let family = AddressFamily::of(&src.ip());
        if family != AddressFamily::of(&dst.ip()) {
            return Err(XfrmError::InvalidSelector(format!(
                "source {src} and destination {dst} differ in family"
            )));
        }
        Ok(Self {
            daddr: dst.network(),
            saddr: src.network(),
            prefixlen_d: dst.prefix(),
            prefixlen_s: src.prefix(),
            ..Self::any(family)
        })
    }

    /// Match only this destination port
    pub fn with_dport(mut self, port: u16) -> Self {
        self.dport = port;
        self.dport_mask = if port == 0 { 0 } else { u16::MAX };
        self
    }

    /// Match only this source port
    pub fn with_sport(mut self, port: u16) -> Self {
        self.sport = port;
        self.sport_mask = if port == 0 { 0 } else { u16::MAX };
        self
    }

    /// Match only this upper layer protocol
    pub fn with_proto(mut self, proto: u8) -> Self {
        self.proto = proto;
        self
    }

    /// Match only this interface
    pub fn with_ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    /// Match against a flow
    #[inline]
    pub fn matches(&self, flow: &FlowDescriptor, family: AddressFamily) -> bool {
        if self.family != family || flow.family != family {
            return false;
        }

        if !prefix_matches(&flow.daddr, &self.daddr, self.prefixlen_d, family) {
            return false;
        }

        if !prefix_matches(&flow.saddr, &self.saddr, self.prefixlen_s, family) {
            return false;
        }

        if (flow.dport ^ self.dport) & self.dport_mask != 0 {
            return false;
        }

        if (flow.sport ^ self.sport) & self.sport_mask != 0 {
            return false;
        }

        if self.proto != 0 && flow.proto != self.proto {
            return false;
        }

        self.ifindex == 0 || flow.ifindex == self.ifindex
    }
}

#[inline]
fn prefix_matches(addr: &IpAddr, network: &IpAddr, prefix_len: u8, family: AddressFamily) -> bool {
    if prefix_len == 0 {
        return true;
    }
    let width = family.addr_bits();
    let (addr, network) = (addr_to_u128(addr), addr_to_u128(network));
    if prefix_len >= width {
        return addr == network;
    }
    let mask = (!0u128 >> (128 - width as u32)) & (!0u128 << (width - prefix_len) as u32);
    (addr & mask) == (network & mask)
}
