//! Flow descriptors for policy lookup
//!
//! A flow descriptor is the tuple the engine matches selectors against. It is
//! either built directly by the caller or decoded from the IP header of a
//! packet.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{XfrmError, XfrmResult};

/// IP protocol numbers the decoder understands
pub mod proto {
    /// ICMP
    pub const ICMP: u8 = 1;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// DCCP
    pub const DCCP: u8 = 33;
    /// Encapsulating security payload
    pub const ESP: u8 = 50;
    /// Authentication header
    pub const AH: u8 = 51;
    /// ICMPv6
    pub const ICMPV6: u8 = 58;
    /// IP payload compression
    pub const COMP: u8 = 108;
    /// SCTP
    pub const SCTP: u8 = 132;
    /// UDP-Lite
    pub const UDPLITE: u8 = 136;
}

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum AddressFamily {
    /// IPv4
    Inet = 2,
    /// IPv6
    Inet6 = 10,
}

impl AddressFamily {
    /// Number of slots in per-family tables
    pub const SLOTS: usize = 2;

    /// Slot of this family in per-family tables
    #[inline(always)]
    pub const fn slot(self) -> usize {
        match self {
            Self::Inet => 0,
            Self::Inet6 => 1,
        }
    }

    /// Family of an address
    #[inline(always)]
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Inet,
            IpAddr::V6(_) => Self::Inet6,
        }
    }

    /// Address width in bits
    #[inline(always)]
    pub const fn addr_bits(self) -> u8 {
        match self {
            Self::Inet => 32,
            Self::Inet6 => 128,
        }
    }

    /// Unspecified address of this family
    pub const fn unspecified(self) -> IpAddr {
        match self {
            Self::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Address as an integer, IPv4 in the low 32 bits
#[inline(always)]
pub fn addr_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()) as u128,
        IpAddr::V6(v6) => u128::from_be_bytes(v6.octets()),
    }
}

/// One direction of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowDescriptor {
    /// Address family
    pub family: AddressFamily,
    /// Source address
    pub saddr: IpAddr,
    /// Destination address
    pub daddr: IpAddr,
    /// Source port (ICMP type for ICMP)
    pub sport: u16,
    /// Destination port (ICMP code for ICMP)
    pub dport: u16,
    /// Upper layer protocol
    pub proto: u8,
    /// Outgoing or incoming interface, 0 if unknown
    pub ifindex: u32,
}

impl FlowDescriptor {
    /// Create from an IPv4 tuple
    pub fn v4(saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16, proto: u8) -> Self {
        Self {
            family: AddressFamily::Inet,
            saddr: IpAddr::V4(saddr),
            daddr: IpAddr::V4(daddr),
            sport,
            dport,
            proto,
            ifindex: 0,
        }
    }

    /// Create from an IPv6 tuple
    pub fn v6(saddr: Ipv6Addr, daddr: Ipv6Addr, sport: u16, dport: u16, proto: u8) -> Self {
        Self {
            family: AddressFamily::Inet6,
            saddr: IpAddr::V6(saddr),
            daddr: IpAddr::V6(daddr),
            sport,
            dport,
            proto,
            ifindex: 0,
        }
    }

    /// Create from addresses of the same family
    pub fn new(saddr: IpAddr, daddr: IpAddr, sport: u16, dport: u16, proto: u8) -> XfrmResult<Self> {
        let family = AddressFamily::of(&saddr);
        if family != AddressFamily::of(&daddr) {
            return Err(XfrmError::MalformedPacket("mixed address families"));
        }
        Ok(Self {
            family,
            saddr,
            daddr,
            sport,
            dport,
            proto,
            ifindex: 0,
        })
    }

    /// Same flow bound to an interface
    pub fn with_ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    /// Reply direction of this flow
    pub fn reverse(&self) -> Self {
        Self {
            saddr: self.daddr,
            daddr: self.saddr,
            sport: self.dport,
            dport: self.sport,
            ..*self
        }
    }

    /// Decode the flow from a raw IP packet (no link layer header)
    pub fn decode(packet: &[u8]) -> XfrmResult<Self> {
        match packet.first().map(|b| b >> 4) {
            Some(4) => Self::decode_ipv4(packet),
            Some(6) => Self::decode_ipv6(packet),
            Some(_) => Err(XfrmError::MalformedPacket("unknown IP version")),
            None => Err(XfrmError::MalformedPacket("empty packet")),
        }
    }

    /// Decode an IPv4 header and the leading transport bytes
    pub fn decode_ipv4(data: &[u8]) -> XfrmResult<Self> {
        if data.len() < 20 {
            return Err(XfrmError::MalformedPacket("truncated IPv4 header"));
        }

        let ihl = ((data[0] & 0x0f) as usize) * 4;
        if ihl < 20 || data.len() < ihl {
            return Err(XfrmError::MalformedPacket("bad IPv4 header length"));
        }
        let frag_off = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
        let protocol = data[9];
        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

        // Only the first fragment carries transport ports
        let (sport, dport) = if frag_off == 0 {
            transport_ports(protocol, &data[ihl..])
        } else {
            (0, 0)
        };

        Ok(Self::v4(src, dst, sport, dport, protocol))
    }

    /// Decode an IPv6 header and the leading transport bytes
    pub fn decode_ipv6(data: &[u8]) -> XfrmResult<Self> {
        if data.len() < 40 {
            return Err(XfrmError::MalformedPacket("truncated IPv6 header"));
        }

        let protocol = data[6];
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);

        let (sport, dport) = transport_ports(protocol, &data[40..]);

        Ok(Self::v6(
            Ipv6Addr::from(src),
            Ipv6Addr::from(dst),
            sport,
            dport,
            protocol,
        ))
    }
}

fn transport_ports(protocol: u8, l4: &[u8]) -> (u16, u16) {
    match protocol {
        proto::TCP | proto::UDP | proto::UDPLITE | proto::SCTP | proto::DCCP if l4.len() >= 4 => (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        ),
        proto::ICMP | proto::ICMPV6 if l4.len() >= 2 => (l4[0] as u16, l4[1] as u16),
        _ => (0, 0),
    }
}
