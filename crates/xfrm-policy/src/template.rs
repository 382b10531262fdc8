//! Transform templates

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use xfrm_common::proto;

use crate::state::XfrmState;

/// Algorithm mask accepting any algorithm
pub const ALL_ALGOS: u32 = u32::MAX;

/// Encapsulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Protect the payload of the original packet
    #[default]
    Transport,
    /// Wrap the whole packet in a new outer header
    Tunnel,
}

/// One step of a transform chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Template {
    /// Transform protocol (ESP, AH, IPCOMP)
    pub proto: u8,
    /// Fixed security parameter index
    #[serde(default)]
    pub spi: Option<u32>,
    /// Fixed tunnel remote endpoint
    #[serde(default)]
    pub daddr: Option<IpAddr>,
    /// Fixed tunnel local endpoint
    #[serde(default)]
    pub saddr: Option<IpAddr>,
    /// Chain may go without this step
    #[serde(default)]
    pub optional: bool,
    /// Encapsulation mode
    #[serde(default)]
    pub mode: Mode,
    /// Accepted algorithms, one bit per algorithm id
    #[serde(default = "all_algos")]
    pub algos: u32,
    /// Request id correlating with negotiation
    #[serde(default)]
    pub reqid: u32,
}

fn all_algos() -> u32 {
    ALL_ALGOS
}

impl Template {
    /// Transport mode template for a protocol
    pub fn transport(proto: u8) -> Self {
        Self {
            proto,
            spi: None,
            daddr: None,
            saddr: None,
            optional: false,
            mode: Mode::Transport,
            algos: ALL_ALGOS,
            reqid: 0,
        }
    }

    /// Tunnel mode template between fixed endpoints
    pub fn tunnel(proto: u8, saddr: IpAddr, daddr: IpAddr) -> Self {
        Self {
            saddr: Some(saddr),
            daddr: Some(daddr),
            mode: Mode::Tunnel,
            ..Self::transport(proto)
        }
    }

    /// Mark the step optional
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Pin the security parameter index
    pub fn with_spi(mut self, spi: u32) -> Self {
        self.spi = Some(spi);
        self
    }

    /// Set the request id
    pub fn with_reqid(mut self, reqid: u32) -> Self {
        self.reqid = reqid;
        self
    }

    /// Restrict accepted algorithms
    pub fn with_algos(mut self, algos: u32) -> Self {
        self.algos = algos;
        self
    }

    /// Whether an association satisfies this template
    pub fn accepts(&self, state: &XfrmState) -> bool {
        if state.id.proto != self.proto || state.mode != self.mode {
            return false;
        }
        if self.spi.is_some_and(|spi| spi != state.id.spi) {
            return false;
        }
        if self.reqid != 0 && self.reqid != state.reqid {
            return false;
        }
        if !self.accepts_algo(state.algo) {
            return false;
        }
        match self.mode {
            Mode::Transport => true,
            Mode::Tunnel => {
                self.daddr.map_or(true, |d| d == state.id.daddr)
                    && self.saddr.map_or(true, |s| s == state.saddr)
            }
        }
    }

    fn accepts_algo(&self, algo: u8) -> bool {
        // IPCOMP carries no authentication/encryption algorithm choice
        if self.algos == ALL_ALGOS || !matches!(self.proto, proto::ESP | proto::AH) {
            return true;
        }
        1u32.checked_shl(algo as u32)
            .is_some_and(|bit| self.algos & bit != 0)
    }
}
