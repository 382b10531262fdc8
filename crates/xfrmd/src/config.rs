//! Daemon Configuration

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use xfrm_common::{proto, Selector};
use xfrm_policy::{
    Action, Direction, EngineConfig, Lifetime, Mode, PolicySpec, RouteEntry, StateId, Template,
    XfrmState,
};

use crate::DaemonError;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Engine tunables
    pub engine: EngineConfig,
    /// Seconds between statistics snapshots and bundle pruning
    pub stats_interval_secs: u64,
    /// Static routes, both families
    pub routes: Vec<RouteEntry>,
    /// Statically keyed associations
    pub states: Vec<StateConfig>,
    /// Policies installed at startup
    pub policies: Vec<PolicyConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            stats_interval_secs: 60,
            routes: Vec::new(),
            states: Vec::new(),
            policies: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Statically keyed association
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Remote endpoint
    pub daddr: IpAddr,
    /// Local endpoint
    pub saddr: IpAddr,
    /// Security parameter index
    pub spi: u32,
    /// Transform protocol, ESP when omitted
    #[serde(default = "default_proto")]
    pub proto: u8,
    /// Encapsulation mode
    #[serde(default)]
    pub mode: Mode,
    /// Request id
    #[serde(default)]
    pub reqid: u32,
    /// Per-packet header bytes
    #[serde(default)]
    pub header_len: u32,
    /// Per-packet trailer bytes
    #[serde(default)]
    pub trailer_len: u32,
}

fn default_proto() -> u8 {
    proto::ESP
}

impl StateConfig {
    /// Build the association, valid from the start
    pub fn to_state(&self) -> XfrmState {
        XfrmState::new(StateId::new(self.daddr, self.spi, self.proto), self.saddr, self.mode)
            .with_reqid(self.reqid)
            .with_overhead(self.header_len, self.trailer_len)
    }
}

/// Policy as written by operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Direction
    pub direction: Direction,
    /// Source CIDR
    pub src: String,
    /// Destination CIDR
    pub dst: String,
    /// Upper layer protocol, 0 = any
    #[serde(default)]
    pub proto: u8,
    /// Destination port, 0 = any
    #[serde(default)]
    pub dport: u16,
    /// Source port, 0 = any
    #[serde(default)]
    pub sport: u16,
    /// Lower matches first
    #[serde(default)]
    pub priority: u32,
    /// Action
    #[serde(default)]
    pub action: Action,
    /// Transform chain
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Lifetime thresholds
    #[serde(default)]
    pub lifetime: Lifetime,
}

impl PolicyConfig {
    /// Parse into an engine policy description
    pub fn to_spec(&self) -> Result<PolicySpec, DaemonError> {
        let src = parse_cidr(&self.src)?;
        let dst = parse_cidr(&self.dst)?;
        let selector = Selector::from_networks(src, dst)?
            .with_proto(self.proto)
            .with_dport(self.dport)
            .with_sport(self.sport);

        Ok(PolicySpec {
            priority: self.priority,
            selector,
            action: self.action,
            templates: self.templates.clone(),
            lifetime: self.lifetime,
        })
    }
}

fn parse_cidr(value: &str) -> Result<IpNetwork, DaemonError> {
    value
        .parse()
        .map_err(|e| DaemonError::Config(format!("invalid CIDR {value:?}: {e}")))
}
