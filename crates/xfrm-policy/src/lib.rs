//! Transform Policy Engine
//!
//! Decides, per flow, whether traffic passes untouched, is dropped, or must
//! go through an ordered chain of security transforms, and caches the
//! resolved chains ("bundles") on the policy that produced them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         XfrmEngine                           │
//! │                                                              │
//! │  ┌─────────────┐   ┌──────────┐   ┌───────────┐   ┌────────┐ │
//! │  │ PolicyStore │──►│ Resolver │──►│ FamilyOps │──►│ Bundle │ │
//! │  │ (RwLock)    │   │          │   │ (per AF)  │   │ cache  │ │
//! │  └─────────────┘   └────┬─────┘   └───────────┘   └────────┘ │
//! │        │                │ StateStore                         │
//! │        ▼                ▼                                    │
//! │  ┌───────────┐    ┌──────────────┐    ┌──────────────────┐   │
//! │  │ Lifetime  │    │ Negotiation  │    │ Garbage collector│   │
//! │  │ timers    │    │ waker        │    │ (deferred drop)  │   │
//! │  └───────────┘    └──────────────┘    └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod bundle;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod family;
pub mod gc;
pub mod inet;
pub mod km;
mod lifecycle;
pub mod policy;
pub mod resolver;
pub mod state;
pub mod store;
pub mod template;

pub use bundle::{BaseRoute, Bundle, BundleLink};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use engine::{EngineStats, FlowVerdict, LookupOptions, XfrmEngine};
pub use family::{FamilyOps, FamilyRegistry};
pub use inet::{InetFamily, RouteEntry};
pub use km::{ChannelKeyManager, KeyManager, LoggingKeyManager, PolicyExpiry};
pub use policy::{Action, Direction, Lifetime, Policy, PolicyAction, PolicyInfo, PolicySpec};
pub use state::{MemoryStateStore, NegotiationWaker, StateId, StateLookup, StateStatus, StateStore, XfrmState};
pub use store::{PolicyStore, SocketId};
pub use template::{Mode, Template};

pub use xfrm_common::{AddressFamily, FlowDescriptor, Selector, XfrmError, XfrmResult};
