//! Error types for the xfrm policy engine

use thiserror::Error;

use crate::AddressFamily;

/// Template resolution failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// A mandatory template has an association that is still being negotiated
    #[error("security association negotiation pending")]
    Pending,

    /// A mandatory template has no association at all
    #[error("no security association matches template")]
    NoMatch,
}

/// Bundle materialisation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No route towards a tunnel endpoint
    #[error("no route to tunnel endpoint {0}")]
    NoRoute(std::net::IpAddr),

    /// Header overhead leaves no room for payload
    #[error("transform overhead {overhead} exceeds path MTU {mtu}")]
    MtuExceeded {
        /// Accumulated header and trailer bytes
        overhead: u32,
        /// MTU of the route the chain rides on
        mtu: u32,
    },

    /// An instance became invalid while the chain was built
    #[error("security association {0:#x} is no longer valid")]
    StaleState(u32),

    /// Family mismatch between the flow and the chain
    #[error("address family mismatch")]
    FamilyMismatch,
}

/// xfrm engine error type
#[derive(Error, Debug)]
pub enum XfrmError {
    /// Lookup or delete found nothing
    #[error("policy not found")]
    NotFound,

    /// Exclusive insert collided with an identical selector
    #[error("policy with identical selector already exists")]
    AlreadyExists,

    /// Policy object is, or was, linked already
    #[error("policy already linked")]
    AlreadyLinked,

    /// Flow matched a blocking policy
    #[error("flow blocked by policy")]
    Blocked,

    /// Negotiation pending and the caller may not wait
    #[error("security association negotiation pending, try again")]
    Pending,

    /// Mandatory template could not be resolved
    #[error("no security association for mandatory template")]
    NoMatch,

    /// Bundle construction failed
    #[error("bundle build failed: {0}")]
    Build(#[from] BuildError),

    /// Lookup was interrupted and should be restarted by the caller
    #[error("lookup interrupted, restart requested")]
    RestartRequested,

    /// Store is empty
    #[error("policy store is empty")]
    Empty,

    /// No family operations registered for the family
    #[error("address family {0:?} not supported")]
    FamilyNotSupported(AddressFamily),

    /// Family operations already registered
    #[error("address family {0:?} already registered")]
    FamilyBusy(AddressFamily),

    /// Direction not valid for the operation
    #[error("invalid policy direction")]
    InvalidDirection,

    /// Selector could not be built
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// Packet could not be decoded into a flow
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Security path does not satisfy the policy templates
    #[error("security path does not match policy templates")]
    TemplateMismatch,

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ResolveError> for XfrmError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Pending => Self::Pending,
            ResolveError::NoMatch => Self::NoMatch,
        }
    }
}

impl XfrmError {
    /// Whether repeating the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Pending | Self::RestartRequested)
    }
}

/// Result type for the xfrm engine
pub type XfrmResult<T> = Result<T, XfrmError>;
