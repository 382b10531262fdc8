//! Key management notifications

use serde::Serialize;
use tokio::sync::mpsc;

use crate::policy::Direction;

/// Receives policy expiry notifications; must not block
pub trait KeyManager: Send + Sync {
    /// A soft (`hard == false`) or hard lifetime of a policy elapsed
    fn notify_expired(&self, policy_id: u32, direction: Direction, hard: bool);
}

/// Key manager that only logs
#[derive(Debug, Default)]
pub struct LoggingKeyManager;

impl KeyManager for LoggingKeyManager {
    fn notify_expired(&self, policy_id: u32, direction: Direction, hard: bool) {
        if hard {
            tracing::info!(index = policy_id, dir = ?direction, "policy hard expired");
        } else {
            tracing::info!(index = policy_id, dir = ?direction, "policy soft expired, renegotiate");
        }
    }
}

/// Expiry event forwarded by [`ChannelKeyManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyExpiry {
    pub index: u32,
    pub direction: Direction,
    pub hard: bool,
}

/// Key manager forwarding events to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelKeyManager {
    tx: mpsc::UnboundedSender<PolicyExpiry>,
}

impl ChannelKeyManager {
    /// Create with the receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PolicyExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl KeyManager for ChannelKeyManager {
    fn notify_expired(&self, policy_id: u32, direction: Direction, hard: bool) {
        let event = PolicyExpiry {
            index: policy_id,
            direction,
            hard,
        };
        if self.tx.send(event).is_err() {
            tracing::debug!(index = policy_id, "expiry consumer gone, event dropped");
        }
    }
}
