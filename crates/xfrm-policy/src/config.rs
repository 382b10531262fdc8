//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use xfrm_common::{XfrmError, XfrmResult};

/// Tunables read on every timer tick; swapped atomically on reload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Re-arm interval after a soft expiry notification
    pub km_timeout_secs: u64,
    /// Upper bound for the first timer tick after insertion
    pub poll_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            km_timeout_secs: 30,
            poll_interval_secs: 1,
        }
    }
}

impl EngineConfig {
    /// Soft expiry catch-up interval
    pub fn km_timeout(&self) -> Duration {
        Duration::from_secs(self.km_timeout_secs)
    }

    /// First tick bound
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Reject values that would spin the timers
    pub fn validate(&self) -> XfrmResult<()> {
        if self.km_timeout_secs == 0 {
            return Err(XfrmError::Config("km_timeout_secs must be positive".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(XfrmError::Config("poll_interval_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "km_timeout_secs": 5 }"#).unwrap();
        assert_eq!(config.km_timeout(), Duration::from_secs(5));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = EngineConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(XfrmError::Config(_))));
    }
}
