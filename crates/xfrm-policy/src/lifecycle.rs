//! Policy lifetime timers
//!
//! Each armed policy owns one task sleeping until its next threshold. The
//! task holds weak references only, so a sleeping timer never keeps its
//! policy or the engine alive. Arming replaces the previous task under the
//! policy lock.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::engine::EngineShared;
use crate::policy::{Lifetime, Policy};

/// Outcome of one timer evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// A hard threshold elapsed
    Expired,
    /// Still alive; `warn` reports an elapsed soft threshold
    Tick {
        warn: bool,
        next: Option<Duration>,
    },
}

/// Evaluate thresholds at `now`. Use-based thresholds count from the last
/// use, or from insertion if the policy was never used.
pub(crate) fn next_event(
    lifetime: &Lifetime,
    add_time: Instant,
    use_time: Option<Instant>,
    now: Instant,
    km_timeout: Duration,
) -> TimerEvent {
    let use_time = use_time.unwrap_or(add_time);
    let remaining = |threshold: Option<Duration>, since: Instant| {
        threshold.filter(|t| !t.is_zero()).map(|t| {
            since
                .checked_add(t)
                .map_or(Duration::MAX, |deadline| deadline.saturating_duration_since(now))
        })
    };

    let mut next: Option<Duration> = None;
    let mut earliest = |tmo: Duration| next = Some(next.map_or(tmo, |n| n.min(tmo)));

    for hard in [
        remaining(lifetime.hard_add_expires, add_time),
        remaining(lifetime.hard_use_expires, use_time),
    ]
    .into_iter()
    .flatten()
    {
        if hard.is_zero() {
            return TimerEvent::Expired;
        }
        earliest(hard);
    }

    let mut warn = false;
    for soft in [
        remaining(lifetime.soft_add_expires, add_time),
        remaining(lifetime.soft_use_expires, use_time),
    ]
    .into_iter()
    .flatten()
    {
        if soft.is_zero() {
            warn = true;
            earliest(km_timeout);
        } else {
            earliest(soft);
        }
    }

    TimerEvent::Tick { warn, next }
}

/// Arm the first tick after linking: no later than the poll interval, or
/// the hard-add threshold when that is sooner
pub(crate) fn arm_after_insert(shared: &Arc<EngineShared>, policy: &Arc<Policy>) {
    let lifetime = policy.lifetime();
    if !lifetime.is_set() {
        return;
    }
    let mut delay = shared.config.load().poll_interval();
    if let Some(hard) = lifetime.hard_add_expires.filter(|d| !d.is_zero()) {
        delay = delay.min(hard);
    }
    schedule(shared, policy, delay);
}

/// Replace the policy's timer with one firing after `delay`
pub(crate) fn schedule(shared: &Arc<EngineShared>, policy: &Arc<Policy>, delay: Duration) -> bool {
    let engine: Weak<EngineShared> = Arc::downgrade(shared);
    let runtime = shared.runtime.clone();
    let target: Weak<Policy> = Arc::downgrade(policy);
    policy.arm_timer(|seq| {
        runtime
            .spawn(async move {
                tokio::time::sleep(delay).await;
                if let (Some(shared), Some(policy)) = (engine.upgrade(), target.upgrade()) {
                    tick(&shared, policy, seq);
                }
            })
            .abort_handle()
    })
}

fn tick(shared: &Arc<EngineShared>, policy: Arc<Policy>, seq: u64) {
    if !policy.claim_fired_timer(seq) {
        return;
    }

    let km_timeout = shared.config.load().km_timeout();
    let event = next_event(
        policy.lifetime(),
        policy.add_time(),
        policy.use_time(),
        Instant::now(),
        km_timeout,
    );

    match event {
        TimerEvent::Expired => {
            // Whoever unlinks first owns the kill
            let Some(dir) = policy.direction() else {
                return;
            };
            if shared.store.unlink(&policy) {
                tracing::info!(index = policy.index(), ?dir, "policy lifetime expired");
                metrics::counter!("xfrm_policy_expired_total").increment(1);
                shared.stats.expired.inc();
                shared.key_manager.notify_expired(policy.index(), dir, true);
                shared.kill_policy(policy);
            }
        }
        TimerEvent::Tick { warn, next } => {
            if warn {
                if let Some(dir) = policy.direction() {
                    tracing::debug!(index = policy.index(), ?dir, "policy soft lifetime reached");
                    shared.key_manager.notify_expired(policy.index(), dir, false);
                }
            }
            if let Some(next) = next {
                schedule(shared, &policy, next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KM: Duration = Duration::from_secs(30);

    fn secs(s: u64) -> Option<Duration> {
        Some(Duration::from_secs(s))
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_configured_stops() {
        let now = Instant::now();
        assert_eq!(
            next_event(&Lifetime::default(), now, None, now, KM),
            TimerEvent::Tick { warn: false, next: None }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_add_expires() {
        let added = Instant::now();
        let lifetime = Lifetime {
            hard_add_expires: secs(10),
            ..Default::default()
        };
        assert_eq!(
            next_event(&lifetime, added, None, added + Duration::from_secs(4), KM),
            TimerEvent::Tick { warn: false, next: secs(6) }
        );
        assert_eq!(
            next_event(&lifetime, added, None, added + Duration::from_secs(10), KM),
            TimerEvent::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_thresholds_follow_last_use() {
        let added = Instant::now();
        let lifetime = Lifetime {
            hard_use_expires: secs(5),
            ..Default::default()
        };
        let now = added + Duration::from_secs(6);
        assert_eq!(next_event(&lifetime, added, None, now, KM), TimerEvent::Expired);

        let used = added + Duration::from_secs(3);
        assert_eq!(
            next_event(&lifetime, added, Some(used), now, KM),
            TimerEvent::Tick { warn: false, next: secs(2) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_warns_and_catches_up() {
        let added = Instant::now();
        let lifetime = Lifetime {
            soft_add_expires: secs(5),
            hard_add_expires: secs(100),
            ..Default::default()
        };
        let now = added + Duration::from_secs(5);
        assert_eq!(
            next_event(&lifetime, added, None, now, KM),
            TimerEvent::Tick { warn: true, next: Some(KM) }
        );

        // Catch-up never overshoots the hard threshold
        let now = added + Duration::from_secs(80);
        assert_eq!(
            next_event(&lifetime, added, None, now, KM),
            TimerEvent::Tick { warn: true, next: secs(20) }
        );
    }
}
