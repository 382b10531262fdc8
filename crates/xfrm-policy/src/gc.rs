//! Deferred policy reclamation
//!
//! Dead policies are queued here instead of being dropped on the path that
//! unlinked them. The worker releases their bundles and timer, then waits
//! out concurrent store readers before letting go of its reference.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use xfrm_common::AtomicCounter;

use crate::policy::Policy;
use crate::store::PolicyStore;

enum GcRequest {
    Reclaim(Arc<Policy>),
    Sync(oneshot::Sender<()>),
}

/// Handle to the reclamation worker
pub struct GarbageCollector {
    tx: mpsc::UnboundedSender<GcRequest>,
    store: Arc<PolicyStore>,
    reclaimed: Arc<AtomicCounter>,
}

impl GarbageCollector {
    /// Spawn the worker on `runtime`
    pub fn spawn(runtime: &Handle, store: Arc<PolicyStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reclaimed = Arc::new(AtomicCounter::default());

        let worker_store = Arc::clone(&store);
        let worker_count = Arc::clone(&reclaimed);
        runtime.spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    GcRequest::Reclaim(policy) => {
                        reclaim(&worker_store, policy);
                        worker_count.inc();
                    }
                    GcRequest::Sync(done) => {
                        let _ = done.send(());
                    }
                }
            }
            tracing::debug!("garbage collector stopped");
        });

        Self {
            tx,
            store,
            reclaimed,
        }
    }

    /// Queue a dead policy; reclaims inline once the worker is gone
    pub fn enqueue(&self, policy: Arc<Policy>) {
        if let Err(mpsc::error::SendError(GcRequest::Reclaim(policy))) =
            self.tx.send(GcRequest::Reclaim(policy))
        {
            tracing::debug!(index = policy.index(), "gc worker gone, reclaiming inline");
            reclaim(&self.store, policy);
            self.reclaimed.inc();
        }
    }

    /// Wait until everything queued before this call is reclaimed
    pub async fn sync(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(GcRequest::Sync(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Policies reclaimed so far
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.get()
    }
}

fn reclaim(store: &PolicyStore, policy: Arc<Policy>) {
    let index = policy.index();
    let bundles = policy.take_bundles();
    policy.disarm_timer();

    // Lookups that found the policy before it was unlinked may still hold it
    if Arc::strong_count(&policy) > 1 {
        store.read_barrier();
    }

    tracing::trace!(index, bundles = bundles.len(), "policy reclaimed");
    drop(bundles);
}
