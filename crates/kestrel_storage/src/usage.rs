//! Snapshot usage registry.
//!
//! Every transaction holds a [`UsageLease`] on the snapshot it reads for as
//! long as it lives. The compactor uses the registry to wait until no
//! snapshot older than a given transaction id is still in use before it
//! deletes files such snapshots might dereference.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use kestrel_common::shutdown::CancelToken;
use kestrel_common::types::TransactionId;

#[derive(Default)]
pub struct SnapshotUsageRegistry {
    in_use: Mutex<BTreeMap<TransactionId, usize>>,
    released: Condvar,
}

impl SnapshotUsageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, id: TransactionId) -> UsageLease {
        *self.in_use.lock().entry(id).or_insert(0) += 1;
        UsageLease {
            registry: Arc::clone(self),
            id,
        }
    }

    fn release(&self, id: TransactionId) {
        let mut in_use = self.in_use.lock();
        if let Some(count) = in_use.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                in_use.remove(&id);
                self.released.notify_all();
            }
        }
    }

    pub fn use_count(&self, id: TransactionId) -> usize {
        self.in_use.lock().get(&id).copied().unwrap_or(0)
    }

    /// Block until every snapshot older than `id` has been released.
    /// Returns `false` if cancelled first.
    pub fn wait_for_finishing_before(
        &self,
        id: TransactionId,
        cancel: &CancelToken,
        recheck: Duration,
    ) -> bool {
        let mut in_use = self.in_use.lock();
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match in_use.keys().next() {
                Some(oldest) if *oldest < id => {
                    tracing::trace!(oldest = oldest.0, waiting_for = id.0, "waiting for readers");
                }
                _ => return true,
            }
            self.released.wait_for(&mut in_use, recheck);
        }
    }
}

/// Scoped use of one snapshot; released exactly once on drop.
pub struct UsageLease {
    registry: Arc<SnapshotUsageRegistry>,
    id: TransactionId,
}

impl Drop for UsageLease {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

impl std::fmt::Debug for UsageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLease").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_lease_counts() {
        let registry = Arc::new(SnapshotUsageRegistry::new());
        let a = registry.acquire(TransactionId(3));
        let b = registry.acquire(TransactionId(3));
        let _c = registry.acquire(TransactionId(5));
        assert_eq!(registry.use_count(TransactionId(3)), 2);
        assert_eq!(registry.use_count(TransactionId(5)), 1);
        drop(a);
        drop(b);
        assert_eq!(registry.use_count(TransactionId(3)), 0);
        assert_eq!(registry.use_count(TransactionId(5)), 1);
        assert!(registry.wait_for_finishing_before(
            TransactionId(5),
            &CancelToken::new(),
            Duration::from_millis(5)
        ));
    }

    #[test]
    fn test_wait_returns_immediately_for_newer_snapshots() {
        let registry = Arc::new(SnapshotUsageRegistry::new());
        let _lease = registry.acquire(TransactionId(10));
        assert!(registry.wait_for_finishing_before(
            TransactionId(10),
            &CancelToken::new(),
            Duration::from_millis(5)
        ));
    }

    #[test]
    fn test_wait_wakes_on_release() {
        let registry = Arc::new(SnapshotUsageRegistry::new());
        let lease = registry.acquire(TransactionId(1));
        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let start = Instant::now();
                let done = registry.wait_for_finishing_before(
                    TransactionId(2),
                    &CancelToken::new(),
                    Duration::from_secs(10),
                );
                (done, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        drop(lease);
        let (done, elapsed) = waiter.join().unwrap();
        assert!(done);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_honours_cancel() {
        let registry = Arc::new(SnapshotUsageRegistry::new());
        let _lease = registry.acquire(TransactionId(1));
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(!registry.wait_for_finishing_before(
            TransactionId(2),
            &cancel,
            Duration::from_millis(5)
        ));
    }
}
