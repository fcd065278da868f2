//! GPU pool scheduling.
//!
//! A fixed set of device ids; jobs that ask for scheduling take one for
//! their lifetime. `acquire` is the one call in the job host that may block
//! indefinitely: with every id taken, new scheduled jobs queue here until a
//! running one exits.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

use rmx_common::ErrorCode;

pub struct GpuAllocator {
    pool: Vec<u32>,
    assigned: Mutex<BTreeSet<u32>>,
    released: Condvar,
}

impl GpuAllocator {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut pool: Vec<u32> = ids.into_iter().collect();
        pool.sort_unstable();
        pool.dedup();
        Self {
            pool,
            assigned: Mutex::new(BTreeSet::new()),
            released: Condvar::new(),
        }
    }

    pub fn pool(&self) -> &[u32] {
        &self.pool
    }

    /// Block until some id is free, then take it.
    ///
    /// Waiters are woken on every release and simply recheck; there is no
    /// hand-off and no fairness between them.
    pub fn acquire(&self) -> u32 {
        if self.pool.is_empty() {
            warn!(
                code = %ErrorCode::ResourceGpuPoolEmpty.code_string(),
                "GPU scheduling requested with an empty pool; waiting forever"
            );
        }
        let mut assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(id) = self.pool.iter().copied().find(|id| !assigned.contains(id)) {
                assigned.insert(id);
                debug!(gpu = id, "GPU acquired");
                return id;
            }
            assigned = self
                .released
                .wait(assigned)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn release(&self, id: u32) {
        let mut assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
        if !assigned.remove(&id) {
            warn!(
                gpu = id,
                code = %ErrorCode::ResourceUnknownGpu.code_string(),
                "Released a GPU that was not assigned"
            );
            return;
        }
        drop(assigned);
        debug!(gpu = id, "GPU released");
        self.released.notify_all();
    }

    pub fn available(&self) -> usize {
        let assigned = self.assigned.lock().unwrap_or_else(|e| e.into_inner());
        self.pool.len() - assigned.len()
    }

    /// [`acquire`](Self::acquire), returning a lease that releases on drop.
    pub fn lease(self: &Arc<Self>) -> GpuLease {
        let id = self.acquire();
        GpuLease {
            allocator: Arc::clone(self),
            id,
        }
    }
}

/// An assigned GPU id, returned to the pool when dropped.
pub struct GpuLease {
    allocator: Arc<GpuAllocator>,
    id: u32,
}

impl GpuLease {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        self.allocator.release(self.id);
    }
}

impl std::fmt::Debug for GpuLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuLease").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_two_acquires_get_distinct_ids() {
        let gpus = Arc::new(GpuAllocator::new([1, 0]));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gpus = Arc::clone(&gpus);
                thread::spawn(move || gpus.acquire())
            })
            .collect();
        let mut ids: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(gpus.available(), 0);
    }

    #[test]
    fn test_third_acquire_blocks_until_release() {
        let gpus = Arc::new(GpuAllocator::new([0, 1]));
        let first = gpus.acquire();
        let _second = gpus.acquire();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let gpus = Arc::clone(&gpus);
            thread::spawn(move || tx.send(gpus.acquire()).unwrap())
        };

        assert!(
            rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "acquire must block while the pool is exhausted"
        );
        gpus.release(first);
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, first);
        waiter.join().unwrap();
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let gpus = Arc::new(GpuAllocator::new([7]));
        {
            let lease = gpus.lease();
            assert_eq!(lease.id(), 7);
            assert_eq!(gpus.available(), 0);
        }
        assert_eq!(gpus.available(), 1);
    }

    #[test]
    fn test_release_of_unassigned_id_is_ignored() {
        let gpus = GpuAllocator::new([0]);
        gpus.release(0);
        gpus.release(5);
        assert_eq!(gpus.available(), 1);
    }

    #[test]
    fn test_pool_is_sorted_and_deduplicated() {
        let gpus = GpuAllocator::new([2, 0, 2, 1]);
        assert_eq!(gpus.pool(), &[0, 1, 2]);
        assert_eq!(gpus.acquire(), 0);
    }
}
