//! Global pool of (backend, local slot) pairs with free-or-oldest selection
//! and per-slot mutual exclusion.
//!
//! Selection reads a lock-free array of "last used" timestamps; the actual
//! serialization of concurrent requests against the *same* slot is the
//! slot's own lock, acquired only after selection. Two requests can select
//! the same slot (its timestamp hasn't moved yet because the holder hasn't
//! reached `save_after`); the second acquire simply queues on the lock
//! rather than re-running selection. This mirrors the ordering guarantee in
//! the design notes: selection needs no lock of its own.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::backend::BackendClient;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a free slot")]
    Timeout,
}

struct Slot {
    backend: Arc<BackendClient>,
    local_slot_id: usize,
    last_used: AtomicU64,
    lock: Arc<Mutex<()>>,
}

/// Handle to a slot currently held by the caller. Dropping it without
/// calling [`SlotManager::release`] still releases the underlying lock
/// (via `OwnedMutexGuard`'s own `Drop`), but leaves `last_used` untouched,
/// so callers should always go through `release` to keep the cleanup path
/// uniform and observable in logs.
pub struct SlotHandle {
    index: usize,
    local_slot_id: usize,
    backend: Arc<BackendClient>,
    guard: Option<OwnedMutexGuard<()>>,
    pub restored: bool,
}

impl SlotHandle {
    pub fn backend(&self) -> &Arc<BackendClient> {
        &self.backend
    }

    pub fn local_slot_id(&self) -> usize {
        self.local_slot_id
    }

    fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

pub struct SlotManager {
    slots: Vec<Slot>,
    acquire_timeout: Duration,
}

impl SlotManager {
    /// Build the global slot table from each backend's client and slot
    /// count, in the order the backends were configured.
    pub fn new(backends: Vec<(Arc<BackendClient>, usize)>, acquire_timeout: Duration) -> Self {
        let mut slots = Vec::new();
        for (backend, n_slots) in backends {
            for local_slot_id in 0..n_slots {
                slots.push(Slot {
                    backend: backend.clone(),
                    local_slot_id,
                    last_used: AtomicU64::new(0),
                    lock: Arc::new(Mutex::new(())),
                });
            }
        }
        Self {
            slots,
            acquire_timeout,
        }
    }

    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    /// Free-or-oldest selection: the first slot with `last_used == 0`, else
    /// the slot with the smallest `last_used`, ties broken by table order.
    fn select(&self) -> usize {
        let mut best_index = 0;
        let mut best_used = u64::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            let used = slot.last_used.load(Ordering::Acquire);
            if used == 0 {
                return i;
            }
            if used < best_used {
                best_used = used;
                best_index = i;
            }
        }
        best_index
    }

    /// Select a slot, block (up to `acquire_timeout`) for its lock, and
    /// optionally restore `restore_key` into it before returning.
    pub async fn acquire_for_request(
        &self,
        restore_key: Option<&str>,
    ) -> Result<SlotHandle, AcquireError> {
        let index = self.select();
        let slot = &self.slots[index];

        let guard = tokio::time::timeout(self.acquire_timeout, slot.lock.clone().lock_owned())
            .await
            .map_err(|_| AcquireError::Timeout)?;

        let mut restored = false;
        if let Some(key) = restore_key {
            restored = slot.backend.restore_slot(slot.local_slot_id, key).await;
            if !restored {
                debug!(slot = index, "restore missed, proceeding without cached prefix");
            }
        }

        Ok(SlotHandle {
            index,
            local_slot_id: slot.local_slot_id,
            backend: slot.backend.clone(),
            guard: Some(guard),
            restored,
        })
    }

    /// Persist the slot's current KV state under `key`. Marks the slot
    /// "used" (bumps `last_used`) regardless of whether the save RPC
    /// succeeded: a failed save still leaves the backend's in-memory state
    /// dirty, so the pool must not treat the slot as pristine.
    pub async fn save_after(&self, handle: &SlotHandle, key: &str) -> bool {
        let ok = handle.backend.save_slot(handle.local_slot_id, key).await;
        if !ok {
            warn!(slot = handle.index, key, "save RPC failed, slot marked used anyway");
        }
        self.slots[handle.index].last_used.store(now_unix(), Ordering::Release);
        ok
    }

    /// Release the slot's lock. Tolerates being called more than once: a
    /// second call on an already-released handle is a no-op.
    pub fn release(&self, handle: &mut SlotHandle) {
        if handle.is_held() {
            handle.guard = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Client;

    use super::*;

    fn manager(n_slots: usize) -> SlotManager {
        let backend = Arc::new(BackendClient::new(Client::new(), "http://127.0.0.1:1".to_string()));
        SlotManager::new(vec![(backend, n_slots)], Duration::from_millis(200))
    }

    #[tokio::test]
    async fn acquire_picks_a_free_slot_and_release_frees_it() {
        let mgr = manager(2);
        let mut handle = mgr.acquire_for_request(None).await.unwrap();
        assert!(!handle.restored);
        mgr.release(&mut handle);
        // Releasing twice is a no-op, not a panic.
        mgr.release(&mut handle);
    }

    #[tokio::test]
    async fn concurrent_acquires_up_to_pool_size_all_succeed() {
        let mgr = Arc::new(manager(2));
        let mut h1 = mgr.acquire_for_request(None).await.unwrap();
        let mut h2 = mgr.acquire_for_request(None).await.unwrap();
        mgr.release(&mut h1);
        mgr.release(&mut h2);
    }

    #[tokio::test]
    async fn nth_plus_one_acquire_times_out_while_pool_is_exhausted() {
        let mgr = Arc::new(manager(1));
        let handle = mgr.acquire_for_request(None).await.unwrap();

        let err = mgr.acquire_for_request(None).await.unwrap_err();
        assert!(matches!(err, AcquireError::Timeout));

        drop(handle);
    }

    #[tokio::test]
    async fn released_slot_becomes_available_again() {
        let mgr = Arc::new(manager(1));
        let mut h1 = mgr.acquire_for_request(None).await.unwrap();
        mgr.release(&mut h1);

        // Should not time out now that the only slot is free.
        let h2 = mgr.acquire_for_request(None).await;
        assert!(h2.is_ok());
    }

    #[tokio::test]
    async fn save_after_marks_slot_used_even_when_rpc_fails() {
        let mgr = manager(1);
        let handle = mgr.acquire_for_request(None).await.unwrap();
        // The backend URL is unreachable, so the RPC fails, but last_used
        // must still advance past zero.
        let ok = mgr.save_after(&handle, "some-key").await;
        assert!(!ok);
        assert!(mgr.slots[handle.index].last_used.load(Ordering::Acquire) > 0);
    }
}
