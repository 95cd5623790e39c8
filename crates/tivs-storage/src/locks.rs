//! Per-tender write serialization.
//!
//! Writers for the same `(portal, uid)` queue behind one async mutex; writers
//! for different keys never share a lock. Entries are dropped once the last
//! holder or waiter releases them, so the map only holds in-flight keys.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tivs_core::PortalId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenderKey {
    pub portal_id: PortalId,
    pub uid: String,
}

impl TenderKey {
    pub fn new(portal_id: PortalId, uid: impl Into<String>) -> Self {
        Self {
            portal_id,
            uid: uid.into(),
        }
    }
}

impl fmt::Display for TenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.portal_id, self.uid)
    }
}

/// Slot mutex plus the number of holders and waiters registered on it.
type LockMap = Mutex<HashMap<TenderKey, (Arc<AsyncMutex<()>>, usize)>>;

#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<LockMap>,
}

/// Held from before the wait until the lock is released, so a waiter that is
/// cancelled mid-wait still deregisters.
struct Registration {
    map: Arc<LockMap>,
    key: TenderKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((_, users)) = map.get_mut(&self.key) {
            *users -= 1;
            if *users == 0 {
                map.remove(&self.key);
            }
        }
    }
}

/// Fields drop in order: the mutex is released before the key deregisters.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: TenderKey) -> KeyGuard {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let (slot, users) = map
                .entry(key.clone())
                .or_insert_with(|| (Arc::new(AsyncMutex::new(())), 0));
            *users += 1;
            Arc::clone(slot)
        };
        let registration = Registration {
            map: Arc::clone(&self.inner),
            key,
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _registration: registration,
        }
    }

    /// Keys with a holder or waiter.
    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(TenderKey::new(1, "T1")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(TenderKey::new(1, "T1")).await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock(TenderKey::new(1, "T2"))).await;
        assert!(b.is_ok());
        assert_eq!(locks.in_flight(), 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry_behind() {
        let locks = KeyedLocks::new();
        let holder = locks.lock(TenderKey::new(1, "T1")).await;
        let waiter = tokio::time::timeout(Duration::from_millis(20), locks.lock(TenderKey::new(1, "T1"))).await;
        assert!(waiter.is_err());
        assert_eq!(locks.in_flight(), 1);

        drop(holder);
        assert_eq!(locks.in_flight(), 0);
        let again = tokio::time::timeout(Duration::from_millis(200), locks.lock(TenderKey::new(1, "T1"))).await;
        assert!(again.is_ok());
    }
}
