use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::Clock;

/// Default lease after which an unreleased lock becomes reclaimable.
pub fn default_lease() -> Duration {
    Duration::seconds(30)
}

#[derive(Debug, Clone)]
struct LockEntry {
    label: String,
    token: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Proof of lock ownership returned by [`TenantLockManager::acquire`].
///
/// Release requires the token so a slow, stale caller cannot release a lock
/// acquired by a newer caller for the same tenant.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub tenant_id: Uuid,
    pub token: Uuid,
    pub label: String,
    pub acquired_at: DateTime<Utc>,
}

/// In-process mutual-exclusion map keyed by tenant id, with lease expiry.
///
/// Lock state is process-local; the "at most one provisioning per tenant"
/// guarantee only holds for single-instance deployments.
#[derive(Clone)]
pub struct TenantLockManager {
    locks: Arc<Mutex<HashMap<Uuid, LockEntry>>>,
    lease: Duration,
    clock: Clock,
}

impl TenantLockManager {
    pub fn new(lease: Duration) -> Self {
        Self::with_clock(lease, crate::system_clock())
    }

    pub fn with_clock(lease: Duration, clock: Clock) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            lease,
            clock,
        }
    }

    /// Attempts to acquire the lock for a tenant. Never blocks.
    ///
    /// `None` means the operation is already in progress elsewhere; callers
    /// must surface that as a structured "in progress" result, not an error.
    pub fn acquire(&self, tenant_id: Uuid, operation_label: &str) -> Option<LockHandle> {
        let now = (self.clock)();
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Self::sweep(&mut locks, now, self.lease);

        if locks.contains_key(&tenant_id) {
            return None;
        }

        let entry = LockEntry {
            label: operation_label.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
        };
        let handle = LockHandle {
            tenant_id,
            token: entry.token,
            label: entry.label.clone(),
            acquired_at: entry.acquired_at,
        };
        locks.insert(tenant_id, entry);
        Some(handle)
    }

    /// Releases the lock for a tenant.
    ///
    /// Succeeds when the token matches the current holder, or when the lock
    /// has already expired and been reclaimed. A token mismatch against a live
    /// lock returns `false` and leaves the newer holder in place.
    pub fn release(&self, tenant_id: Uuid, token: Uuid) -> bool {
        let now = (self.clock)();
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Self::sweep(&mut locks, now, self.lease);

        match locks.get(&tenant_id) {
            None => true,
            Some(entry) if entry.token == token => {
                locks.remove(&tenant_id);
                true
            }
            Some(_) => false,
        }
    }

    /// Removes locks whose lease has elapsed.
    ///
    /// Invoked opportunistically on every acquire and release, so a crashed
    /// holder never wedges a tenant permanently.
    pub fn sweep_expired(&self) {
        let now = (self.clock)();
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Self::sweep(&mut locks, now, self.lease);
    }

    fn sweep(locks: &mut HashMap<Uuid, LockEntry>, now: DateTime<Utc>, lease: Duration) {
        locks.retain(|tenant_id, entry| {
            let live = now - entry.acquired_at <= lease;
            if !live {
                warn!(
                    stage = "lock",
                    tenant_id = %tenant_id,
                    operation = %entry.label,
                    acquired_at = %entry.acquired_at,
                    "reclaiming expired tenant lock"
                );
            }
            live
        });
    }
}
