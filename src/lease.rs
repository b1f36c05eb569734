//! Sandbox-scoped launch leases
//!
//! Concurrent `ensure_gateway` calls against the same sandbox serialize
//! around the launch decision by holding a lease. A lease expires after its
//! TTL so a caller that hangs or is dropped cannot block launches forever.

use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Interval for polling a held lease (in milliseconds)
const LEASE_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Table shared by every caller of the free `ensure_gateway`
static GLOBAL_LEASES: OnceLock<Arc<LaunchLeases>> = OnceLock::new();

/// In-process table of launch leases keyed by sandbox id
#[derive(Debug, Default)]
pub struct LaunchLeases {
    leases: DashMap<String, Lease>,
    /// Last launched process per sandbox that never became reachable
    abandoned: DashMap<String, String>,
}

/// Outcome of [`LaunchLeases::acquire`]
pub struct Acquired {
    pub guard: LeaseGuard,
    /// Whether another holder had to be waited for
    pub contended: bool,
}

impl LaunchLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide lease table
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_LEASES.get_or_init(LaunchLeases::new))
    }

    /// Take the lease for `sandbox_id` if it is free or expired
    pub fn try_acquire(self: &Arc<Self>, sandbox_id: &str, ttl: Duration) -> Option<LeaseGuard> {
        let now = Instant::now();
        let token = Uuid::new_v4();
        let new_lease = Lease {
            token,
            expires_at: now + ttl,
        };

        let mut acquired = false;
        self.leases
            .entry(sandbox_id.to_string())
            .and_modify(|lease| {
                if lease.is_expired(now) {
                    warn!(sandbox_id, "Taking over expired launch lease");
                    *lease = new_lease;
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                new_lease
            });

        if !acquired {
            return None;
        }

        debug!(sandbox_id, %token, ttl_secs = ttl.as_secs(), "Launch lease acquired");
        Some(LeaseGuard {
            leases: Arc::clone(self),
            sandbox_id: sandbox_id.to_string(),
            token,
        })
    }

    /// Wait until the lease for `sandbox_id` can be taken
    ///
    /// Always succeeds within roughly `ttl` because a held lease expires.
    pub async fn acquire(self: &Arc<Self>, sandbox_id: &str, ttl: Duration) -> Acquired {
        let mut contended = false;
        loop {
            if let Some(guard) = self.try_acquire(sandbox_id, ttl) {
                return Acquired { guard, contended };
            }
            contended = true;
            tokio::time::sleep(Duration::from_millis(LEASE_POLL_INTERVAL_MS)).await;
        }
    }

    /// Whether a live lease is held for `sandbox_id`
    pub fn is_held(&self, sandbox_id: &str) -> bool {
        self.leases
            .get(sandbox_id)
            .map(|lease| !lease.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    /// Record that `process_id` was launched in `sandbox_id` and never became reachable
    pub fn mark_abandoned(&self, sandbox_id: &str, process_id: &str) {
        self.abandoned
            .insert(sandbox_id.to_string(), process_id.to_string());
    }

    /// Forget any abandoned launch for `sandbox_id`
    pub fn clear_abandoned(&self, sandbox_id: &str) {
        self.abandoned.remove(sandbox_id);
    }

    /// Whether `process_id` is the last abandoned launch in `sandbox_id`
    pub fn is_abandoned(&self, sandbox_id: &str, process_id: &str) -> bool {
        self.abandoned
            .get(sandbox_id)
            .map(|id| id.as_str() == process_id)
            .unwrap_or(false)
    }

    fn release(&self, sandbox_id: &str, token: Uuid) {
        let removed = self
            .leases
            .remove_if(sandbox_id, |_, lease| lease.token == token)
            .is_some();
        if removed {
            debug!(sandbox_id, %token, "Launch lease released");
        }
    }
}

/// Releases its lease on drop, unless it was already taken over
pub struct LeaseGuard {
    leases: Arc<LaunchLeases>,
    sandbox_id: String,
    token: Uuid,
}

impl LeaseGuard {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.leases.release(&self.sandbox_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_is_exclusive() {
        let leases = LaunchLeases::new();
        let guard = leases.try_acquire("sb-1", Duration::from_secs(60)).unwrap();

        assert!(leases.is_held("sb-1"));
        assert!(leases.try_acquire("sb-1", Duration::from_secs(60)).is_none());
        // Other sandboxes are independent
        assert!(leases.try_acquire("sb-2", Duration::from_secs(60)).is_some());

        drop(guard);
        assert!(!leases.is_held("sb-1"));
        assert!(leases.try_acquire("sb-1", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let leases = LaunchLeases::new();
        let stale = leases.try_acquire("sb-1", Duration::ZERO).unwrap();

        let fresh = leases.try_acquire("sb-1", Duration::from_secs(60)).unwrap();
        assert!(leases.is_held("sb-1"));

        // Dropping the stale guard must not release the new holder's lease
        drop(stale);
        assert!(leases.is_held("sb-1"));

        drop(fresh);
        assert!(!leases.is_held("sb-1"));
    }

    #[test]
    fn test_abandoned_launch_is_tracked_per_sandbox() {
        let leases = LaunchLeases::new();
        assert!(!leases.is_abandoned("sb-1", "proc-1"));

        leases.mark_abandoned("sb-1", "proc-1");
        assert!(leases.is_abandoned("sb-1", "proc-1"));
        assert!(!leases.is_abandoned("sb-1", "proc-2"));
        assert!(!leases.is_abandoned("sb-2", "proc-1"));

        leases.mark_abandoned("sb-1", "proc-2");
        assert!(!leases.is_abandoned("sb-1", "proc-1"));

        leases.clear_abandoned("sb-1");
        assert!(!leases.is_abandoned("sb-1", "proc-2"));
    }

    #[test]
    fn test_global_table_is_shared() {
        let a = LaunchLeases::global();
        let b = LaunchLeases::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let leases = LaunchLeases::new();
        let first = leases.acquire("sb-1", Duration::from_secs(60)).await;
        assert!(!first.contended);

        let waiter = {
            let leases = Arc::clone(&leases);
            tokio::spawn(async move { leases.acquire("sb-1", Duration::from_secs(60)).await.contended })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert!(waiter.await.unwrap());
    }
}
