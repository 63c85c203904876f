//! Ownership of the single accelerator.
//!
//! Busy state is a lease (owner + expiry) guarded by one mutex, so the
//! availability check and the claim happen as a single compare-and-set.
//! An expired lease counts as free and is reclaimed by the next claimant.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MANUAL_OWNER: &str = "manual";

#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub owner: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
struct ResourceState {
    present: bool,
    lease: Option<Lease>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub accelerator_present: bool,
    pub accelerator_busy: bool,
    pub lease_owner: Option<String>,
}

#[derive(Debug)]
pub struct ResourceArbiter {
    state: Mutex<ResourceState>,
    ttl: Duration,
    releases: AtomicU64,
}

impl ResourceArbiter {
    pub fn new(accelerator_present: bool, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(ResourceState {
                present: accelerator_present,
                lease: None,
            }),
            ttl,
            releases: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn present(&self) -> bool {
        self.lock().present
    }

    /// Capability changes observed from outside, e.g. device lost.
    pub fn set_present(&self, present: bool) {
        self.lock().present = present;
    }

    /// Present and not held by a live lease.
    pub fn available(&self) -> bool {
        self.available_at(Instant::now())
    }

    pub(crate) fn available_at(&self, now: Instant) -> bool {
        let state = self.lock();
        state.present && !state.lease.as_ref().is_some_and(|l| l.is_live(now))
    }

    /// Plain busy flag for callers that do not track ownership. Last writer
    /// wins; `true` installs an anonymous lease, `false` drops whatever
    /// lease is held.
    pub fn set_busy(&self, busy: bool) {
        let now = Instant::now();
        let mut state = self.lock();
        if busy {
            state.lease = Some(Lease {
                owner: MANUAL_OWNER.to_string(),
                acquired_at: now,
                expires_at: now + self.ttl,
            });
        } else if state.lease.take().is_some() {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
        info!(busy, "accelerator marked");
    }

    /// Atomically checks availability and claims the accelerator for `owner`.
    pub fn try_acquire(&self, owner: &str) -> Option<Lease> {
        self.try_acquire_at(owner, Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, owner: &str, now: Instant) -> Option<Lease> {
        let mut state = self.lock();
        if !state.present {
            return None;
        }
        match &state.lease {
            Some(current) if current.is_live(now) => {
                debug!(owner, holder = %current.owner, "accelerator busy");
                return None;
            }
            Some(expired) => {
                warn!(
                    owner,
                    stale_owner = %expired.owner,
                    "reclaiming expired accelerator lease"
                );
            }
            None => {}
        }
        let lease = Lease {
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        state.lease = Some(lease.clone());
        info!(owner, "accelerator lease acquired");
        Some(lease)
    }

    /// Extends the lease if `owner` still holds it.
    pub fn renew(&self, owner: &str) -> bool {
        self.renew_at(owner, Instant::now())
    }

    pub(crate) fn renew_at(&self, owner: &str, now: Instant) -> bool {
        let mut state = self.lock();
        match state.lease.as_mut() {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = now + self.ttl;
                debug!(owner, "accelerator lease renewed");
                true
            }
            _ => {
                warn!(owner, "lease renewal refused, lease no longer held");
                false
            }
        }
    }

    /// Releases the lease if `owner` holds it. A reclaimed lease is left
    /// to its new owner.
    pub fn release(&self, owner: &str) -> bool {
        let mut state = self.lock();
        match &state.lease {
            Some(lease) if lease.owner == owner => {
                state.lease = None;
                self.releases.fetch_add(1, Ordering::SeqCst);
                info!(owner, "accelerator lease released");
                true
            }
            _ => {
                debug!(owner, "release skipped, lease held by someone else");
                false
            }
        }
    }

    /// Number of releases performed since start.
    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ResourceStatus {
        let now = Instant::now();
        let state = self.lock();
        let live = state.lease.as_ref().filter(|l| l.is_live(now));
        ResourceStatus {
            accelerator_present: state.present,
            accelerator_busy: live.is_some(),
            lease_owner: live.map(|l| l.owner.clone()),
        }
    }
}

/// Lease held by a running job. Released exactly once, on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    arbiter: Arc<ResourceArbiter>,
    owner: String,
}

impl LeaseGuard {
    /// Claims the accelerator for `owner`, `None` when unavailable.
    pub fn acquire(arbiter: &Arc<ResourceArbiter>, owner: &str) -> Option<Self> {
        arbiter.try_acquire(owner).map(|lease| Self {
            arbiter: Arc::clone(arbiter),
            owner: lease.owner,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.arbiter.release(&self.owner);
    }
}
