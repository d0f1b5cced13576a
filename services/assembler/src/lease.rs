//! Leases and liveness.
//!
//! A host grants leases that expire unless renewed. Holders hook a lease:
//! a keeper task renews it through the granting peer every third of its
//! duration and fires a callback once renewal fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use plexus_id::LeaseId;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::peer::Peer;

/// Invoked at most once when a lease expires or is lost.
pub type LeaseCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("unknown lease {0}")]
    Unknown(LeaseId),

    #[error("lease {0} expired")]
    Expired(LeaseId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub duration: Duration,
}

/// Grants, renews and watches leases.
pub trait LivenessPort: Send + Sync {
    /// Grants a lease; `on_expire` runs if it is not renewed in time.
    fn create_lease(&self, duration: Duration, on_expire: LeaseCallback) -> Lease;

    fn renew(&self, id: LeaseId) -> Result<(), LeaseError>;

    /// Drops a granted lease without running its callback.
    fn remove(&self, id: LeaseId) -> bool;

    /// Keeps a lease granted by `granter` alive; `on_lost` runs once
    /// renewal fails.
    fn hook(&self, lease: Lease, granter: Arc<dyn Peer>, on_lost: LeaseCallback);

    /// Stops keeping a hooked lease alive.
    fn unhook(&self, id: LeaseId) -> bool;
}

struct Granted {
    deadline: Instant,
    duration: Duration,
    on_expire: Option<LeaseCallback>,
}

#[derive(Default)]
struct Inner {
    granted: Mutex<HashMap<LeaseId, Granted>>,
    keepers: Mutex<HashMap<LeaseId, JoinHandle<()>>>,
}

impl Inner {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(LeaseId, Option<LeaseCallback>)> = match self.granted.lock() {
            Ok(mut granted) => {
                let ids: Vec<LeaseId> = granted
                    .iter()
                    .filter(|(_, g)| g.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| granted.remove(&id).map(|g| (id, g.on_expire)))
                    .collect()
            }
            Err(_) => return 0,
        };

        // Callbacks run outside the lock; they may grant or drop leases.
        let count = expired.len();
        for (id, callback) in expired {
            info!(lease_id = %id, "Lease expired");
            if let Some(callback) = callback {
                callback();
            }
        }
        count
    }
}

/// In-process lease table with a sweeper task.
#[derive(Clone)]
pub struct LocalLeases {
    inner: Arc<Inner>,
}

impl LocalLeases {
    /// Creates the table and spawns its sweeper, which stops on shutdown or
    /// when the last handle is dropped.
    pub fn start(check_interval: Duration, mut shutdown: watch::Receiver<bool>) -> Self {
        let inner = Arc::new(Inner::default());
        let weak: Weak<Inner> = Arc::downgrade(&inner);

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Lease sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    /// Expires overdue leases now. Returns how many expired.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn granted_count(&self) -> usize {
        self.inner.granted.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn hooked_count(&self) -> usize {
        self.inner.keepers.lock().map(|k| k.len()).unwrap_or(0)
    }
}

impl LivenessPort for LocalLeases {
    fn create_lease(&self, duration: Duration, on_expire: LeaseCallback) -> Lease {
        let lease = Lease {
            id: LeaseId::new(),
            duration,
        };
        if let Ok(mut granted) = self.inner.granted.lock() {
            granted.insert(
                lease.id,
                Granted {
                    deadline: Instant::now() + duration,
                    duration,
                    on_expire: Some(on_expire),
                },
            );
        }
        debug!(lease_id = %lease.id, duration_ms = duration.as_millis() as u64, "Granted lease");
        lease
    }

    fn renew(&self, id: LeaseId) -> Result<(), LeaseError> {
        let mut granted = self
            .inner
            .granted
            .lock()
            .map_err(|_| LeaseError::Unknown(id))?;
        let entry = granted.get_mut(&id).ok_or(LeaseError::Unknown(id))?;

        let now = Instant::now();
        if entry.deadline <= now {
            return Err(LeaseError::Expired(id));
        }
        entry.deadline = now + entry.duration;
        Ok(())
    }

    fn remove(&self, id: LeaseId) -> bool {
        self.inner
            .granted
            .lock()
            .map(|mut g| g.remove(&id).is_some())
            .unwrap_or(false)
    }

    fn hook(&self, lease: Lease, granter: Arc<dyn Peer>, on_lost: LeaseCallback) {
        let period = (lease.duration / 3).max(Duration::from_millis(1));
        let id = lease.id;

        let keeper = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            // The first tick completes immediately.
            timer.tick().await;
            loop {
                timer.tick().await;
                if let Err(e) = granter.renew(id).await {
                    warn!(
                        lease_id = %id,
                        granter = %granter.system_id(),
                        error = %e,
                        "Lease renewal failed"
                    );
                    on_lost();
                    break;
                }
            }
        });

        if let Ok(mut keepers) = self.inner.keepers.lock() {
            if let Some(previous) = keepers.insert(id, keeper) {
                previous.abort();
            }
        }
    }

    fn unhook(&self, id: LeaseId) -> bool {
        match self.inner.keepers.lock() {
            Ok(mut keepers) => match keepers.remove(&id) {
                Some(keeper) => {
                    keeper.abort();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}
