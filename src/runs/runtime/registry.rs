//! Process-local registries for live runs.
//!
//! Both maps are keyed by run id and only hold runs this process launched.
//! Neither survives a restart: a deployment with several instances has to
//! route `resume` and `cancel` for a run back to the instance that started it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::runs::domain::RunContext;

/// Handle on one pipeline invocation of a run.
///
/// `epoch` tells invocations of the same run apart (a resumed run gets a new
/// one). `status_lock` serializes metadata status writes between the
/// controller and `cancel` for this invocation.
#[derive(Debug, Clone)]
pub struct RunLease {
    pub token: CancellationToken,
    pub epoch: u64,
    pub status_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Maps active run ids to their cancellation token.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    leases: Mutex<HashMap<String, RunLease>>,
    next_epoch: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, RunLease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh token for `run_id`, replacing any earlier one.
    pub fn register(&self, run_id: &str) -> RunLease {
        let lease = self.new_lease();
        self.leases().insert(run_id.to_string(), lease.clone());
        lease
    }

    fn new_lease(&self) -> RunLease {
        RunLease {
            token: CancellationToken::new(),
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1,
            status_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Register a fresh token only if no invocation of `run_id` is live.
    pub fn register_if_idle(&self, run_id: &str) -> Option<RunLease> {
        let mut leases = self.leases();
        if leases.contains_key(run_id) {
            return None;
        }
        let lease = self.new_lease();
        leases.insert(run_id.to_string(), lease.clone());
        Some(lease)
    }

    pub fn get(&self, run_id: &str) -> Option<RunLease> {
        self.leases().get(run_id).cloned()
    }

    /// Whether `epoch` is still the registered invocation of `run_id`.
    pub fn is_current(&self, run_id: &str, epoch: u64) -> bool {
        self.leases()
            .get(run_id)
            .is_some_and(|lease| lease.epoch == epoch)
    }

    /// Drop the lease for `run_id` if it still belongs to `epoch`.
    pub fn release(&self, run_id: &str, epoch: u64) -> bool {
        let mut leases = self.leases();
        if leases.get(run_id).is_some_and(|lease| lease.epoch == epoch) {
            leases.remove(run_id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.leases().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps resumable run ids to the parameters they were started with.
#[derive(Debug, Default)]
pub struct ResumeContextRegistry {
    contexts: Mutex<HashMap<String, RunContext>>,
}

impl ResumeContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<String, RunContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, run_id: &str, ctx: RunContext) {
        self.contexts().insert(run_id.to_string(), ctx);
    }

    pub fn get(&self, run_id: &str) -> Option<RunContext> {
        self.contexts().get(run_id).cloned()
    }

    pub fn remove(&self, run_id: &str) -> Option<RunContext> {
        self.contexts().remove(run_id)
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.contexts().contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
