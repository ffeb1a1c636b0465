//! Discovery backends: where workers register and find each other.
//!
//! The runtime ships two in-memory backends. Anything that talks to a real
//! quorum store implements the same trait out of tree and is injected via
//! `Topology::with_backend`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{MembershipError, WorkerEntry};
use crate::config::{BackendKind, WorkerConfig};

/// A discovery backend the membership service registers against.
///
/// `register` doubles as the heartbeat upsert: the service calls it with its
/// assigned id and a fresh entry every cycle.
#[async_trait::async_trait]
pub trait MembershipBackend: Send + Sync {
  /// One-time backend setup before the first registration.
  async fn init(&self, config: &WorkerConfig) -> Result<(), MembershipError>;

  /// Registers or refreshes a worker, returning its assigned id.
  async fn register(&self, self_id: Option<u32>, entry: WorkerEntry) -> Result<u32, MembershipError>;

  /// The full set of currently registered workers.
  async fn poll_peers(&self) -> Result<HashMap<u32, WorkerEntry>, MembershipError>;

  /// Reports a peer this worker could not reach.
  async fn notify_failure(&self, entry: &WorkerEntry) -> Result<(), MembershipError>;
}

/// Resolves the configured backend kind.
///
/// The `InProcess` arm creates a registry private to this topology; workers
/// that should discover each other share one [`InProcessRegistry`] and
/// inject [`InProcessBackend`] handles instead.
#[must_use]
pub fn backend_for(kind: BackendKind) -> Arc<dyn MembershipBackend> {
  match kind {
    BackendKind::SingleNode => Arc::new(SingleNodeBackend::default()),
    BackendKind::InProcess => Arc::new(InProcessBackend::new(InProcessRegistry::default())),
  }
}

/// Self-only membership for single-worker deployments.
///
/// Registration assigns the hinted id, or 0; polls see exactly one worker.
#[derive(Default)]
pub struct SingleNodeBackend {
  slot: Mutex<Option<WorkerEntry>>,
}

#[async_trait::async_trait]
impl MembershipBackend for SingleNodeBackend {
  async fn init(&self, _config: &WorkerConfig) -> Result<(), MembershipError> {
    Ok(())
  }

  async fn register(&self, self_id: Option<u32>, mut entry: WorkerEntry) -> Result<u32, MembershipError> {
    let id = self_id.unwrap_or(0);
    entry.worker_id = id;
    let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(entry);
    Ok(id)
  }

  async fn poll_peers(&self) -> Result<HashMap<u32, WorkerEntry>, MembershipError> {
    let slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    Ok(slot.iter().map(|entry| (entry.worker_id, entry.clone())).collect())
  }

  async fn notify_failure(&self, entry: &WorkerEntry) -> Result<(), MembershipError> {
    debug!(worker = entry.worker_id, "failure notice ignored on single-node backend");
    Ok(())
  }
}

#[derive(Default)]
struct RegistryState {
  next_id: u32,
  entries: HashMap<u32, WorkerEntry>,
}

/// A shared in-process registry.
///
/// Clone one registry into an [`InProcessBackend`] per worker to let several
/// workers embedded in one process discover each other. Ids are assigned in
/// registration order.
#[derive(Clone, Default)]
pub struct InProcessRegistry {
  state: Arc<Mutex<RegistryState>>,
}

impl InProcessRegistry {
  fn register(&self, self_id: Option<u32>, mut entry: WorkerEntry) -> u32 {
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = match self_id {
      Some(id) => id,
      None => {
        let id = state.next_id;
        info!(worker = id, "assigned fresh worker id");
        id
      }
    };
    state.next_id = state.next_id.max(id + 1);
    entry.worker_id = id;
    state.entries.insert(id, entry);
    id
  }

  fn entries(&self) -> HashMap<u32, WorkerEntry> {
    let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    state.entries.clone()
  }

  fn evict(&self, worker_id: u32) {
    let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if state.entries.remove(&worker_id).is_some() {
      info!(worker = worker_id, "evicted worker after failure notice");
    }
  }
}

/// One worker's handle onto a shared [`InProcessRegistry`].
pub struct InProcessBackend {
  registry: InProcessRegistry,
}

impl InProcessBackend {
  /// Wraps a registry handle for one worker.
  #[must_use]
  pub fn new(registry: InProcessRegistry) -> Self {
    InProcessBackend { registry }
  }
}

#[async_trait::async_trait]
impl MembershipBackend for InProcessBackend {
  async fn init(&self, _config: &WorkerConfig) -> Result<(), MembershipError> {
    Ok(())
  }

  async fn register(&self, self_id: Option<u32>, entry: WorkerEntry) -> Result<u32, MembershipError> {
    Ok(self.registry.register(self_id, entry))
  }

  async fn poll_peers(&self) -> Result<HashMap<u32, WorkerEntry>, MembershipError> {
    Ok(self.registry.entries())
  }

  async fn notify_failure(&self, entry: &WorkerEntry) -> Result<(), MembershipError> {
    // The peer re-registers itself on its next heartbeat if it is actually
    // alive, so eviction here is safe to be wrong about.
    self.registry.evict(entry.worker_id);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn single_node_assigns_hint_or_zero() {
    let backend = SingleNodeBackend::default();
    let entry = WorkerEntry::new(0, "localhost", 5000);
    assert_eq!(backend.register(None, entry.clone()).await.unwrap(), 0);
    assert_eq!(backend.register(Some(7), entry).await.unwrap(), 7);
    let peers = backend.poll_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[&7].worker_id, 7);
  }

  #[tokio::test]
  async fn in_process_registry_assigns_sequential_ids() {
    let registry = InProcessRegistry::default();
    let a = InProcessBackend::new(registry.clone());
    let b = InProcessBackend::new(registry.clone());
    let entry = WorkerEntry::new(0, "localhost", 5000);
    assert_eq!(a.register(None, entry.clone()).await.unwrap(), 0);
    assert_eq!(b.register(None, entry.clone()).await.unwrap(), 1);
    assert_eq!(a.poll_peers().await.unwrap().len(), 2);
    assert_eq!(b.poll_peers().await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn in_process_registry_honors_explicit_ids() {
    let registry = InProcessRegistry::default();
    let backend = InProcessBackend::new(registry.clone());
    let entry = WorkerEntry::new(0, "localhost", 5000);
    assert_eq!(backend.register(Some(5), entry.clone()).await.unwrap(), 5);
    // Fresh assignment continues past the explicit id.
    assert_eq!(backend.register(None, entry).await.unwrap(), 6);
  }

  #[tokio::test]
  async fn failure_notice_evicts_until_reregistration() {
    let registry = InProcessRegistry::default();
    let backend = InProcessBackend::new(registry.clone());
    let entry = WorkerEntry::new(0, "localhost", 5000);
    let id = backend.register(None, entry.clone()).await.unwrap();
    let registered = backend.poll_peers().await.unwrap()[&id].clone();

    backend.notify_failure(&registered).await.unwrap();
    assert!(backend.poll_peers().await.unwrap().is_empty());

    backend.register(Some(id), entry).await.unwrap();
    assert_eq!(backend.poll_peers().await.unwrap().len(), 1);
  }
}
