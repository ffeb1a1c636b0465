//! # Tuple routing
//!
//! The router turns a tuple's `next_component` into a concrete (task,
//! worker) destination and dispatches it: straight into a local mailbox, or
//! onto an outbound transport queue when the owning worker is remote.
//!
//! Task addressing is arithmetic, not a lookup table. With parallelism `p`
//! and `w` known workers, component tasks are numbered `0..p*w` and task `t`
//! lives on worker `t / p`. Keyed routing picks `t` from the stable hash of
//! the routing key; shuffle routing folds the tuple id over this worker's
//! own task range, so it never leaves the worker.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::component::RoutingStrategy;
use crate::hash;
use crate::membership::MembershipView;
use crate::tuple::Tuple;

/// Why a tuple could not be dispatched. Callers own the drop policy: every
/// variant is non-fatal and the tuple it describes is simply lost.
#[derive(Debug, Error)]
pub enum RouteError {
  /// The tuple names no target component.
  #[error("tuple has no target component")]
  MissingTarget,
  /// The target component is not registered on this worker.
  #[error("unknown component {0}")]
  UnknownComponent(String),
  /// Keyed routing was asked to place a tuple with no routing key.
  #[error("keyed routing to {component} requires a group-by key")]
  MissingKey {
    /// The keyed component the tuple was addressed to.
    component: String,
  },
  /// No mailbox is registered for the resolved task.
  #[error("no task {task_id} registered for component {component}")]
  UnknownTask {
    /// Target component.
    component: String,
    /// Resolved task id.
    task_id: u32,
  },
  /// The target task's mailbox has shut down.
  #[error("mailbox for component {component} task {task_id} is closed")]
  MailboxClosed {
    /// Target component.
    component: String,
    /// Resolved task id.
    task_id: u32,
  },
  /// The tuple resolved to a remote worker but no transport is running.
  #[error("remote transport unavailable")]
  TransportUnavailable,
}

struct ComponentSlot {
  parallelism: u32,
  strategy: RoutingStrategy,
  senders: HashMap<u32, mpsc::Sender<Tuple>>,
}

/// Partitions tuples and dispatches them locally or toward the transport.
pub struct Router {
  self_worker_id: u32,
  cluster_size: u32,
  poll_interval: Duration,
  view: MembershipView,
  arena: RwLock<HashMap<String, ComponentSlot>>,
  outbound: Vec<mpsc::Sender<Tuple>>,
}

impl Router {
  pub(crate) fn new(
    self_worker_id: u32,
    cluster_size: u32,
    poll_interval: Duration,
    view: MembershipView,
    outbound: Vec<mpsc::Sender<Tuple>>,
  ) -> Self {
    Router {
      self_worker_id,
      cluster_size: cluster_size.max(1),
      poll_interval,
      view,
      arena: RwLock::new(HashMap::new()),
      outbound,
    }
  }

  /// The worker this router dispatches for.
  #[must_use]
  pub fn self_worker_id(&self) -> u32 {
    self.self_worker_id
  }

  pub(crate) fn register_component(&self, name: &str, parallelism: u32, strategy: RoutingStrategy) {
    let mut arena = self.arena.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    arena.insert(
      name.to_string(),
      ComponentSlot { parallelism: parallelism.max(1), strategy, senders: HashMap::new() },
    );
  }

  pub(crate) fn register_task(&self, component: &str, task_id: u32, sender: mpsc::Sender<Tuple>) {
    let mut arena = self.arena.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(slot) = arena.get_mut(component) {
      slot.senders.insert(task_id, sender);
    }
  }

  /// Drops every registered mailbox sender, letting task strands drain out.
  pub(crate) fn clear(&self) {
    let mut arena = self.arena.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    arena.clear();
  }

  fn slot_meta(&self, component: &str) -> Result<(u32, RoutingStrategy), RouteError> {
    let arena = self.arena.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    arena
      .get(component)
      .map(|slot| (slot.parallelism, slot.strategy))
      .ok_or_else(|| RouteError::UnknownComponent(component.to_string()))
  }

  /// Dispatches a tuple by its target component's declared strategy.
  pub async fn route(&self, mut tuple: Tuple) -> Result<(), RouteError> {
    let next = tuple.next_component.clone().ok_or(RouteError::MissingTarget)?;
    let (parallelism, strategy) = self.slot_meta(&next)?;
    // The view always holds at least our own entry once membership is up.
    let worker_count = self.view.known_count().max(1) as u32;

    let task_id = match strategy {
      RoutingStrategy::Keyed => {
        let key = tuple
          .group_by_key
          .as_ref()
          .ok_or_else(|| RouteError::MissingKey { component: next.clone() })?;
        keyed_task(&key.routing_str(), parallelism * worker_count)
      }
      RoutingStrategy::Shuffle => {
        self.self_worker_id * parallelism + (tuple.id % i64::from(parallelism)).unsigned_abs() as u32
      }
    };

    let destination_worker = task_id / parallelism;
    if destination_worker == self.self_worker_id {
      self.route_local(&next, task_id, tuple).await
    } else {
      tuple.destination_task_id = task_id;
      tuple.destination_worker_id = destination_worker;
      self.forward_remote(tuple).await
    }
  }

  /// Dispatches a tuple to an explicit task, bypassing partitioning.
  ///
  /// Used for direct task-addressed replies; the owning worker is still
  /// derived from the target component's parallelism.
  pub async fn route_to_task(&self, mut tuple: Tuple, task_id: u32) -> Result<(), RouteError> {
    let next = tuple.next_component.clone().ok_or(RouteError::MissingTarget)?;
    let (parallelism, _) = self.slot_meta(&next)?;
    let destination_worker = task_id / parallelism;
    if destination_worker == self.self_worker_id {
      self.route_local(&next, task_id, tuple).await
    } else {
      tuple.destination_task_id = task_id;
      tuple.destination_worker_id = destination_worker;
      self.forward_remote(tuple).await
    }
  }

  /// Enqueues a tuple into a local task's mailbox, suspending while the
  /// mailbox is full. The transport's receive path lands here too, which is
  /// what makes remote delivery indistinguishable from local delivery.
  pub async fn route_local(&self, component: &str, task_id: u32, tuple: Tuple) -> Result<(), RouteError> {
    let sender = {
      let arena = self.arena.read().unwrap_or_else(|poisoned| poisoned.into_inner());
      let slot = arena
        .get(component)
        .ok_or_else(|| RouteError::UnknownComponent(component.to_string()))?;
      slot
        .senders
        .get(&task_id)
        .cloned()
        .ok_or_else(|| RouteError::UnknownTask { component: component.to_string(), task_id })?
    };
    sender
      .send(tuple)
      .await
      .map_err(|_| RouteError::MailboxClosed { component: component.to_string(), task_id })
  }

  async fn forward_remote(&self, tuple: Tuple) -> Result<(), RouteError> {
    if self.outbound.is_empty() {
      return Err(RouteError::TransportUnavailable);
    }
    let shard = tuple.destination_worker_id as usize % self.outbound.len();
    self.outbound[shard].send(tuple).await.map_err(|_| RouteError::TransportUnavailable)
  }

  /// Blocks until the membership view knows the configured cluster size.
  ///
  /// An explicit barrier: if the cluster never assembles, this never
  /// returns.
  pub async fn wait_for_cluster(&self) {
    loop {
      let known = self.view.known_count();
      if known >= self.cluster_size as usize {
        return;
      }
      info!(
        worker = self.self_worker_id,
        known,
        expected = self.cluster_size,
        "waiting for cluster to assemble"
      );
      tokio::time::sleep(self.poll_interval).await;
    }
  }
}

/// Target task for a routing key: the key's stable 32-bit hash, interpreted
/// as signed, reduced modulo the component's total task count.
fn keyed_task(key: &str, total_tasks: u32) -> u32 {
  let hashed = hash::hash32(key.as_bytes()) as i32;
  (hashed % total_tasks as i32).unsigned_abs()
}
