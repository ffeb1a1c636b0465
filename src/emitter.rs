//! Per-task emission handle.
//!
//! The emitter is how a component instance reaches the rest of the
//! topology. Every anchored emission and every ack also produces an XOR
//! contribution to the acker, which is the entire bookkeeping the
//! reliability guarantee rests on; components never talk to the acker
//! directly.

use std::sync::Arc;

use tracing::warn;

use crate::router::Router;
use crate::tuple::{ACKER_COMPONENT, Key, Tuple};

/// A component task's handle for emitting, anchoring and acking tuples.
///
/// Cheap to clone; producer tasks spawned from `ready` hold their own clone.
#[derive(Clone)]
pub struct Emitter {
  router: Arc<Router>,
  component: String,
  task_id: u32,
  worker_id: u32,
}

impl Emitter {
  pub(crate) fn new(router: Arc<Router>, component: String, task_id: u32, worker_id: u32) -> Self {
    Emitter { router, component, task_id, worker_id }
  }

  /// The task this emitter stamps as producer.
  #[must_use]
  pub fn task_id(&self) -> u32 {
    self.task_id
  }

  /// Emits a brand-new tuple from a source, opening a lineage tree.
  ///
  /// The tuple becomes its own root and its own anchor: the contribution
  /// sent here seeds the acker's ledger entry for the new tree, and this
  /// task is recorded as the destination for the eventual completion reply.
  pub async fn source_emit(&self, next: &str, mut tuple: Tuple) {
    tuple.component_name = self.component.clone();
    tuple.task_id = self.task_id;
    tuple.origin_id = tuple.id;
    tuple.source_worker_id = self.worker_id;
    let anchor = tuple.clone();
    self.emit(next, tuple, &anchor).await;
  }

  /// Emits a tuple derived from `anchor` toward `next`.
  ///
  /// The output joins the anchor's lineage tree: it inherits the root id,
  /// gains the root in its ack fan-out list, and its creation is charged to
  /// the ledger under the anchor's producer.
  pub async fn emit(&self, next: &str, mut tuple: Tuple, anchor: &Tuple) {
    tuple.origin_id = anchor.origin_id;
    tuple.source_ids.push(anchor.origin_id);
    tuple.component_name = self.component.clone();
    tuple.task_id = self.task_id;
    self
      .contribute(&anchor.component_name, anchor.origin_id, tuple.id, anchor.task_id)
      .await;
    tuple.next_component = Some(next.to_string());
    if let Err(error) = self.router.route(tuple).await {
      warn!(component = %self.component, error = %error, "dropping emitted tuple");
    }
  }

  /// Declares a tuple fully handled by this task, cancelling its charge in
  /// every tree it belongs to.
  pub async fn ack(&self, tuple: &Tuple) {
    for source_id in &tuple.source_ids {
      self.contribute(&self.component, *source_id, tuple.id, self.task_id).await;
    }
  }

  /// Sends a tuple straight to a specific task of `next`, bypassing
  /// partitioning. No lineage bookkeeping happens here; this is the path
  /// for completion replies.
  pub async fn emit_direct(&self, next: &str, destination_task_id: u32, mut tuple: Tuple) {
    tuple.component_name = self.component.clone();
    tuple.task_id = self.task_id;
    tuple.next_component = Some(next.to_string());
    if let Err(error) = self.router.route_to_task(tuple, destination_task_id).await {
      warn!(
        component = %self.component,
        task = destination_task_id,
        error = %error,
        "dropping direct tuple"
      );
    }
  }

  /// One XOR contribution to the ledger of tree `root_id`, reported under
  /// `component`/`task_id`. Keyed on the root so the same acker task sees
  /// every contribution for one tree.
  async fn contribute(&self, component: &str, root_id: i64, value: i64, task_id: u32) {
    let mut contribution = Tuple::new();
    contribution.origin_id = root_id;
    contribution.ack = true;
    contribution.group_by_key = Some(Key::Int(root_id));
    contribution.group_by_value = Some(value);
    contribution.component_name = component.to_string();
    contribution.task_id = task_id;
    contribution.next_component = Some(ACKER_COMPONENT.to_string());
    if let Err(error) = self.router.route(contribution).await {
      warn!(root = root_id, error = %error, "dropping ack contribution");
    }
  }
}
