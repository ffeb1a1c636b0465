//! The tuple data model and id generation.
//!
//! A [`Tuple`] is the unit of transmission and processing. Besides the user
//! payload it carries the lineage metadata the reliability subsystem needs:
//! the id of its tree root, the ancestor ids it must acknowledge, and the
//! producer coordinates stamped by the emitter on every hop.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::hash;

/// Reserved component name of the built-in completion tracker.
pub const ACKER_COMPONENT: &str = "_acker";

/// Reserved component name stamped on synthetic tick tuples.
pub const TICK_COMPONENT: &str = "_tick";

/// A routing key: either an integer or a piece of text.
///
/// Keys hash by their canonical string form, so `Key::Int(7)` and
/// `Key::Text("7".into())` partition identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
  /// An integer key, hashed as its decimal rendering.
  Int(i64),
  /// A text key, hashed as its bytes.
  Text(String),
}

impl Key {
  /// The canonical string this key hashes as.
  #[must_use]
  pub fn routing_str(&self) -> std::borrow::Cow<'_, str> {
    match self {
      Key::Int(value) => std::borrow::Cow::Owned(value.to_string()),
      Key::Text(text) => std::borrow::Cow::Borrowed(text),
    }
  }
}

impl From<i64> for Key {
  fn from(value: i64) -> Self {
    Key::Int(value)
  }
}

impl From<&str> for Key {
  fn from(value: &str) -> Self {
    Key::Text(value.to_string())
  }
}

impl From<String> for Key {
  fn from(value: String) -> Self {
    Key::Text(value)
  }
}

/// One unit of data flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuple {
  /// Process-unique id, assigned at creation.
  pub id: i64,
  /// Id of this tuple's lineage root. Equal to `id` for source-emitted
  /// tuples; copied from the anchor for derived tuples.
  pub origin_id: i64,
  /// Ancestor ids this tuple acknowledges when acked. Grows by appension
  /// on each anchored emission, never mutated in place once sent.
  pub source_ids: Vec<i64>,
  /// Routing key for keyed partitioning; also carries the root id on
  /// ack-protocol tuples.
  pub group_by_key: Option<Key>,
  /// Ledger contribution value on ack-protocol tuples.
  pub group_by_value: Option<i64>,
  /// Name of the component that produced this tuple.
  pub component_name: String,
  /// Component this tuple is being routed to.
  pub next_component: Option<String>,
  /// Task that produced this tuple.
  pub task_id: u32,
  /// Target task, stamped by the router on remote sends.
  pub destination_task_id: u32,
  /// Target worker, stamped by the router on remote sends.
  pub destination_worker_id: u32,
  /// Worker that created the lineage root.
  pub source_worker_id: u32,
  /// Marks ack-protocol tuples; on a completion reply, `true` means the
  /// tree finished and `false` means it expired.
  pub ack: bool,
  /// User data, opaque to the runtime.
  pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Tuple {
  /// A blank tuple with a fresh process-unique id.
  #[must_use]
  pub fn new() -> Self {
    Self::with_id(fresh_id())
  }

  /// A blank tuple with an explicit id.
  #[must_use]
  pub fn with_id(id: i64) -> Self {
    Tuple {
      id,
      origin_id: 0,
      source_ids: Vec::new(),
      group_by_key: None,
      group_by_value: None,
      component_name: String::new(),
      next_component: None,
      task_id: 0,
      destination_task_id: 0,
      destination_worker_id: 0,
      source_worker_id: 0,
      ack: false,
      payload: serde_json::Map::new(),
    }
  }

  /// A blank tuple whose id is derived from a string seed, stable across
  /// processes and restarts.
  #[must_use]
  pub fn with_derived_id(seed: &str) -> Self {
    Self::with_id(hash::hash64(seed.as_bytes()) as i64)
  }

  /// Whether this is a synthetic tick injected by the executor's timer.
  #[must_use]
  pub fn is_tick(&self) -> bool {
    self.component_name == TICK_COMPONENT
  }

  /// Interprets this tuple as a completion reply from the acker.
  ///
  /// Replies are the only tuples delivered to sources, and always carry a
  /// routing key. Returns the lineage root id and whether the tree
  /// completed (`true`) or expired (`false`).
  #[must_use]
  pub fn ack_reply(&self) -> Option<(i64, bool)> {
    self.group_by_key.as_ref().map(|_| (self.origin_id, self.ack))
  }

  /// Stores a payload field.
  pub fn set(&mut self, field: &str, value: impl Into<serde_json::Value>) {
    self.payload.insert(field.to_string(), value.into());
  }

  /// Reads a payload field.
  #[must_use]
  pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
    self.payload.get(field)
  }
}

impl Default for Tuple {
  fn default() -> Self {
    Self::new()
  }
}

/// Process-unique id: an atomic counter seeded once from the wall clock
/// mixed with a random value. Uniqueness is only required within the
/// lifetime of a tuple tree, so counter wraparound is not a concern.
fn fresh_id() -> i64 {
  static SEQUENCE: OnceLock<AtomicI64> = OnceLock::new();
  let sequence = SEQUENCE.get_or_init(|| {
    let nanos = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|elapsed| elapsed.as_nanos() as i64)
      .unwrap_or(1);
    AtomicI64::new(nanos ^ (rand::random::<i64>() << 32))
  });
  sequence.fetch_add(1, Ordering::Relaxed)
}
