//! # XOR-ledger completion tracking
//!
//! The acker is an ordinary component, auto-registered under the reserved
//! `_acker` name and routed keyed on lineage root ids, so all contributions
//! for one tuple tree land on the same task and its ledger needs no locks.
//!
//! Per root id the ledger keeps a single 64-bit value. Every tuple created
//! in the tree is XOR-ed in once (by its producer's emission) and XOR-ed out
//! once (by its consumer's ack); the value returns to zero exactly when
//! every tuple has been both emitted and acked, regardless of arrival
//! order. Entries that fail to zero out within the eviction window are
//! reported to their source as failed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::component::{Component, RoutingStrategy};
use crate::config::WorkerConfig;
use crate::emitter::Emitter;
use crate::tuple::{ACKER_COMPONENT, Key, Tuple};

/// Buckets in the eviction ring. Entries survive at least this many sweep
/// ticks minus one, and at most this many.
const LEDGER_BUCKETS: usize = 3;

/// Interval between progress log lines, in contributions processed.
const PROGRESS_INTERVAL: u64 = 100_000;

/// A ring of time-windowed buckets with O(1) bulk eviction.
///
/// Inserts go to the newest bucket; lookups scan oldest-first; `rotate`
/// drops the whole oldest bucket and opens a fresh one. Expiry precision is
/// one bucket width, which is the price of never walking entries on a
/// timer.
pub struct RotatingMap<K, V> {
  buckets: VecDeque<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> RotatingMap<K, V> {
  /// A ring of `num_buckets` empty buckets (at least one).
  #[must_use]
  pub fn new(num_buckets: usize) -> Self {
    let mut buckets = VecDeque::with_capacity(num_buckets.max(1));
    for _ in 0..num_buckets.max(1) {
      buckets.push_back(HashMap::new());
    }
    RotatingMap { buckets }
  }

  /// Inserts into the newest bucket.
  pub fn insert(&mut self, key: K, value: V) {
    if let Some(newest) = self.buckets.back_mut() {
      newest.insert(key, value);
    }
  }

  /// Finds a value, scanning oldest bucket first.
  pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
    self.buckets.iter_mut().find_map(|bucket| bucket.get_mut(key))
  }

  /// Removes a value, scanning oldest bucket first.
  pub fn remove(&mut self, key: &K) -> Option<V> {
    self.buckets.iter_mut().find_map(|bucket| bucket.remove(key))
  }

  /// Evicts the oldest bucket wholesale and opens a fresh one, returning
  /// the evicted entries.
  pub fn rotate(&mut self) -> HashMap<K, V> {
    let expired = self.buckets.pop_front().unwrap_or_default();
    self.buckets.push_back(HashMap::new());
    expired
  }

  /// Number of live entries across all buckets.
  #[must_use]
  pub fn len(&self) -> usize {
    self.buckets.iter().map(HashMap::len).sum()
  }

  /// Whether no entries are live.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.buckets.iter().all(HashMap::is_empty)
  }
}

/// Ledger row for one lineage tree.
#[derive(Debug, Clone, PartialEq)]
pub struct AckerEntry {
  /// Source component that opened the tree; the completion reply goes here.
  pub source_component: String,
  /// Source task that opened the tree.
  pub source_task_id: u32,
  /// When the row was created.
  pub create_time: DateTime<Utc>,
  /// Running XOR of every contribution. Zero means complete.
  pub xor_value: i64,
}

impl AckerEntry {
  fn new(source_component: String, source_task_id: u32, initial: i64) -> Self {
    AckerEntry { source_component, source_task_id, create_time: Utc::now(), xor_value: initial }
  }

  fn integrate(&mut self, value: i64) {
    self.xor_value ^= value;
  }

  fn is_complete(&self) -> bool {
    self.xor_value == 0
  }
}

/// The built-in completion tracker.
///
/// Constructed by the topology with the set of registered source names; a
/// tree may only be opened by a contribution whose reporter is a source.
pub struct Acker {
  ledger: RotatingMap<i64, AckerEntry>,
  sources: HashSet<String>,
  tick_millis: u64,
  emitter: Option<Emitter>,
  processed: u64,
}

impl Acker {
  /// A fresh acker sweeping at `tick_millis`.
  #[must_use]
  pub fn new(sources: HashSet<String>, tick_millis: u64) -> Self {
    Acker {
      ledger: RotatingMap::new(LEDGER_BUCKETS),
      sources,
      tick_millis,
      emitter: None,
      processed: 0,
    }
  }

  /// Folds one contribution into the ledger.
  async fn track(&mut self, tuple: Tuple) {
    let root = tuple.origin_id;
    let Some(value) = tuple.group_by_value else {
      warn!(root, component = %tuple.component_name, "dropping contribution with no value");
      return;
    };

    match self.ledger.get_mut(&root) {
      Some(entry) => {
        entry.integrate(value);
        if entry.is_complete() {
          if let Some(entry) = self.ledger.remove(&root) {
            debug!(root, source = %entry.source_component, "tuple tree complete");
            self.reply(root, &entry, true).await;
          }
        }
      }
      None => {
        if self.sources.contains(&tuple.component_name) {
          // The opening contribution carries the root as its value; seed
          // with the root id and remember where the reply must go.
          self
            .ledger
            .insert(root, AckerEntry::new(tuple.component_name, tuple.task_id, root));
        } else {
          warn!(
            root,
            component = %tuple.component_name,
            "dropping contribution: no ledger entry and reporter is not a source"
          );
        }
      }
    }
  }

  /// Rotates the eviction ring and fails every tree the oldest bucket still
  /// held.
  async fn sweep(&mut self) {
    let expired = self.ledger.rotate();
    for (root, entry) in expired {
      warn!(root, source = %entry.source_component, "tuple tree expired before completion");
      self.reply(root, &entry, false).await;
    }
  }

  async fn reply(&self, root: i64, entry: &AckerEntry, completed: bool) {
    let Some(emitter) = self.emitter.as_ref() else {
      return;
    };
    let mut reply = Tuple::new();
    reply.origin_id = root;
    reply.group_by_key = Some(Key::Int(root));
    reply.ack = completed;
    emitter.emit_direct(&entry.source_component, entry.source_task_id, reply).await;
  }
}

#[async_trait::async_trait]
impl Component for Acker {
  fn name(&self) -> String {
    ACKER_COMPONENT.to_string()
  }

  fn routing_strategy(&self) -> RoutingStrategy {
    RoutingStrategy::Keyed
  }

  fn tick_interval_millis(&self) -> u64 {
    self.tick_millis
  }

  fn configure(&mut self, _config: &WorkerConfig, _task_id: u32, emitter: Emitter) {
    self.emitter = Some(emitter);
  }

  async fn ready(&mut self) {}

  async fn process(&mut self, tuple: Tuple) {
    if tuple.is_tick() {
      self.sweep().await;
      return;
    }
    self.processed += 1;
    if self.processed % PROGRESS_INTERVAL == 0 {
      info!(processed = self.processed, pending = self.ledger.len(), "acker progress");
    }
    self.track(tuple).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rotating_map_finds_entries_in_any_bucket() {
    let mut map = RotatingMap::new(3);
    map.insert("a", 1);
    map.rotate();
    map.insert("b", 2);
    assert_eq!(map.get_mut(&"a"), Some(&mut 1));
    assert_eq!(map.get_mut(&"b"), Some(&mut 2));
    assert_eq!(map.len(), 2);
  }

  #[test]
  fn rotating_map_evicts_after_a_full_cycle() {
    let mut map = RotatingMap::new(3);
    map.insert("a", 1);
    assert!(map.rotate().is_empty());
    assert!(map.rotate().is_empty());
    let expired = map.rotate();
    assert_eq!(expired.get("a"), Some(&1));
    assert!(map.is_empty());
    assert_eq!(map.get_mut(&"a"), None);
  }

  #[test]
  fn rotating_map_remove_scans_oldest_first() {
    let mut map = RotatingMap::new(3);
    map.insert("a", 1);
    map.rotate();
    map.insert("a", 2);
    // Two generations of "a" live at once; removal takes the oldest.
    assert_eq!(map.remove(&"a"), Some(1));
    assert_eq!(map.remove(&"a"), Some(2));
    assert_eq!(map.remove(&"a"), None);
  }

  #[test]
  fn rotating_map_survives_a_zero_bucket_request() {
    let mut map = RotatingMap::new(0);
    map.insert("a", 1);
    assert_eq!(map.rotate().get("a"), Some(&1));
  }

  #[test]
  fn entry_completes_when_contributions_cancel() {
    let mut entry = AckerEntry::new("spout".to_string(), 0, 77);
    assert!(!entry.is_complete());
    entry.integrate(12);
    entry.integrate(12);
    assert!(!entry.is_complete());
    entry.integrate(77);
    assert!(entry.is_complete());
  }
}
