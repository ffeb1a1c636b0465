//! # Cluster membership
//!
//! Maintains the worker-id to address map every other subsystem routes by.
//! A worker registers against a pluggable discovery [`backend`], persists
//! its assigned id, then runs a push/poll heartbeat loop that merges peer
//! entries into an immutable snapshot. Readers grab the snapshot through a
//! cheap [`MembershipView`] clone and never contend with the writer.
//!
//! Liveness is a consumer-side judgment: entries are never removed from the
//! known map, and [`MembershipView::live`] filters by entry age instead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;

pub mod backend;

use backend::MembershipBackend;

/// Membership failures.
#[derive(Debug, Error)]
pub enum MembershipError {
  /// The discovery backend could not be reached or refused the call.
  #[error("membership backend unavailable: {0}")]
  BackendUnavailable(String),
  /// The worker-id cache file could not be written.
  #[error("worker id cache {path}: {source}")]
  IdCache {
    /// Path of the cache file.
    path: String,
    /// Underlying filesystem error.
    #[source]
    source: std::io::Error,
  },
}

/// One worker's record in the cluster map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
  /// Assigned worker id.
  pub worker_id: u32,
  /// Address the worker's data transport listens on.
  pub address: String,
  /// Port the worker's data transport listens on.
  pub data_port: u16,
  /// Last time this worker was heard from.
  pub last_contact: DateTime<Utc>,
  /// Whether the backend observed a full quorum when this entry was
  /// produced. Informational; routing does not consult it.
  pub quorum_established: bool,
}

impl WorkerEntry {
  /// A fresh entry stamped with the current time.
  #[must_use]
  pub fn new(worker_id: u32, address: impl Into<String>, data_port: u16) -> Self {
    WorkerEntry {
      worker_id,
      address: address.into(),
      data_port,
      last_contact: Utc::now(),
      quorum_established: false,
    }
  }

  /// Whether this entry has been heard from within `threshold`.
  #[must_use]
  pub fn is_live(&self, threshold: Duration) -> bool {
    let age = Utc::now().signed_duration_since(self.last_contact);
    age.to_std().map(|age| age <= threshold).unwrap_or(true)
  }
}

/// Shared, read-only handle onto the current membership snapshot.
///
/// Cloning is cheap; every clone observes the same atomically swapped map.
#[derive(Clone, Default)]
pub struct MembershipView {
  inner: Arc<RwLock<Arc<HashMap<u32, WorkerEntry>>>>,
}

impl MembershipView {
  /// The full known map, including entries that have gone quiet.
  #[must_use]
  pub fn snapshot(&self) -> Arc<HashMap<u32, WorkerEntry>> {
    self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
  }

  /// Number of workers ever observed.
  #[must_use]
  pub fn known_count(&self) -> usize {
    self.snapshot().len()
  }

  /// Entries heard from within `threshold`.
  #[must_use]
  pub fn live(&self, threshold: Duration) -> HashMap<u32, WorkerEntry> {
    self
      .snapshot()
      .iter()
      .filter(|(_, entry)| entry.is_live(threshold))
      .map(|(id, entry)| (*id, entry.clone()))
      .collect()
  }

  pub(crate) fn publish(&self, map: HashMap<u32, WorkerEntry>) {
    let mut slot = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Arc::new(map);
  }
}

/// Registration plus the background heartbeat loop.
pub struct MembershipService {
  view: MembershipView,
  backend: Arc<dyn MembershipBackend>,
  self_id: u32,
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

impl MembershipService {
  /// Registers this worker and starts the heartbeat loop.
  ///
  /// Blocks until the backend accepts the registration, retrying at the
  /// heartbeat cadence for as long as it takes; a cluster with no reachable
  /// backend is not something a worker can make progress without. The id
  /// hint is the cached id from a previous run if one is persisted,
  /// otherwise the configured id, otherwise none.
  pub async fn start(
    config: &WorkerConfig,
    backend: Arc<dyn MembershipBackend>,
    cancel: CancellationToken,
  ) -> Result<Self, MembershipError> {
    let mut hint = config.worker_id;
    if let Some(path) = &config.id_cache_path {
      if let Some(cached) = read_cached_id(path).await {
        debug!(worker = cached, path = %path.display(), "reusing cached worker id");
        hint = Some(cached);
      }
    }

    let mut entry = WorkerEntry::new(hint.unwrap_or(0), config.bind_address.clone(), config.data_port);
    let self_id = loop {
      entry.last_contact = Utc::now();
      match backend.register(hint, entry.clone()).await {
        Ok(id) => break id,
        Err(error) => {
          warn!(error = %error, "membership backend unavailable, retrying registration");
          tokio::time::sleep(config.heartbeat_interval).await;
        }
      }
    };
    entry.worker_id = self_id;

    if let Some(path) = &config.id_cache_path {
      write_cached_id(path, self_id).await?;
    }

    let view = MembershipView::default();
    view.publish(HashMap::from([(self_id, entry.clone())]));

    let handle = tokio::spawn(heartbeat_loop(
      backend.clone(),
      view.clone(),
      entry,
      config.heartbeat_interval,
      cancel.clone(),
    ));
    info!(worker = self_id, "membership service started");

    Ok(MembershipService { view, backend, self_id, cancel, handle })
  }

  /// This worker's assigned id.
  #[must_use]
  pub fn self_id(&self) -> u32 {
    self.self_id
  }

  /// A read handle onto the membership snapshot.
  #[must_use]
  pub fn view(&self) -> MembershipView {
    self.view.clone()
  }

  /// The backend this service registered with, for failure reporting.
  #[must_use]
  pub fn backend(&self) -> Arc<dyn MembershipBackend> {
    self.backend.clone()
  }

  /// Stops the heartbeat loop and waits for it to exit.
  pub async fn stop(self) {
    self.cancel.cancel();
    let _ = self.handle.await;
  }
}

/// Push self, poll peers, merge, publish. A failed cycle is logged and the
/// next tick simply tries again.
async fn heartbeat_loop(
  backend: Arc<dyn MembershipBackend>,
  view: MembershipView,
  mut self_entry: WorkerEntry,
  interval: Duration,
  cancel: CancellationToken,
) {
  let self_id = self_entry.worker_id;
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = tokio::time::sleep(interval) => {}
    }

    self_entry.last_contact = Utc::now();
    if let Err(error) = backend.register(Some(self_id), self_entry.clone()).await {
      warn!(worker = self_id, error = %error, "membership heartbeat push failed");
      continue;
    }

    match backend.poll_peers().await {
      Ok(peers) => {
        let mut merged: HashMap<u32, WorkerEntry> = (*view.snapshot()).clone();
        let known_before = merged.len();
        for (id, peer) in peers {
          // Polled entries win wholesale, timestamp included, so liveness
          // reflects what the backend reported rather than when we polled.
          merged.insert(id, peer);
        }
        if merged.len() > known_before {
          info!(worker = self_id, known = merged.len(), "discovered new workers");
        }
        view.publish(merged);
      }
      Err(error) => {
        warn!(worker = self_id, error = %error, "membership poll failed");
      }
    }
  }
  debug!(worker = self_id, "membership loop stopped");
}

async fn read_cached_id(path: &Path) -> Option<u32> {
  match tokio::fs::read_to_string(path).await {
    Ok(text) => match text.trim().parse::<u32>() {
      Ok(id) => Some(id),
      Err(_) => {
        warn!(path = %path.display(), "ignoring unparseable worker id cache");
        None
      }
    },
    // An absent cache is the normal first-run case.
    Err(_) => None,
  }
}

async fn write_cached_id(path: &Path, id: u32) -> Result<(), MembershipError> {
  tokio::fs::write(path, format!("{id}\n")).await.map_err(|source| MembershipError::IdCache {
    path: path.display().to_string(),
    source,
  })
}
