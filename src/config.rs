//! Worker configuration.
//!
//! One [`WorkerConfig`] is shared by every subsystem on a worker. Defaults
//! suit a single-node deployment; tests and clusters override the handful of
//! fields they care about through the `with_*` builders.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which membership discovery backend the topology resolves at startup.
///
/// External backends (quorum stores and the like) bypass this enum and are
/// injected directly via `Topology::with_backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
  /// Self-only membership for single-worker deployments.
  #[default]
  SingleNode,
  /// A process-wide shared registry, for embedding several workers in one
  /// process.
  InProcess,
}

/// Configuration for one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Preferred worker id. `None` asks the backend to assign one.
  pub worker_id: Option<u32>,
  /// Number of workers the cluster is expected to reach before the router
  /// releases its startup barrier.
  pub worker_count: u32,
  /// Address the data transport binds and advertises.
  pub bind_address: String,
  /// Port the data transport binds and advertises.
  pub data_port: u16,
  /// Replicas of the built-in completion tracker.
  pub acker_parallelism: u32,
  /// Outbound transport strands; remote sends shard across them by
  /// destination worker.
  pub client_threads: u32,
  /// Capacity of each task mailbox.
  pub mailbox_capacity: usize,
  /// Capacity of each outbound transport queue.
  pub outbound_capacity: usize,
  /// Cadence of the membership push/poll cycle.
  pub heartbeat_interval: Duration,
  /// Age beyond which a peer entry is excluded from the live view.
  pub liveness_timeout: Duration,
  /// Sleep between checks while waiting for the cluster to assemble.
  pub discovery_poll_interval: Duration,
  /// Warm-up delay before each task's `ready` callback runs.
  pub ready_delay: Duration,
  /// Grace period for mailbox drain during shutdown, per task.
  pub drain_timeout: Duration,
  /// Cadence of the acker's eviction sweep.
  pub acker_tick_interval: Duration,
  /// Reconnect attempts before a remote send is abandoned.
  pub transport_retries: u32,
  /// Fixed delay between reconnect attempts.
  pub transport_retry_delay: Duration,
  /// Membership backend selected when none is injected.
  pub backend: BackendKind,
  /// File persisting this worker's assigned id across restarts.
  /// `None` disables persistence.
  pub id_cache_path: Option<PathBuf>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    WorkerConfig {
      worker_id: None,
      worker_count: 1,
      bind_address: "localhost".to_string(),
      data_port: 5000,
      acker_parallelism: 1,
      client_threads: 1,
      mailbox_capacity: 8192,
      outbound_capacity: 8192,
      heartbeat_interval: Duration::from_millis(1000),
      liveness_timeout: Duration::from_millis(5000),
      discovery_poll_interval: Duration::from_millis(2000),
      ready_delay: Duration::from_millis(3000),
      drain_timeout: Duration::from_millis(1000),
      acker_tick_interval: Duration::from_millis(30_000),
      transport_retries: 3,
      transport_retry_delay: Duration::from_millis(1000),
      backend: BackendKind::SingleNode,
      id_cache_path: None,
    }
  }
}

impl WorkerConfig {
  /// Sets the preferred worker id.
  #[must_use]
  pub fn with_worker_id(mut self, worker_id: u32) -> Self {
    self.worker_id = Some(worker_id);
    self
  }

  /// Sets the expected cluster size.
  #[must_use]
  pub fn with_worker_count(mut self, worker_count: u32) -> Self {
    self.worker_count = worker_count;
    self
  }

  /// Sets the transport bind address.
  #[must_use]
  pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
    self.bind_address = bind_address.into();
    self
  }

  /// Sets the transport port.
  #[must_use]
  pub fn with_data_port(mut self, data_port: u16) -> Self {
    self.data_port = data_port;
    self
  }

  /// Sets the acker replica count.
  #[must_use]
  pub fn with_acker_parallelism(mut self, parallelism: u32) -> Self {
    self.acker_parallelism = parallelism;
    self
  }

  /// Sets the outbound transport strand count.
  #[must_use]
  pub fn with_client_threads(mut self, client_threads: u32) -> Self {
    self.client_threads = client_threads;
    self
  }

  /// Sets the task mailbox capacity.
  #[must_use]
  pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
    self.mailbox_capacity = capacity;
    self
  }

  /// Sets the membership heartbeat cadence.
  #[must_use]
  pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  /// Sets the peer liveness threshold.
  #[must_use]
  pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
    self.liveness_timeout = timeout;
    self
  }

  /// Sets the cluster-assembly poll cadence.
  #[must_use]
  pub fn with_discovery_poll_interval(mut self, interval: Duration) -> Self {
    self.discovery_poll_interval = interval;
    self
  }

  /// Sets the pre-`ready` warm-up delay.
  #[must_use]
  pub fn with_ready_delay(mut self, delay: Duration) -> Self {
    self.ready_delay = delay;
    self
  }

  /// Sets the shutdown drain grace period.
  #[must_use]
  pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
    self.drain_timeout = timeout;
    self
  }

  /// Sets the acker sweep cadence.
  #[must_use]
  pub fn with_acker_tick_interval(mut self, interval: Duration) -> Self {
    self.acker_tick_interval = interval;
    self
  }

  /// Sets the remote-send retry budget.
  #[must_use]
  pub fn with_transport_retries(mut self, retries: u32, delay: Duration) -> Self {
    self.transport_retries = retries;
    self.transport_retry_delay = delay;
    self
  }

  /// Selects the membership backend kind.
  #[must_use]
  pub fn with_backend(mut self, backend: BackendKind) -> Self {
    self.backend = backend;
    self
  }

  /// Sets the worker-id cache file.
  #[must_use]
  pub fn with_id_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.id_cache_path = Some(path.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_describe_a_single_node() {
    let config = WorkerConfig::default();
    assert_eq!(config.worker_id, None);
    assert_eq!(config.worker_count, 1);
    assert_eq!(config.data_port, 5000);
    assert_eq!(config.bind_address, "localhost");
    assert_eq!(config.acker_parallelism, 1);
    assert_eq!(config.client_threads, 1);
    assert_eq!(config.mailbox_capacity, 8192);
    assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    assert_eq!(config.liveness_timeout, Duration::from_secs(5));
    assert_eq!(config.ready_delay, Duration::from_secs(3));
    assert_eq!(config.backend, BackendKind::SingleNode);
    assert_eq!(config.id_cache_path, None);
  }

  #[test]
  fn builders_override_fields() {
    let config = WorkerConfig::default()
      .with_worker_id(3)
      .with_worker_count(4)
      .with_data_port(0)
      .with_backend(BackendKind::InProcess)
      .with_ready_delay(Duration::from_millis(10));
    assert_eq!(config.worker_id, Some(3));
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.data_port, 0);
    assert_eq!(config.backend, BackendKind::InProcess);
    assert_eq!(config.ready_delay, Duration::from_millis(10));
  }

  #[test]
  fn config_deserializes_from_json() {
    let config: WorkerConfig =
      serde_json::from_str(&serde_json::to_string(&WorkerConfig::default()).unwrap()).unwrap();
    assert_eq!(config.worker_count, 1);
    assert_eq!(config.acker_tick_interval, Duration::from_secs(30));
  }
}
