//! Tests for the framed transport: wire round trips, poisoned frames,
//! retry exhaustion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::JsonTupleCodec;
use crate::component::RoutingStrategy;
use crate::config::WorkerConfig;
use crate::membership::backend::MembershipBackend;
use crate::membership::{MembershipError, MembershipView, WorkerEntry};
use crate::router::Router;
use crate::transport::client::OutboundTransport;
use crate::transport::server::TransportServer;
use crate::tuple::Tuple;

/// Backend stub that records failure notices.
#[derive(Default)]
struct RecordingBackend {
  failures: Mutex<Vec<u32>>,
}

impl RecordingBackend {
  fn failures(&self) -> Vec<u32> {
    self.failures.lock().unwrap().clone()
  }
}

#[async_trait::async_trait]
impl MembershipBackend for RecordingBackend {
  async fn init(&self, _config: &WorkerConfig) -> Result<(), MembershipError> {
    Ok(())
  }

  async fn register(&self, self_id: Option<u32>, _entry: WorkerEntry) -> Result<u32, MembershipError> {
    Ok(self_id.unwrap_or(0))
  }

  async fn poll_peers(&self) -> Result<HashMap<u32, WorkerEntry>, MembershipError> {
    Ok(HashMap::new())
  }

  async fn notify_failure(&self, entry: &WorkerEntry) -> Result<(), MembershipError> {
    self.failures.lock().unwrap().push(entry.worker_id);
    Ok(())
  }
}

fn transport_config() -> WorkerConfig {
  WorkerConfig::default()
    .with_bind_address("127.0.0.1")
    .with_client_threads(1)
    .with_transport_retries(2, Duration::from_millis(10))
}

/// Router for worker 0 with one "stage" mailbox at task 0.
fn receiving_router() -> (Arc<Router>, mpsc::Receiver<Tuple>) {
  let router = Arc::new(Router::new(
    0,
    1,
    Duration::from_millis(5),
    MembershipView::default(),
    Vec::new(),
  ));
  router.register_component("stage", 1, RoutingStrategy::Keyed);
  let (sender, receiver) = mpsc::channel(64);
  router.register_task("stage", 0, sender);
  (router, receiver)
}

fn remote_tuple(destination_worker: u32, tag: i64) -> Tuple {
  let mut tuple = Tuple::new();
  tuple.next_component = Some("stage".to_string());
  tuple.destination_task_id = 0;
  tuple.destination_worker_id = destination_worker;
  tuple.set("tag", tag);
  tuple
}

#[tokio::test]
async fn test_tuples_round_trip_over_tcp_in_order() {
  let cancel = CancellationToken::new();
  let (router, mut mailbox) = receiving_router();
  let server = TransportServer::start(
    "127.0.0.1",
    0,
    router,
    Arc::new(JsonTupleCodec),
    cancel.clone(),
  )
  .await
  .unwrap();

  // The receiving worker is "worker 9" from the sender's point of view.
  let view = MembershipView::default();
  view.publish(HashMap::from([(
    9,
    WorkerEntry::new(9, "127.0.0.1", server.local_addr().port()),
  )]));
  let outbound = OutboundTransport::start(
    &transport_config(),
    view,
    Arc::new(JsonTupleCodec),
    Arc::new(RecordingBackend::default()),
    cancel.clone(),
  );

  let queue = outbound.senders().remove(0);
  for tag in 0..5 {
    queue.send(remote_tuple(9, tag)).await.unwrap();
  }

  for tag in 0..5 {
    let delivered = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(delivered.get("tag"), Some(&serde_json::json!(tag)));
    assert_eq!(delivered.destination_task_id, 0);
  }

  outbound.stop(Duration::from_millis(200)).await;
  server.stop().await;
}

#[tokio::test]
async fn test_poisoned_frame_kills_only_its_connection() {
  let cancel = CancellationToken::new();
  let (router, mut mailbox) = receiving_router();
  let server = TransportServer::start(
    "127.0.0.1",
    0,
    router,
    Arc::new(JsonTupleCodec),
    cancel.clone(),
  )
  .await
  .unwrap();
  let address = server.local_addr();

  // Hand-deliver a frame that is length-valid but not a tuple.
  let mut poisoned = tokio::net::TcpStream::connect(address).await.unwrap();
  let garbage = b"definitely not a tuple";
  poisoned.write_all(&(garbage.len() as u32).to_be_bytes()).await.unwrap();
  poisoned.write_all(garbage).await.unwrap();
  poisoned.flush().await.unwrap();

  // The server hangs up on that connection.
  let mut remainder = Vec::new();
  let read = tokio::time::timeout(Duration::from_secs(2), poisoned.read_to_end(&mut remainder)).await;
  assert_eq!(read.unwrap().unwrap(), 0);

  // A healthy connection afterwards still delivers.
  let view = MembershipView::default();
  view.publish(HashMap::from([(9, WorkerEntry::new(9, "127.0.0.1", address.port()))]));
  let outbound = OutboundTransport::start(
    &transport_config(),
    view,
    Arc::new(JsonTupleCodec),
    Arc::new(RecordingBackend::default()),
    cancel.clone(),
  );
  outbound.senders().remove(0).send(remote_tuple(9, 7)).await.unwrap();
  let delivered = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(delivered.get("tag"), Some(&serde_json::json!(7)));

  outbound.stop(Duration::from_millis(200)).await;
  server.stop().await;
}

#[tokio::test]
async fn test_exhausted_retries_drop_and_notify() {
  // Grab a port with nothing listening on it.
  let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_port = vacant.local_addr().unwrap().port();
  drop(vacant);

  let view = MembershipView::default();
  view.publish(HashMap::from([(5, WorkerEntry::new(5, "127.0.0.1", dead_port))]));
  let backend = Arc::new(RecordingBackend::default());
  let cancel = CancellationToken::new();
  let outbound = OutboundTransport::start(
    &transport_config(),
    view,
    Arc::new(JsonTupleCodec),
    backend.clone(),
    cancel,
  );

  outbound.senders().remove(0).send(remote_tuple(5, 1)).await.unwrap();

  let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
  while backend.failures().is_empty() && tokio::time::Instant::now() < deadline {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(backend.failures(), vec![5]);

  outbound.stop(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_unknown_peer_is_dropped_without_notice() {
  let backend = Arc::new(RecordingBackend::default());
  let cancel = CancellationToken::new();
  let outbound = OutboundTransport::start(
    &transport_config(),
    MembershipView::default(),
    Arc::new(JsonTupleCodec),
    backend.clone(),
    cancel,
  );

  // Worker 8 is in nobody's view; the send burns its retries and there is
  // no entry to report.
  outbound.senders().remove(0).send(remote_tuple(8, 1)).await.unwrap();
  tokio::time::sleep(Duration::from_millis(200)).await;
  assert!(backend.failures().is_empty());

  outbound.stop(Duration::from_millis(200)).await;
}
