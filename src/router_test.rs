//! Tests for partitioned dispatch, the remote hand-off and the barrier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::component::RoutingStrategy;
use crate::membership::{MembershipView, WorkerEntry};
use crate::router::{RouteError, Router};
use crate::tuple::{Key, Tuple};

fn view_of(workers: &[u32]) -> MembershipView {
  let view = MembershipView::default();
  let map: HashMap<u32, WorkerEntry> = workers
    .iter()
    .map(|id| (*id, WorkerEntry::new(*id, "localhost", 5000)))
    .collect();
  view.publish(map);
  view
}

fn local_router(self_worker: u32, outbound: Vec<mpsc::Sender<Tuple>>, view: MembershipView) -> Router {
  Router::new(self_worker, 1, Duration::from_millis(5), view, outbound)
}

fn keyed_tuple(key: &str, next: &str) -> Tuple {
  let mut tuple = Tuple::new();
  tuple.group_by_key = Some(Key::from(key));
  tuple.next_component = Some(next.to_string());
  tuple
}

#[tokio::test]
async fn test_keyed_route_delivers_to_a_local_mailbox() {
  let router = local_router(0, Vec::new(), MembershipView::default());
  router.register_component("stage", 1, RoutingStrategy::Keyed);
  let (sender, mut receiver) = mpsc::channel(8);
  router.register_task("stage", 0, sender);

  router.route(keyed_tuple("host1", "stage")).await.unwrap();
  let delivered = receiver.try_recv().unwrap();
  assert_eq!(delivered.group_by_key, Some(Key::from("host1")));
  // Local delivery never stamps remote destination fields.
  assert_eq!(delivered.destination_worker_id, 0);
}

#[tokio::test]
async fn test_keyed_route_without_a_key_is_rejected() {
  let router = local_router(0, Vec::new(), MembershipView::default());
  router.register_component("stage", 1, RoutingStrategy::Keyed);

  let mut tuple = Tuple::new();
  tuple.next_component = Some("stage".to_string());
  let error = router.route(tuple).await.unwrap_err();
  assert!(matches!(error, RouteError::MissingKey { component } if component == "stage"));
}

#[tokio::test]
async fn test_unknown_component_and_task_are_rejected() {
  let router = local_router(0, Vec::new(), MembershipView::default());
  router.register_component("stage", 1, RoutingStrategy::Keyed);

  let error = router.route(keyed_tuple("host1", "nowhere")).await.unwrap_err();
  assert!(matches!(error, RouteError::UnknownComponent(name) if name == "nowhere"));

  let error = router.route(Tuple::new()).await.unwrap_err();
  assert!(matches!(error, RouteError::MissingTarget));

  // Component registered, but its mailbox never was.
  let error = router.route(keyed_tuple("host1", "stage")).await.unwrap_err();
  assert!(matches!(error, RouteError::UnknownTask { task_id: 0, .. }));
}

#[tokio::test]
async fn test_shuffle_route_stays_on_the_local_worker() {
  // Worker 1 of 2, parallelism 3: shuffle may only pick tasks 3, 4 and 5.
  let router = local_router(1, Vec::new(), view_of(&[0, 1]));
  router.register_component("stage", 3, RoutingStrategy::Shuffle);
  let mut receivers = Vec::new();
  for task in 3..6 {
    let (sender, receiver) = mpsc::channel(64);
    router.register_task("stage", task, sender);
    receivers.push(receiver);
  }

  for id in [-17i64, -1, 0, 1, 2, 3, 100, i64::MIN, i64::MAX] {
    let mut tuple = Tuple::with_id(id);
    tuple.next_component = Some("stage".to_string());
    router.route(tuple).await.unwrap();
  }

  let delivered: usize = receivers.iter_mut().map(|rx| {
    let mut count = 0;
    while rx.try_recv().is_ok() {
      count += 1;
    }
    count
  }).sum();
  assert_eq!(delivered, 9);
}

#[tokio::test]
async fn test_keyed_route_forwards_remote_tuples_to_the_transport() {
  let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
  let router = local_router(0, vec![outbound_tx], view_of(&[0, 1]));
  router.register_component("stage", 1, RoutingStrategy::Keyed);
  let (sender, mut local_rx) = mpsc::channel(64);
  router.register_task("stage", 0, sender);

  // With two workers the key space splits across task 0 (local) and task 1
  // (worker 1); enough distinct keys hit both.
  for i in 0..64 {
    router.route(keyed_tuple(&format!("host{i}"), "stage")).await.unwrap();
  }

  let mut local = 0;
  while local_rx.try_recv().is_ok() {
    local += 1;
  }
  let mut remote = 0;
  while let Ok(tuple) = outbound_rx.try_recv() {
    assert_eq!(tuple.destination_worker_id, 1);
    assert_eq!(tuple.destination_task_id, 1);
    remote += 1;
  }
  assert_eq!(local + remote, 64);
  assert!(local > 0);
  assert!(remote > 0);
}

#[tokio::test]
async fn test_remote_route_without_transport_is_rejected() {
  let router = local_router(0, Vec::new(), view_of(&[0, 1]));
  router.register_component("stage", 1, RoutingStrategy::Keyed);
  let (sender, _receiver) = mpsc::channel(8);
  router.register_task("stage", 0, sender);

  let remote_key = (0..1000)
    .map(|i| format!("host{i}"))
    .find(|key| (crate::hash::hash32(key.as_bytes()) as i32 % 2).unsigned_abs() == 1)
    .unwrap();
  let error = router.route(keyed_tuple(&remote_key, "stage")).await.unwrap_err();
  assert!(matches!(error, RouteError::TransportUnavailable));
}

#[tokio::test]
async fn test_route_to_task_bypasses_partitioning() {
  let router = local_router(0, Vec::new(), view_of(&[0, 1]));
  router.register_component("spout", 2, RoutingStrategy::Keyed);
  let (sender, mut receiver) = mpsc::channel(8);
  router.register_task("spout", 1, sender);

  // No routing key needed; the explicit task wins.
  let mut tuple = Tuple::new();
  tuple.next_component = Some("spout".to_string());
  router.route_to_task(tuple, 1).await.unwrap();
  assert!(receiver.try_recv().is_ok());
}

#[tokio::test]
async fn test_route_to_task_resolves_the_owning_worker() {
  let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
  let router = local_router(0, vec![outbound_tx], view_of(&[0, 1]));
  router.register_component("spout", 2, RoutingStrategy::Keyed);

  // Task 3 of a parallelism-2 component lives on worker 1.
  let mut tuple = Tuple::new();
  tuple.next_component = Some("spout".to_string());
  router.route_to_task(tuple, 3).await.unwrap();
  let forwarded = outbound_rx.try_recv().unwrap();
  assert_eq!(forwarded.destination_worker_id, 1);
  assert_eq!(forwarded.destination_task_id, 3);
}

#[tokio::test]
async fn test_barrier_releases_once_the_cluster_assembles() {
  let view = MembershipView::default();
  view.publish(HashMap::from([(0, WorkerEntry::new(0, "localhost", 5000))]));
  let router = Arc::new(Router::new(0, 2, Duration::from_millis(5), view.clone(), Vec::new()));

  let waiting = {
    let router = router.clone();
    tokio::spawn(async move { router.wait_for_cluster().await })
  };
  // Still parked: only one worker is known.
  tokio::time::sleep(Duration::from_millis(30)).await;
  assert!(!waiting.is_finished());

  view.publish(HashMap::from([
    (0, WorkerEntry::new(0, "localhost", 5000)),
    (1, WorkerEntry::new(1, "localhost", 5001)),
  ]));
  tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
}
