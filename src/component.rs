//! The component contract implemented by sources and processing stages.

use crate::config::WorkerConfig;
use crate::emitter::Emitter;
use crate::tuple::Tuple;

/// How tuples addressed to a component pick their target task.
///
/// The strategy belongs to the consumer: the router reads the declared
/// strategy of the tuple's `next_component`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
  /// Partition by the stable hash of the tuple's routing key. The same key
  /// always reaches the same task, cluster-wide.
  #[default]
  Keyed,
  /// Partition by tuple id across this worker's local tasks only. Never
  /// crosses the network.
  Shuffle,
}

/// A pipeline stage, replicated into `parallelism` tasks per worker.
///
/// Each task runs on its own strand: `configure` is called once before the
/// task starts, `ready` once after the warm-up delay, then `process` once
/// per mailbox tuple, never concurrently with itself. Sources that produce
/// indefinitely spawn their own producer task from `ready` (holding a clone
/// of the emitter) and return; the strand needs to get back to the mailbox
/// to receive completion replies.
#[async_trait::async_trait]
pub trait Component: Send {
  /// Unique component name within the topology.
  fn name(&self) -> String;

  /// Partitioning strategy for tuples routed *to* this component.
  fn routing_strategy(&self) -> RoutingStrategy {
    RoutingStrategy::default()
  }

  /// Cadence of synthetic tick tuples delivered to each task's mailbox,
  /// in milliseconds. Zero disables ticks.
  fn tick_interval_millis(&self) -> u64 {
    0
  }

  /// Wires the instance to its task id and emitter before the strand starts.
  fn configure(&mut self, config: &WorkerConfig, task_id: u32, emitter: Emitter);

  /// Invoked once per task after the warm-up delay, before any tuple.
  async fn ready(&mut self);

  /// Handles one tuple. Sources receive only completion replies here
  /// (see [`Tuple::ack_reply`]); stages receive data tuples and,
  /// when a tick interval is declared, tick tuples.
  async fn process(&mut self, tuple: Tuple);
}

/// Builds one fresh component instance per task.
pub type ComponentFactory = Box<dyn Fn() -> Box<dyn Component> + Send + Sync>;

/// A declared component: the metadata read off a template instance plus the
/// factory that stamps out one instance per task.
pub(crate) struct ComponentSpec {
  pub(crate) name: String,
  pub(crate) parallelism: u32,
  pub(crate) strategy: RoutingStrategy,
  pub(crate) tick_millis: u64,
  pub(crate) factory: ComponentFactory,
}
