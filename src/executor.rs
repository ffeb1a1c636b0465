//! Task mailboxes and execution strands.
//!
//! Every task owns one bounded mailbox and one strand that drains it, so a
//! component instance is never entered concurrently while distinct tasks run
//! fully in parallel. Producers into a full mailbox suspend; backpressure is
//! the buffer bound, nothing more.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::ComponentSpec;
use crate::config::WorkerConfig;
use crate::emitter::Emitter;
use crate::router::Router;
use crate::tuple::{TICK_COMPONENT, Tuple};

/// Running strands and timers for one component on this worker.
pub(crate) struct ComponentExecutor {
  component: String,
  strands: Vec<JoinHandle<()>>,
  timers: Vec<JoinHandle<()>>,
}

/// Instantiates and starts every task of one component.
///
/// Task ids are `worker_id * parallelism + i`, which is what lets the router
/// recover the owning worker by integer division. Each strand sleeps the
/// warm-up delay, runs `ready` once, then loops on its mailbox until all
/// senders are gone.
pub(crate) fn start_component(
  spec: &ComponentSpec,
  config: &WorkerConfig,
  router: &Arc<Router>,
  cancel: &CancellationToken,
) -> ComponentExecutor {
  let worker_id = router.self_worker_id();
  let mut strands = Vec::new();
  let mut timers = Vec::new();

  for index in 0..spec.parallelism {
    let task_id = worker_id * spec.parallelism + index;
    let mut instance = (spec.factory)();
    let emitter = Emitter::new(router.clone(), spec.name.clone(), task_id, worker_id);
    instance.configure(config, task_id, emitter);

    let (sender, mut receiver) = mpsc::channel::<Tuple>(config.mailbox_capacity);
    router.register_task(&spec.name, task_id, sender.clone());

    if spec.tick_millis > 0 {
      let tick_sender = sender;
      let tick_cancel = cancel.clone();
      let warmup = config.ready_delay;
      let period = Duration::from_millis(spec.tick_millis);
      timers.push(tokio::spawn(async move {
        // First tick lands one period after the warm-up.
        tokio::time::sleep(warmup).await;
        loop {
          tokio::select! {
            _ = tick_cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
          }
          let mut tick = Tuple::new();
          tick.component_name = TICK_COMPONENT.to_string();
          if tick_sender.send(tick).await.is_err() {
            break;
          }
        }
      }));
    }

    let warmup = config.ready_delay;
    let component = spec.name.clone();
    strands.push(tokio::spawn(async move {
      tokio::time::sleep(warmup).await;
      instance.ready().await;
      debug!(component = %component, task = task_id, "task ready");
      while let Some(tuple) = receiver.recv().await {
        instance.process(tuple).await;
      }
      debug!(component = %component, task = task_id, "task drained");
    }));
  }

  info!(component = %spec.name, tasks = spec.parallelism, "component started");
  ComponentExecutor { component: spec.name.clone(), strands, timers }
}

impl ComponentExecutor {
  /// Waits up to `drain` per strand for a graceful exit, then force-cancels.
  ///
  /// Callers must have closed the mailboxes first (cancel the token, clear
  /// the router) or every strand will run out its full grace period.
  pub(crate) async fn join(self, drain: Duration) {
    for timer in &self.timers {
      timer.abort();
    }
    for mut strand in self.strands {
      match tokio::time::timeout(drain, &mut strand).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
          if error.is_panic() {
            warn!(component = %self.component, "task strand panicked");
          }
        }
        Err(_) => {
          warn!(component = %self.component, "forcing task shutdown after drain timeout");
          strand.abort();
        }
      }
    }
  }
}
