//! # Topology assembly and lifecycle
//!
//! A [`Topology`] owns the wiring for one worker process: it resolves the
//! membership backend, builds the router over the membership view, starts
//! the transport, and stamps out executor strands for every declared
//! component plus the built-in acker. All wiring is explicit constructor
//! injection; nothing is looked up by type name at runtime.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::acker::Acker;
use crate::codec::{JsonTupleCodec, TupleCodec};
use crate::component::{Component, ComponentSpec, RoutingStrategy};
use crate::config::WorkerConfig;
use crate::executor::{ComponentExecutor, start_component};
use crate::membership::{MembershipError, MembershipService};
use crate::membership::backend::{MembershipBackend, backend_for};
use crate::router::Router;
use crate::transport::TransportError;
use crate::transport::client::OutboundTransport;
use crate::transport::server::TransportServer;
use crate::tuple::{ACKER_COMPONENT, TICK_COMPONENT};

/// Topology declaration or lifecycle failures.
#[derive(Debug, Error)]
pub enum TopologyError {
  /// A component with this name is already declared.
  #[error("component name {0} is already registered")]
  DuplicateComponent(String),
  /// The name collides with a runtime-reserved component.
  #[error("component name {0} is reserved")]
  ReservedName(String),
  /// `start` was called while the topology is running.
  #[error("topology is already running")]
  AlreadyRunning,
  /// `stop` was called while the topology is not running.
  #[error("topology is not running")]
  NotRunning,
  /// Membership startup failed.
  #[error(transparent)]
  Membership(#[from] MembershipError),
  /// Transport startup failed.
  #[error(transparent)]
  Transport(#[from] TransportError),
}

struct Running {
  cancel: CancellationToken,
  router: Arc<Router>,
  membership: MembershipService,
  server: TransportServer,
  outbound: OutboundTransport,
  executors: Vec<ComponentExecutor>,
}

/// One worker's pipeline: declared components plus the running runtime.
pub struct Topology {
  config: WorkerConfig,
  backend: Option<Arc<dyn MembershipBackend>>,
  codec: Arc<dyn TupleCodec>,
  specs: Vec<ComponentSpec>,
  sources: HashSet<String>,
  running: Option<Running>,
}

impl Topology {
  /// A topology with no components declared yet.
  #[must_use]
  pub fn new(config: WorkerConfig) -> Self {
    Topology {
      config,
      backend: None,
      codec: Arc::new(JsonTupleCodec),
      specs: Vec::new(),
      sources: HashSet::new(),
      running: None,
    }
  }

  /// Injects a membership backend, overriding the configured kind.
  #[must_use]
  pub fn with_backend(mut self, backend: Arc<dyn MembershipBackend>) -> Self {
    self.backend = Some(backend);
    self
  }

  /// Injects a wire codec, replacing the JSON default.
  #[must_use]
  pub fn with_codec(mut self, codec: Arc<dyn TupleCodec>) -> Self {
    self.codec = codec;
    self
  }

  /// Declares a source component with `parallelism` tasks per worker.
  ///
  /// Sources open lineage trees: only their contributions may seed the
  /// acker's ledger, and completion replies are delivered back to them.
  pub fn add_source<F>(&mut self, parallelism: u32, factory: F) -> Result<&mut Self, TopologyError>
  where
    F: Fn() -> Box<dyn Component> + Send + Sync + 'static,
  {
    self.add_component(parallelism, Box::new(factory), true)
  }

  /// Declares a processing stage with `parallelism` tasks per worker.
  pub fn add_stage<F>(&mut self, parallelism: u32, factory: F) -> Result<&mut Self, TopologyError>
  where
    F: Fn() -> Box<dyn Component> + Send + Sync + 'static,
  {
    self.add_component(parallelism, Box::new(factory), false)
  }

  fn add_component(
    &mut self,
    parallelism: u32,
    factory: Box<dyn Fn() -> Box<dyn Component> + Send + Sync>,
    is_source: bool,
  ) -> Result<&mut Self, TopologyError> {
    let template = factory();
    let name = template.name();
    if name == ACKER_COMPONENT || name == TICK_COMPONENT {
      return Err(TopologyError::ReservedName(name));
    }
    if self.specs.iter().any(|spec| spec.name == name) {
      return Err(TopologyError::DuplicateComponent(name));
    }
    let spec = ComponentSpec {
      name: name.clone(),
      parallelism: parallelism.max(1),
      strategy: template.routing_strategy(),
      tick_millis: template.tick_interval_millis(),
      factory,
    };
    if is_source {
      self.sources.insert(name);
    }
    self.specs.push(spec);
    Ok(self)
  }

  /// Brings the worker up: membership registration, the cluster-assembly
  /// barrier, transport, then every component's tasks.
  ///
  /// Blocks until the configured number of workers is known, however long
  /// that takes.
  pub async fn start(&mut self) -> Result<(), TopologyError> {
    if self.running.is_some() {
      return Err(TopologyError::AlreadyRunning);
    }

    let cancel = CancellationToken::new();
    let backend = match &self.backend {
      Some(backend) => backend.clone(),
      None => backend_for(self.config.backend),
    };
    backend.init(&self.config).await?;

    let membership = MembershipService::start(&self.config, backend.clone(), cancel.clone()).await?;
    let self_id = membership.self_id();
    let view = membership.view();

    let outbound = OutboundTransport::start(
      &self.config,
      view.clone(),
      self.codec.clone(),
      membership.backend(),
      cancel.clone(),
    );
    let router = Arc::new(Router::new(
      self_id,
      self.config.worker_count,
      self.config.discovery_poll_interval,
      view,
      outbound.senders(),
    ));

    let acker_spec = self.acker_spec();
    for spec in self.specs.iter().chain(std::iter::once(&acker_spec)) {
      router.register_component(&spec.name, spec.parallelism, spec.strategy);
    }

    router.wait_for_cluster().await;

    let server = TransportServer::start(
      &self.config.bind_address,
      self.config.data_port,
      router.clone(),
      self.codec.clone(),
      cancel.clone(),
    )
    .await?;

    let executors = self
      .specs
      .iter()
      .chain(std::iter::once(&acker_spec))
      .map(|spec| start_component(spec, &self.config, &router, &cancel))
      .collect();

    info!(worker = self_id, components = self.specs.len(), "topology started");
    self.running = Some(Running { cancel, router, membership, server, outbound, executors });
    Ok(())
  }

  /// Winds the worker down: close mailboxes, drain task strands within the
  /// grace period, then stop transport and membership.
  pub async fn stop(&mut self) -> Result<(), TopologyError> {
    let Some(running) = self.running.take() else {
      return Err(TopologyError::NotRunning);
    };

    running.cancel.cancel();
    running.router.clear();
    let drain = self.config.drain_timeout;
    for executor in running.executors {
      executor.join(drain).await;
    }
    running.outbound.stop(drain).await;
    running.server.stop().await;
    running.membership.stop().await;
    info!("topology stopped");
    Ok(())
  }

  /// Whether `start` has run and `stop` has not.
  #[must_use]
  pub fn is_running(&self) -> bool {
    self.running.is_some()
  }

  /// The configuration this topology was built with.
  #[must_use]
  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// The built-in completion tracker, parallelized and swept per the
  /// configuration, seeded with the declared source names.
  fn acker_spec(&self) -> ComponentSpec {
    let sources = self.sources.clone();
    let tick_millis = self.config.acker_tick_interval.as_millis() as u64;
    ComponentSpec {
      name: ACKER_COMPONENT.to_string(),
      parallelism: self.config.acker_parallelism.max(1),
      strategy: RoutingStrategy::Keyed,
      tick_millis,
      factory: Box::new(move || Box::new(Acker::new(sources.clone(), tick_millis))),
    }
  }
}
