//! Outbound side: sharded sender strands with persistent connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::TransportError;
use crate::codec::TupleCodec;
use crate::config::WorkerConfig;
use crate::membership::MembershipView;
use crate::membership::backend::MembershipBackend;
use crate::tuple::Tuple;

/// The running outbound strands and their queues.
pub(crate) struct OutboundTransport {
  senders: Vec<mpsc::Sender<Tuple>>,
  handles: Vec<JoinHandle<()>>,
}

impl OutboundTransport {
  /// Starts `client_threads` sender strands. The router shards remote
  /// tuples across their queues by destination worker id.
  pub(crate) fn start(
    config: &WorkerConfig,
    view: MembershipView,
    codec: Arc<dyn TupleCodec>,
    backend: Arc<dyn MembershipBackend>,
    cancel: CancellationToken,
  ) -> Self {
    let mut senders = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..config.client_threads.max(1) {
      let (sender, receiver) = mpsc::channel::<Tuple>(config.outbound_capacity);
      let shard = Shard {
        view: view.clone(),
        codec: codec.clone(),
        backend: backend.clone(),
        retries: config.transport_retries,
        retry_delay: config.transport_retry_delay,
        links: HashMap::new(),
      };
      senders.push(sender);
      handles.push(tokio::spawn(shard_loop(receiver, shard, cancel.clone())));
    }
    OutboundTransport { senders, handles }
  }

  /// Queue handles for the router, one per shard.
  pub(crate) fn senders(&self) -> Vec<mpsc::Sender<Tuple>> {
    self.senders.clone()
  }

  /// Waits briefly for the strands to wind down, then force-cancels any
  /// still blocked mid-delivery.
  pub(crate) async fn stop(self, drain: Duration) {
    drop(self.senders);
    for mut handle in self.handles {
      if tokio::time::timeout(drain, &mut handle).await.is_err() {
        handle.abort();
      }
    }
  }
}

struct Shard {
  view: MembershipView,
  codec: Arc<dyn TupleCodec>,
  backend: Arc<dyn MembershipBackend>,
  retries: u32,
  retry_delay: Duration,
  links: HashMap<u32, FramedWrite<TcpStream, LengthDelimitedCodec>>,
}

async fn shard_loop(mut receiver: mpsc::Receiver<Tuple>, mut shard: Shard, cancel: CancellationToken) {
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      tuple = receiver.recv() => match tuple {
        Some(tuple) => shard.deliver(tuple).await,
        None => break,
      }
    }
  }
}

impl Shard {
  /// Sends one tuple, reconnecting and resending on failure until the
  /// retry budget runs out; then the tuple is dropped and the peer is
  /// reported to the membership backend.
  async fn deliver(&mut self, tuple: Tuple) {
    let destination = tuple.destination_worker_id;
    let frame = match self.codec.encode(&tuple) {
      Ok(frame) => frame,
      Err(err) => {
        error!(worker = destination, error = %err, "dropping unencodable tuple");
        return;
      }
    };

    for attempt in 0..=self.retries {
      if attempt > 0 {
        tokio::time::sleep(self.retry_delay).await;
      }
      if !self.links.contains_key(&destination) {
        match self.connect(destination).await {
          Ok(link) => {
            self.links.insert(destination, link);
          }
          Err(err) => {
            warn!(worker = destination, attempt, error = %err, "transport connect failed");
            continue;
          }
        }
      }
      let Some(link) = self.links.get_mut(&destination) else {
        continue;
      };
      match link.send(frame.clone()).await {
        Ok(()) => return,
        Err(err) => {
          warn!(worker = destination, attempt, error = %err, "transport write failed, reconnecting");
          self.links.remove(&destination);
        }
      }
    }

    error!(worker = destination, "peer unreachable, dropping tuple");
    let peer = self.view.snapshot().get(&destination).cloned();
    if let Some(entry) = peer {
      if let Err(err) = self.backend.notify_failure(&entry).await {
        warn!(worker = destination, error = %err, "failure notice not delivered");
      }
    }
  }

  async fn connect(&self, destination: u32) -> Result<FramedWrite<TcpStream, LengthDelimitedCodec>, TransportError> {
    let entry = self
      .view
      .snapshot()
      .get(&destination)
      .cloned()
      .ok_or(TransportError::UnknownPeer(destination))?;
    let address = format!("{}:{}", entry.address, entry.data_port);
    let stream = TcpStream::connect((entry.address.as_str(), entry.data_port))
      .await
      .map_err(|source| TransportError::Connect { worker_id: destination, address: address.clone(), source })?;
    info!(worker = destination, address = %address, "transport connected");
    Ok(FramedWrite::new(stream, LengthDelimitedCodec::new()))
  }
}
