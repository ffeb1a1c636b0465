//! Inbound side: accept loop and per-connection decode strands.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::TransportError;
use crate::codec::TupleCodec;
use crate::router::Router;

/// The running data listener.
pub(crate) struct TransportServer {
  local_addr: SocketAddr,
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

impl TransportServer {
  /// Binds the listener and starts accepting peer connections.
  pub(crate) async fn start(
    bind_address: &str,
    port: u16,
    router: Arc<Router>,
    codec: Arc<dyn TupleCodec>,
    cancel: CancellationToken,
  ) -> Result<Self, TransportError> {
    let requested = format!("{bind_address}:{port}");
    let listener = TcpListener::bind((bind_address, port))
      .await
      .map_err(|source| TransportError::Bind { address: requested.clone(), source })?;
    let local_addr = listener
      .local_addr()
      .map_err(|source| TransportError::Bind { address: requested, source })?;
    info!(address = %local_addr, "transport listening");

    let handle = tokio::spawn(accept_loop(listener, router, codec, cancel.clone()));
    Ok(TransportServer { local_addr, cancel, handle })
  }

  /// The address actually bound, with any ephemeral port resolved.
  #[must_use]
  pub(crate) fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stops accepting and waits for the accept loop to exit. Connection
  /// strands observe the same cancellation and wind down on their own.
  pub(crate) async fn stop(self) {
    self.cancel.cancel();
    let _ = self.handle.await;
  }
}

async fn accept_loop(
  listener: TcpListener,
  router: Arc<Router>,
  codec: Arc<dyn TupleCodec>,
  cancel: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((stream, peer)) => {
          info!(peer = %peer, "transport connection accepted");
          tokio::spawn(serve_connection(stream, router.clone(), codec.clone(), cancel.clone()));
        }
        Err(error) => {
          warn!(error = %error, "transport accept failed");
        }
      }
    }
  }
}

/// Decodes tuples off one connection and injects them into local dispatch.
///
/// A frame that fails to decode terminates this strand only; the peer
/// reconnects and every other connection is untouched.
async fn serve_connection(
  stream: TcpStream,
  router: Arc<Router>,
  codec: Arc<dyn TupleCodec>,
  cancel: CancellationToken,
) {
  let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_default();
  let mut frames = FramedRead::new(stream, LengthDelimitedCodec::new());
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      frame = frames.next() => match frame {
        Some(Ok(bytes)) => {
          let tuple = match codec.decode(&bytes) {
            Ok(tuple) => tuple,
            Err(error) => {
              error!(peer = %peer, error = %error, "closing connection on undecodable frame");
              break;
            }
          };
          let Some(next) = tuple.next_component.clone() else {
            warn!(peer = %peer, "dropping inbound tuple with no target component");
            continue;
          };
          let task_id = tuple.destination_task_id;
          if let Err(error) = router.route_local(&next, task_id, tuple).await {
            warn!(peer = %peer, component = %next, task = task_id, error = %error, "dropping inbound tuple");
          }
        }
        Some(Err(error)) => {
          warn!(peer = %peer, error = %error, "transport read failed");
          break;
        }
        None => break,
      }
    }
  }
}
