//! # Framed TCP transport between workers
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed
//! by one codec-encoded tuple. The [`server`] side accepts connections and
//! feeds decoded tuples straight into local routing; the [`client`] side
//! shards outbound tuples across persistent connections by destination
//! worker. Remote delivery becomes ordinary local delivery the moment a
//! frame is decoded.

use thiserror::Error;

use crate::codec::CodecError;

pub(crate) mod client;
pub(crate) mod server;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
  /// The data listener could not bind.
  #[error("transport bind on {address} failed: {source}")]
  Bind {
    /// Requested bind address.
    address: String,
    /// Underlying socket error.
    #[source]
    source: std::io::Error,
  },
  /// A connection to a peer worker could not be established.
  #[error("connect to worker {worker_id} at {address} failed: {source}")]
  Connect {
    /// Target worker.
    worker_id: u32,
    /// Resolved peer address.
    address: String,
    /// Underlying socket error.
    #[source]
    source: std::io::Error,
  },
  /// A frame could not be written to a peer.
  #[error("write to worker {worker_id} failed: {source}")]
  Write {
    /// Target worker.
    worker_id: u32,
    /// Underlying socket error.
    #[source]
    source: std::io::Error,
  },
  /// The membership view has no address for the destination worker.
  #[error("no address known for worker {0}")]
  UnknownPeer(u32),
  /// The tuple could not be encoded or decoded.
  #[error(transparent)]
  Codec(#[from] CodecError),
}
