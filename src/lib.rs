//! # Weft
//!
//! A distributed tuple-stream processing runtime with at-least-once
//! delivery.
//!
//! A fixed pipeline of user components (sources and processing stages) is
//! replicated across a cluster of worker processes. Tuples route between
//! component tasks in-process or over a framed TCP transport, and an
//! XOR-ledger acker tracks whether every tuple spawned from a given input
//! was fully processed, without ever storing the tuple tree itself.
//!
//! ## Key pieces
//!
//! - **Membership**: workers register against a pluggable discovery backend
//!   and heartbeat a shared address map.
//! - **Router**: keyed or shuffle partitioning over the live cluster,
//!   dispatching to local mailboxes or remote workers.
//! - **Executor**: one bounded mailbox and one serial strand per task.
//! - **Acker**: per-tree completion tracking in a single 64-bit value, with
//!   rotating-bucket expiry.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft::config::WorkerConfig;
//! use weft::topology::Topology;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), weft::topology::TopologyError> {
//!   let mut topology = Topology::new(WorkerConfig::default());
//!   // topology.add_source(1, || Box::new(MySource::default()))?;
//!   // topology.add_stage(4, || Box::new(MyStage::default()))?;
//!   topology.start().await?;
//!   topology.stop().await?;
//!   Ok(())
//! }
//! ```

#![deny(missing_docs)]

/// XOR-ledger completion tracking and its rotating eviction map.
pub mod acker;
/// Pluggable tuple wire codecs.
pub mod codec;
/// The component contract implemented by sources and processing stages.
pub mod component;
/// Worker configuration.
pub mod config;
/// Per-task emission handle with lineage bookkeeping.
pub mod emitter;
/// Task mailboxes and execution strands.
pub mod executor;
/// Stable hashes used for key partitioning and derived tuple ids.
pub mod hash;
/// Cluster membership: discovery backends, heartbeats, the shared view.
pub mod membership;
/// Partitioned tuple routing.
pub mod router;
/// Topology assembly and lifecycle.
pub mod topology;
/// Framed TCP transport between workers.
pub mod transport;
/// The tuple data model and id generation.
pub mod tuple;

#[cfg(test)]
mod router_test;
#[cfg(test)]
mod transport_test;
