//! Raft-style leader election and heartbeat replication.
//!
//! This is deliberately a *thinner* consensus module than a general Raft log:
//! the cluster has no application command log to replicate, the only thing
//! ever replicated is a single whole-blob `GlobalIndex` snapshot piggybacked
//! on heartbeats. So where a textbook Raft keeps an append-only log of
//! `{term, command}` entries, [`ConsensusModule`] keeps only the minimal
//! `(last_index, last_term)` pair needed to preserve the `RequestVote`
//! up-to-date check, and leaves the actual state blob opaque (`Vec<u8>`) so
//! this crate stays agnostic to what the rest of the cluster replicates.

pub mod consensus;
pub mod errors;
pub mod protos;

pub use consensus::{ConsensusModule, Tick};
pub use errors::RaftError;
pub use protos::*;
