//! The crate's universal error type. One variant per domain error kind,
//! each carrying the policy implied by its name in how callers are
//! expected to react. A single chained `errors` module, the shape of a
//! `thiserror`-derived enum rather than a hand-rolled `Display` impl per
//! variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("transient peer error talking to {node_id}: {message}")]
    TransientPeer { node_id: String, message: String },

    #[error("stale leader: observed higher term {observed_term}, stepping down")]
    StaleLeader { observed_term: u64 },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("replication shortage for {filename} {range_key}: have {have}, want {want}")]
    ReplicationShortage {
        filename: String,
        range_key: String,
        have: usize,
        want: usize,
    },

    #[error("prepare rejected by {node_id}: {reason}")]
    PrepareRejected { node_id: String, reason: String },

    #[error("global index invariant violated: {detail}")]
    IndexInvariant { detail: String },

    #[error("fatal local error: {0}")]
    FatalLocal(String),

    #[error("this node is not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },

    #[error(transparent)]
    Raft(#[from] chorus_raft::RaftError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("msgpack encode error: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),

    #[error("dns resolution error: {0}")]
    Dns(#[from] hickory_resolver::error::ResolveError),
}

pub type Result<T> = std::result::Result<T, ChorusError>;
