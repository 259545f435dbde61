//! Wire types for the consensus RPCs (`RequestVote` / `AppendEntries`).

use serde::{Deserialize, Serialize};

/// Nodes are identified by their current IP string, not a stable numeric id
/// (identity is not stable across container restarts; see the respawn
/// reconciliation logic in the `chorus` crate's leader coordinator).
pub type NodeId = String;

pub type Term = u64;

/// Requests a vote for `candidate_id` in `term`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// A heartbeat/replication round. `state_blob` is an opaque, leader-owned
/// snapshot (in practice the serialized `GlobalIndex` plus node-liveness
/// bookkeeping); this crate never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: Term,
    pub commit_index: u64,
    pub state_blob: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Present on rejection so the leader can perform an additive merge of
    /// this follower's own index into its own. Absent on success.
    pub own_state_blob: Option<Vec<u8>>,
    pub last_log_index: u64,
}

/// An outbound message produced by a [`crate::consensus::ConsensusModule`]
/// tick, addressed to a single peer. The caller (the `chorus` crate's peer
/// RPC client) is responsible for actually dialing `to` and feeding the
/// response back into [`crate::consensus::ConsensusModule`].
#[derive(Debug, Clone)]
pub struct Message {
    pub to: NodeId,
    pub body: MessageBody,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}
