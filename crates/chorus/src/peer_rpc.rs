//! The peer RPC surface, as a single trait object rather than a
//! concrete transport. Callers depend on `Arc<dyn PeerTransport>` and leave
//! the wire encoding to whatever binds it at the process boundary. Tests
//! bind it to an in-process fake that dispatches directly into sibling
//! `Node`s, so the suite never touches a socket.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use chorus_raft::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};

use crate::entities::{Entity, Filter, MetaOp};
use crate::errors::Result;
use crate::global_index::NodeId;
use crate::journal::JournalDump;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResult {
    pub success: bool,
    pub outcome: crate::local_meta_store::ApplyOutcome,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    // -- Consensus --
    async fn request_vote(&self, to: &NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse>;
    async fn append_entries(&self, to: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    // -- Metadata (DB nodes only) --
    async fn get_data(&self, to: &NodeId, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>>;
    async fn entity_exists(&self, to: &NodeId, kind: &str, id: &str) -> Result<bool>;
    async fn prepare(&self, to: &NodeId, task_id: &str, op: MetaOp, entity: Entity, term: u64) -> Result<PrepareResult>;
    async fn commit_operation(&self, to: &NodeId, task_id: &str) -> Result<bool>;
    async fn rollback_operation(&self, to: &NodeId, task_id: &str) -> Result<bool>;
    async fn get_journal_dump(&self, to: &NodeId) -> Result<JournalDump>;
    async fn restore_journal_from_dump(&self, to: &NodeId, dump: JournalDump) -> Result<()>;
    async fn delete_journal(&self, to: &NodeId) -> Result<()>;
    async fn get_full_dump(&self, to: &NodeId) -> Result<Vec<Entity>>;
    async fn restore_from_dump(&self, to: &NodeId, entities: Vec<Entity>) -> Result<()>;

    // -- File ranges --
    async fn list_files(&self, to: &NodeId) -> Result<Vec<String>>;
    async fn range_exists(&self, to: &NodeId, filename: &str) -> Result<bool>;
    async fn get_file_ranges(&self, to: &NodeId, filename: &str) -> Result<Vec<String>>;
    async fn create_range(&self, to: &NodeId, filename: &str, range_key: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get_chunk_range(&self, to: &NodeId, filename: &str, range_key: &str) -> Result<Vec<u8>>;
    async fn delete_range(&self, to: &NodeId, filename: &str, range_key: &str) -> Result<bool>;
}
