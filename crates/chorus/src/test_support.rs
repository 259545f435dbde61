//! Shared fakes for unit tests that need a `PeerTransport` but never
//! actually call out to a peer (single-node scenarios).

#![cfg(test)]

use async_trait::async_trait;

use chorus_raft::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};

use crate::entities::{Entity, Filter, MetaOp};
use crate::errors::Result;
use crate::global_index::NodeId;
use crate::journal::JournalDump;
use crate::local_meta_store::ApplyOutcome;
use crate::peer_rpc::{PeerTransport, PrepareResult};

pub struct NoopTransport;

#[async_trait]
impl PeerTransport for NoopTransport {
    async fn request_vote(&self, _to: &NodeId, _req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        unimplemented!("single-node tests never dial a peer")
    }
    async fn append_entries(&self, _to: &NodeId, _req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        unimplemented!("single-node tests never dial a peer")
    }
    async fn get_data(&self, _to: &NodeId, _kind: &str, _filters: &[Filter]) -> Result<Vec<Entity>> {
        Ok(vec![])
    }
    async fn entity_exists(&self, _to: &NodeId, _kind: &str, _id: &str) -> Result<bool> {
        Ok(false)
    }
    async fn prepare(&self, _to: &NodeId, _task_id: &str, _op: MetaOp, _entity: Entity, _term: u64) -> Result<PrepareResult> {
        Ok(PrepareResult {
            success: true,
            outcome: ApplyOutcome::Applied,
        })
    }
    async fn commit_operation(&self, _to: &NodeId, _task_id: &str) -> Result<bool> {
        Ok(true)
    }
    async fn rollback_operation(&self, _to: &NodeId, _task_id: &str) -> Result<bool> {
        Ok(true)
    }
    async fn get_journal_dump(&self, _to: &NodeId) -> Result<JournalDump> {
        unimplemented!("single-node tests never dial a peer")
    }
    async fn restore_journal_from_dump(&self, _to: &NodeId, _dump: JournalDump) -> Result<()> {
        Ok(())
    }
    async fn delete_journal(&self, _to: &NodeId) -> Result<()> {
        Ok(())
    }
    async fn get_full_dump(&self, _to: &NodeId) -> Result<Vec<Entity>> {
        Ok(vec![])
    }
    async fn restore_from_dump(&self, _to: &NodeId, _entities: Vec<Entity>) -> Result<()> {
        Ok(())
    }
    async fn list_files(&self, _to: &NodeId) -> Result<Vec<String>> {
        Ok(vec![])
    }
    async fn range_exists(&self, _to: &NodeId, _filename: &str) -> Result<bool> {
        Ok(false)
    }
    async fn get_file_ranges(&self, _to: &NodeId, _filename: &str) -> Result<Vec<String>> {
        Ok(vec![])
    }
    async fn create_range(&self, _to: &NodeId, _filename: &str, _range_key: &str, _bytes: Vec<u8>) -> Result<()> {
        Ok(())
    }
    async fn get_chunk_range(&self, _to: &NodeId, _filename: &str, _range_key: &str) -> Result<Vec<u8>> {
        Ok(vec![])
    }
    async fn delete_range(&self, _to: &NodeId, _filename: &str, _range_key: &str) -> Result<bool> {
        Ok(true)
    }
}
