//! `ClientFacade`: the surface an external HTTP layer calls. Every method
//! is served only by the leader; non-leaders return
//! [`ChorusError::NotLeader`] carrying a redirect hint, which the HTTP
//! layer (out of scope here) is expected to translate into a `5xx` with the
//! hinted leader id.

use std::collections::HashSet;

use crate::entities::{Entity, Filter, MetaOp};
use crate::errors::{ChorusError, Result};
use crate::file_sharding::FileShardingCoordinator;
use crate::global_index::NodeId;
use crate::metadata_protocol::MetadataProtocol;

pub struct WriteFileOutcome {
    pub distribution_ranges: usize,
    pub total_chunks: u64,
}

pub struct ClientFacade {
    is_leader: bool,
    leader_hint: Option<NodeId>,
    /// Live membership as of facade construction (one snapshot per
    /// client-facing call from the HTTP layer).
    live_nodes: HashSet<NodeId>,
    metadata: MetadataProtocol,
    sharding: FileShardingCoordinator,
}

impl ClientFacade {
    pub fn new(
        is_leader: bool,
        leader_hint: Option<NodeId>,
        live_nodes: HashSet<NodeId>,
        metadata: MetadataProtocol,
        sharding: FileShardingCoordinator,
    ) -> Self {
        ClientFacade {
            is_leader,
            leader_hint,
            live_nodes,
            metadata,
            sharding,
        }
    }

    fn require_leader(&self) -> Result<()> {
        if self.is_leader {
            Ok(())
        } else {
            Err(ChorusError::NotLeader {
                leader_hint: self.leader_hint.clone(),
            })
        }
    }

    pub async fn read_metadata(&self, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>> {
        self.require_leader()?;
        self.metadata.read_metadata(kind, filters).await
    }

    pub async fn write_metadata(&self, entity: Entity, op: MetaOp) -> Result<()> {
        self.require_leader()?;
        self.metadata.write_metadata(entity, op).await
    }

    pub async fn write_file(&self, filename: &str, bytes: &[u8], now: i64) -> Result<WriteFileOutcome> {
        self.require_leader()?;
        let live = self.live_nodes.clone();
        let (total_chunks, distribution_ranges) = self.sharding.write_file(filename, bytes, &live, now).await?;
        Ok(WriteFileOutcome {
            distribution_ranges,
            total_chunks,
        })
    }

    pub async fn read_file_chunks(&self, filename: &str, start_chunk: u64, chunk_count: u64) -> Result<Vec<Vec<u8>>> {
        self.require_leader()?;
        let live = self.live_nodes.clone();
        self.sharding.read_file_chunks(filename, start_chunk, chunk_count, &live).await
    }

    pub async fn delete_file(&self, filename: &str) -> Result<()> {
        self.require_leader()?;
        self.sharding.delete_file(filename).await
    }
}
