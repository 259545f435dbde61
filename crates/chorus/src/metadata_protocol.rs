//! The two-phase metadata write protocol across the DB quorum.
//! `WriteMetadata` is the only mutator of committed library metadata; reads
//! go straight to a single DB node via `ReadMetadata`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entities::{Entity, Filter, MetaOp};
use crate::errors::{ChorusError, Result};
use crate::global_index::{GlobalIndex, NodeId};
use crate::journal::OperationJournal;
use crate::local_meta_store::{ApplyOutcome, MetaStore};
use crate::peer_rpc::PeerTransport;

pub struct MetadataProtocol {
    node_id: NodeId,
    term: u64,
    transport: Arc<dyn PeerTransport>,
    meta_store: Arc<dyn MetaStore>,
    journal: Arc<OperationJournal>,
    index: Arc<RwLock<GlobalIndex>>,
}

impl MetadataProtocol {
    pub fn new(
        node_id: NodeId,
        term: u64,
        transport: Arc<dyn PeerTransport>,
        meta_store: Arc<dyn MetaStore>,
        journal: Arc<OperationJournal>,
        index: Arc<RwLock<GlobalIndex>>,
    ) -> Self {
        MetadataProtocol {
            node_id,
            term,
            transport,
            meta_store,
            journal,
            index,
        }
    }

    pub async fn read_metadata(&self, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>> {
        let db_nodes: Vec<NodeId> = self.index.read().await.db_nodes.iter().cloned().collect();
        let target = {
            let index = self.index.read().await;
            index
                .least_loaded_read(&db_nodes.iter().cloned().collect())
                .unwrap_or_else(|| self.node_id.clone())
        };

        let result = if target == self.node_id {
            self.meta_store.get(kind, filters).await
        } else {
            self.transport.get_data(&target, kind, filters).await
        };

        let mut index = self.index.write().await;
        index.ensure_node(&target);
        if let Some(v) = index.node_versions.get_mut(&target) {
            v.read_version += 1;
        }
        result
    }

    /// Runs the 2PC write, steps 1-6.
    pub async fn write_metadata(&self, entity: Entity, op: MetaOp) -> Result<()> {
        let task_id = Uuid::new_v4().to_string();
        let live_db_nodes: Vec<NodeId> = self.index.read().await.db_nodes.iter().cloned().collect();

        let mut succeeded: HashSet<NodeId> = HashSet::new();
        for n in &live_db_nodes {
            let ok = if *n == self.node_id {
                self.journal
                    .append_pending(self.term, task_id.clone(), op, entity.clone())
                    .await?;
                matches!(
                    self.meta_store.prepare(&task_id, op, entity.clone()).await?,
                    ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied
                )
            } else {
                self.transport
                    .prepare(n, &task_id, op, entity.clone(), self.term)
                    .await
                    .map(|r| r.success)
                    .unwrap_or(false)
            };
            if ok {
                succeeded.insert(n.clone());
            }
        }

        if succeeded.is_empty() {
            return Err(ChorusError::PrepareRejected {
                node_id: "all".to_string(),
                reason: "no db node accepted prepare".to_string(),
            });
        }

        for n in &succeeded {
            self.commit_with_retries(n, &task_id, 3).await;
        }

        Ok(())
    }

    async fn commit_with_retries(&self, node: &NodeId, task_id: &str, attempts: u32) {
        for attempt in 0..attempts {
            let ok = if *node == self.node_id {
                self.meta_store.commit(task_id).await.unwrap_or(false) && self.journal.mark_completed(task_id).await.unwrap_or(false)
            } else {
                self.transport.commit_operation(node, task_id).await.unwrap_or(false)
            };
            if ok {
                return;
            }
            tracing::warn!(node = %node, task_id, attempt, "commit failed, retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tracing::warn!(node = %node, task_id, "commit did not succeed after retries; next monitoring cycle will resync");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ArtistRecord;
    use crate::local_meta_store::InMemoryMetaStore;
    use crate::test_support::NoopTransport;

    #[tokio::test]
    async fn write_then_read_visible_on_single_node() {
        let node_id = "n1".to_string();
        let meta_store: Arc<dyn MetaStore> = Arc::new(InMemoryMetaStore::new());
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(OperationJournal::open(dir.path(), node_id.clone()).await.unwrap());
        let index = Arc::new(RwLock::new(GlobalIndex::new()));
        {
            let mut idx = index.write().await;
            idx.ensure_node(&node_id);
            idx.db_nodes.insert(node_id.clone());
            idx.node_versions.get_mut(&node_id).unwrap().is_db_node = true;
        }

        let protocol = MetadataProtocol::new(node_id.clone(), 1, Arc::new(NoopTransport), meta_store, journal, index);

        let entity = Entity::Artist(ArtistRecord {
            id: "a1".to_string(),
            name: "Name".to_string(),
            bio: None,
        });
        protocol.write_metadata(entity.clone(), MetaOp::Create).await.unwrap();

        let results = protocol
            .read_metadata("artist", &[Filter { field: "id".to_string(), value: "a1".to_string() }])
            .await
            .unwrap();
        assert_eq!(results, vec![entity]);
    }
}
