//! End-to-end scenarios over an in-process multi-`Node` cluster (no real
//! sockets or DNS): a shared `PeerDirectory` membership list plus a
//! `PeerTransport` that dispatches straight into sibling `Node`s' public
//! accessors. Covers the cold-start, upload, node-loss, and delete
//! scenarios from the specification's end-to-end list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tokio::sync::RwLock;

use chorus::config::NodeConfig;
use chorus::entities::{ArtistRecord, Entity, Filter, MetaOp};
use chorus::errors::{ChorusError, Result};
use chorus::global_index::NodeId;
use chorus::journal::JournalDump;
use chorus::local_meta_store::ApplyOutcome;
use chorus::node::Node;
use chorus::peer_directory::{ContainerInfo, PeerDirectory};
use chorus::peer_rpc::{PeerTransport, PrepareResult};
use chorus_raft::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use chorus_util::ranges::ChunkRange;

type Registry = Arc<RwLock<HashMap<NodeId, Arc<Node>>>>;
type Membership = Arc<RwLock<Vec<ContainerInfo>>>;

struct InProcessTransport {
    registry: Registry,
}

impl InProcessTransport {
    async fn target(&self, to: &NodeId) -> Result<Arc<Node>> {
        self.registry.read().await.get(to).cloned().ok_or_else(|| ChorusError::TransientPeer {
            node_id: to.clone(),
            message: "node not registered (killed or never joined)".to_string(),
        })
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn request_vote(&self, to: &NodeId, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        Ok(self.target(to).await?.handle_request_vote(req))
    }

    async fn append_entries(&self, to: &NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        Ok(self.target(to).await?.handle_append_entries(req).await)
    }

    async fn get_data(&self, to: &NodeId, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>> {
        self.target(to).await?.meta_store().get(kind, filters).await
    }

    async fn entity_exists(&self, to: &NodeId, kind: &str, id: &str) -> Result<bool> {
        self.target(to).await?.meta_store().exists(kind, &id.to_string()).await
    }

    async fn prepare(&self, to: &NodeId, task_id: &str, op: MetaOp, entity: Entity, term: u64) -> Result<PrepareResult> {
        let node = self.target(to).await?;
        let outcome = node.meta_store().prepare(task_id, op, entity.clone()).await?;
        if matches!(outcome, ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied) {
            node.journal().append_pending(term, task_id.to_string(), op, entity).await?;
        }
        Ok(PrepareResult {
            success: matches!(outcome, ApplyOutcome::Applied | ApplyOutcome::AlreadyApplied),
            outcome,
        })
    }

    async fn commit_operation(&self, to: &NodeId, task_id: &str) -> Result<bool> {
        let node = self.target(to).await?;
        let committed = node.meta_store().commit(task_id).await?;
        let marked = node.journal().mark_completed(task_id).await?;
        Ok(committed && marked)
    }

    async fn rollback_operation(&self, to: &NodeId, task_id: &str) -> Result<bool> {
        self.target(to).await?.meta_store().rollback(task_id).await
    }

    async fn get_journal_dump(&self, to: &NodeId) -> Result<JournalDump> {
        Ok(self.target(to).await?.journal().dump().await)
    }

    async fn restore_journal_from_dump(&self, to: &NodeId, dump: JournalDump) -> Result<()> {
        self.target(to).await?.journal().restore_from_dump(dump).await
    }

    async fn delete_journal(&self, to: &NodeId) -> Result<()> {
        self.target(to).await?.journal().delete_file().await
    }

    async fn get_full_dump(&self, to: &NodeId) -> Result<Vec<Entity>> {
        self.target(to).await?.meta_store().dump().await
    }

    async fn restore_from_dump(&self, to: &NodeId, entities: Vec<Entity>) -> Result<()> {
        self.target(to).await?.meta_store().restore(entities).await
    }

    async fn list_files(&self, to: &NodeId) -> Result<Vec<String>> {
        self.target(to).await?.range_store().list_filenames().await
    }

    async fn range_exists(&self, to: &NodeId, filename: &str) -> Result<bool> {
        self.target(to).await?.range_store().exists(filename).await
    }

    async fn get_file_ranges(&self, to: &NodeId, filename: &str) -> Result<Vec<String>> {
        Ok(self
            .target(to)
            .await?
            .range_store()
            .list_ranges(filename)
            .await?
            .into_iter()
            .map(|r| r.key())
            .collect())
    }

    async fn create_range(&self, to: &NodeId, filename: &str, range_key: &str, bytes: Vec<u8>) -> Result<()> {
        let range = ChunkRange::parse_key(range_key).expect("well-formed range key");
        self.target(to).await?.range_store().put(filename, range, &bytes).await
    }

    async fn get_chunk_range(&self, to: &NodeId, filename: &str, range_key: &str) -> Result<Vec<u8>> {
        let range = ChunkRange::parse_key(range_key).expect("well-formed range key");
        self.target(to).await?.range_store().get(filename, range).await
    }

    async fn delete_range(&self, to: &NodeId, filename: &str, range_key: &str) -> Result<bool> {
        let range = ChunkRange::parse_key(range_key).expect("well-formed range key");
        self.target(to).await?.range_store().delete(filename, range).await
    }
}

struct SharedPeerDirectory {
    own_ip: String,
    membership: Membership,
}

#[async_trait]
impl PeerDirectory for SharedPeerDirectory {
    async fn discover(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.membership.read().await.clone())
    }

    async fn own_ip(&self) -> Result<String> {
        Ok(self.own_ip.clone())
    }
}

/// Spins up a `Node` bound to the shared registry/membership, registers it,
/// and starts its consensus driver. Timings are kept small so cluster tests
/// converge in well under a second of wall-clock time.
async fn spawn_node(id: &str, base_dir: &std::path::Path, registry: Registry, membership: Membership, replication_factor: usize) -> Arc<Node> {
    let mut config = NodeConfig::parse_from(["chorus-node"]);
    config.dir = base_dir.join(id);
    config.node_check_interval_ms = 40;
    config.election_timeout_min_ms = 120;
    config.election_timeout_max_ms = 220;
    config.heartbeat_min_ms = 30;
    config.heartbeat_max_ms = 60;
    config.db_replication_factor = replication_factor;
    config.chunk_size = 64;
    config.chunk_ranges = 4;

    let transport: Arc<dyn PeerTransport> = Arc::new(InProcessTransport { registry: registry.clone() });
    let peer_directory: Arc<dyn PeerDirectory> = Arc::new(SharedPeerDirectory {
        own_ip: id.to_string(),
        membership,
    });

    let node = Node::new(id.to_string(), config, transport, peer_directory).await.unwrap();
    registry.write().await.insert(id.to_string(), node.clone());
    node.start();
    node
}

async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

async fn find_leader(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    for n in nodes {
        if n.is_leader() {
            return Some(n.clone());
        }
    }
    None
}

fn artist(id: &str) -> Entity {
    Entity::Artist(ArtistRecord {
        id: id.to_string(),
        name: "Test Artist".to_string(),
        bio: None,
    })
}

async fn spawn_cluster(base_dir: &std::path::Path, ids: &[&str], replication_factor: usize) -> (Vec<Arc<Node>>, Registry, Membership) {
    let registry: Registry = Arc::new(RwLock::new(HashMap::new()));
    let membership: Membership = Arc::new(RwLock::new(ids.iter().map(|id| ContainerInfo { ip: id.to_string(), hostname: None }).collect()));

    let mut nodes = vec![];
    for id in ids {
        nodes.push(spawn_node(id, base_dir, registry.clone(), membership.clone(), replication_factor).await);
    }
    (nodes, registry, membership)
}

/// Scenario 1: cold start, `k=3`, 3 nodes. Expect exactly one leader and a
/// full DB quorum including the leader.
#[tokio::test]
async fn cold_start_elects_single_leader_with_full_quorum() {
    let dir = tempfile::tempdir().unwrap();
    let (nodes, ..) = spawn_cluster(dir.path(), &["a", "b", "c"], 3).await;

    let converged = wait_until(Duration::from_secs(5), || async {
        let leader = find_leader(&nodes).await;
        let Some(leader) = leader else { return false };
        let index = leader.index_snapshot().await;
        index.db_nodes.len() == 3 && index.db_nodes.iter().all(|n| index.node_versions.get(n).map_or(false, |v| v.is_db_node))
    })
    .await;

    assert!(converged, "cluster did not converge to a single leader with a full db quorum");

    let leaders = {
        let mut count = 0;
        for n in &nodes {
            if n.is_leader() {
                count += 1;
            }
        }
        count
    };
    assert_eq!(leaders, 1, "expected exactly one leader");
}

/// Scenario 2: upload a 320-byte file with `CHUNK_SIZE=64`, `p=4`, `k=3`.
/// Expect `total_chunks=5`, ranges `[0-2, 2-3, 3-4, 4-5]`, each range on 3
/// distinct live nodes.
#[tokio::test]
async fn upload_file_shards_with_exact_chunking() {
    let dir = tempfile::tempdir().unwrap();
    let (nodes, ..) = spawn_cluster(dir.path(), &["a", "b", "c"], 3).await;

    wait_until(Duration::from_secs(5), || async { find_leader(&nodes).await.is_some() })
        .await;
    let leader = find_leader(&nodes).await.expect("a leader must have been elected");

    let facade = leader.client_facade().await;
    let bytes = vec![7u8; 320];
    let outcome = facade.write_file("x.mp3", &bytes, 0).await.unwrap();
    assert_eq!(outcome.total_chunks, 5);
    assert_eq!(outcome.distribution_ranges, 4);

    let index = leader.index_snapshot().await;
    let meta = index.files_metadata.get("x.mp3").unwrap();
    assert_eq!(meta.total_chunks, 5);
    let mut keys: Vec<&String> = meta.chunk_distribution.keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["0-2", "2-3", "3-4", "4-5"]);
    for holders in meta.chunk_distribution.values() {
        assert_eq!(holders.len(), 3, "every range must be replicated on all 3 nodes");
    }

    let chunks = facade.read_file_chunks("x.mp3", 0, 5).await.unwrap();
    assert_eq!(chunks.concat(), bytes);
}

/// Scenario 3: a live spare node beyond the DB quorum gets promoted when a
/// non-leader DB node disappears, and the lost shards are re-replicated.
#[tokio::test]
async fn killing_non_leader_db_node_triggers_promotion_and_repair() {
    let dir = tempfile::tempdir().unwrap();
    let (nodes, registry, membership) = spawn_cluster(dir.path(), &["a", "b", "c", "d"], 3).await;

    wait_until(Duration::from_secs(5), || async {
        let Some(leader) = find_leader(&nodes).await else { return false };
        leader.index_snapshot().await.db_nodes.len() == 3
    })
    .await;
    let leader = find_leader(&nodes).await.expect("a leader must have been elected");

    let facade = leader.client_facade().await;
    let bytes = vec![9u8; 320];
    facade.write_file("y.mp3", &bytes, 0).await.unwrap();

    let victim = {
        let index = leader.index_snapshot().await;
        index
            .db_nodes
            .iter()
            .find(|n| *n != leader.id())
            .cloned()
            .expect("a non-leader db node must exist with a 4-node, k=3 cluster")
    };

    if let Some(victim_node) = registry.write().await.remove(&victim) {
        victim_node.stop().await;
    }
    membership.write().await.retain(|c| c.ip != victim);

    let repaired = wait_until(Duration::from_secs(8), || async {
        let index = leader.index_snapshot().await;
        let live: std::collections::HashSet<NodeId> = nodes.iter().map(|n| n.id().clone()).filter(|id| id != &victim).collect();
        let db_live = index.db_nodes.iter().filter(|n| live.contains(*n)).count();
        if db_live != 3 {
            return false;
        }
        index
            .files_metadata
            .get("y.mp3")
            .map(|m| m.chunk_distribution.values().all(|holders| holders.iter().filter(|n| live.contains(*n)).count() == 3))
            .unwrap_or(false)
    })
    .await;

    assert!(repaired, "expected the spare node to be promoted and shards re-replicated after losing a db node");
}

/// Scenario 6: deleting a track's file removes its metadata and every
/// replica within one monitoring cycle.
#[tokio::test]
async fn delete_file_removes_shards_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let (nodes, ..) = spawn_cluster(dir.path(), &["a", "b", "c"], 3).await;

    wait_until(Duration::from_secs(5), || async { find_leader(&nodes).await.is_some() }).await;
    let leader = find_leader(&nodes).await.expect("a leader must have been elected");

    let facade = leader.client_facade().await;
    facade.write_file("z.mp3", &vec![1u8; 320], 0).await.unwrap();
    facade.delete_file("z.mp3").await.unwrap();

    let index = leader.index_snapshot().await;
    assert!(!index.files_metadata.contains_key("z.mp3"));
    for files in index.files.values() {
        assert!(!files.contains("z.mp3"));
    }
    for shards in index.node_shards.values() {
        assert!(!shards.shards.contains_key("z.mp3"));
    }

    let err = facade.read_file_chunks("z.mp3", 0, 1).await.unwrap_err();
    assert!(matches!(err, ChorusError::NotFound { .. }));
}

/// 2PC round trip through the cluster's metadata protocol: a write on the
/// leader is visible via `ReadMetadata` without touching the range store.
#[tokio::test]
async fn write_metadata_is_durable_across_the_quorum() {
    let dir = tempfile::tempdir().unwrap();
    let (nodes, ..) = spawn_cluster(dir.path(), &["a", "b", "c"], 3).await;

    wait_until(Duration::from_secs(5), || async {
        let Some(leader) = find_leader(&nodes).await else { return false };
        leader.index_snapshot().await.db_nodes.len() == 3
    })
    .await;
    let leader = find_leader(&nodes).await.expect("a leader must have been elected");

    let facade = leader.client_facade().await;
    facade.write_metadata(artist("ar1"), MetaOp::Create).await.unwrap();

    let found = facade
        .read_metadata("artist", &[Filter { field: "id".to_string(), value: "ar1".to_string() }])
        .await
        .unwrap();
    assert_eq!(found, vec![artist("ar1")]);
}
