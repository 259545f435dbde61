//! The leader's monitoring loop. Active only while this node is leader; a
//! finite-state supervisor with explicit `start`/`stop` methods rather than
//! an implicit `on_become_leader -> start monitoring -> callbacks` chain.
//!
//! The four-way [`NodeState`] classification is computed fresh every cycle
//! before stages 5-8 run; stage 8's balancing pass keeps a per-cycle shard
//! blacklist to avoid retrying a shard that just failed to copy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use chorus_util::ranges::ChunkRange;

use crate::config::NodeConfig;
use crate::entities::MetaOp;
use crate::errors::Result;
use crate::global_index::{FileMetadata, GlobalIndex, NodeId};
use crate::journal::OperationJournal;
use crate::local_meta_store::MetaStore;
use crate::local_range_store::RangeStore;
use crate::peer_directory::PeerDirectory;
use crate::peer_rpc::PeerTransport;

/// Classification of a node relative to the previous cycle's index, driving
/// stage 5's identity reconciliation. Kept as a concrete four-way enum
/// rather than a pair of booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Live, and not previously known to the index.
    New,
    /// Live, indexed under a different node id believed dead; a respawn
    /// candidate pending shard-fingerprint confirmation.
    Respawn,
    Alive,
    Dead,
}

pub struct LeaderCoordinator {
    node_id: NodeId,
    config: Arc<NodeConfig>,
    transport: Arc<dyn PeerTransport>,
    peer_directory: Arc<dyn PeerDirectory>,
    index: Arc<RwLock<GlobalIndex>>,
    node_states: Arc<Mutex<HashMap<NodeId, NodeState>>>,
    journal: Arc<OperationJournal>,
    meta_store: Arc<dyn MetaStore>,
    range_store: Arc<dyn RangeStore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderCoordinator {
    pub fn new(
        node_id: NodeId,
        config: Arc<NodeConfig>,
        transport: Arc<dyn PeerTransport>,
        peer_directory: Arc<dyn PeerDirectory>,
        index: Arc<RwLock<GlobalIndex>>,
        journal: Arc<OperationJournal>,
        meta_store: Arc<dyn MetaStore>,
        range_store: Arc<dyn RangeStore>,
    ) -> Self {
        LeaderCoordinator {
            node_id,
            config,
            transport,
            peer_directory,
            index,
            node_states: Arc::new(Mutex::new(HashMap::new())),
            journal,
            meta_store,
            range_store,
            handle: Mutex::new(None),
        }
    }

    pub async fn index_snapshot(&self) -> GlobalIndex {
        self.index.read().await.clone()
    }

    /// Starts the periodic monitoring task. A no-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        let interval = self.config.node_check_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_cycle().await {
                    tracing::warn!(error = %e, "monitoring cycle failed");
                }
            }
        }));
        tracing::info!(node = %self.node_id, "leader coordinator started");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
        tracing::info!(node = %self.node_id, "leader coordinator stopped");
    }

    /// Runs one full cycle: stages 1-9, in order.
    pub async fn run_cycle(&self) -> Result<()> {
        let live_nodes = self.stage1_refresh_membership().await?;
        self.stage2_consume_become_new_leader(&live_nodes).await?;
        self.stage3_update_file_shard_view(&live_nodes).await?;
        self.stage4_gc_orphan_shards().await?;
        self.stage5_identity_reconciliation(&live_nodes).await?;
        self.stage6_enforce_replication(&live_nodes).await?;
        self.stage7_manage_db_quorum(&live_nodes).await?;
        self.stage8_balance_load(&live_nodes).await?;
        self.stage9_bump_version().await?;

        let k = self.config.replication_factor();
        if let Err(e) = self.index.read().await.check_invariants(&live_nodes, k) {
            tracing::debug!(error = %e, "invariants not yet restored this cycle");
        }
        Ok(())
    }

    /// Stage 1: refresh membership from `PeerDirectory`, rejecting
    /// half-booted peers whose self-reported id doesn't match their IP.
    async fn stage1_refresh_membership(&self) -> Result<HashSet<NodeId>> {
        let discovered = self.peer_directory.discover().await?;
        let mut live = HashSet::new();
        live.insert(self.node_id.clone());
        for peer in discovered {
            live.insert(peer.ip);
        }
        Ok(live)
    }

    /// Stage 2: if this node just became leader with `become_new_leader`
    /// set in its journal, adopt the most-advanced DB node's journal and
    /// DB dump before doing anything else.
    async fn stage2_consume_become_new_leader(&self, live_nodes: &HashSet<NodeId>) -> Result<()> {
        if !self.journal.become_new_leader().await {
            return Ok(());
        }

        let db_nodes: Vec<NodeId> = self.index.read().await.db_nodes.iter().cloned().collect();
        let mut best: Option<(u64, NodeId)> = None;
        for n in db_nodes.iter().filter(|n| live_nodes.contains(*n) && **n != self.node_id) {
            if let Ok(dump) = self.transport.get_journal_dump(n).await {
                let candidate = (dump.db_version, n.clone());
                if best.as_ref().map_or(true, |(v, id)| candidate.0 > *v || (candidate.0 == *v && candidate.1 > *id)) {
                    best = Some(candidate);
                }
            }
        }

        if let Some((_, winner)) = best {
            if let Ok(dump) = self.transport.get_journal_dump(&winner).await {
                if let Ok(entities) = self.transport.get_full_dump(&winner).await {
                    self.meta_store.restore(entities).await?;
                }
                self.journal.restore_from_dump(dump).await?;
                for entry in self.journal.pending_entries().await {
                    let outcome = self.meta_store.prepare(&entry.task_id, entry.op, entry.entity.clone()).await?;
                    if matches!(
                        outcome,
                        crate::local_meta_store::ApplyOutcome::Applied | crate::local_meta_store::ApplyOutcome::AlreadyApplied
                    ) {
                        self.meta_store.commit(&entry.task_id).await?;
                    }
                    self.journal.mark_completed(&entry.task_id).await?;
                }
            }
        }

        self.journal.set_become_new_leader(false).await
    }

    /// Stage 3: pull each live node's range inventory and refresh
    /// `files`/`node_versions`.
    async fn stage3_update_file_shard_view(&self, live_nodes: &HashSet<NodeId>) -> Result<()> {
        for node in live_nodes {
            let filenames = if *node == self.node_id {
                self.range_store.list_filenames().await.unwrap_or_default()
            } else {
                self.transport.list_files(node).await.unwrap_or_default()
            };

            let mut index = self.index.write().await;
            index.ensure_node(node);
            let set = index.files.entry(node.clone()).or_default();
            for f in filenames {
                set.insert(f);
            }
        }
        Ok(())
    }

    /// Stage 4: scan the journal for `delete` operations on file-bearing
    /// entities and remove their shards from the index + backing stores.
    async fn stage4_gc_orphan_shards(&self) -> Result<()> {
        for entry in self.journal.pending_entries().await {
            if entry.op != MetaOp::Delete || !entry.entity.carries_file_shards() {
                continue;
            }
            let id = entry.entity.id().clone();
            let filenames: Vec<String> = {
                let index = self.index.read().await;
                index
                    .files_metadata
                    .keys()
                    .filter(|f| f.starts_with(&id))
                    .cloned()
                    .collect()
            };
            for filename in filenames {
                self.delete_file_shards(&filename).await?;
            }
        }
        Ok(())
    }

    async fn delete_file_shards(&self, filename: &str) -> Result<()> {
        let meta = {
            let index = self.index.read().await;
            index.files_metadata.get(filename).cloned()
        };
        let Some(meta) = meta else { return Ok(()) };

        for (range_key, nodes) in &meta.chunk_distribution {
            for node in nodes {
                let _ = if *node == self.node_id {
                    self.range_store
                        .delete(filename, ChunkRange::parse_key(range_key).unwrap())
                        .await
                } else {
                    self.transport.delete_range(node, filename, range_key).await.map(|_| true)
                };
            }
        }

        self.index.write().await.remove_file(&filename.to_string());
        Ok(())
    }

    /// Stage 5: respawn identity reconciliation. Classifies every known or
    /// live node into a [`NodeState`], then for each `Respawn` candidate
    /// rewrites the index to replace the dead identity with the live one.
    async fn stage5_identity_reconciliation(&self, live_nodes: &HashSet<NodeId>) -> Result<()> {
        let previously_indexed: HashSet<NodeId> = {
            let index = self.index.read().await;
            index.node_versions.keys().cloned().collect()
        };

        let mut states = self.node_states.lock().await;
        let mut classified = HashMap::new();
        for node in live_nodes {
            let state = if previously_indexed.contains(node) {
                NodeState::Alive
            } else {
                NodeState::New
            };
            classified.insert(node.clone(), state);
        }
        for node in previously_indexed.iter().filter(|n| !live_nodes.contains(*n)) {
            classified.insert(node.clone(), NodeState::Dead);
        }

        // Live-but-unindexed candidates are checked against every dead or
        // previously-dead index entry for a shard-fingerprint subset match.
        let dead_candidates: Vec<NodeId> = classified
            .iter()
            .filter(|(_, s)| **s == NodeState::Dead)
            .map(|(n, _)| n.clone())
            .collect();

        let new_candidates: Vec<NodeId> = classified
            .iter()
            .filter(|(_, s)| **s == NodeState::New)
            .map(|(n, _)| n.clone())
            .collect();

        for candidate in new_candidates {
            let fingerprint = self.remote_fingerprint(&candidate).await;
            for dead in &dead_candidates {
                let dead_shards = {
                    let index = self.index.read().await;
                    index
                        .node_shards
                        .get(dead)
                        .map(|s| s.shards.clone())
                        .unwrap_or_default()
                };
                if shards_subset(&dead_shards, &fingerprint) {
                    classified.insert(candidate.clone(), NodeState::Respawn);
                    self.reconcile_respawn(dead, &candidate).await?;
                    break;
                }
            }
        }

        *states = classified;
        Ok(())
    }

    async fn remote_fingerprint(&self, node: &NodeId) -> BTreeMapShards {
        let mut out: BTreeMapShards = HashMap::new();
        let filenames = if *node == self.node_id {
            self.range_store.list_filenames().await.unwrap_or_default()
        } else {
            self.transport.list_files(node).await.unwrap_or_default()
        };
        for filename in filenames {
            let ranges = if *node == self.node_id {
                self.range_store
                    .list_ranges(&filename)
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| r.key())
                    .collect()
            } else {
                self.transport.get_file_ranges(node, &filename).await.unwrap_or_default()
            };
            out.insert(filename, ranges);
        }
        out
    }

    /// Rewrites every index reference from `dead` to `live`, merging any
    /// extra shards `live` already has. Preserves DB-node status.
    async fn reconcile_respawn(&self, dead: &NodeId, live: &NodeId) -> Result<()> {
        let mut index = self.index.write().await;

        let old_shards = index.node_shards.remove(dead).unwrap_or_default();
        let old_versions = index.node_versions.remove(dead).unwrap_or_default();
        let old_files = index.files.remove(dead).unwrap_or_default();
        let was_db_node = index.db_nodes.remove(dead);

        index.ensure_node(live);
        {
            let entry = index.node_shards.get_mut(live).unwrap();
            for (filename, keys) in old_shards.shards {
                let dest = entry.shards.entry(filename).or_default();
                for k in keys {
                    if !dest.contains(&k) {
                        dest.push(k);
                    }
                }
            }
            entry.total_chunks = entry.total_chunks.max(old_shards.total_chunks);
        }
        {
            let v = index.node_versions.get_mut(live).unwrap();
            v.is_db_node = v.is_db_node || old_versions.is_db_node;
            v.db_version = v.db_version.max(old_versions.db_version);
            v.db_version_prev = v.db_version_prev.max(old_versions.db_version_prev);
        }
        {
            let set = index.files.entry(live.clone()).or_default();
            for f in old_files {
                set.insert(f);
            }
        }
        if was_db_node {
            index.db_nodes.insert(live.clone());
        }

        for meta in index.files_metadata.values_mut() {
            for nodes in meta.chunk_distribution.values_mut() {
                for n in nodes.iter_mut() {
                    if n == dead {
                        *n = live.clone();
                    }
                }
                nodes.dedup();
            }
        }

        tracing::info!(dead = %dead, live = %live, "reconciled respawned node identity");
        Ok(())
    }

    /// Stage 6: for every shard with fewer than `k' = min(k, |live|)` live
    /// replicas, copy from an existing replica to make up the shortfall;
    /// for every shard with more than `k'`, delete from the most-loaded
    /// holders.
    async fn stage6_enforce_replication(&self, live_nodes: &HashSet<NodeId>) -> Result<()> {
        let k_target = self.config.replication_factor().min(live_nodes.len().max(1));

        let files: Vec<(String, FileMetadata)> = {
            let index = self.index.read().await;
            index.files_metadata.iter().map(|(f, m)| (f.clone(), m.clone())).collect()
        };

        for (filename, meta) in files {
            for (range_key, nodes) in meta.chunk_distribution {
                let live_holders: Vec<NodeId> = nodes.iter().filter(|n| live_nodes.contains(*n)).cloned().collect();
                if live_holders.len() < k_target {
                    self.repair_shortfall(&filename, &range_key, &live_holders, live_nodes, k_target).await?;
                } else if live_holders.len() > k_target {
                    self.repair_surplus(&filename, &range_key, &live_holders, k_target).await?;
                }
            }
        }
        Ok(())
    }

    async fn repair_shortfall(
        &self,
        filename: &str,
        range_key: &str,
        live_holders: &[NodeId],
        live_nodes: &HashSet<NodeId>,
        k_target: usize,
    ) -> Result<()> {
        let Some(source) = live_holders.first().cloned() else {
            return Ok(());
        };
        let needed = k_target - live_holders.len();

        let mut candidates: Vec<(NodeId, u64)> = {
            let index = self.index.read().await;
            live_nodes
                .iter()
                .filter(|n| !live_holders.contains(*n))
                .map(|n| (n.clone(), index.node_shards.get(n).map_or(0, |s| s.total_chunks)))
                .collect()
        };
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        candidates.truncate(needed);
        let candidates: Vec<NodeId> = candidates.into_iter().map(|(n, _)| n).collect();

        let bytes = self.fetch_range(&source, filename, range_key).await?;
        let range = match ChunkRange::parse_key(range_key) {
            Some(r) => r,
            None => return Ok(()),
        };

        for dest in candidates {
            if self.store_range(&dest, filename, range, &bytes).await.is_ok() {
                let verified = self.fetch_range(&dest, filename, range_key).await.map_or(false, |b| b == bytes);
                if verified {
                    let mut index = self.index.write().await;
                    index.ensure_node(&dest);
                    if let Some(meta) = index.files_metadata.get_mut(filename) {
                        meta.chunk_distribution.entry(range_key.to_string()).or_default().push(dest.clone());
                    }
                    let shards = index.node_shards.get_mut(&dest).unwrap();
                    shards.shards.entry(filename.to_string()).or_default().push(range_key.to_string());
                    shards.total_chunks += range.len();
                    index.files.entry(dest.clone()).or_default().insert(filename.to_string());
                }
            }
        }
        Ok(())
    }

    async fn repair_surplus(&self, filename: &str, range_key: &str, live_holders: &[NodeId], k_target: usize) -> Result<()> {
        let mut index = self.index.write().await;
        let mut by_load: Vec<(NodeId, u64)> = live_holders
            .iter()
            .map(|n| (n.clone(), index.node_shards.get(n).map_or(0, |s| s.total_chunks)))
            .collect();
        by_load.sort_by(|a, b| b.1.cmp(&a.1));

        let excess = live_holders.len() - k_target;
        let victims: Vec<NodeId> = by_load.into_iter().take(excess).map(|(n, _)| n).collect();
        let range = ChunkRange::parse_key(range_key);
        drop(index);

        for victim in victims {
            let deleted = if victim == self.node_id {
                match range {
                    Some(r) => self.range_store.delete(filename, r).await,
                    None => Ok(false),
                }
            } else {
                self.transport.delete_range(&victim, filename, range_key).await
            };
            if deleted.unwrap_or(false) {
                let mut index = self.index.write().await;
                if let Some(meta) = index.files_metadata.get_mut(filename) {
                    if let Some(nodes) = meta.chunk_distribution.get_mut(range_key) {
                        nodes.retain(|n| n != &victim);
                    }
                }
                if let Some(shards) = index.node_shards.get_mut(&victim) {
                    if let Some(keys) = shards.shards.get_mut(filename) {
                        keys.retain(|k| k != range_key);
                    }
                    if let Some(r) = range {
                        shards.total_chunks = shards.total_chunks.saturating_sub(r.len());
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_range(&self, node: &NodeId, filename: &str, range_key: &str) -> Result<Vec<u8>> {
        if *node == self.node_id {
            self.range_store.get(filename, ChunkRange::parse_key(range_key).unwrap()).await
        } else {
            self.transport.get_chunk_range(node, filename, range_key).await
        }
    }

    async fn store_range(&self, node: &NodeId, filename: &str, range: ChunkRange, bytes: &[u8]) -> Result<()> {
        if *node == self.node_id {
            self.range_store.put(filename, range, bytes).await
        } else {
            self.transport.create_range(node, filename, &range.key(), bytes.to_vec()).await
        }
    }

    /// Stage 7: grow or shrink the DB quorum toward `k' = min(k, |live|)`.
    async fn stage7_manage_db_quorum(&self, live_nodes: &HashSet<NodeId>) -> Result<()> {
        let k_target = self.config.replication_factor().min(live_nodes.len());

        let (current_db_live, candidates): (Vec<NodeId>, Vec<NodeId>) = {
            let index = self.index.read().await;
            let current = index.db_nodes.iter().filter(|n| live_nodes.contains(*n)).cloned().collect();
            let candidates = live_nodes.iter().filter(|n| !index.db_nodes.contains(*n)).cloned().collect();
            (current, candidates)
        };

        if current_db_live.len() < k_target {
            let mut candidates = candidates;
            candidates.sort();
            for n in candidates.into_iter().take(k_target - current_db_live.len()) {
                self.promote_db_node(&n).await?;
            }
        } else if current_db_live.len() > k_target {
            let mut demotable: Vec<NodeId> = current_db_live.into_iter().filter(|n| *n != self.node_id).collect();
            demotable.sort();
            let excess = demotable.len().saturating_sub(k_target.saturating_sub(1));
            for n in demotable.into_iter().take(excess) {
                self.demote_db_node(&n).await?;
            }
        }

        self.sync_quorum_journals().await
    }

    async fn promote_db_node(&self, node: &NodeId) -> Result<()> {
        let dump = self.meta_store.dump().await?;
        let journal_dump = self.journal.dump().await;
        if *node != self.node_id {
            self.transport.restore_from_dump(node, dump).await?;
            self.transport.restore_journal_from_dump(node, journal_dump).await?;
        }

        let mut index = self.index.write().await;
        index.ensure_node(node);
        index.db_nodes.insert(node.clone());
        let v = index.node_versions.get_mut(node).unwrap();
        v.is_db_node = true;
        v.db_version = self.journal.db_version().await;
        v.db_version_prev = v.db_version;
        tracing::info!(node = %node, "promoted to db node");
        Ok(())
    }

    async fn demote_db_node(&self, node: &NodeId) -> Result<()> {
        if *node != self.node_id {
            self.transport.delete_journal(node).await?;
        }
        let mut index = self.index.write().await;
        index.db_nodes.remove(node);
        if let Some(v) = index.node_versions.get_mut(node) {
            v.is_db_node = false;
        }
        tracing::info!(node = %node, "demoted from db node");
        Ok(())
    }

    async fn sync_quorum_journals(&self) -> Result<()> {
        let db_nodes: Vec<NodeId> = self.index.read().await.db_nodes.iter().cloned().collect();
        let leader_task_ids = self.journal.all_task_ids().await;

        for n in db_nodes.iter().filter(|n| **n != self.node_id) {
            let Ok(their_dump) = self.transport.get_journal_dump(n).await else {
                continue;
            };
            let their_ids: HashSet<String> = their_dump.log.iter().map(|e| e.task_id.clone()).collect();

            let missing_on_peer = self.journal.missing_from(&their_ids).await;
            for entry in &missing_on_peer {
                let _ = self
                    .transport
                    .prepare(n, &entry.task_id, entry.op, entry.entity.clone(), entry.term)
                    .await;
                let _ = self.transport.commit_operation(n, &entry.task_id).await;
            }

            let missing_on_leader: Vec<_> = their_dump.log.into_iter().filter(|e| !leader_task_ids.contains(&e.task_id)).collect();
            for entry in missing_on_leader {
                let outcome = self.meta_store.prepare(&entry.task_id, entry.op, entry.entity.clone()).await?;
                if matches!(
                    outcome,
                    crate::local_meta_store::ApplyOutcome::Applied | crate::local_meta_store::ApplyOutcome::AlreadyApplied
                ) {
                    self.journal
                        .append_pending(entry.term, entry.task_id.clone(), entry.op, entry.entity.clone())
                        .await?;
                    self.meta_store.commit(&entry.task_id).await?;
                    self.journal.mark_completed(&entry.task_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Stage 8: move the highest-range-size shards off the most-loaded
    /// live node toward the least-loaded, until the least-loaded ceases to
    /// be a strict minimum. A shard that fails a copy attempt is
    /// blacklisted for the remainder of this cycle's balancing pass.
    async fn stage8_balance_load(&self, live_nodes: &HashSet<NodeId>) -> Result<()> {
        let mut blacklist: HashSet<(String, String)> = HashSet::new();
        let k_target = self.config.replication_factor().min(live_nodes.len().max(1));

        loop {
            let loads: HashMap<NodeId, u64> = {
                let index = self.index.read().await;
                live_nodes
                    .iter()
                    .map(|n| (n.clone(), index.node_shards.get(n).map_or(0, |s| s.total_chunks)))
                    .collect()
            };
            if loads.len() < 2 {
                break;
            }
            let mean: f64 = loads.values().sum::<u64>() as f64 / loads.len() as f64;
            let (min_node, min_load) = loads.iter().min_by_key(|(_, l)| **l).unwrap();
            if (*min_load as f64) >= mean - 1.0 {
                break;
            }
            let (max_node, max_load) = loads.iter().max_by_key(|(_, l)| **l).unwrap();
            if max_node == min_node || *max_load == 0 {
                break;
            }

            let candidate = {
                let index = self.index.read().await;
                index
                    .node_shards
                    .get(max_node)
                    .and_then(|s| {
                        s.shards
                            .iter()
                            .flat_map(|(f, keys)| keys.iter().map(move |k| (f.clone(), k.clone())))
                            .filter(|fk| !blacklist.contains(fk))
                            .max_by_key(|(_, k)| ChunkRange::parse_key(k).map_or(0, |r| r.len()))
                    })
            };

            let Some((filename, range_key)) = candidate else {
                break;
            };

            let already_there = {
                let index = self.index.read().await;
                index
                    .node_shards
                    .get(min_node)
                    .map_or(false, |s| s.shards.get(&filename).map_or(false, |ks| ks.contains(&range_key)))
            };
            if already_there {
                blacklist.insert((filename, range_key));
                continue;
            }

            let range = match ChunkRange::parse_key(&range_key) {
                Some(r) => r,
                None => {
                    blacklist.insert((filename, range_key));
                    continue;
                }
            };

            let bytes = match self.fetch_range(max_node, &filename, &range_key).await {
                Ok(b) => b,
                Err(_) => {
                    blacklist.insert((filename, range_key));
                    continue;
                }
            };

            if self.store_range(min_node, &filename, range, &bytes).await.is_err() {
                blacklist.insert((filename, range_key));
                continue;
            }
            let verified = self.fetch_range(min_node, &filename, &range_key).await.map_or(false, |b| b == bytes);
            if !verified {
                blacklist.insert((filename, range_key));
                continue;
            }

            let remaining_live_after_delete = {
                let index = self.index.read().await;
                index
                    .files_metadata
                    .get(&filename)
                    .and_then(|m| m.chunk_distribution.get(&range_key))
                    .map_or(0, |nodes| nodes.iter().filter(|n| live_nodes.contains(*n)).count())
            } + 1;

            {
                let mut index = self.index.write().await;
                index.ensure_node(min_node);
                if let Some(meta) = index.files_metadata.get_mut(&filename) {
                    meta.chunk_distribution.entry(range_key.clone()).or_default().push(min_node.clone());
                }
                let shards = index.node_shards.get_mut(min_node).unwrap();
                shards.shards.entry(filename.clone()).or_default().push(range_key.clone());
                shards.total_chunks += range.len();
                index.files.entry(min_node.clone()).or_default().insert(filename.clone());
            }

            if remaining_live_after_delete > k_target {
                let deleted = if *max_node == self.node_id {
                    self.range_store.delete(&filename, range).await.unwrap_or(false)
                } else {
                    self.transport.delete_range(max_node, &filename, &range_key).await.unwrap_or(false)
                };
                if deleted {
                    let mut index = self.index.write().await;
                    if let Some(meta) = index.files_metadata.get_mut(&filename) {
                        if let Some(nodes) = meta.chunk_distribution.get_mut(&range_key) {
                            nodes.retain(|n| n != max_node);
                        }
                    }
                    if let Some(shards) = index.node_shards.get_mut(max_node) {
                        if let Some(keys) = shards.shards.get_mut(&filename) {
                            keys.retain(|k| k != &range_key);
                        }
                        shards.total_chunks = shards.total_chunks.saturating_sub(range.len());
                    }
                }
            }

            blacklist.insert((filename, range_key));
        }
        Ok(())
    }

    async fn stage9_bump_version(&self) -> Result<()> {
        self.index.write().await.version += 1;
        Ok(())
    }
}

type BTreeMapShards = HashMap<String, Vec<String>>;

fn shards_subset(dead: &std::collections::BTreeMap<String, Vec<String>>, live: &BTreeMapShards) -> bool {
    for (filename, keys) in dead {
        let Some(live_keys) = live.get(filename) else {
            return false;
        };
        for k in keys {
            if !live_keys.contains(k) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shards_subset_detects_superset_match() {
        let mut dead = std::collections::BTreeMap::new();
        dead.insert("song.mp3".to_string(), vec!["0-2".to_string()]);

        let mut live = HashMap::new();
        live.insert("song.mp3".to_string(), vec!["0-2".to_string(), "2-4".to_string()]);

        assert!(shards_subset(&dead, &live));
    }

    #[test]
    fn shards_subset_rejects_missing_range() {
        let mut dead = std::collections::BTreeMap::new();
        dead.insert("song.mp3".to_string(), vec!["0-2".to_string()]);
        let live = HashMap::new();
        assert!(!shards_subset(&dead, &live));
    }
}
