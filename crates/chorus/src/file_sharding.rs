//! The file sharding coordinator: `WriteFile`, `ReadFileChunks`,
//! `DeleteFile`. Ranges are split front-loaded-remainder-first (see
//! `chorus_util::ranges::split_into_ranges`), and destination selection
//! threads an `already_selected` accumulator across the whole call so picks
//! spread across ranges rather than repeating the same destinations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use chorus_util::ranges::{split_into_ranges, ChunkRange};

use crate::config::NodeConfig;
use crate::errors::{ChorusError, Result};
use crate::global_index::{GlobalIndex, NodeId};
use crate::local_range_store::RangeStore;
use crate::peer_rpc::PeerTransport;

pub struct FileShardingCoordinator {
    node_id: NodeId,
    config: Arc<NodeConfig>,
    transport: Arc<dyn PeerTransport>,
    range_store: Arc<dyn RangeStore>,
    index: Arc<RwLock<GlobalIndex>>,
}

impl FileShardingCoordinator {
    pub fn new(
        node_id: NodeId,
        config: Arc<NodeConfig>,
        transport: Arc<dyn PeerTransport>,
        range_store: Arc<dyn RangeStore>,
        index: Arc<RwLock<GlobalIndex>>,
    ) -> Self {
        FileShardingCoordinator {
            node_id,
            config,
            transport,
            range_store,
            index,
        }
    }

    /// `WriteFile`: splits `bytes` into `p` ranges, picks `k'` destinations
    /// per range by lowest adjusted `write_version`, writes each slice, and
    /// registers the result in the `GlobalIndex`.
    pub async fn write_file(&self, filename: &str, bytes: &[u8], live_nodes: &HashSet<NodeId>, now: i64) -> Result<(u64, usize)> {
        let chunk_size = self.config.chunk_size;
        let total_chunks = chorus_util::ceil_div(bytes.len() as u64, chunk_size);
        let ranges = split_into_ranges(total_chunks, self.config.chunk_ranges);
        let k_target = self.config.replication_factor().min(live_nodes.len().max(1));

        let base_versions: HashMap<NodeId, u64> = {
            let index = self.index.read().await;
            live_nodes
                .iter()
                .map(|n| (n.clone(), index.node_versions.get(n).map_or(0, |v| v.write_version)))
                .collect()
        };
        let mut already_selected: HashMap<NodeId, u64> = HashMap::new();

        let mut chunk_distribution: BTreeMap<String, Vec<NodeId>> = BTreeMap::new();

        for range in &ranges {
            let mut candidates: Vec<(NodeId, u64)> = live_nodes
                .iter()
                .map(|n| {
                    let adjusted = base_versions.get(n).copied().unwrap_or(0) + already_selected.get(n).copied().unwrap_or(0);
                    (n.clone(), adjusted)
                })
                .collect();
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let destinations: Vec<NodeId> = candidates.into_iter().take(k_target).map(|(n, _)| n).collect();

            let slice = slice_for_range(bytes, *range, chunk_size);
            for dest in &destinations {
                *already_selected.entry(dest.clone()).or_insert(0) += 1;
                self.write_range_to(dest, filename, *range, &slice).await?;
            }
            chunk_distribution.insert(range.key(), destinations);
        }

        let num_ranges = chunk_distribution.len();
        let mut index = self.index.write().await;
        for n in already_selected.keys() {
            index.ensure_node(n);
            index.node_versions.get_mut(n).unwrap().write_version += 1;
        }
        index.register_file(&filename.to_string(), total_chunks, chunk_distribution, now);
        Ok((total_chunks, num_ranges))
    }

    async fn write_range_to(&self, node: &NodeId, filename: &str, range: ChunkRange, bytes: &[u8]) -> Result<()> {
        if *node == self.node_id {
            self.range_store.put(filename, range, bytes).await
        } else {
            self.transport.create_range(node, filename, &range.key(), bytes.to_vec()).await
        }
    }

    /// `ReadFileChunks`: picks the single live node with lowest
    /// `read_version`, delegates the whole read to it.
    pub async fn read_file_chunks(&self, filename: &str, start_chunk: u64, chunk_count: u64, live_nodes: &HashSet<NodeId>) -> Result<Vec<Vec<u8>>> {
        let meta = {
            let index = self.index.read().await;
            index
                .files_metadata
                .get(filename)
                .cloned()
                .ok_or_else(|| ChorusError::NotFound { what: format!("file {filename}") })?
        };

        let target = {
            let index = self.index.read().await;
            index.least_loaded_read(live_nodes).unwrap_or_else(|| self.node_id.clone())
        };

        let mut out = Vec::with_capacity(chunk_count as usize);
        for chunk_idx in start_chunk..(start_chunk + chunk_count) {
            let range_key = meta
                .chunk_distribution
                .keys()
                .find(|k| ChunkRange::parse_key(k).map_or(false, |r| r.start <= chunk_idx && chunk_idx < r.end))
                .cloned()
                .ok_or_else(|| ChorusError::NotFound {
                    what: format!("chunk {chunk_idx} of {filename}"),
                })?;

            let holders = meta.chunk_distribution.get(&range_key).cloned().unwrap_or_default();
            let holder = if holders.contains(&target) {
                target.clone()
            } else {
                holders
                    .into_iter()
                    .find(|n| live_nodes.contains(n))
                    .ok_or_else(|| ChorusError::ReplicationShortage {
                        filename: filename.to_string(),
                        range_key: range_key.clone(),
                        have: 0,
                        want: 1,
                    })?
            };

            let range = ChunkRange::parse_key(&range_key).expect("validated above");
            let bytes = if holder == self.node_id {
                self.range_store.get(filename, range).await?
            } else {
                self.transport.get_chunk_range(&holder, filename, &range_key).await?
            };

            let chunk_size = self.config.chunk_size;
            let offset_in_range = (chunk_idx - range.start) * chunk_size;
            let end = (offset_in_range + chunk_size).min(bytes.len() as u64);
            out.push(bytes[offset_in_range as usize..end as usize].to_vec());
        }

        let mut index = self.index.write().await;
        index.ensure_node(&target);
        index.node_versions.get_mut(&target).unwrap().read_version += 1;

        Ok(out)
    }

    /// `DeleteFile`: removes every replica in parallel (sequentially here,
    /// which preserves correctness at the cost of some latency), then
    /// removes the file from the index.
    pub async fn delete_file(&self, filename: &str) -> Result<()> {
        let meta = {
            let index = self.index.read().await;
            index.files_metadata.get(filename).cloned()
        };
        let Some(meta) = meta else {
            return Err(ChorusError::NotFound { what: format!("file {filename}") });
        };

        for (range_key, nodes) in &meta.chunk_distribution {
            let range = ChunkRange::parse_key(range_key);
            for node in nodes {
                let _ = match range {
                    Some(r) if *node == self.node_id => self.range_store.delete(filename, r).await,
                    _ => self.transport.delete_range(node, filename, range_key).await,
                };
            }
        }

        self.index.write().await.remove_file(&filename.to_string());
        Ok(())
    }
}

fn slice_for_range(bytes: &[u8], range: ChunkRange, chunk_size: u64) -> Vec<u8> {
    let start = (range.start * chunk_size).min(bytes.len() as u64) as usize;
    let end = (range.end * chunk_size).min(bytes.len() as u64) as usize;
    bytes[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_range_store::FsRangeStore;
    use crate::test_support::NoopTransport;
    use clap::Parser;

    #[tokio::test]
    async fn write_then_read_round_trips_single_node() {
        let dir = tempfile::tempdir().unwrap();
        let node_id = "n1".to_string();
        let range_store: Arc<dyn RangeStore> = Arc::new(FsRangeStore::new(dir.path()));
        let index = Arc::new(RwLock::new(GlobalIndex::new()));
        let mut config = NodeConfig::parse_from(["chorus-node"]);
        config.chunk_size = 4;
        config.chunk_ranges = 2;
        config.db_replication_factor = 1;
        let config = Arc::new(config);

        let live: HashSet<NodeId> = [node_id.clone()].into_iter().collect();
        let coordinator = FileShardingCoordinator::new(node_id.clone(), config, Arc::new(NoopTransport), range_store, index);

        let bytes = b"abcdefgh".to_vec();
        let (total_chunks, num_ranges) = coordinator.write_file("song.mp3", &bytes, &live, 0).await.unwrap();
        assert_eq!(total_chunks, 2);
        assert_eq!(num_ranges, 2);

        let chunks = coordinator.read_file_chunks("song.mp3", 0, 2, &live).await.unwrap();
        assert_eq!(chunks.concat(), bytes);

        coordinator.delete_file("song.mp3").await.unwrap();
        let err = coordinator.read_file_chunks("song.mp3", 0, 1, &live).await.unwrap_err();
        assert!(matches!(err, ChorusError::NotFound { .. }));
    }
}
