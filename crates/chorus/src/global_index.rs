//! The `GlobalIndex`: the single cluster-wide shared structure. Leader owns
//! all mutation; followers hold a read-only snapshot replaced wholesale on
//! every heartbeat. This module also carries the invariant checks used by
//! tests and (at `debug` level) by the monitoring loop itself to catch
//! regressions early.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use chorus_util::ranges::ChunkRange;

use crate::errors::{ChorusError, Result};

pub type NodeId = String;
pub type Filename = String;
pub type RangeKey = String;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub total_chunks: u64,
    /// `range_key -> [node_id]`.
    pub chunk_distribution: BTreeMap<RangeKey, Vec<NodeId>>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeShards {
    pub total_chunks: u64,
    /// `filename -> [range_key]`.
    pub shards: BTreeMap<Filename, Vec<RangeKey>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeVersions {
    pub read_version: u64,
    pub write_version: u64,
    pub db_version: u64,
    pub db_version_prev: u64,
    pub is_db_node: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalIndex {
    pub version: u64,
    pub files: BTreeMap<NodeId, BTreeSet<Filename>>,
    pub files_metadata: BTreeMap<Filename, FileMetadata>,
    pub node_shards: BTreeMap<NodeId, NodeShards>,
    pub db_nodes: BTreeSet<NodeId>,
    pub node_versions: BTreeMap<NodeId, NodeVersions>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_node(&mut self, node: &NodeId) {
        self.node_versions.entry(node.clone()).or_default();
        self.node_shards.entry(node.clone()).or_default();
        self.files.entry(node.clone()).or_default();
    }

    pub fn least_loaded_read(&self, candidates: &HashSet<NodeId>) -> Option<NodeId> {
        candidates
            .iter()
            .filter_map(|n| self.node_versions.get(n).map(|v| (n.clone(), v.read_version)))
            .min_by_key(|(_, v)| *v)
            .map(|(n, _)| n)
    }

    /// Adds `filename`'s metadata and updates each destination's
    /// `node_shards`/`files`. Bumps `version`. Used by `WriteFile`.
    pub fn register_file(
        &mut self,
        filename: &Filename,
        total_chunks: u64,
        chunk_distribution: BTreeMap<RangeKey, Vec<NodeId>>,
        created_at: i64,
    ) {
        for (range_key, nodes) in &chunk_distribution {
            let range = ChunkRange::parse_key(range_key).expect("well-formed range key");
            for node in nodes {
                self.ensure_node(node);
                self.files.get_mut(node).unwrap().insert(filename.clone());
                let shards = self.node_shards.get_mut(node).unwrap();
                shards.shards.entry(filename.clone()).or_default().push(range_key.clone());
                shards.total_chunks += range.len();
            }
        }

        self.files_metadata.insert(
            filename.clone(),
            FileMetadata {
                total_chunks,
                chunk_distribution,
                created_at,
            },
        );
        self.version += 1;
    }

    /// Removes every trace of `filename` from the index. Used by
    /// `DeleteFile` and monitoring-cycle stage 4 (orphan GC).
    pub fn remove_file(&mut self, filename: &Filename) {
        let Some(meta) = self.files_metadata.remove(filename) else {
            return;
        };

        for (range_key, nodes) in &meta.chunk_distribution {
            let range = ChunkRange::parse_key(range_key);
            for node in nodes {
                if let Some(set) = self.files.get_mut(node) {
                    set.remove(filename);
                }
                if let Some(shards) = self.node_shards.get_mut(node) {
                    if let Some(list) = shards.shards.get_mut(filename) {
                        list.retain(|k| k != range_key);
                        if list.is_empty() {
                            shards.shards.remove(filename);
                        }
                    }
                    if let Some(r) = range {
                        shards.total_chunks = shards.total_chunks.saturating_sub(r.len());
                    }
                }
            }
        }
        self.version += 1;
    }

    /// Additive merge of a follower's `GlobalIndex` into this (leader's)
    /// index on stale-term rejection. Never deletes or downgrades anything
    /// already present; `version` becomes the max of both.
    pub fn merge_additive(&mut self, other: &GlobalIndex) {
        for (node, files) in &other.files {
            let set = self.files.entry(node.clone()).or_default();
            for f in files {
                set.insert(f.clone());
            }
        }

        for (filename, meta) in &other.files_metadata {
            let entry = self.files_metadata.entry(filename.clone()).or_insert_with(|| FileMetadata {
                total_chunks: meta.total_chunks,
                chunk_distribution: BTreeMap::new(),
                created_at: meta.created_at,
            });
            for (range_key, nodes) in &meta.chunk_distribution {
                let dest = entry.chunk_distribution.entry(range_key.clone()).or_default();
                for n in nodes {
                    if !dest.contains(n) {
                        dest.push(n.clone());
                    }
                }
            }
            entry.total_chunks = entry.total_chunks.max(meta.total_chunks);
        }

        for (node, shards) in &other.node_shards {
            let entry = self.node_shards.entry(node.clone()).or_default();
            for (filename, keys) in &shards.shards {
                let dest = entry.shards.entry(filename.clone()).or_default();
                for k in keys {
                    if !dest.contains(k) {
                        dest.push(k.clone());
                    }
                }
            }
            entry.total_chunks = entry.total_chunks.max(shards.total_chunks);
        }

        for n in &other.db_nodes {
            self.db_nodes.insert(n.clone());
        }

        for (node, v) in &other.node_versions {
            let entry = self.node_versions.entry(node.clone()).or_default();
            entry.read_version = entry.read_version.max(v.read_version);
            entry.write_version = entry.write_version.max(v.write_version);
            entry.db_version = entry.db_version.max(v.db_version);
            entry.db_version_prev = entry.db_version_prev.max(v.db_version_prev);
            entry.is_db_node = entry.is_db_node || v.is_db_node;
        }

        self.version = self.version.max(other.version);
    }

    /// Checks invariants 1-6. Returns the first violation found, if any.
    /// Called by the monitoring loop at `debug` level after each cycle and
    /// directly by tests.
    pub fn check_invariants(&self, live_nodes: &HashSet<NodeId>, replication_factor: usize) -> Result<()> {
        // Invariant 1: chunk_distribution list == set of node_shards referencing it.
        for (filename, meta) in &self.files_metadata {
            for (range_key, listed) in &meta.chunk_distribution {
                let listed_set: HashSet<&NodeId> = listed.iter().collect();
                let derived_set: HashSet<&NodeId> = self
                    .node_shards
                    .iter()
                    .filter(|(_, s)| s.shards.get(filename).map_or(false, |ks| ks.contains(range_key)))
                    .map(|(n, _)| n)
                    .collect();
                if listed_set != derived_set {
                    return Err(ChorusError::IndexInvariant {
                        detail: format!(
                            "invariant 1 violated for {filename} {range_key}: listed {listed_set:?} != derived {derived_set:?}"
                        ),
                    });
                }
            }
        }

        // Invariant 2: live replica count == min(k, |live_nodes|) for any shard with >=1 live replica.
        let target = replication_factor.min(live_nodes.len().max(1));
        for (filename, meta) in &self.files_metadata {
            for (range_key, nodes) in &meta.chunk_distribution {
                let live_count = nodes.iter().filter(|n| live_nodes.contains(*n)).count();
                if live_count > 0 && live_count != target {
                    return Err(ChorusError::IndexInvariant {
                        detail: format!(
                            "invariant 2 violated for {filename} {range_key}: {live_count} live replicas, want {target}"
                        ),
                    });
                }
            }
        }

        // Invariant 3: |db_nodes ∩ live| == min(k, |live|).
        let db_live = self.db_nodes.iter().filter(|n| live_nodes.contains(*n)).count();
        let want_db = replication_factor.min(live_nodes.len());
        if !live_nodes.is_empty() && db_live != want_db {
            return Err(ChorusError::IndexInvariant {
                detail: format!("invariant 3 violated: |db_nodes ∩ live| = {db_live}, want {want_db}"),
            });
        }

        // Invariant 4: every db_node has is_db_node = true.
        for n in &self.db_nodes {
            if !self.node_versions.get(n).map_or(false, |v| v.is_db_node) {
                return Err(ChorusError::IndexInvariant {
                    detail: format!("invariant 4 violated: {n} is in db_nodes but is_db_node=false"),
                });
            }
        }

        // Invariant 5: node_shards[n].total_chunks == sum of range lengths.
        for (node, shards) in &self.node_shards {
            let sum: u64 = shards
                .shards
                .values()
                .flatten()
                .filter_map(|k| ChunkRange::parse_key(k))
                .map(|r| r.len())
                .sum();
            if sum != shards.total_chunks {
                return Err(ChorusError::IndexInvariant {
                    detail: format!("invariant 5 violated for {node}: total_chunks {} != sum {sum}", shards.total_chunks),
                });
            }
        }

        // Invariant 6: union of chunk_distribution ranges for each file covers [0, total_chunks) with no gaps/overlaps.
        for (filename, meta) in &self.files_metadata {
            let mut ranges: Vec<ChunkRange> = meta
                .chunk_distribution
                .keys()
                .filter_map(|k| ChunkRange::parse_key(k))
                .collect();
            ranges.sort();
            let mut cursor = 0u64;
            for r in &ranges {
                if r.start != cursor {
                    return Err(ChorusError::IndexInvariant {
                        detail: format!("invariant 6 violated for {filename}: gap/overlap before {}", r.start),
                    });
                }
                cursor = r.end;
            }
            if cursor != meta.total_chunks {
                return Err(ChorusError::IndexInvariant {
                    detail: format!("invariant 6 violated for {filename}: coverage ends at {cursor}, want {}", meta.total_chunks),
                });
            }
        }

        Ok(())
    }

    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(blob)?)
    }
}

/// Live-node computation support: the per-cycle `{node_id -> state}` view
/// maintained alongside the index (kept as a sibling map rather than a
/// GlobalIndex field since it is derived fresh every cycle, not persisted
/// cluster state).
pub type NodeStates = HashMap<NodeId, crate::leader_coordinator::NodeState>;

#[cfg(test)]
mod tests {
    use super::*;

    fn live(nodes: &[&str]) -> HashSet<NodeId> {
        nodes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_and_remove_file_round_trips_invariants() {
        let mut idx = GlobalIndex::new();
        for n in ["a", "b", "c"] {
            idx.ensure_node(&n.to_string());
            idx.node_versions.get_mut(n).unwrap().is_db_node = true;
            idx.db_nodes.insert(n.to_string());
        }

        let mut dist = BTreeMap::new();
        dist.insert("0-3".to_string(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        dist.insert("3-5".to_string(), vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        idx.register_file(&"x.mp3".to_string(), 5, dist, 0);

        idx.check_invariants(&live(&["a", "b", "c"]), 3).unwrap();

        idx.remove_file(&"x.mp3".to_string());
        assert!(!idx.files_metadata.contains_key("x.mp3"));
        for n in ["a", "b", "c"] {
            assert!(!idx.files.get(n).unwrap().contains("x.mp3"));
        }
    }

    #[test]
    fn merge_additive_never_loses_existing_entries() {
        let mut leader_idx = GlobalIndex::new();
        leader_idx.ensure_node(&"a".to_string());
        leader_idx.version = 3;

        let mut follower_idx = GlobalIndex::new();
        follower_idx.ensure_node(&"b".to_string());
        follower_idx.version = 5;
        let mut dist = BTreeMap::new();
        dist.insert("0-1".to_string(), vec!["b".to_string()]);
        follower_idx.register_file(&"y.mp3".to_string(), 1, dist, 0);

        leader_idx.merge_additive(&follower_idx);
        assert!(leader_idx.node_shards.contains_key("a"));
        assert!(leader_idx.node_shards.contains_key("b"));
        assert!(leader_idx.files_metadata.contains_key("y.mp3"));
        assert_eq!(leader_idx.version, 6);
    }

    #[test]
    fn detects_invariant_six_gap() {
        let mut idx = GlobalIndex::new();
        idx.ensure_node(&"a".to_string());
        let mut dist = BTreeMap::new();
        dist.insert("0-2".to_string(), vec!["a".to_string()]);
        dist.insert("3-5".to_string(), vec!["a".to_string()]);
        idx.files_metadata.insert(
            "broken.mp3".to_string(),
            FileMetadata {
                total_chunks: 5,
                chunk_distribution: dist,
                created_at: 0,
            },
        );
        let err = idx.check_invariants(&live(&["a"]), 1).unwrap_err();
        assert!(matches!(err, ChorusError::IndexInvariant { .. }));
    }
}
