//! `OperationJournal`: the durable per-DB-node record of metadata
//! operations, persisted as a single JSON document. Append-only except for
//! `pending -> completed` status updates; entries are never deleted except
//! by an optional, not-yet-implemented compaction scheme.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::entities::{Entity, MetaOp};
use crate::errors::Result;
use crate::global_index::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    Pending,
    Completed,
}

/// One journal entry. `op`/`entity` are the typed view this crate actually
/// works with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub term: u64,
    pub task_id: String,
    pub op: MetaOp,
    pub entity: Entity,
    pub status: JournalStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalDoc {
    term: u64,
    node_id: NodeId,
    db_version: u64,
    db_version_prev: u64,
    become_new_leader: bool,
    log: Vec<JournalEntry>,
}

impl JournalDoc {
    fn new(node_id: NodeId) -> Self {
        JournalDoc {
            term: 0,
            node_id,
            db_version: 0,
            db_version_prev: 0,
            become_new_leader: false,
            log: vec![],
        }
    }
}

/// A journal dump as returned by `GetJournalDump`, used for sync checks and
/// new-DB-node promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalDump {
    pub term: u64,
    pub node_id: NodeId,
    pub db_version: u64,
    pub db_version_prev: u64,
    pub log: Vec<JournalEntry>,
}

pub struct OperationJournal {
    path: PathBuf,
    doc: Mutex<JournalDoc>,
}

impl OperationJournal {
    /// Loads `<base>/db_node_state.json` if present, otherwise starts a
    /// fresh journal for `node_id`.
    pub async fn open(base: &Path, node_id: NodeId) -> Result<Self> {
        let path = base.join("db_node_state.json");
        let doc = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JournalDoc::new(node_id),
            Err(e) => return Err(e.into()),
        };
        Ok(OperationJournal {
            path,
            doc: Mutex::new(doc),
        })
    }

    async fn persist(&self, doc: &JournalDoc) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn append_pending(&self, term: u64, task_id: String, op: MetaOp, entity: Entity) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.log.push(JournalEntry {
            term,
            task_id,
            op,
            entity,
            status: JournalStatus::Pending,
        });
        self.persist(&doc).await
    }

    pub async fn mark_completed(&self, task_id: &str) -> Result<bool> {
        let mut doc = self.doc.lock().await;
        let found = doc.log.iter_mut().find(|e| e.task_id == task_id);
        let found = match found {
            Some(e) => e,
            None => return Ok(false),
        };
        found.status = JournalStatus::Completed;
        doc.db_version_prev = doc.db_version;
        doc.db_version += 1;
        self.persist(&doc).await?;
        Ok(true)
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.doc.lock().await.log.iter().any(|e| e.task_id == task_id)
    }

    pub async fn pending_entries(&self) -> Vec<JournalEntry> {
        self.doc
            .lock()
            .await
            .log
            .iter()
            .filter(|e| e.status == JournalStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn db_version(&self) -> u64 {
        self.doc.lock().await.db_version
    }

    pub async fn set_become_new_leader(&self, flag: bool) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.become_new_leader = flag;
        self.persist(&doc).await
    }

    pub async fn become_new_leader(&self) -> bool {
        self.doc.lock().await.become_new_leader
    }

    pub async fn dump(&self) -> JournalDump {
        let doc = self.doc.lock().await;
        JournalDump {
            term: doc.term,
            node_id: doc.node_id.clone(),
            db_version: doc.db_version,
            db_version_prev: doc.db_version_prev,
            log: doc.log.clone(),
        }
    }

    /// Replaces this journal's contents with `dump`, used during DB-node
    /// promotion: a whole-journal copy, never used for steady-state sync,
    /// which always diffs by `task_id`.
    pub async fn restore_from_dump(&self, dump: JournalDump) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.term = dump.term;
        doc.db_version = dump.db_version;
        doc.db_version_prev = dump.db_version_prev;
        doc.log = dump.log;
        doc.become_new_leader = false;
        self.persist(&doc).await
    }

    /// Task ids present here but missing from `other`, for quorum sync
    /// diffing.
    pub async fn missing_from(&self, other_task_ids: &std::collections::HashSet<String>) -> Vec<JournalEntry> {
        self.doc
            .lock()
            .await
            .log
            .iter()
            .filter(|e| !other_task_ids.contains(&e.task_id))
            .cloned()
            .collect()
    }

    pub async fn all_task_ids(&self) -> std::collections::HashSet<String> {
        self.doc.lock().await.log.iter().map(|e| e.task_id.clone()).collect()
    }

    /// Deletes the on-disk journal file. Used on demotion; the in-memory
    /// doc keeps existing for whatever's still holding a reference, but a
    /// later `open()` on the same path starts fresh.
    pub async fn delete_file(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ArtistRecord;

    fn artist(id: &str) -> Entity {
        Entity::Artist(ArtistRecord {
            id: id.to_string(),
            name: "n".to_string(),
            bio: None,
        })
    }

    #[tokio::test]
    async fn append_then_complete_bumps_db_version() {
        let dir = tempfile::tempdir().unwrap();
        let journal = OperationJournal::open(dir.path(), "node-a".to_string()).await.unwrap();

        journal
            .append_pending(1, "t1".to_string(), MetaOp::Create, artist("a1"))
            .await
            .unwrap();
        assert_eq!(journal.db_version().await, 0);
        assert!(journal.mark_completed("t1").await.unwrap());
        assert_eq!(journal.db_version().await, 1);
    }

    #[tokio::test]
    async fn mark_completed_unknown_task_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let journal = OperationJournal::open(dir.path(), "node-a".to_string()).await.unwrap();
        assert!(!journal.mark_completed("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn reopen_loads_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = OperationJournal::open(dir.path(), "node-a".to_string()).await.unwrap();
            journal
                .append_pending(1, "t1".to_string(), MetaOp::Create, artist("a1"))
                .await
                .unwrap();
            journal.mark_completed("t1").await.unwrap();
        }
        let reopened = OperationJournal::open(dir.path(), "node-a".to_string()).await.unwrap();
        assert_eq!(reopened.db_version().await, 1);
        assert!(reopened.contains("t1").await);
    }

    #[tokio::test]
    async fn restore_from_dump_then_replay_pending_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let journal = OperationJournal::open(dir.path(), "node-a".to_string()).await.unwrap();
        let dump = JournalDump {
            term: 2,
            node_id: "node-a".to_string(),
            db_version: 1,
            db_version_prev: 0,
            log: vec![JournalEntry {
                term: 2,
                task_id: "t9".to_string(),
                op: MetaOp::Create,
                entity: artist("a9"),
                status: JournalStatus::Pending,
            }],
        };
        journal.restore_from_dump(dump.clone()).await.unwrap();
        let pending_first = journal.pending_entries().await;
        journal.restore_from_dump(dump).await.unwrap();
        let pending_second = journal.pending_entries().await;
        assert_eq!(pending_first.len(), pending_second.len());
    }
}
