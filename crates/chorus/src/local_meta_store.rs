//! `LocalMetaStore`: the per-node relational-ish store for library
//! entities, exposing prepare/commit/rollback savepoint semantics for 2PC.
//! The real relational engine is an external collaborator; this module
//! provides a concrete in-memory reference implementation so the crate
//! compiles and its test suite runs standalone.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::{Entity, EntityId, Filter, MetaOp};
use crate::errors::Result;

/// Outcome of applying a 2PC operation, an explicit enum in place of an
/// exception-driven "already exists = success" control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
    Conflict,
    Failed,
}

struct Savepoint {
    op: MetaOp,
    entity: Entity,
    /// The value the entity had before this savepoint applied, for rollback.
    previous: Option<Entity>,
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Applies `op` on `entity` against an open savepoint (not yet durable
    /// in the committed table); returns the outcome without touching the
    /// journal. Idempotent by `task_id`: a repeated prepare for a
    /// `task_id` already open or already committed returns the cached
    /// outcome without re-applying.
    async fn prepare(&self, task_id: &str, op: MetaOp, entity: Entity) -> Result<ApplyOutcome>;

    async fn commit(&self, task_id: &str) -> Result<bool>;

    async fn rollback(&self, task_id: &str) -> Result<bool>;

    async fn get(&self, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>>;

    async fn exists(&self, kind: &str, id: &EntityId) -> Result<bool>;

    /// Whole-table snapshot, used only during DB-node promotion, never
    /// steady-state sync.
    async fn dump(&self) -> Result<Vec<Entity>>;

    async fn restore(&self, entities: Vec<Entity>) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    committed: HashMap<EntityId, Entity>,
    savepoints: HashMap<String, Savepoint>,
    /// `task_id`s that have already been committed, so a re-prepare after
    /// commit also returns `AlreadyApplied` rather than reopening a
    /// savepoint.
    committed_tasks: std::collections::HashSet<String>,
}

pub struct InMemoryMetaStore {
    tables: Mutex<Tables>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        InMemoryMetaStore {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn matches(entity: &Entity, kind: &str, filters: &[Filter]) -> bool {
        if entity.kind() != kind {
            return false;
        }
        filters.iter().all(|f| field_value(entity, &f.field) == Some(f.value.clone()))
    }
}

fn field_value(entity: &Entity, field: &str) -> Option<String> {
    if field == "id" {
        return Some(entity.id().clone());
    }
    match entity {
        Entity::Artist(r) if field == "name" => Some(r.name.clone()),
        Entity::Album(r) if field == "artist_id" => Some(r.artist_id.clone()),
        Entity::Album(r) if field == "title" => Some(r.title.clone()),
        Entity::Track(r) if field == "album_id" => Some(r.album_id.clone()),
        Entity::Track(r) if field == "title" => Some(r.title.clone()),
        Entity::User(r) if field == "email" => Some(r.email.clone()),
        _ => None,
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn prepare(&self, task_id: &str, op: MetaOp, entity: Entity) -> Result<ApplyOutcome> {
        let mut tables = self.tables.lock().unwrap();

        if tables.committed_tasks.contains(task_id) || tables.savepoints.contains_key(task_id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let id = entity.id().clone();
        let previous = tables.committed.get(&id).cloned();

        match op {
            MetaOp::Create => {
                if previous.is_some() {
                    return Ok(ApplyOutcome::Conflict);
                }
            }
            MetaOp::Update | MetaOp::Delete => {
                if previous.is_none() {
                    return Ok(ApplyOutcome::Conflict);
                }
            }
        }

        tables.savepoints.insert(
            task_id.to_string(),
            Savepoint {
                op,
                entity,
                previous,
            },
        );
        Ok(ApplyOutcome::Applied)
    }

    async fn commit(&self, task_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        let Some(savepoint) = tables.savepoints.remove(task_id) else {
            return Ok(false);
        };

        let id = savepoint.entity.id().clone();
        match savepoint.op {
            MetaOp::Create | MetaOp::Update => {
                tables.committed.insert(id, savepoint.entity);
            }
            MetaOp::Delete => {
                tables.committed.remove(&id);
            }
        }
        tables.committed_tasks.insert(task_id.to_string());
        Ok(true)
    }

    async fn rollback(&self, task_id: &str) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        Ok(tables.savepoints.remove(task_id).is_some())
    }

    async fn get(&self, kind: &str, filters: &[Filter]) -> Result<Vec<Entity>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .committed
            .values()
            .filter(|e| Self::matches(e, kind, filters))
            .cloned()
            .collect())
    }

    async fn exists(&self, kind: &str, id: &EntityId) -> Result<bool> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.committed.get(id).map_or(false, |e| e.kind() == kind))
    }

    async fn dump(&self) -> Result<Vec<Entity>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.committed.values().cloned().collect())
    }

    async fn restore(&self, entities: Vec<Entity>) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.committed.clear();
        for e in entities {
            tables.committed.insert(e.id().clone(), e);
        }
        Ok(())
    }
}

impl Default for InMemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::ArtistRecord;

    fn artist(id: &str) -> Entity {
        Entity::Artist(ArtistRecord {
            id: id.to_string(),
            name: "Name".to_string(),
            bio: None,
        })
    }

    #[tokio::test]
    async fn prepare_create_then_commit_is_visible() {
        let store = InMemoryMetaStore::new();
        let outcome = store.prepare("t1", MetaOp::Create, artist("a1")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(!store.exists("artist", &"a1".to_string()).await.unwrap());
        assert!(store.commit("t1").await.unwrap());
        assert!(store.exists("artist", &"a1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_task_id_is_already_applied() {
        let store = InMemoryMetaStore::new();
        store.prepare("t1", MetaOp::Create, artist("a1")).await.unwrap();
        let second = store.prepare("t1", MetaOp::Create, artist("a1")).await.unwrap();
        assert_eq!(second, ApplyOutcome::AlreadyApplied);
    }

    #[tokio::test]
    async fn commit_unknown_task_id_fails_without_side_effects() {
        let store = InMemoryMetaStore::new();
        assert!(!store.commit("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn create_conflict_when_already_exists() {
        let store = InMemoryMetaStore::new();
        store.prepare("t1", MetaOp::Create, artist("a1")).await.unwrap();
        store.commit("t1").await.unwrap();
        let outcome = store.prepare("t2", MetaOp::Create, artist("a1")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflict);
    }

    #[tokio::test]
    async fn rollback_discards_uncommitted_savepoint() {
        let store = InMemoryMetaStore::new();
        store.prepare("t1", MetaOp::Create, artist("a1")).await.unwrap();
        assert!(store.rollback("t1").await.unwrap());
        assert!(!store.commit("t1").await.unwrap());
    }
}
