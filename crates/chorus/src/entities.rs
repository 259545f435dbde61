//! The tagged entity model: a closed enum, one constructor per entity
//! kind, serialized by variant tag rather than a separate `"model"` string
//! threaded alongside a loose dict.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub type EntityId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub id: EntityId,
    pub name: String,
    pub bio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRecord {
    pub id: EntityId,
    pub title: String,
    pub artist_id: EntityId,
    pub released: Option<String>,
}

/// `artist_ids` is a first-class field here, never assembled onto the
/// record as a many-to-many relation set after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: EntityId,
    pub title: String,
    pub album_id: EntityId,
    pub duration_secs: u32,
    pub artist_ids: BTreeSet<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: EntityId,
    pub email: String,
    pub display_name: String,
}

/// One constructor per entity kind; serde tags on `kind` so the wire shape
/// stays self-describing without needing a second parallel string field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entity {
    Artist(ArtistRecord),
    Album(AlbumRecord),
    Track(TrackRecord),
    User(UserRecord),
}

impl Entity {
    pub fn id(&self) -> &EntityId {
        match self {
            Entity::Artist(r) => &r.id,
            Entity::Album(r) => &r.id,
            Entity::Track(r) => &r.id,
            Entity::User(r) => &r.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Artist(_) => "artist",
            Entity::Album(_) => "album",
            Entity::Track(_) => "track",
            Entity::User(_) => "user",
        }
    }

    /// Only `Album`/`Track` participate in `FileShardSet` lifecycle: a
    /// `Track` delete cascades into shard garbage collection during
    /// monitoring-cycle stage 4.
    pub fn carries_file_shards(&self) -> bool {
        matches!(self, Entity::Album(_) | Entity::Track(_))
    }
}

/// The operation a `WriteMetadata` call requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaOp {
    Create,
    Update,
    Delete,
}

/// A filter used by `ReadMetadata` / `GetData`. Kept intentionally small:
/// exact-match on a single field, since the query surface this crate needs
/// never grows beyond simple equality filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_dispatches_by_variant() {
        let e = Entity::Track(TrackRecord {
            id: "t1".into(),
            title: "Song".into(),
            album_id: "a1".into(),
            duration_secs: 180,
            artist_ids: BTreeSet::from(["ar1".to_string()]),
        });
        assert_eq!(e.id(), "t1");
        assert_eq!(e.kind(), "track");
        assert!(e.carries_file_shards());
    }

    #[test]
    fn user_does_not_carry_file_shards() {
        let e = Entity::User(UserRecord {
            id: "u1".into(),
            email: "a@b.com".into(),
            display_name: "A".into(),
        });
        assert!(!e.carries_file_shards());
    }
}
