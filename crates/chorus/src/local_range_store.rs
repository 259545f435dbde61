//! Per-node byte store for `(filename, range_id) -> bytes`.
//! Filesystem-backed: each range lives at
//! `<storage_root>/<filename>/range_<start>-<end>`, and empty filename
//! directories are pruned on delete.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use chorus_util::ranges::ChunkRange;

use crate::errors::{ChorusError, Result};

#[async_trait]
pub trait RangeStore: Send + Sync {
    async fn put(&self, filename: &str, range: ChunkRange, bytes: &[u8]) -> Result<()>;
    async fn get(&self, filename: &str, range: ChunkRange) -> Result<Vec<u8>>;
    async fn delete(&self, filename: &str, range: ChunkRange) -> Result<bool>;
    async fn exists(&self, filename: &str) -> Result<bool>;
    async fn list_filenames(&self) -> Result<Vec<String>>;
    async fn list_ranges(&self, filename: &str) -> Result<Vec<ChunkRange>>;
}

pub struct FsRangeStore {
    root: PathBuf,
}

impl FsRangeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsRangeStore { root: root.into() }
    }

    fn file_dir(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    fn range_path(&self, filename: &str, range: ChunkRange) -> PathBuf {
        self.file_dir(filename).join(format!("range_{}-{}", range.start, range.end))
    }

    fn parse_range_filename(name: &str) -> Option<ChunkRange> {
        let key = name.strip_prefix("range_")?;
        ChunkRange::parse_key(key)
    }
}

#[async_trait]
impl RangeStore for FsRangeStore {
    async fn put(&self, filename: &str, range: ChunkRange, bytes: &[u8]) -> Result<()> {
        let dir = self.file_dir(filename);
        fs::create_dir_all(&dir).await?;
        fs::write(self.range_path(filename, range), bytes).await?;
        Ok(())
    }

    async fn get(&self, filename: &str, range: ChunkRange) -> Result<Vec<u8>> {
        let path = self.range_path(filename, range);
        fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ChorusError::NotFound {
                    what: format!("range {} of {filename}", range.key()),
                }
            } else {
                ChorusError::Io(e)
            }
        })
    }

    async fn delete(&self, filename: &str, range: ChunkRange) -> Result<bool> {
        let path = self.range_path(filename, range);
        match fs::remove_file(&path).await {
            Ok(()) => {
                prune_if_empty(&self.file_dir(filename)).await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ChorusError::Io(e)),
        }
    }

    async fn exists(&self, filename: &str) -> Result<bool> {
        Ok(fs::metadata(self.file_dir(filename)).await.is_ok())
    }

    async fn list_filenames(&self) -> Result<Vec<String>> {
        let mut out = vec![];
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ChorusError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    async fn list_ranges(&self, filename: &str) -> Result<Vec<ChunkRange>> {
        let dir = self.file_dir(filename);
        let mut out = vec![];
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ChorusError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(range) = Self::parse_range_filename(name) {
                    out.push(range);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

async fn prune_if_empty(dir: &Path) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    if entries.next_entry().await?.is_none() {
        let _ = fs::remove_dir(dir).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRangeStore::new(dir.path());
        let range = ChunkRange { start: 0, end: 3 };

        store.put("song.mp3", range, b"hello").await.unwrap();
        assert!(store.exists("song.mp3").await.unwrap());
        assert_eq!(store.get("song.mp3", range).await.unwrap(), b"hello");
        assert_eq!(store.list_ranges("song.mp3").await.unwrap(), vec![range]);

        assert!(store.delete("song.mp3", range).await.unwrap());
        assert!(!store.exists("song.mp3").await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_range_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRangeStore::new(dir.path());
        let err = store.get("missing.mp3", ChunkRange { start: 0, end: 1 }).await.unwrap_err();
        assert!(matches!(err, ChorusError::NotFound { .. }));
    }
}
