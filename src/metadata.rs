//! File-per-record metadata store for slot snapshots.
//!
//! Each cached prefix gets one `<key>.meta.json` file under `META_DIR`
//! holding its block hashes, model id, and last-touched timestamp. There is
//! no in-memory index: every lookup re-scans the directory, which is fine at
//! the scale this proxy runs at and keeps a crash from ever leaving memory
//! and disk disagreeing about what snapshots exist. All I/O goes through
//! `tokio::fs` so metadata reads/writes are a suspension point like any
//! other, never blocking the executor thread.

use std::{
    io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

const META_SUFFIX: &str = ".meta.json";

/// A single cache entry's metadata, as persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub key: String,
    pub model_id: String,
    pub words_per_block: usize,
    pub block_hashes: Vec<String>,
    /// Char count of the raw prefix this record was hashed from. Informational
    /// only: not used in any ratio computation, just for inspecting on-disk
    /// records.
    pub prefix_len: usize,
    pub updated_at: u64,
}

/// Directory-backed metadata store. Cheap to clone: it's just a path.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

impl MetadataStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}{META_SUFFIX}"))
    }

    /// Write a brand-new or fully-updated record for `key`, replacing
    /// `updated_at` with the current time. The write goes to a sibling
    /// temp file and is renamed into place so a crash mid-write never
    /// leaves a truncated or partially-written record behind.
    pub async fn write(
        &self,
        key: &str,
        model_id: &str,
        words_per_block: usize,
        block_hashes: Vec<String>,
        prefix_len: usize,
    ) -> io::Result<()> {
        let record = MetaRecord {
            key: key.to_string(),
            model_id: model_id.to_string(),
            words_per_block,
            block_hashes,
            prefix_len,
            updated_at: now_unix(),
        };
        self.write_record(&record).await
    }

    async fn write_record(&self, record: &MetaRecord) -> io::Result<()> {
        let final_path = self.path_for(&record.key);
        let tmp_path = self
            .dir
            .join(format!("{}.tmp-{}", record.key, uuid::Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tokio::fs::write(&tmp_path, &body).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    /// Bump `updated_at` on an existing record without touching its
    /// block hashes, used to mark a restored slot as freshly used. A
    /// missing record is not an error: the caller may be touching a key
    /// that was evicted from disk between lookup and touch.
    pub async fn touch(&self, key: &str) -> io::Result<()> {
        let path = self.path_for(key);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut record: MetaRecord = serde_json::from_slice(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        record.updated_at = now_unix();
        self.write_record(&record).await
    }

    /// Read a single record by key, if present.
    pub async fn get(&self, key: &str) -> io::Result<Option<MetaRecord>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(body) => serde_json::from_slice(&body)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load every record in the store, newest `updated_at` first.
    ///
    /// A file that fails to parse as a `MetaRecord` is skipped and logged
    /// rather than failing the whole scan: one corrupt snapshot record
    /// should not take every other cache entry down with it.
    pub async fn scan_all(&self) -> io::Result<Vec<MetaRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_meta_file(&path) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(body) => match serde_json::from_slice::<MetaRecord>(&body) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(file = %path.display(), error = %e, "skipping malformed metadata file"),
                },
                Err(e) => warn!(file = %path.display(), error = %e, "failed to read metadata file"),
            }
        }

        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }
}

fn is_meta_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(META_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        store
            .write("key1", "llama.cpp", 100, vec!["h1".into(), "h2".into()], 42)
            .await
            .unwrap();

        let record = store.get("key1").await.unwrap().unwrap();
        assert_eq!(record.model_id, "llama.cpp");
        assert_eq!(record.block_hashes, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_updates_timestamp_without_changing_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        store.write("key1", "llama.cpp", 100, vec!["h1".into()], 5).await.unwrap();
        let before = store.get("key1").await.unwrap().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        store.touch("key1").await.unwrap();
        let after = store.get("key1").await.unwrap().unwrap();

        assert_eq!(before.block_hashes, after.block_hashes);
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn touch_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        store.touch("missing").await.unwrap();
    }

    #[tokio::test]
    async fn scan_all_orders_newest_first_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path()).await.unwrap();
        store.write("older", "llama.cpp", 100, vec!["a".into()], 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        store.write("newer", "llama.cpp", 100, vec!["b".into()], 1).await.unwrap();

        tokio::fs::write(dir.path().join("garbage.meta.json"), b"not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("ignored.txt"), b"not a meta file")
            .await
            .unwrap();

        let records = store.scan_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "newer");
        assert_eq!(records[1].key, "older");
    }

    #[tokio::test]
    async fn scan_all_on_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let store = MetadataStore::open(&missing).await.unwrap();
        tokio::fs::remove_dir(&missing).await.unwrap();
        assert!(store.scan_all().await.unwrap().is_empty());
    }
}
