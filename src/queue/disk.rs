//! Disk-backed overflow medium.
//!
//! Each datum lives in a heap tier (the in-memory inbox) and a disk tier
//! (one JSON file per datum key). Files are written to a temporary name and
//! renamed into place, and are reloaded by [`DiskQueue::open`], so overflowed
//! datum survive a process restart without a remote queue.
//!
//! Re-sending a datum with the same key replaces the previous entry. Writes
//! and deletes for one key are serialized through a [`KeyLockPool`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::inbox::{self, Inbox};
use super::lock_pool::KeyLockPool;
use super::{DurableQueue, QueueAttributes, QueueError, QueueMessage, Receipt};
use crate::datum::Datum;

/// Number of idle per-key locks kept by the pool.
const LOCK_POOL_SIZE: usize = 64;

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

/// Local durable queue spooling message bodies to a directory.
pub struct DiskQueue {
    dir: PathBuf,
    inbox: Inbox,
    locks: Arc<KeyLockPool>,
}

impl DiskQueue {
    /// Open (or create) a spool directory and load any entries left from a
    /// previous run.
    pub async fn open(dir: impl Into<PathBuf>, visibility: Duration) -> Result<Self, QueueError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let queue = Self {
            dir,
            inbox: Inbox::new(visibility),
            locks: KeyLockPool::new(LOCK_POOL_SIZE),
        };
        let loaded = queue.load().await?;

        info!(
            dir = %queue.dir.display(),
            entries = loaded,
            "Disk queue opened"
        );
        Ok(queue)
    }

    async fn load(&self) -> Result<usize, QueueError> {
        let mut loaded = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(TEMP_EXTENSION) {
                debug!(path = %path.display(), "Removing incomplete spool file");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to remove spool file");
                }
                continue;
            }

            let Some(id) = name.strip_suffix(&format!(".{}", ENTRY_EXTENSION)) else {
                continue;
            };

            let body = tokio::fs::read(&path).await?;
            self.inbox.push(id.to_string(), body);
            loaded += 1;
        }

        Ok(loaded)
    }

    /// Spool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, ENTRY_EXTENSION))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, TEMP_EXTENSION))
    }

    /// Entry id: the datum key's storage id, or a random id for bodies that
    /// are not datum.
    fn entry_id(body: &[u8]) -> String {
        match Datum::from_json(body) {
            Ok(datum) => datum.key().storage_id().to_string(),
            Err(_) => Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl DurableQueue for DiskQueue {
    async fn send(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let id = Self::entry_id(&body);
        let _lock = self.locks.lock(&id).await;

        let temp = self.temp_path(&id);
        tokio::fs::write(&temp, &body).await?;
        tokio::fs::rename(&temp, self.entry_path(&id)).await?;

        self.inbox.push(id, body);
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        Ok(self.inbox.receive(max_messages, wait).await)
    }

    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let (id, generation) = inbox::parse_receipt(receipt)?;
        let _lock = self.locks.lock(&id).await;

        if self.inbox.remove(&id, generation) {
            match tokio::fs::remove_file(self.entry_path(&id)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            debug!(%receipt, "Ignoring delete with stale receipt");
        }
        Ok(())
    }

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        Ok(self.inbox.attributes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{ObjectDatum, ObjectKind};
    use chrono::{TimeZone, Utc};

    fn datum(watts: f64) -> Datum {
        ObjectDatum::new(
            ObjectKind::Node,
            1,
            "/inverter/1",
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
        .with_instantaneous("watts", watts)
        .into()
    }

    fn spool_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == ENTRY_EXTENSION)
            })
            .count()
    }

    #[tokio::test]
    async fn test_send_writes_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();

        queue.send(datum(1.0).to_json().unwrap()).await.unwrap();

        assert_eq!(spool_files(dir.path()), 1);
        assert_eq!(queue.attributes().await.unwrap().approximate_depth, 1);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = DiskQueue::open(dir.path(), Duration::from_secs(30))
                .await
                .unwrap();
            queue.send(datum(1.0).to_json().unwrap()).await.unwrap();
            queue.send(b"{\"opaque\":true}".to_vec()).await.unwrap();
        }

        let reopened = DiskQueue::open(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();
        let messages = reopened.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 2);

        let decoded: Vec<_> = messages
            .iter()
            .filter_map(|m| Datum::from_json(&m.body).ok())
            .collect();
        assert_eq!(decoded, vec![datum(1.0)]);
    }

    #[tokio::test]
    async fn test_same_key_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();

        queue.send(datum(1.0).to_json().unwrap()).await.unwrap();
        queue.send(datum(2.0).to_json().unwrap()).await.unwrap();

        assert_eq!(spool_files(dir.path()), 1);
        let messages = queue.receive(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(Datum::from_json(&messages[0].body).unwrap(), datum(2.0));
    }

    #[tokio::test]
    async fn test_delete_removes_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();
        queue.send(datum(1.0).to_json().unwrap()).await.unwrap();

        let messages = queue.receive(1, Duration::from_millis(10)).await.unwrap();
        queue.delete(&messages[0].receipt).await.unwrap();

        assert_eq!(spool_files(dir.path()), 0);
        assert_eq!(
            queue.attributes().await.unwrap(),
            QueueAttributes::default()
        );
    }

    #[tokio::test]
    async fn test_superseded_delete_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DiskQueue::open(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();
        queue.send(datum(1.0).to_json().unwrap()).await.unwrap();

        let messages = queue.receive(1, Duration::from_millis(10)).await.unwrap();
        queue.send(datum(3.0).to_json().unwrap()).await.unwrap();
        queue.delete(&messages[0].receipt).await.unwrap();

        assert_eq!(spool_files(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_open_discards_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("partial.json.tmp"), b"{").unwrap();

        let queue = DiskQueue::open(dir.path(), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(!dir.path().join("partial.json.tmp").exists());
        assert_eq!(queue.attributes().await.unwrap().approximate_depth, 0);
    }
}
