//! Per-entity append-only record logs.
//!
//! Records are stored as newline-delimited JSON, one tagged record per line.
//! Scanning re-reads the whole store and parses every line on its own, so a
//! corrupt or truncated line costs only that record.

use crate::record::{
    ChannelRecord, DirectMessageRecord, Entity, LoginRecord, PublicationRecord, Tagged,
};
use crate::store::{FileStore, LogStore, MemoryStore, StoreError};
use bytes::Bytes;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Record separator.
const SEPARATOR: u8 = b'\n';

/// File names of the four logs inside the data directory.
pub const LOGINS_FILE: &str = "logins.ndjson";
pub const CHANNELS_FILE: &str = "channels.ndjson";
pub const PUBLICATIONS_FILE: &str = "publications.ndjson";
pub const DIRECT_MESSAGES_FILE: &str = "direct_messages.ndjson";

/// An append-only log of one entity type.
pub struct RecordLog<R> {
    store: Arc<dyn LogStore>,
    _entity: PhantomData<fn() -> R>,
}

impl<R: Entity> RecordLog<R> {
    /// Create a log over a byte store.
    #[must_use]
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    /// Create a log backed by memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Append a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written.
    pub async fn append(&self, record: &R) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&Tagged::new(record))?;
        line.push(SEPARATOR);
        self.store.append(&line).await
    }

    /// Read every record appended so far.
    ///
    /// Lines that fail to parse are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    pub async fn scan_all(&self) -> Result<Scan<R>, StoreError> {
        let contents = self.store.read_all().await?;
        Ok(Scan::new(contents))
    }
}

/// Lazy iterator over the records of a log snapshot.
pub struct Scan<R> {
    contents: Bytes,
    position: usize,
    _entity: PhantomData<fn() -> R>,
}

impl<R> Scan<R> {
    fn new(contents: Bytes) -> Self {
        Self {
            contents,
            position: 0,
            _entity: PhantomData,
        }
    }
}

impl<R: Entity> Iterator for Scan<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        while self.position < self.contents.len() {
            let rest = &self.contents[self.position..];
            let end = rest
                .iter()
                .position(|&b| b == SEPARATOR)
                .unwrap_or(rest.len());
            let line = &rest[..end];
            self.position += end + 1;

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<R>(line) {
                Ok(record) => return Some(record),
                Err(e) => debug!(kind = R::KIND, error = %e, "Skipping unreadable log line"),
            }
        }

        None
    }
}

/// The four record logs owned by a dispatcher.
pub struct Logs {
    pub logins: RecordLog<LoginRecord>,
    pub channels: RecordLog<ChannelRecord>,
    pub publications: RecordLog<PublicationRecord>,
    pub direct_messages: RecordLog<DirectMessageRecord>,
}

impl Logs {
    /// Open file-backed logs inside a data directory, creating the directory
    /// and any missing log files.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a log file cannot be created.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref();

        let logs = Self {
            logins: RecordLog::new(Arc::new(FileStore::open(dir.join(LOGINS_FILE)).await?)),
            channels: RecordLog::new(Arc::new(FileStore::open(dir.join(CHANNELS_FILE)).await?)),
            publications: RecordLog::new(Arc::new(
                FileStore::open(dir.join(PUBLICATIONS_FILE)).await?,
            )),
            direct_messages: RecordLog::new(Arc::new(
                FileStore::open(dir.join(DIRECT_MESSAGES_FILE)).await?,
            )),
        };

        info!(data_dir = %dir.display(), "Opened record logs");
        Ok(logs)
    }

    /// Create memory-backed logs.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            logins: RecordLog::in_memory(),
            channels: RecordLog::in_memory(),
            publications: RecordLog::in_memory(),
            direct_messages: RecordLog::in_memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(user: &str, timestamp: i64) -> LoginRecord {
        LoginRecord {
            user: user.into(),
            timestamp,
            clock: None,
        }
    }

    #[tokio::test]
    async fn test_append_then_scan() {
        let log = RecordLog::<LoginRecord>::in_memory();
        log.append(&login("alice", 1)).await.unwrap();
        log.append(&login("bob", 2)).await.unwrap();

        let records: Vec<_> = log.scan_all().await.unwrap().collect();
        assert_eq!(records, vec![login("alice", 1), login("bob", 2)]);
    }

    #[tokio::test]
    async fn test_scan_is_restartable() {
        let log = RecordLog::<LoginRecord>::in_memory();
        log.append(&login("alice", 1)).await.unwrap();

        assert_eq!(log.scan_all().await.unwrap().count(), 1);
        log.append(&login("alice", 2)).await.unwrap();
        assert_eq!(log.scan_all().await.unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_scan_skips_bad_lines() {
        let store = Arc::new(MemoryStore::new());
        store
            .append(b"{\"user\":\"alice\",\"timestamp\":1}\nnot json\n\n{\"user\":\"bob\"}\n{\"user\":\"carol\",\"timestamp\":3}")
            .await
            .unwrap();

        let log = RecordLog::<LoginRecord>::new(store);
        let users: Vec<_> = log.scan_all().await.unwrap().map(|r| r.user).collect();
        assert_eq!(users, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_open_creates_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");

        let logs = Logs::open(&data_dir).await.unwrap();
        for file in [LOGINS_FILE, CHANNELS_FILE, PUBLICATIONS_FILE, DIRECT_MESSAGES_FILE] {
            assert!(data_dir.join(file).exists(), "{file} should exist");
        }

        logs.logins.append(&login("alice", 1)).await.unwrap();
        let contents = std::fs::read_to_string(data_dir.join(LOGINS_FILE)).unwrap();
        assert_eq!(contents, "{\"type\":\"login\",\"user\":\"alice\",\"timestamp\":1}\n");
    }
}
