//! Deduplicating conversation store.
//!
//! Two retention tiers:
//! - A per-`(instance, namespace)` persisted log: one JSON document holding
//!   the instance's records in append order, FIFO-capped, rewritten
//!   atomically (tmp + rename) on each accepted merge.
//! - A cross-instance in-memory ring of recent records for fast UI refresh,
//!   rebuildable from persistence on namespace switch.
//!
//! Merge is idempotent under at-least-once delivery: a candidate matching an
//! existing record's sender and content within a small timestamp window is
//! rejected, which absorbs re-reads after truncation recovery or a crash
//! between read and cursor commit.
//!
//! Durability is best-effort: a failed disk write is logged and the
//! in-memory history still advances, so the operator-facing console keeps
//! working while storage is unavailable.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use agent_console_core::{ConversationRecord, StoreError};

/// How many trailing records are scanned for duplicates on merge. Re-reads
/// only ever replay the tail of the log, so a bounded window is enough.
const DEDUP_WINDOW: usize = 64;

struct InstanceLog {
    namespace: String,
    records: VecDeque<ConversationRecord>,
    /// Bumped on every accepted merge; pairs with `file_gate` so concurrent
    /// writers never persist a stale snapshot over a newer one.
    generation: u64,
    /// Holds the last persisted generation. Lock order: always after the
    /// store's own lock is released.
    file_gate: Arc<Mutex<u64>>,
}

struct StoreInner {
    /// instance_id -> in-memory mirror of the persisted log.
    logs: HashMap<String, InstanceLog>,
    /// Cross-instance recent-history ring.
    recent: VecDeque<ConversationRecord>,
}

/// Shared, concurrency-safe conversation store.
pub struct ConversationStore {
    data_dir: PathBuf,
    max_records: usize,
    recent_capacity: usize,
    dedup_epsilon: chrono::Duration,
    inner: RwLock<StoreInner>,
}

impl ConversationStore {
    pub fn new(
        data_dir: PathBuf,
        max_records: usize,
        recent_capacity: usize,
        dedup_epsilon: std::time::Duration,
    ) -> Self {
        Self {
            data_dir,
            max_records,
            recent_capacity,
            dedup_epsilon: chrono::Duration::from_std(dedup_epsilon)
                .unwrap_or_else(|_| chrono::Duration::seconds(1)),
            inner: RwLock::new(StoreInner {
                logs: HashMap::new(),
                recent: VecDeque::new(),
            }),
        }
    }

    /// The persisted document path for one instance.
    pub fn log_path(&self, namespace: &str, instance_id: &str) -> PathBuf {
        self.data_dir
            .join(namespace)
            .join(format!("{instance_id}.json"))
    }

    /// Merge a finalized candidate into the store.
    ///
    /// Returns `false` when the candidate is a duplicate of an existing
    /// record (same sender and content, timestamps within the epsilon).
    /// Persistence failures do not fail the merge.
    pub async fn merge(&self, record: ConversationRecord) -> bool {
        self.ensure_loaded(&record.namespace, &record.instance_id)
            .await;

        let path = self.log_path(&record.namespace, &record.instance_id);

        // Stage the update under the store lock; the disk write happens
        // after release so slow storage on one instance cannot stall the
        // others.
        let staged = {
            let mut inner = self.inner.write().await;
            // Entry, not get: a concurrent evict between ensure_loaded and
            // this lock would otherwise drop the merge.
            let log = inner
                .logs
                .entry(record.instance_id.clone())
                .or_insert_with(|| InstanceLog {
                    namespace: record.namespace.clone(),
                    generation: 0,
                    file_gate: Arc::new(Mutex::new(0)),
                    records: VecDeque::new(),
                });

            let is_duplicate = log.records.iter().rev().take(DEDUP_WINDOW).any(|existing| {
                existing.sender == record.sender
                    && existing.message == record.message
                    && (existing.timestamp - record.timestamp).abs() <= self.dedup_epsilon
            });
            if is_duplicate {
                debug!(
                    instance_id = %record.instance_id,
                    "duplicate candidate rejected by merge"
                );
                return false;
            }

            log.records.push_back(record.clone());
            while log.records.len() > self.max_records {
                log.records.pop_front();
            }
            log.generation += 1;

            let snapshot: Vec<ConversationRecord> = log.records.iter().cloned().collect();
            let generation = log.generation;
            let gate = log.file_gate.clone();

            inner.recent.push_back(record);
            while inner.recent.len() > self.recent_capacity {
                inner.recent.pop_front();
            }

            (snapshot, generation, gate)
        };

        let (snapshot, generation, gate) = staged;
        let mut persisted = gate.lock().await;
        if generation > *persisted {
            match write_document(&path, &snapshot).await {
                Ok(()) => *persisted = generation,
                Err(e) => warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to persist conversation log; in-memory history still updated"
                ),
            }
        }

        true
    }

    /// The most recent `limit` records across all instances, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<ConversationRecord> {
        let inner = self.inner.read().await;
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    /// The full persisted history of one instance, in append order.
    pub async fn instance_history(
        &self,
        namespace: &str,
        instance_id: &str,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        {
            let inner = self.inner.read().await;
            if let Some(log) = inner.logs.get(instance_id) {
                return Ok(log.records.iter().cloned().collect());
            }
        }
        match read_document(&self.log_path(namespace, instance_id)).await {
            Ok(records) => Ok(records),
            Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// All persisted records of one namespace, ordered by timestamp,
    /// truncated to the most recent `limit`.
    pub async fn namespace_history(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let dir = self.data_dir.join(namespace);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut all = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_document(&path).await {
                Ok(mut records) => all.append(&mut records),
                // One corrupt document must not hide the rest of the
                // namespace's history.
                Err(e) => warn!(error = %e, path = %path.display(), "skipping unreadable conversation log"),
            }
        }

        all.sort_by_key(|r| r.timestamp);
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    /// Rebuild the recent-history ring from one namespace's persisted logs
    /// (used when the console switches namespaces). Returns the number of
    /// records loaded.
    pub async fn reload_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let records = self
            .namespace_history(namespace, self.recent_capacity)
            .await?;
        let count = records.len();
        let mut inner = self.inner.write().await;
        inner.recent = records.into();
        Ok(count)
    }

    /// Drop an instance's in-memory mirror. The persisted document remains;
    /// a later merge reloads it.
    pub async fn evict(&self, instance_id: &str) {
        let mut inner = self.inner.write().await;
        inner.logs.remove(instance_id);
    }

    /// Load the persisted log for an instance into memory if absent, so
    /// dedup works against history from before a restart.
    async fn ensure_loaded(&self, namespace: &str, instance_id: &str) {
        {
            let inner = self.inner.read().await;
            if inner.logs.contains_key(instance_id) {
                return;
            }
        }

        let path = self.log_path(namespace, instance_id);
        let records = match read_document(&path).await {
            Ok(records) => records,
            Err(StoreError::NotFound { .. }) => Vec::new(),
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "could not load existing conversation log; starting fresh"
                );
                Vec::new()
            }
        };

        let mut inner = self.inner.write().await;
        inner
            .logs
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceLog {
                namespace: namespace.to_string(),
                generation: 0,
                file_gate: Arc::new(Mutex::new(0)),
                records: records.into(),
            });
    }
}

async fn read_document(path: &Path) -> Result<Vec<ConversationRecord>, StoreError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::MalformedJson {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Rewrite the document atomically: serialize, write to a sibling temp file,
/// rename over the target.
async fn write_document(path: &Path, records: &[ConversationRecord]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(records).map_err(|e| StoreError::MalformedJson {
        path: path.to_path_buf(),
        source: e,
    })?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_console_core::SpeakerKind;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_780_000_000 + secs, 0).unwrap()
    }

    fn record(instance: &str, message: &str, at: DateTime<Utc>) -> ConversationRecord {
        ConversationRecord {
            instance_id: instance.into(),
            namespace: "default".into(),
            sender: SpeakerKind::Assistant,
            message: message.into(),
            timestamp: at,
        }
    }

    fn store(dir: &Path) -> ConversationStore {
        ConversationStore::new(
            dir.to_path_buf(),
            5,
            10,
            std::time::Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn merge_accepts_then_rejects_the_same_message() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.merge(record("web-1", "hello", ts(0))).await);
        // Redelivered 300ms later (overlapping poll window) — duplicate.
        assert!(
            !store
                .merge(record("web-1", "hello", ts(0) + chrono::Duration::milliseconds(300)))
                .await
        );

        let history = store.instance_history("default", "web-1").await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn same_text_outside_epsilon_is_a_new_message() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.merge(record("web-1", "ok", ts(0))).await);
        assert!(store.merge(record("web-1", "ok", ts(30))).await);

        let history = store.instance_history("default", "web-1").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_check_is_per_instance() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.merge(record("web-1", "hello", ts(0))).await);
        assert!(store.merge(record("web-2", "hello", ts(0))).await);
    }

    #[tokio::test]
    async fn persisted_log_is_fifo_capped() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()); // cap = 5

        for i in 0..8 {
            assert!(store.merge(record("web-1", &format!("msg {i}"), ts(i * 10))).await);
        }

        let history = store.instance_history("default", "web-1").await.unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].message, "msg 3");
        assert_eq!(history[4].message, "msg 7");
    }

    #[tokio::test]
    async fn round_trip_preserves_order_across_store_instances() {
        let dir = tempdir().unwrap();
        {
            let store = store(dir.path());
            for i in 0..4 {
                store.merge(record("web-1", &format!("msg {i}"), ts(i))).await;
            }
        }

        // Fresh store, same data dir — as after a restart.
        let reopened = store(dir.path());
        let history = reopened.instance_history("default", "web-1").await.unwrap();
        let messages: Vec<&str> = history.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["msg 0", "msg 1", "msg 2", "msg 3"]);
    }

    #[tokio::test]
    async fn dedup_survives_restart_via_lazy_load() {
        let dir = tempdir().unwrap();
        {
            let store = store(dir.path());
            store.merge(record("web-1", "before restart", ts(0))).await;
        }

        let reopened = store(dir.path());
        assert!(!reopened.merge(record("web-1", "before restart", ts(0))).await);
    }

    #[tokio::test]
    async fn recent_ring_is_capped_and_chronological() {
        let dir = tempdir().unwrap();
        let store = store(dir.path()); // recent capacity = 10

        for i in 0..15 {
            store.merge(record("web-1", &format!("msg {i}"), ts(i * 10))).await;
        }

        let recent = store.recent(100).await;
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].message, "msg 5");

        let last_three = store.recent(3).await;
        let messages: Vec<&str> = last_three.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["msg 12", "msg 13", "msg 14"]);
    }

    #[tokio::test]
    async fn namespace_history_merges_instances_by_timestamp() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.merge(record("web-1", "first", ts(0))).await;
        store.merge(record("web-2", "second", ts(10))).await;
        store.merge(record("web-1", "third", ts(20))).await;

        let history = store.namespace_history("default", 100).await.unwrap();
        let messages: Vec<&str> = history.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);

        let capped = store.namespace_history("default", 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].message, "second");
    }

    #[tokio::test]
    async fn reload_namespace_rebuilds_the_recent_ring() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.merge(record("web-1", "kept message", ts(0))).await;
        store.merge(record("web-2", "also kept", ts(5))).await;

        // Clobber the ring, then rebuild from persistence.
        store.reload_namespace("empty-ns").await.unwrap();
        assert!(store.recent(100).await.is_empty());

        let loaded = store.reload_namespace("default").await.unwrap();
        assert_eq!(loaded, 2);
        let recent = store.recent(100).await;
        assert_eq!(recent[0].message, "kept message");
        assert_eq!(recent[1].message, "also kept");
    }

    #[tokio::test]
    async fn persistence_failure_keeps_the_in_memory_path_working() {
        let dir = tempdir().unwrap();
        // Make the namespace directory an unwritable location by shadowing
        // it with a plain file.
        let blocker = dir.path().join("default");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = store(dir.path());
        assert!(store.merge(record("web-1", "still live", ts(0))).await);

        // Disk write failed, but history and dedup still work.
        assert_eq!(store.recent(10).await.len(), 1);
        assert!(!store.merge(record("web-1", "still live", ts(0))).await);
    }

    #[tokio::test]
    async fn corrupt_document_is_skipped_in_namespace_history() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.merge(record("web-1", "good record", ts(0))).await;

        std::fs::write(dir.path().join("default").join("broken.json"), b"{ not json").unwrap();

        let history = store.namespace_history("default", 100).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "good record");
    }

    #[tokio::test]
    async fn evict_drops_memory_but_not_disk() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.merge(record("web-1", "durable", ts(0))).await;

        store.evict("web-1").await;

        let history = store.instance_history("default", "web-1").await.unwrap();
        assert_eq!(history.len(), 1);
        // And dedup still sees it after the lazy reload.
        assert!(!store.merge(record("web-1", "durable", ts(0))).await);
    }

    #[tokio::test]
    async fn persisted_document_is_valid_json_array() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.merge(record("web-1", "hello", ts(0))).await;

        let raw = std::fs::read(store.log_path("default", "web-1")).unwrap();
        let parsed: Vec<ConversationRecord> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].message, "hello");
        assert_eq!(parsed[0].namespace, "default");
    }
}
