//! Poll-loop orchestrator.
//!
//! `MonitorManager` owns the registry of monitored instances and drives the
//! read → clean → segment → merge → publish chain with one independent
//! tokio task per instance. Loops share nothing mutable except the
//! [`ConversationStore`] and [`StreamingPublisher`], both safe for
//! concurrent use; each source's cursor is owned by exactly one loop.
//!
//! Per-source lifecycle: `Stopped -> Running -> Stopping -> Stopped`.
//! A stop request cancels the loop's token; the loop then performs one
//! final read/clean/segment pass, force-flushes any open message as
//! complete, and releases its resources. Errors inside a tick are logged
//! and treated as a skipped cycle — only an explicit stop request ends a
//! loop, and a fault in one instance never affects the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use agent_console_core::{
    CandidateMessage, ConversationRecord, EscapeFilter, MonitorEvent, SourceError,
    SpeakerSegmenter,
};

use crate::config::MonitorConfig;
use crate::publish::StreamingPublisher;
use crate::reader::MonitoredSource;
use crate::store::ConversationStore;

struct MonitorHandle {
    namespace: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Process-wide orchestrator. Construct once at startup and share the
/// returned handle; there is no ambient global registry.
pub struct MonitorManager {
    config: MonitorConfig,
    store: Arc<ConversationStore>,
    publisher: Arc<StreamingPublisher>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitorManager {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let store = Arc::new(ConversationStore::new(
            config.data_dir.clone(),
            config.max_records_per_instance,
            config.recent_history_capacity,
            config.dedup_epsilon,
        ));
        let publisher = Arc::new(StreamingPublisher::new(config.channel_capacity));
        Arc::new(Self {
            config,
            store,
            publisher,
            monitors: Mutex::new(HashMap::new()),
        })
    }

    /// The shared conversation store (history queries, namespace reloads).
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// The shared event publisher.
    pub fn publisher(&self) -> &Arc<StreamingPublisher> {
        &self.publisher
    }

    /// Subscribe to one instance's live events.
    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<MonitorEvent> {
        self.publisher.subscribe(instance_id)
    }

    /// Begin monitoring an instance. Idempotent: returns `false` without
    /// side effects when the instance is already monitored.
    pub async fn start_monitoring(&self, instance_id: &str, namespace: &str) -> bool {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(instance_id) {
            debug!(instance_id, "already monitoring; start request ignored");
            return false;
        }

        let source = MonitoredSource::new(
            instance_id,
            namespace,
            self.config.source_path(instance_id, namespace),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_poll_loop(
            source,
            self.config.poll_interval,
            self.store.clone(),
            self.publisher.clone(),
            cancel.clone(),
        ));

        monitors.insert(
            instance_id.to_string(),
            MonitorHandle {
                namespace: namespace.to_string(),
                cancel,
                task,
            },
        );
        info!(instance_id, namespace, "monitoring started");
        true
    }

    /// Stop monitoring an instance, waiting for its loop to flush and exit.
    /// Idempotent: returns `false` when the instance is not monitored.
    pub async fn stop_monitoring(&self, instance_id: &str) -> bool {
        // Remove the handle under the lock, but wait for the task outside
        // it so a slow shutdown cannot block other start/stop requests.
        let handle = self.monitors.lock().await.remove(instance_id);
        let Some(handle) = handle else {
            debug!(instance_id, "not monitored; stop request ignored");
            return false;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(instance_id, error = %e, "poll loop panicked during shutdown");
        }

        self.store.evict(instance_id).await;
        self.publisher.remove(instance_id);
        info!(instance_id, namespace = %handle.namespace, "monitoring stopped");
        true
    }

    /// Stop every monitored instance (process shutdown).
    pub async fn stop_all(&self) {
        let instance_ids: Vec<String> = {
            let monitors = self.monitors.lock().await;
            monitors.keys().cloned().collect()
        };
        for instance_id in instance_ids {
            self.stop_monitoring(&instance_id).await;
        }
    }

    /// Whether an instance is currently monitored.
    pub async fn is_monitoring(&self, instance_id: &str) -> bool {
        self.monitors.lock().await.contains_key(instance_id)
    }

    /// The currently monitored instance ids.
    pub async fn monitored_instances(&self) -> Vec<String> {
        let monitors = self.monitors.lock().await;
        let mut ids: Vec<String> = monitors.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// The per-instance poll loop. Runs until cancelled, then performs the
/// Stopping pass: one last read and a forced flush of the open message.
async fn run_poll_loop(
    mut source: MonitoredSource,
    poll_interval: std::time::Duration,
    store: Arc<ConversationStore>,
    publisher: Arc<StreamingPublisher>,
    cancel: CancellationToken,
) {
    let filter = EscapeFilter::new();
    let mut segmenter = SpeakerSegmenter::new();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = poll_once(&mut source, &filter, &mut segmenter, &store, &publisher).await {
                    // Transient source errors retry on the next tick.
                    debug!(instance_id = %source.instance_id(), error = %e, "poll cycle skipped");
                }
            }
        }
    }

    // Stopping: pick up whatever was appended since the last tick, then
    // flush the still-open message as complete.
    if let Err(e) = poll_once(&mut source, &filter, &mut segmenter, &store, &publisher).await {
        debug!(instance_id = %source.instance_id(), error = %e, "final poll cycle failed");
    }
    if let Some(open) = segmenter.flush() {
        deliver_complete(&source, open, &store, &publisher).await;
    }

    source.deactivate();
    debug!(instance_id = %source.instance_id(), "poll loop stopped");
}

/// One tick of the pipeline: read → clean → segment → merge/publish.
async fn poll_once(
    source: &mut MonitoredSource,
    filter: &EscapeFilter,
    segmenter: &mut SpeakerSegmenter,
    store: &ConversationStore,
    publisher: &StreamingPublisher,
) -> Result<(), SourceError> {
    let chunk = source.read_new().await?;
    if chunk.is_empty() {
        source.commit(chunk.next_cursor);
        return Ok(());
    }

    let now = Utc::now();
    let cleaned = filter.clean_lines(chunk.lines.iter().map(String::as_str));
    let finalized = segmenter.feed(&cleaned, now);

    // The cursor moves only after the chunk went through filter and
    // segmenter; a crash in between re-reads the chunk and the store's
    // dedup absorbs the re-delivery.
    source.commit(chunk.next_cursor);

    for message in finalized {
        deliver_complete(source, message, store, publisher).await;
    }

    if let Some(open) = segmenter.open_message() {
        publisher.publish_fragment(
            source.instance_id(),
            filter.scrub_prompt_glyphs(&open.content),
            open.timestamp,
        );
    }

    Ok(())
}

/// Merge a finalized message and, when accepted, broadcast it.
async fn deliver_complete(
    source: &MonitoredSource,
    message: CandidateMessage,
    store: &ConversationStore,
    publisher: &StreamingPublisher,
) {
    let record =
        ConversationRecord::from_candidate(source.instance_id(), source.namespace(), &message);
    if store.merge(record.clone()).await {
        publisher.publish_complete(&record);
    } else {
        debug!(
            instance_id = %source.instance_id(),
            "duplicate message suppressed after merge"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config(base: &Path) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(20),
            log_dir: base.join("logs"),
            data_dir: base.join("data"),
            max_records_per_instance: 50,
            recent_history_capacity: 50,
            dedup_epsilon: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }

    fn append(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        write!(f, "{text}").unwrap();
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = tempdir().unwrap();
        let manager = MonitorManager::new(test_config(dir.path()));

        assert!(manager.start_monitoring("web-1", "default").await);
        assert!(!manager.start_monitoring("web-1", "default").await);
        assert!(manager.is_monitoring("web-1").await);

        assert!(manager.stop_monitoring("web-1").await);
        assert!(!manager.stop_monitoring("web-1").await);
        assert!(!manager.is_monitoring("web-1").await);
    }

    #[tokio::test]
    async fn missing_transcript_is_tolerated_until_it_appears() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = MonitorManager::new(config.clone());
        let mut rx = manager.subscribe("web-1");

        // No transcript exists yet; the loop just idles.
        manager.start_monitoring("web-1", "default").await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        append(
            &config.source_path("web-1", "default"),
            "!> are you there\nyes, fully operational\n",
        );

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        match event {
            MonitorEvent::Complete { content, .. } => assert_eq!(content, "are you there"),
            other => panic!("expected the user turn first, got {other:?}"),
        }

        manager.stop_monitoring("web-1").await;
    }

    #[tokio::test]
    async fn stopping_one_instance_leaves_others_running() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let manager = MonitorManager::new(config.clone());

        manager.start_monitoring("web-1", "default").await;
        manager.start_monitoring("web-2", "default").await;
        manager.stop_monitoring("web-1").await;

        assert!(!manager.is_monitoring("web-1").await);
        assert!(manager.is_monitoring("web-2").await);

        // The survivor still delivers events.
        let mut rx = manager.subscribe("web-2");
        append(
            &config.source_path("web-2", "default"),
            "!> ping check\npong from the survivor\n",
        );
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("surviving loop stopped delivering")
            .unwrap();
        assert_eq!(event.instance_id(), "web-2");

        manager.stop_all().await;
        assert!(manager.monitored_instances().await.is_empty());
    }

    #[tokio::test]
    async fn monitored_instances_lists_sorted_ids() {
        let dir = tempdir().unwrap();
        let manager = MonitorManager::new(test_config(dir.path()));

        manager.start_monitoring("zeta", "default").await;
        manager.start_monitoring("alpha", "default").await;
        assert_eq!(manager.monitored_instances().await, vec!["alpha", "zeta"]);

        manager.stop_all().await;
    }
}
