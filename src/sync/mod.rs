//! Best-effort push of identity records to the metadata store.
//!
//! Callers hand records to a [`SyncHandle`] and move on. A single worker
//! task drains the queue, runs each upsert on the blocking pool under a
//! timeout, and logs failures. Nothing here ever reports an error back to
//! the caller; the next reconciliation pass pushes the record again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::db::{MetadataStore, RemoteSyncError, UpsertAction, UpsertOutcome};
use crate::sidecar::IdentityRecord;

/// One record waiting to be pushed.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub record: IdentityRecord,
    pub filename: String,
}

/// Totals reported by the worker when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub inserted: usize,
    pub patched: usize,
    pub upgraded: usize,
    /// Pushes skipped because the store already held a newer version.
    pub stale: usize,
    pub failed: usize,
}

impl SyncStats {
    pub fn succeeded(&self) -> usize {
        self.inserted + self.patched + self.upgraded
    }

    fn record(&mut self, action: UpsertAction) {
        match action {
            UpsertAction::Inserted => self.inserted += 1,
            UpsertAction::Patched => self.patched += 1,
            UpsertAction::Upgraded => self.upgraded += 1,
            UpsertAction::Stale => self.stale += 1,
        }
    }
}

/// Cheap cloneable sender side of the queue.
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    tx: Option<mpsc::UnboundedSender<SyncJob>>,
}

impl SyncHandle {
    /// Queue `record` for upsert. Never blocks, never fails.
    pub fn enqueue(&self, record: IdentityRecord, filename: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let job = SyncJob {
            record,
            filename: filename.into(),
        };
        if let Err(e) = tx.send(job) {
            let uuid = e.0.record.uuid;
            let error = RemoteSyncError::WorkerUnavailable;
            warn!(%uuid, %error, "Dropping metadata sync job");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }
}

/// Owner of the sync worker.
pub struct SyncQueue {
    handle: SyncHandle,
    worker: Option<JoinHandle<SyncStats>>,
}

impl SyncQueue {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn MetadataStore>, owner: impl Into<String>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(store, owner.into(), timeout, rx));
        Self {
            handle: SyncHandle { tx: Some(tx) },
            worker: Some(worker),
        }
    }

    /// A queue that silently discards everything, for offline use.
    pub fn disabled() -> Self {
        Self {
            handle: SyncHandle::default(),
            worker: None,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Close the queue and wait for already queued jobs to finish.
    ///
    /// Handles cloned from this queue keep the channel open; drop them
    /// first or this waits for them.
    pub async fn shutdown(self) -> SyncStats {
        drop(self.handle);
        match self.worker {
            Some(worker) => match worker.await {
                Ok(stats) => stats,
                Err(e) => {
                    let error = RemoteSyncError::Join(e);
                    warn!(%error, "Sync worker ended abnormally");
                    SyncStats::default()
                }
            },
            None => SyncStats::default(),
        }
    }
}

async fn run_worker(
    store: Arc<dyn MetadataStore>,
    owner: String,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<SyncJob>,
) -> SyncStats {
    let mut stats = SyncStats::default();

    while let Some(job) = rx.recv().await {
        let uuid = job.record.uuid;
        let filename = job.filename.clone();
        match push(&store, &owner, timeout, job).await {
            Ok(outcome) => {
                debug!(%uuid, %filename, action = ?outcome.action, "Synced identity record");
                stats.record(outcome.action);
            }
            Err(e) => {
                warn!(%uuid, %filename, error = %e, "Metadata sync failed");
                stats.failed += 1;
            }
        }
    }

    debug!(?stats, "Sync worker finished");
    stats
}

async fn push(
    store: &Arc<dyn MetadataStore>,
    owner: &str,
    timeout: Duration,
    job: SyncJob,
) -> Result<UpsertOutcome, RemoteSyncError> {
    let store = Arc::clone(store);
    let owner = owner.to_string();
    let task =
        tokio::task::spawn_blocking(move || store.upsert(&job.record, &job.filename, &owner));

    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined?,
        Err(_) => Err(RemoteSyncError::Timeout(timeout)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{
        BulkUpsertSummary, MetadataRow, MetadataValue, RemoteId, RemoteImageRecord, SqliteStore,
    };
    use uuid::Uuid;

    /// Store whose every call fails, optionally after a delay.
    pub(crate) struct BrokenStore {
        pub delay: Option<Duration>,
    }

    impl MetadataStore for BrokenStore {
        fn upsert(
            &self,
            _record: &IdentityRecord,
            _filename: &str,
            _owner: &str,
        ) -> Result<UpsertOutcome, RemoteSyncError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Err(RemoteSyncError::Corrupt("store offline".to_string()))
        }

        fn bulk_upsert_metadata_fields(
            &self,
            _rows: &[MetadataRow],
            _owner: &str,
        ) -> Result<BulkUpsertSummary, RemoteSyncError> {
            Err(RemoteSyncError::Corrupt("store offline".to_string()))
        }

        fn get_by_uuid(&self, _uuid: &Uuid) -> Result<Option<RemoteImageRecord>, RemoteSyncError> {
            Ok(None)
        }

        fn find_by_filename(
            &self,
            _filename: &str,
            _owner: &str,
        ) -> Result<Vec<RemoteImageRecord>, RemoteSyncError> {
            Ok(Vec::new())
        }

        fn metadata_values(
            &self,
            _image_id: RemoteId,
        ) -> Result<Vec<(String, MetadataValue)>, RemoteSyncError> {
            Ok(Vec::new())
        }

        fn list_images(&self, _owner: &str) -> Result<Vec<RemoteImageRecord>, RemoteSyncError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_jobs_are_pushed_in_order() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = SyncQueue::spawn(store.clone(), "alice", Duration::from_secs(5));
        let handle = queue.handle();

        let record = IdentityRecord::new(None);
        handle.enqueue(record.clone(), "a.png");
        let mut edited = record.clone();
        edited.caption = "edited".to_string();
        handle.enqueue(edited, "a.png");
        drop(handle);

        let stats = queue.shutdown().await;
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.patched, 1);
        assert_eq!(stats.failed, 0);

        let stored = store.get_by_uuid(&record.uuid).unwrap().unwrap();
        assert_eq!(stored.caption, "edited");
    }

    #[tokio::test]
    async fn test_late_older_push_is_stale() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let queue = SyncQueue::spawn(store.clone(), "alice", Duration::from_secs(5));
        let handle = queue.handle();

        let record = IdentityRecord::new(None);
        let edited = crate::sidecar::update(&record, &crate::sidecar::RecordPatch::caption("new"));
        handle.enqueue(edited, "a.png");
        handle.enqueue(record.clone(), "a.png");
        drop(handle);

        let stats = queue.shutdown().await;
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(store.get_by_uuid(&record.uuid).unwrap().unwrap().caption, "new");
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        let store = BrokenStore { delay: None };
        let queue = SyncQueue::spawn(Arc::new(store), "alice", Duration::from_secs(5));
        queue.handle().enqueue(IdentityRecord::new(None), "a.png");

        let stats = queue.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded(), 0);
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let store = BrokenStore {
            delay: Some(Duration::from_millis(300)),
        };
        let queue = SyncQueue::spawn(Arc::new(store), "alice", Duration::from_millis(20));
        queue.handle().enqueue(IdentityRecord::new(None), "a.png");

        let stats = queue.shutdown().await;
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_disabled_queue_discards() {
        let queue = SyncQueue::disabled();
        let handle = queue.handle();
        assert!(!handle.is_enabled());
        handle.enqueue(IdentityRecord::new(None), "a.png");
        assert_eq!(queue.shutdown().await, SyncStats::default());
    }
}
