//! Identity reconciliation for a freshly opened folder.
//!
//! Every image gets a task: adopt the sidecar if there is one, otherwise
//! fingerprint the pixels, mint a record and write its sidecar. Either way
//! the result is queued for the metadata store. Tasks are independent; one
//! file failing leaves the others untouched and that file keeps its
//! placeholder identity.

pub mod collection;

use std::collections::HashSet;
use std::path::PathBuf;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scanner::hashing;
use crate::sidecar::{IdentityRecord, SidecarStore};
use crate::sync::SyncHandle;

pub use collection::{
    ApplyOutcome, EntryId, EntryPatch, Generation, IdentityState, ImageCollection, ImageEntry,
    PatchBatch, Resolution,
};

/// Work item for one file.
#[derive(Debug, Clone)]
pub struct FileJob {
    pub id: EntryId,
    pub path: PathBuf,
    pub directory: PathBuf,
    pub filename: String,
}

impl From<&ImageEntry> for FileJob {
    fn from(entry: &ImageEntry) -> Self {
        Self {
            id: entry.id,
            path: entry.path.clone(),
            directory: entry.directory.clone(),
            filename: entry.filename.clone(),
        }
    }
}

/// Counts for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub total: usize,
    pub adopted: usize,
    pub minted: usize,
    /// Minted without a fingerprint because the image would not decode.
    pub unhashed: usize,
    /// Minted but the sidecar could not be written.
    pub unpersisted: usize,
    pub failed: usize,
    pub applied: usize,
    pub stale: bool,
    pub duplicate_uuids: Vec<Uuid>,
}

impl ReconcileReport {
    pub fn from_batch(batch: &PatchBatch) -> Self {
        let mut report = Self {
            total: batch.patches.len(),
            ..Default::default()
        };
        for patch in &batch.patches {
            match &patch.resolution {
                Resolution::Adopted(_) => report.adopted += 1,
                Resolution::Minted {
                    hashed, persisted, ..
                } => {
                    report.minted += 1;
                    if !hashed {
                        report.unhashed += 1;
                    }
                    if !persisted {
                        report.unpersisted += 1;
                    }
                }
                Resolution::Failed(_) => report.failed += 1,
            }
        }
        report
    }
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    sidecars: SidecarStore,
    sync: SyncHandle,
}

impl Reconciler {
    pub fn new(sidecars: SidecarStore, sync: SyncHandle) -> Self {
        Self { sidecars, sync }
    }

    /// Resolve the identity of a single file.
    pub async fn reconcile_file(&self, job: &FileJob) -> Resolution {
        if let Some(record) = self.sidecars.read(&job.directory, &job.filename).await {
            debug!(file = %job.path.display(), uuid = %record.uuid, "Adopted sidecar identity");
            self.sync.enqueue(record.clone(), job.filename.clone());
            return Resolution::Adopted(record);
        }

        let bytes = match tokio::fs::read(&job.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %job.path.display(), error = %e, "Cannot read image, keeping placeholder");
                return Resolution::Failed(e.to_string());
            }
        };

        let hash = match tokio::task::spawn_blocking(move || hashing::compute_fingerprint(&bytes)).await {
            Ok(Ok(hash)) => Some(hash),
            Ok(Err(e)) => {
                warn!(file = %job.path.display(), error = %e, "Fingerprint unavailable");
                None
            }
            Err(e) => {
                warn!(file = %job.path.display(), error = %e, "Fingerprint task failed");
                None
            }
        };
        let hashed = hash.is_some();

        let record = IdentityRecord::new(hash);
        let persisted = match self.sidecars.write(&job.directory, &job.filename, &record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %job.path.display(), error = %e, "Sidecar not written, identity is session-only");
                false
            }
        };

        debug!(file = %job.path.display(), uuid = %record.uuid, hashed, persisted, "Minted identity");
        self.sync.enqueue(record.clone(), job.filename.clone());

        Resolution::Minted {
            record,
            hashed,
            persisted,
        }
    }

    /// Reconcile all `jobs` concurrently and collect one patch per job.
    pub async fn reconcile(&self, generation: Generation, jobs: Vec<FileJob>) -> PatchBatch {
        let mut pending: HashSet<EntryId> = jobs.iter().map(|j| j.id).collect();
        let mut tasks = JoinSet::new();

        for job in jobs {
            let this = self.clone();
            tasks.spawn(async move {
                let resolution = this.reconcile_file(&job).await;
                EntryPatch {
                    id: job.id,
                    resolution,
                }
            });
        }

        let mut patches = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(patch) => {
                    pending.remove(&patch.id);
                    patches.push(patch);
                }
                Err(e) => warn!(error = %e, "Reconciliation task aborted"),
            }
        }

        // Tasks that died still get a result so the entry leaves the
        // placeholder state.
        for id in pending {
            patches.push(EntryPatch {
                id,
                resolution: Resolution::Failed("reconciliation task aborted".to_string()),
            });
        }

        PatchBatch {
            generation,
            patches,
        }
    }

    /// Run a full pass over `collection`'s current entries and apply it.
    pub async fn reconcile_collection(&self, collection: &mut ImageCollection) -> ReconcileReport {
        let generation = collection.generation();
        let jobs: Vec<FileJob> = collection.entries().iter().map(FileJob::from).collect();
        info!(files = jobs.len(), generation = generation.0, "Reconciling folder");

        let batch = self.reconcile(generation, jobs).await;
        let mut report = ReconcileReport::from_batch(&batch);
        let outcome = collection.apply(batch);
        report.applied = outcome.applied;
        report.stale = outcome.stale;

        for (uuid, ids) in collection.duplicate_uuids() {
            warn!(%uuid, entries = ids.len(), "Several files share one identity");
            report.duplicate_uuids.push(uuid);
        }

        info!(
            adopted = report.adopted,
            minted = report.minted,
            failed = report.failed,
            "Reconciliation finished"
        );
        report
    }
}
