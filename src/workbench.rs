//! Session state for one open folder: the image list, pending edits and the
//! background sync queue.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{BulkUpsertSummary, MetadataStore, SqliteStore};
use crate::export::{self, ExportFormat};
use crate::import;
use crate::reconcile::{
    ApplyOutcome, EntryId, FileJob, Generation, IdentityState, ImageCollection, ImageEntry,
    PatchBatch, ReconcileReport, Reconciler,
};
use crate::scanner::discover_images;
use crate::sidecar::{IdentityRecord, RecordPatch, SidecarStore};
use crate::sync::{SyncQueue, SyncStats};

/// Edit waiting for its debounce window to close.
#[derive(Debug, Clone)]
struct PendingEdit {
    patch: RecordPatch,
    due: Instant,
}

pub struct Workbench {
    config: Config,
    sidecars: SidecarStore,
    store: Option<Arc<dyn MetadataStore>>,
    sync: SyncQueue,
    collection: ImageCollection,
    directory: Option<PathBuf>,
    pending: HashMap<EntryId, PendingEdit>,
}

impl Workbench {
    /// Build a workbench around an already opened store. Must be called
    /// inside a tokio runtime when `store` is `Some`.
    pub fn new(config: Config, store: Option<Arc<dyn MetadataStore>>) -> Self {
        let sync = match &store {
            Some(store) => SyncQueue::spawn(
                Arc::clone(store),
                config.remote.owner.clone(),
                config.remote.timeout(),
            ),
            None => SyncQueue::disabled(),
        };

        Self {
            sidecars: SidecarStore::new(config.sidecar.extension.clone()),
            config,
            store,
            sync,
            collection: ImageCollection::new(),
            directory: None,
            pending: HashMap::new(),
        }
    }

    /// Open the configured metadata store and build a workbench.
    ///
    /// A store that cannot be opened is logged and the session continues
    /// with sidecars only.
    pub fn open(config: Config) -> Self {
        let store: Option<Arc<dyn MetadataStore>> = if config.remote.enabled {
            match SqliteStore::open(&config.remote.db_path) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    warn!(
                        path = %config.remote.db_path.display(),
                        error = %e,
                        "Metadata store unavailable, continuing offline"
                    );
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Option<&Arc<dyn MetadataStore>> {
        self.store.as_ref()
    }

    pub fn collection(&self) -> &ImageCollection {
        &self.collection
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn entry_by_filename(&self, filename: &str) -> Option<&ImageEntry> {
        self.collection.find_by_filename(filename)
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.sidecars.clone(), self.sync.handle())
    }

    /// List `dir` and show placeholders for every image straight away.
    ///
    /// Returns the jobs for the caller to reconcile, possibly on another
    /// task; feed the result back through [`Workbench::apply_batch`].
    pub fn load_placeholders(&mut self, dir: &Path) -> Result<(Generation, Vec<FileJob>)> {
        let paths = discover_images(
            dir,
            &self.config.scanner.image_extensions,
            self.config.scanner.recursive,
        )?;

        // Unsaved edits belong to the folder being left
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "Dropping unsaved edits on folder switch");
            self.pending.clear();
        }

        let generation = self.collection.begin_load(&paths);
        self.directory = Some(dir.to_path_buf());
        let jobs = self.collection.entries().iter().map(FileJob::from).collect();
        Ok((generation, jobs))
    }

    pub fn apply_batch(&mut self, batch: PatchBatch) -> ApplyOutcome {
        self.collection.apply(batch)
    }

    /// Open `dir`, reconcile every image and wait for the result.
    pub async fn open_folder(&mut self, dir: &Path) -> Result<ReconcileReport> {
        self.flush_edits().await;
        self.load_placeholders(dir)?;

        let reconciler = self.reconciler();
        let report = reconciler.reconcile_collection(&mut self.collection).await;

        info!(
            folder = %dir.display(),
            images = report.total,
            minted = report.minted,
            "Folder opened"
        );
        Ok(report)
    }

    /// Apply `patch` to the in-memory entry now; persist after the debounce
    /// window. Consecutive edits to one entry are merged.
    pub fn edit(&mut self, id: EntryId, patch: RecordPatch) -> Result<()> {
        self.edit_at(id, patch, Instant::now())
    }

    fn edit_at(&mut self, id: EntryId, patch: RecordPatch, now: Instant) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let Some(entry) = self.collection.get_mut(id) else {
            bail!("No image with id {}", id.0);
        };
        match entry.state {
            IdentityState::Reconciled => {}
            IdentityState::Placeholder => bail!("{} is still being reconciled", entry.filename),
            // The placeholder uuid must never reach the sidecar or the store
            IdentityState::Failed => bail!(
                "{} has no stable identity; reopen the folder to retry",
                entry.filename
            ),
        }

        if let Some(caption) = &patch.caption {
            entry.identity.caption = caption.clone();
        }
        if let Some(tags) = &patch.tags {
            entry.identity.tags = tags.clone();
        }
        if let Some(p_hash) = &patch.p_hash {
            entry.identity.p_hash = Some(p_hash.clone());
        }

        let due = now + self.config.editing.debounce();
        let merged = match self.pending.remove(&id) {
            Some(previous) => previous.patch.merge(patch),
            None => patch,
        };
        self.pending.insert(id, PendingEdit { patch: merged, due });
        Ok(())
    }

    pub fn has_pending_edits(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Persist edits whose debounce window has closed. Returns how many were
    /// written.
    pub async fn poll_pending_edits(&mut self) -> usize {
        self.poll_pending_edits_at(Instant::now()).await
    }

    pub async fn poll_pending_edits_at(&mut self, now: Instant) -> usize {
        let due: Vec<EntryId> = self
            .pending
            .iter()
            .filter(|(_, edit)| edit.due <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut persisted = 0;
        for id in due {
            if let Some(edit) = self.pending.remove(&id) {
                if self.persist(id, &edit.patch).await {
                    persisted += 1;
                }
            }
        }
        persisted
    }

    /// Persist every pending edit regardless of its deadline.
    pub async fn flush_edits(&mut self) -> usize {
        let pending: Vec<(EntryId, PendingEdit)> = self.pending.drain().collect();
        let mut persisted = 0;
        for (id, edit) in pending {
            if self.persist(id, &edit.patch).await {
                persisted += 1;
            }
        }
        persisted
    }

    async fn persist(&mut self, id: EntryId, patch: &RecordPatch) -> bool {
        let Some(entry) = self.collection.get_mut(id) else {
            return false;
        };
        if entry.state != IdentityState::Reconciled {
            return false;
        }

        let record: IdentityRecord = SidecarStore::update(&entry.identity, patch);
        entry.identity = record.clone();
        let directory = entry.directory.clone();
        let filename = entry.filename.clone();

        let written = match self.sidecars.write(&directory, &filename, &record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %filename, error = %e, "Edit kept in memory only");
                false
            }
        };
        self.sync.handle().enqueue(record, filename);
        written
    }

    /// Delete the image file and its sidecar and drop the entry.
    ///
    /// The sidecar goes first so a failure leaves the image untouched. If the
    /// image itself cannot be removed the sidecar is written back. The remote
    /// record is left in place.
    pub async fn delete_image(&mut self, id: EntryId) -> Result<ImageEntry> {
        let Some(entry) = self.collection.get(id) else {
            bail!("No image with id {}", id.0);
        };
        let path = entry.path.clone();
        let directory = entry.directory.clone();
        let filename = entry.filename.clone();
        let identity = entry.identity.clone();
        let restore = entry.state == IdentityState::Reconciled;

        let had_sidecar = self.sidecars.remove(&directory, &filename).await?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %path.display(), "Image already gone");
            }
            Err(e) => {
                if had_sidecar && restore {
                    if let Err(err) = self.sidecars.write(&directory, &filename, &identity).await {
                        warn!(file = %filename, error = %err, "Could not restore sidecar");
                    }
                }
                return Err(e).with_context(|| format!("Failed to delete {}", path.display()));
            }
        }

        self.pending.remove(&id);
        let removed = self
            .collection
            .remove(id)
            .with_context(|| format!("{} vanished from the list", filename))?;
        info!(file = %path.display(), uuid = %removed.identity.uuid, "Deleted image");
        Ok(removed)
    }

    /// Groups of near-identical images in the open folder.
    pub fn similar_groups(&self) -> Vec<Vec<&ImageEntry>> {
        self.collection
            .similar_groups(self.config.scanner.similarity_threshold)
            .into_iter()
            .map(|ids| ids.into_iter().filter_map(|id| self.collection.get(id)).collect())
            .collect()
    }

    /// Import tabular metadata into the store.
    pub async fn import_csv(&self, path: &Path) -> Result<BulkUpsertSummary> {
        let Some(store) = self.store.clone() else {
            bail!("Metadata store is disabled; nothing to import into");
        };
        let path = path.to_path_buf();
        let owner = self.config.remote.owner.clone();
        let column = self.config.import.filename_column.clone();

        tokio::task::spawn_blocking(move || import::import_csv(store.as_ref(), &path, &owner, &column))
            .await?
    }

    pub fn export(&self, output: &Path, format: ExportFormat) -> Result<usize> {
        let count = export::export_entries(self.collection.entries(), output, format)?;
        info!(file = %output.display(), count, format = format.name(), "Exported identities");
        Ok(count)
    }

    /// Save pending edits and drain the sync queue.
    pub async fn shutdown(mut self) -> SyncStats {
        self.flush_edits().await;
        self.sync.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::hashing::tests::{falling_gradient, png_bytes, rising_gradient};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.remote.db_path = dir.path().join("metadata.db");
        config.remote.owner = "alice".to_string();
        config
    }

    fn write_png(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), png_bytes(&falling_gradient())).unwrap();
    }

    #[tokio::test]
    async fn test_open_folder_mints_identities() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");
        std::fs::write(photos.path().join("notes.txt"), "not an image").unwrap();

        let mut bench = Workbench::open(test_config(&data));
        let report = bench.open_folder(photos.path()).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.minted, 1);

        let content = std::fs::read_to_string(photos.path().join("a.png.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["uuid"].as_str().unwrap().len(), 36);
        let p_hash = value["pHash"].as_str().unwrap();
        assert_eq!(p_hash.len(), 16);
        assert!(p_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(value["caption"], "");
        assert_eq!(value["tags"], serde_json::json!([]));

        let stats = bench.shutdown().await;
        assert_eq!(stats.inserted, 1);
    }

    #[tokio::test]
    async fn test_existing_caption_is_adopted() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "cat.png");

        let mut record = IdentityRecord::new(None);
        record.caption = "a cat".to_string();
        SidecarStore::default()
            .write(photos.path(), "cat.png", &record)
            .await
            .unwrap();

        let mut bench = Workbench::new(test_config(&data), None);
        let report = bench.open_folder(photos.path()).await.unwrap();
        assert_eq!(report.adopted, 1);

        let entry = bench.entry_by_filename("cat.png").unwrap();
        assert_eq!(entry.identity.caption, "a cat");
        assert_eq!(entry.identity.uuid, record.uuid);
    }

    #[tokio::test]
    async fn test_import_then_open_claims_metadata_row() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        let csv = data.path().join("meta.csv");
        std::fs::write(&csv, "filename,location\nbeach.png,Brighton\n").unwrap();

        let mut bench = Workbench::open(test_config(&data));
        let summary = bench.import_csv(&csv).await.unwrap();
        assert_eq!(summary.created, 1);

        let store = bench.store().cloned().unwrap();
        let before = store.find_by_filename("beach.png", "alice").unwrap();
        assert_eq!(before.len(), 1);
        assert!(!before[0].has_image);
        assert!(before[0].uuid.is_none());

        write_png(photos.path(), "beach.png");
        bench.open_folder(photos.path()).await.unwrap();
        let uuid = bench.entry_by_filename("beach.png").unwrap().identity.uuid;
        let stats = bench.shutdown().await;
        assert_eq!(stats.upgraded, 1);

        let after = store.find_by_filename("beach.png", "alice").unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
        assert!(after[0].has_image);
        assert_eq!(after[0].uuid, Some(uuid));
        assert_eq!(after[0].p_hash.as_deref(), Some("ffffffffffffffff"));

        let values = store.metadata_values(after[0].id).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].1.to_string(), "Brighton");
    }

    #[tokio::test]
    async fn test_edits_are_debounced() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");

        let mut config = test_config(&data);
        config.editing.debounce_ms = 500;
        let mut bench = Workbench::open(config);
        bench.open_folder(photos.path()).await.unwrap();
        let entry = bench.entry_by_filename("a.png").unwrap().clone();

        let start = Instant::now();
        bench.edit_at(entry.id, RecordPatch::caption("draft"), start).unwrap();
        bench
            .edit_at(entry.id, RecordPatch::tags(["beach"]), start + Duration::from_millis(100))
            .unwrap();

        // Memory reflects the edit immediately
        let current = bench.collection().get(entry.id).unwrap();
        assert_eq!(current.identity.caption, "draft");
        assert_eq!(current.identity.tags, vec!["beach".to_string()]);

        // Window restarted by the second edit
        assert_eq!(bench.poll_pending_edits_at(start + Duration::from_millis(550)).await, 0);
        let sidecar = SidecarStore::default().read(photos.path(), "a.png").await.unwrap();
        assert_eq!(sidecar.caption, "");

        assert_eq!(bench.poll_pending_edits_at(start + Duration::from_millis(650)).await, 1);
        assert!(!bench.has_pending_edits());

        let sidecar = SidecarStore::default().read(photos.path(), "a.png").await.unwrap();
        assert_eq!(sidecar.caption, "draft");
        assert_eq!(sidecar.tags, vec!["beach".to_string()]);
        assert_eq!(sidecar.created_at, entry.identity.created_at);
        assert!(sidecar.updated_at > entry.identity.updated_at);

        let store = bench.store().cloned().unwrap();
        bench.shutdown().await;
        let remote = store.get_by_uuid(&entry.identity.uuid).unwrap().unwrap();
        assert_eq!(remote.caption, "draft");
    }

    #[tokio::test]
    async fn test_shutdown_flushes_edits() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");

        let mut bench = Workbench::new(test_config(&data), None);
        bench.open_folder(photos.path()).await.unwrap();
        let id = bench.entry_by_filename("a.png").unwrap().id;
        bench.edit(id, RecordPatch::caption("kept")).unwrap();
        bench.shutdown().await;

        let sidecar = SidecarStore::default().read(photos.path(), "a.png").await.unwrap();
        assert_eq!(sidecar.caption, "kept");
    }

    #[tokio::test]
    async fn test_edit_unknown_entry_fails() {
        let data = tempdir().unwrap();
        let mut bench = Workbench::new(test_config(&data), None);
        assert!(bench.edit(EntryId(u64::MAX), RecordPatch::caption("x")).is_err());
    }

    #[tokio::test]
    async fn test_delete_keeps_remote_record() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");
        write_png(photos.path(), "b.png");

        let mut bench = Workbench::open(test_config(&data));
        bench.open_folder(photos.path()).await.unwrap();
        let entry = bench.entry_by_filename("a.png").unwrap().clone();

        let removed = bench.delete_image(entry.id).await.unwrap();
        assert_eq!(removed.identity.uuid, entry.identity.uuid);
        assert!(!photos.path().join("a.png").exists());
        assert!(!photos.path().join("a.png.json").exists());
        assert_eq!(bench.collection().len(), 1);

        let store = bench.store().cloned().unwrap();
        bench.shutdown().await;
        assert!(store.get_by_uuid(&entry.identity.uuid).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_entry_cannot_be_edited() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");

        let mut bench = Workbench::new(test_config(&data), None);
        let (generation, jobs) = bench.load_placeholders(photos.path()).unwrap();
        // File vanishes before it can be read
        std::fs::remove_file(photos.path().join("a.png")).unwrap();
        let batch = bench.reconciler().reconcile(generation, jobs).await;
        bench.apply_batch(batch);

        let entry = bench.entry_by_filename("a.png").unwrap().clone();
        assert_eq!(entry.state, IdentityState::Failed);

        assert!(bench.edit(entry.id, RecordPatch::caption("x")).is_err());
        assert!(!bench.has_pending_edits());
        assert_eq!(bench.flush_edits().await, 0);
        assert!(!photos.path().join("a.png.json").exists());
        assert_eq!(bench.collection().get(entry.id).unwrap().identity.caption, "");
    }

    #[tokio::test]
    async fn test_delete_keeps_image_when_sidecar_cannot_be_removed() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");
        // A directory squatting on the sidecar name
        std::fs::create_dir(photos.path().join("a.png.json")).unwrap();

        let mut bench = Workbench::new(test_config(&data), None);
        bench.open_folder(photos.path()).await.unwrap();
        let id = bench.entry_by_filename("a.png").unwrap().id;

        assert!(bench.delete_image(id).await.is_err());
        assert!(photos.path().join("a.png").exists());
        assert!(bench.collection().get(id).is_some());
    }

    #[tokio::test]
    async fn test_similar_groups_and_export() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");
        write_png(photos.path(), "a_copy.png");
        std::fs::write(photos.path().join("c.png"), png_bytes(&rising_gradient())).unwrap();

        let mut bench = Workbench::new(test_config(&data), None);
        bench.open_folder(photos.path()).await.unwrap();

        let groups = bench.similar_groups();
        assert_eq!(groups.len(), 1);
        let names: Vec<&str> = groups[0].iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, ["a.png", "a_copy.png"]);

        let out = data.path().join("dataset.csv");
        assert_eq!(bench.export(&out, ExportFormat::Csv).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_folder_switch_discards_stale_results() {
        let data = tempdir().unwrap();
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        write_png(first.path(), "old.png");
        write_png(second.path(), "new.png");

        let mut bench = Workbench::new(test_config(&data), None);
        let (generation, jobs) = bench.load_placeholders(first.path()).unwrap();
        let late = bench.reconciler().reconcile(generation, jobs).await;

        let (current, jobs) = bench.load_placeholders(second.path()).unwrap();
        assert!(bench.apply_batch(late).stale);
        assert_eq!(bench.directory(), Some(second.path()));

        let fresh = bench.reconciler().reconcile(current, jobs).await;
        let outcome = bench.apply_batch(fresh);
        assert_eq!(outcome.applied, 1);
        assert_eq!(
            bench.entry_by_filename("new.png").unwrap().state,
            IdentityState::Reconciled
        );
    }

    #[tokio::test]
    async fn test_unopenable_store_falls_back_offline() {
        let data = tempdir().unwrap();
        let photos = tempdir().unwrap();
        write_png(photos.path(), "a.png");

        // A regular file where the store's parent directory should be
        let blocker = data.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let mut config = test_config(&data);
        config.remote.db_path = blocker.join("metadata.db");

        let mut bench = Workbench::open(config);
        assert!(bench.store().is_none());
        let report = bench.open_folder(photos.path()).await.unwrap();
        assert_eq!(report.minted, 1);
        assert!(bench.import_csv(&data.path().join("x.csv")).await.is_err());
    }
}
