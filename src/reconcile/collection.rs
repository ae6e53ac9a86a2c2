//! The in-memory list of images for the open folder.
//!
//! Entries are addressed by [`EntryId`], never by position, because the
//! list may change while reconciliation results are still in flight.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::scanner::hashing;
use crate::sidecar::IdentityRecord;

/// Stable handle for one entry, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl EntryId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        EntryId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// Folder-load epoch. Results tagged with an older generation are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

/// How far identity resolution got for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    /// Temporary identity shown until reconciliation finishes.
    Placeholder,
    Reconciled,
    /// Reconciliation failed; the placeholder is kept for this session.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub id: EntryId,
    pub path: PathBuf,
    pub directory: PathBuf,
    pub filename: String,
    pub identity: IdentityRecord,
    pub state: IdentityState,
}

impl ImageEntry {
    pub fn placeholder(path: &Path) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let directory = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Self {
            id: EntryId::new(),
            path: path.to_path_buf(),
            directory,
            filename,
            identity: IdentityRecord::new(None),
            state: IdentityState::Placeholder,
        }
    }
}

/// Final result for one file.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Identity taken from an existing sidecar.
    Adopted(IdentityRecord),
    /// New identity minted. `hashed` is false when the pixels could not be
    /// decoded, `persisted` is false when the sidecar write failed.
    Minted {
        record: IdentityRecord,
        hashed: bool,
        persisted: bool,
    },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct EntryPatch {
    pub id: EntryId,
    pub resolution: Resolution,
}

/// All results from one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct PatchBatch {
    pub generation: Generation,
    pub patches: Vec<EntryPatch>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: usize,
    /// Entry was removed before its result arrived.
    pub missing: usize,
    /// Entry already had a result.
    pub duplicate: usize,
    /// Whole batch belonged to an earlier folder load.
    pub stale: bool,
}

#[derive(Debug, Default)]
pub struct ImageCollection {
    entries: Vec<ImageEntry>,
    generation: Generation,
}

impl ImageCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Replace the contents with placeholders for `paths` and start a new
    /// generation.
    pub fn begin_load(&mut self, paths: &[PathBuf]) -> Generation {
        self.generation = Generation(self.generation.0 + 1);
        self.entries = paths.iter().map(|p| ImageEntry::placeholder(p)).collect();
        self.generation
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&ImageEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut ImageEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn find_by_filename(&self, filename: &str) -> Option<&ImageEntry> {
        self.entries.iter().find(|e| e.filename == filename)
    }

    /// Add a placeholder entry to the current generation.
    pub fn insert(&mut self, path: &Path) -> EntryId {
        let entry = ImageEntry::placeholder(path);
        let id = entry.id;
        self.entries.push(entry);
        id
    }

    pub fn remove(&mut self, id: EntryId) -> Option<ImageEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Apply reconciliation results by entry id.
    ///
    /// A stale batch is ignored entirely. Within a current batch each entry
    /// takes at most one result; later results for the same entry and results
    /// for removed entries are counted and skipped.
    pub fn apply(&mut self, batch: PatchBatch) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();

        if batch.generation != self.generation {
            debug!(
                batch = batch.generation.0,
                current = self.generation.0,
                "Discarding stale reconciliation batch"
            );
            outcome.stale = true;
            return outcome;
        }

        for patch in batch.patches {
            let Some(entry) = self.get_mut(patch.id) else {
                outcome.missing += 1;
                continue;
            };
            if entry.state != IdentityState::Placeholder {
                outcome.duplicate += 1;
                continue;
            }

            match patch.resolution {
                Resolution::Adopted(record) | Resolution::Minted { record, .. } => {
                    entry.identity = record;
                    entry.state = IdentityState::Reconciled;
                }
                Resolution::Failed(_) => {
                    entry.state = IdentityState::Failed;
                }
            }
            outcome.applied += 1;
        }

        outcome
    }

    /// Uuids carried by more than one reconciled entry, e.g. after files
    /// were copied together with their sidecars.
    pub fn duplicate_uuids(&self) -> Vec<(Uuid, Vec<EntryId>)> {
        let mut by_uuid: HashMap<Uuid, Vec<EntryId>> = HashMap::new();
        for entry in &self.entries {
            if entry.state == IdentityState::Reconciled {
                by_uuid.entry(entry.identity.uuid).or_default().push(entry.id);
            }
        }

        let mut duplicates: Vec<(Uuid, Vec<EntryId>)> =
            by_uuid.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
        duplicates.sort_by_key(|(_, ids)| ids[0]);
        duplicates
    }

    /// Group entries whose fingerprints are within `threshold` bits.
    ///
    /// Single greedy pass in list order: each entry joins the first group
    /// whose seed it matches. Entries without a fingerprint are skipped and
    /// singleton groups are not returned.
    pub fn similar_groups(&self, threshold: u32) -> Vec<Vec<EntryId>> {
        // Only well-formed fingerprints take part
        let hashed: Vec<(EntryId, &str)> = self
            .entries
            .iter()
            .filter(|e| e.identity.perceptual_hash().is_some())
            .filter_map(|e| e.identity.p_hash.as_deref().map(|h| (e.id, h)))
            .collect();

        let mut grouped: HashSet<EntryId> = HashSet::new();
        let mut groups = Vec::new();

        for (i, (seed_id, seed_hash)) in hashed.iter().enumerate() {
            if grouped.contains(seed_id) {
                continue;
            }
            let mut group = vec![*seed_id];
            for (other_id, other_hash) in hashed.iter().skip(i + 1) {
                if grouped.contains(other_id) {
                    continue;
                }
                if stored_similar(seed_hash, other_hash, threshold) {
                    group.push(*other_id);
                    grouped.insert(*other_id);
                }
            }
            if group.len() > 1 {
                grouped.insert(*seed_id);
                groups.push(group);
            }
        }

        groups
    }
}

/// Compare two fingerprints already validated on load.
fn stored_similar(a: &str, b: &str, threshold: u32) -> bool {
    let similar = hashing::are_similar(a, b, threshold);
    debug_assert!(
        similar.is_ok(),
        "stored fingerprints {:?} and {:?} are not comparable",
        a,
        b
    );
    similar.unwrap_or(false)
}
