use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::index::{FileIdentifier, FileIndex, IndexEntry, IndexError};
use super::snapshot::IndexSnapshot;
use super::StorageError;
use crate::object_store::{LocalStore, ObjectStore, ObjectStoreError};

/// Blob directory, relative to the storage dir
pub const FILES_DIR: &str = "files";

/// Index snapshot file, relative to the storage dir
pub const SNAPSHOT_FILE: &str = "storage.idx";

const MAX_NAME_LEN: usize = 255;

/// Owns the file index and the blob store, and keeps the two consistent.
///
/// Blobs are written before they are registered and unregistered only after
/// they are gone from disk, so the index never claims a name whose bytes were
/// not fully stored. A name stays claimed in the index while its blob is
/// being written or removed, so a blob on disk always belongs to exactly one
/// entry. The reverse (an entry whose file disappeared) is repaired lazily:
/// any get or delete that finds the file missing drops the entry.
pub struct StorageEngine {
    index: FileIndex,
    store: Arc<dyn ObjectStore>,
    snapshot_path: PathBuf,
    /// Serializes snapshot writes so an older capture never lands last
    save_lock: tokio::sync::Mutex<()>,
}

impl StorageEngine {
    /// Open storage rooted at `storage_dir`, restoring the index snapshot if
    /// one is present.
    pub async fn open<P: AsRef<Path>>(storage_dir: P) -> Result<Self, StorageError> {
        let storage_dir = storage_dir.as_ref();
        tokio::fs::create_dir_all(storage_dir).await?;
        let store = LocalStore::new(storage_dir.join(FILES_DIR))?;
        Ok(Self::with_store(Arc::new(store), storage_dir.join(SNAPSHOT_FILE)).await)
    }

    /// Build an engine over an arbitrary object store.
    pub async fn with_store(store: Arc<dyn ObjectStore>, snapshot_path: PathBuf) -> Self {
        let index = Self::load_index(&snapshot_path, store.as_ref()).await;
        info!(
            entries = index.len(),
            next_id = index.next_id(),
            "Storage index loaded"
        );
        Self {
            index,
            store,
            snapshot_path,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    // ========================================================================
    // File operations
    // ========================================================================

    /// Fetch a blob's bytes.
    pub async fn get_file(&self, identifier: &FileIdentifier) -> Result<Bytes, StorageError> {
        let entry = self.index.lookup(identifier)?;
        match self.store.get(&entry.name).await {
            // The name may have been deleted and saved again during the read
            Ok(data) if self.index.is_live(&entry) => {
                debug!(id = entry.id, name = %entry.name, bytes = data.len(), "File read");
                Ok(data)
            }
            Ok(_) => {
                debug!(id = entry.id, name = %entry.name, "Entry removed during read");
                Err(StorageError::NotFound(identifier.to_string()))
            }
            Err(ObjectStoreError::NotFound(_)) => {
                self.heal(&entry);
                Err(StorageError::NotFound(identifier.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Store a new blob under `name` and return its id.
    ///
    /// Names are write-once: a name that is live, or being saved by a
    /// concurrent request, is `Forbidden`.
    pub async fn save_file(&self, name: &str, data: Bytes) -> Result<u64, StorageError> {
        validate_name(name)?;
        let reservation = self.index.reserve(name)?;

        let len = data.len();
        if let Err(e) = self.store.put(name, data).await {
            warn!(name, error = %e, "Failed to store file");
            return Err(e.into());
        }

        match reservation.commit() {
            Ok(id) => {
                debug!(id, name, bytes = len, "File saved");
                Ok(id)
            }
            Err(e) => {
                error!(name, error = %e, "Stored file could not be indexed, removing it");
                if let Err(e) = self.store.delete(name).await {
                    warn!(name, error = %e, "Failed to remove unindexed file");
                }
                Err(e.into())
            }
        }
    }

    /// Delete a blob. `Ok(false)` when the identifier does not resolve or the
    /// blob is already gone.
    ///
    /// The name stays claimed until the blob is gone, so a racing delete
    /// reports `false` and a racing save of the same name is `Forbidden`.
    pub async fn delete_file(&self, identifier: &FileIdentifier) -> Result<bool, StorageError> {
        let deletion = match self.index.begin_delete(identifier) {
            Ok(deletion) => deletion,
            Err(IndexError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let entry = deletion.entry().clone();

        match self.store.delete(&entry.name).await {
            Ok(()) => {
                // A concurrent heal may already have dropped the entry
                deletion.finish();
                debug!(id = entry.id, name = %entry.name, "File deleted");
                Ok(true)
            }
            Err(ObjectStoreError::NotFound(_)) => {
                if deletion.finish() {
                    warn!(
                        id = entry.id,
                        name = %entry.name,
                        "Indexed file missing on disk, dropped stale index entry"
                    );
                }
                Ok(false)
            }
            // Dropping the claim keeps the entry for a retry
            Err(e) => Err(e.into()),
        }
    }

    fn heal(&self, entry: &IndexEntry) {
        if self.index.remove_entry(entry) {
            warn!(
                id = entry.id,
                name = %entry.name,
                "Indexed file missing on disk, dropped stale index entry"
            );
        }
    }

    // ========================================================================
    // Index persistence
    // ========================================================================

    /// Persist the index to the snapshot file.
    pub async fn save_index(&self) -> Result<(), StorageError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = IndexSnapshot::capture(&self.index);
        snapshot.write_atomic(&self.snapshot_path).await?;
        info!(
            entries = snapshot.entries.len(),
            next_id = snapshot.next_id,
            path = %self.snapshot_path.display(),
            "Storage index saved"
        );
        Ok(())
    }

    /// Restore the index from `snapshot_path`.
    ///
    /// Never fails: a missing snapshot yields an empty index, and an
    /// unreadable one is moved aside before starting empty so the next save
    /// does not destroy it. Entries whose blob no longer exists are dropped.
    pub async fn load_index(snapshot_path: &Path, store: &dyn ObjectStore) -> FileIndex {
        let snapshot = match IndexSnapshot::read(snapshot_path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(path = %snapshot_path.display(), "No index snapshot, starting empty");
                return FileIndex::new();
            }
            Err(e) => {
                warn!(path = %snapshot_path.display(), error = %e, "Unreadable index snapshot, starting empty");
                quarantine(snapshot_path).await;
                return FileIndex::new();
            }
        };

        let next_id = snapshot.next_id;
        let mut entries = Vec::with_capacity(snapshot.entries.len());
        for entry in snapshot.entries {
            match store.exists(&entry.name).await {
                Ok(false) => {
                    warn!(id = entry.id, name = %entry.name, "Dropping index entry without a file");
                }
                Ok(true) => entries.push(entry),
                Err(e) => {
                    warn!(name = %entry.name, error = %e, "Could not check file, keeping index entry");
                    entries.push(entry);
                }
            }
        }

        match FileIndex::from_entries(next_id, entries) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %snapshot_path.display(), error = %e, "Inconsistent index snapshot, starting empty");
                quarantine(snapshot_path).await;
                FileIndex::new()
            }
        }
    }
}

/// Move a bad snapshot out of the way, keeping it for manual repair.
async fn quarantine(snapshot_path: &Path) {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let file_name = snapshot_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let target = snapshot_path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
    match tokio::fs::rename(snapshot_path, &target).await {
        Ok(()) => warn!(path = %target.display(), "Bad index snapshot moved aside"),
        Err(e) => warn!(error = %e, "Failed to move bad index snapshot aside"),
    }
}

/// Stored names map 1:1 onto files in a flat directory.
fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidName(name.to_string()))
    }
}
