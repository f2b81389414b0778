//! Bidirectional name <-> id index.
//!
//! The index is the only authority for id assignment. Ids come from a
//! monotonic counter and are never handed out twice, even after the entry
//! that held them is removed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Name already indexed: {0}")]
    DuplicateName(String),
    #[error("Id already indexed: {0}")]
    DuplicateId(u64),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("No ids left to assign")]
    IdsExhausted,
}

/// Reference to a stored blob, either by its name or by its numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileIdentifier {
    ByName(String),
    ById(u64),
}

impl FileIdentifier {
    /// Build an identifier from its wire tokens, e.g. `("BY_ID", "2")`.
    pub fn from_parts(kind: &str, value: &str) -> Result<Self, IndexError> {
        match kind.to_ascii_uppercase().as_str() {
            "BY_NAME" if !value.is_empty() => Ok(FileIdentifier::ByName(value.to_string())),
            "BY_ID" => value
                .parse::<u64>()
                .map(FileIdentifier::ById)
                .map_err(|_| IndexError::InvalidIdentifier(format!("{kind} {value}"))),
            _ => Err(IndexError::InvalidIdentifier(format!("{kind} {value}"))),
        }
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileIdentifier::ByName(name) => write!(f, "BY_NAME {name}"),
            FileIdentifier::ById(id) => write!(f, "BY_ID {id}"),
        }
    }
}

/// One live (id, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Default)]
struct IndexState {
    id_to_name: HashMap<u64, String>,
    name_to_id: HashMap<String, u64>,
    /// Names claimed by saves that have not committed yet
    reserved: HashSet<String>,
    /// Names whose blob is being removed
    deleting: HashSet<String>,
    next_id: u64,
}

impl IndexState {
    fn is_taken(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
            || self.reserved.contains(name)
            || self.deleting.contains(name)
    }

    fn insert(&mut self, name: String) -> Result<u64, IndexError> {
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or(IndexError::IdsExhausted)?;
        self.id_to_name.insert(id, name.clone());
        self.name_to_id.insert(name, id);
        Ok(id)
    }

    fn resolve(&self, identifier: &FileIdentifier) -> Option<IndexEntry> {
        match identifier {
            FileIdentifier::ByName(name) => self.name_to_id.get(name).map(|id| IndexEntry {
                id: *id,
                name: name.clone(),
            }),
            FileIdentifier::ById(id) => self.id_to_name.get(id).map(|name| IndexEntry {
                id: *id,
                name: name.clone(),
            }),
        }
    }

    fn remove_pair(&mut self, entry: &IndexEntry) -> bool {
        if self.name_to_id.get(&entry.name) != Some(&entry.id) {
            return false;
        }
        self.name_to_id.remove(&entry.name);
        self.id_to_name.remove(&entry.id);
        true
    }
}

/// Thread-safe name <-> id index.
///
/// Both directions sit behind a single lock so every insert and removal is
/// observed whole by concurrent readers.
#[derive(Debug, Default)]
pub struct FileIndex {
    state: RwLock<IndexState>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted entries.
    ///
    /// The counter is bumped past the largest restored id so a stale or
    /// hand-edited counter can never cause an id to be reused.
    pub fn from_entries(
        next_id: u64,
        entries: impl IntoIterator<Item = IndexEntry>,
    ) -> Result<Self, IndexError> {
        let mut state = IndexState {
            next_id,
            ..Default::default()
        };

        for entry in entries {
            if state.id_to_name.contains_key(&entry.id) {
                return Err(IndexError::DuplicateId(entry.id));
            }
            if state.name_to_id.contains_key(&entry.name) {
                return Err(IndexError::DuplicateName(entry.name));
            }
            let after = entry.id.checked_add(1).ok_or(IndexError::IdsExhausted)?;
            state.next_id = state.next_id.max(after);
            state.name_to_id.insert(entry.name.clone(), entry.id);
            state.id_to_name.insert(entry.id, entry.name);
        }

        Ok(Self {
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `name` under a freshly allocated id.
    pub fn add(&self, name: &str) -> Result<u64, IndexError> {
        let mut state = self.write();
        if state.is_taken(name) {
            return Err(IndexError::DuplicateName(name.to_string()));
        }
        state.insert(name.to_string())
    }

    /// Claim `name` for an in-flight save.
    ///
    /// While the reservation is held, `add` and other reservations of the same
    /// name fail with `DuplicateName`. Dropping it without `commit` releases
    /// the name.
    pub fn reserve(&self, name: &str) -> Result<Reservation<'_>, IndexError> {
        let mut state = self.write();
        if state.is_taken(name) {
            return Err(IndexError::DuplicateName(name.to_string()));
        }
        state.reserved.insert(name.to_string());
        Ok(Reservation {
            index: self,
            name: name.to_string(),
            committed: false,
        })
    }

    pub fn lookup(&self, identifier: &FileIdentifier) -> Result<IndexEntry, IndexError> {
        self.read()
            .resolve(identifier)
            .ok_or_else(|| IndexError::NotFound(identifier.to_string()))
    }

    /// Claim the entry `identifier` resolves to for deletion.
    ///
    /// While the claim is held the entry stays resolvable, but its name can
    /// be neither reserved nor added, and a second claim on it fails with
    /// `NotFound`. Dropping the claim without `finish` keeps the entry.
    pub fn begin_delete(&self, identifier: &FileIdentifier) -> Result<Deletion<'_>, IndexError> {
        let mut state = self.write();
        let entry = state
            .resolve(identifier)
            .ok_or_else(|| IndexError::NotFound(identifier.to_string()))?;
        if !state.deleting.insert(entry.name.clone()) {
            return Err(IndexError::NotFound(identifier.to_string()));
        }
        Ok(Deletion {
            index: self,
            entry,
            finished: false,
        })
    }

    /// Whether exactly this pair is still live.
    pub fn is_live(&self, entry: &IndexEntry) -> bool {
        self.read().name_to_id.get(&entry.name) == Some(&entry.id)
    }

    /// Remove `name` and its id, returning the id it held.
    pub fn remove(&self, name: &str) -> Result<u64, IndexError> {
        let mut state = self.write();
        let id = state
            .name_to_id
            .remove(name)
            .ok_or_else(|| IndexError::NotFound(name.to_string()))?;
        state.id_to_name.remove(&id);
        Ok(id)
    }

    /// Remove the pair only if exactly this pair is still live.
    pub fn remove_entry(&self, entry: &IndexEntry) -> bool {
        self.write().remove_pair(entry)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().name_to_id.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The id the next `add` will hand out.
    pub fn next_id(&self) -> u64 {
        self.read().next_id
    }

    /// All live entries, ordered by id.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.export().1
    }

    /// Live entries and the counter, read under one lock.
    pub(crate) fn export(&self) -> (u64, Vec<IndexEntry>) {
        let state = self.read();
        let mut entries: Vec<IndexEntry> = state
            .id_to_name
            .iter()
            .map(|(id, name)| IndexEntry {
                id: *id,
                name: name.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        (state.next_id, entries)
    }
}

/// A name claimed by an in-flight save. See [`FileIndex::reserve`].
#[derive(Debug)]
pub struct Reservation<'a> {
    index: &'a FileIndex,
    name: String,
    committed: bool,
}

impl Reservation<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Turn the reservation into a live entry and return its id. The name
    /// is released if no id is left to assign.
    pub fn commit(mut self) -> Result<u64, IndexError> {
        let mut state = self.index.write();
        state.reserved.remove(&self.name);
        self.committed = true;
        state.insert(self.name.clone())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.write().reserved.remove(&self.name);
        }
    }
}

/// An entry claimed for deletion. See [`FileIndex::begin_delete`].
#[derive(Debug)]
pub struct Deletion<'a> {
    index: &'a FileIndex,
    entry: IndexEntry,
    finished: bool,
}

impl Deletion<'_> {
    pub fn entry(&self) -> &IndexEntry {
        &self.entry
    }

    /// Drop the entry and release the name. Returns false if the entry was
    /// already gone.
    pub fn finish(mut self) -> bool {
        let mut state = self.index.write();
        state.deleting.remove(&self.entry.name);
        self.finished = true;
        state.remove_pair(&self.entry)
    }
}

impl Drop for Deletion<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.index.write().deleting.remove(&self.entry.name);
        }
    }
}
