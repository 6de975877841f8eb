//! Transactional virtual filesystem (spec.md §4.1).
//!
//! A content-addressed path→bytes store. Snapshots are cheap (bytes are
//! shared behind `Arc<[u8]>`, only the index is cloned — "a naive full-copy
//! map is acceptable for the scales here", spec.md §9) and restoring one
//! must leave the VFS byte-equal to the snapshot (invariant P1).

mod path;

pub use path::VfsPath;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::error::VfsError;

pub type Bytes = Arc<[u8]>;

/// A complete, immutable view of the VFS at a moment (spec.md §3).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub files: IndexMap<VfsPath, Bytes>,
}

/// Result of `diffSnapshot`: partitioned path differences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub added: Vec<VfsPath>,
    pub modified: Vec<VfsPath>,
    pub deleted: Vec<VfsPath>,
}

/// A single change in an `applyChanges` batch; `None` means delete.
pub type ChangeSet = IndexMap<VfsPath, Option<Bytes>>;

struct Inner {
    files: IndexMap<VfsPath, Bytes>,
    snapshot_seq: u64,
}

/// Exclusively owns file bytes. Snapshots share bytes but own their view
/// (spec.md §3, "Lifecycle/ownership").
pub struct Vfs {
    inner: RwLock<Inner>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                files: IndexMap::new(),
                snapshot_seq: 0,
            }),
        }
    }

    pub fn read(&self, path: &VfsPath) -> Result<Bytes, VfsError> {
        let guard = self.inner.read();
        guard
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(path.as_str().to_string()))
    }

    pub fn write(&self, path: &VfsPath, bytes: impl Into<Vec<u8>>) -> Result<(), VfsError> {
        let mut guard = self.inner.write();
        guard
            .files
            .insert(path.clone(), Arc::from(bytes.into().into_boxed_slice()));
        Ok(())
    }

    pub fn delete(&self, path: &VfsPath) -> Result<(), VfsError> {
        let mut guard = self.inner.write();
        guard.files.shift_remove(path);
        Ok(())
    }

    pub fn exists(&self, path: &VfsPath) -> bool {
        self.inner.read().files.contains_key(path)
    }

    /// Lexicographically ordered paths sharing `prefix` (directory semantics
    /// are prefix-based, not nominal, per spec.md §4.1).
    pub fn list(&self, prefix: &str) -> Vec<VfsPath> {
        let guard = self.inner.read();
        let mut out: Vec<VfsPath> = guard
            .files
            .keys()
            .filter(|p| p.is_prefixed_by(prefix))
            .cloned()
            .collect();
        out.sort();
        out
    }

    /// No-op under the prefix-based directory model; validates the path and
    /// gives callers a symmetrical API to mirror a real filesystem.
    pub fn mkdir(&self, path: &VfsPath) -> Result<(), VfsError> {
        let _ = path;
        Ok(())
    }

    pub fn create_snapshot(&self) -> Snapshot {
        let mut guard = self.inner.write();
        guard.snapshot_seq += 1;
        let id = format!("snap-{}", guard.snapshot_seq);
        Snapshot {
            id,
            timestamp: Utc::now(),
            files: guard.files.clone(),
        }
    }

    /// Leaves the VFS byte-equal to `snapshot` for every path present in it,
    /// and deletes any path not in it (invariant P1).
    pub fn restore_snapshot(&self, snapshot: &Snapshot) {
        let mut guard = self.inner.write();
        guard.files = snapshot.files.clone();
    }

    /// Partitions differences between the current VFS and `snapshot`:
    /// added (present now, absent in snapshot), deleted (absent now,
    /// present in snapshot), modified (present in both, bytes differ).
    pub fn diff_snapshot(&self, snapshot: &Snapshot) -> Diff {
        let guard = self.inner.read();
        let mut diff = Diff::default();
        for (path, bytes) in &guard.files {
            match snapshot.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != bytes => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in snapshot.files.keys() {
            if !guard.files.contains_key(path) {
                diff.deleted.push(path.clone());
            }
        }
        diff.added.sort();
        diff.modified.sort();
        diff.deleted.sort();
        diff
    }

    /// Applies a batch of writes/deletes as a single exclusive operation.
    pub fn apply_changes(&self, changes: &ChangeSet) {
        let mut guard = self.inner.write();
        for (path, value) in changes {
            match value {
                Some(bytes) => {
                    guard.files.insert(path.clone(), bytes.clone());
                }
                None => {
                    guard.files.shift_remove(path);
                }
            }
        }
    }

    /// Builds a `ChangeSet` that, applied to the VFS that produced `diff`,
    /// restores it to the state that diff was computed against (round-trip
    /// law in spec.md §8).
    pub fn changeset_from_diff(&self, diff: &Diff, target_before: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for path in &diff.added {
            changes.insert(path.clone(), None);
        }
        for path in diff.modified.iter().chain(diff.deleted.iter()) {
            if let Some(bytes) = target_before.files.get(path) {
                changes.insert(path.clone(), Some(bytes.clone()));
            }
        }
        changes
    }
}
