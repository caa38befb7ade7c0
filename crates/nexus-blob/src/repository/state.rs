//! Repository lock state.
//!
//! Writing and compacting are mutually exclusive. Backing up is orthogonal
//! to both: a backup may start while the file is being written or compacted,
//! and either may start while a backup is running.

use std::fmt;
use std::sync::Arc;

use nexus_common::error::{BlobError, BlobResult};

use super::Repository;

/// Lock state of one repository file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RepoLockState {
    /// No exclusive user.
    #[default]
    Unlocked,
    /// A writer is appending records.
    Writing,
    /// The compactor owns the file.
    Compacting,
    /// A backup is copying the file.
    BackingUp,
    /// Writing while a backup runs.
    WritingBackingUp,
    /// Compacting while a backup runs.
    CompactingBackingUp,
}

/// A request to change the lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockEvent {
    /// Take the file for appending.
    BeginWrite,
    /// Release the file after appending.
    EndWrite,
    /// Take the file for compaction.
    BeginCompact,
    /// Release the file after compaction.
    EndCompact,
    /// Start a backup of the file.
    BeginBackup,
    /// Finish the backup of the file.
    EndBackup,
}

impl RepoLockState {
    /// Applies `event`, returning the next state.
    ///
    /// Fails with `Busy` when the requested mode conflicts with the current
    /// one, and with `InvalidArgument` for a release that does not match.
    pub fn transition(self, event: LockEvent) -> BlobResult<Self> {
        use LockEvent::*;
        use RepoLockState::*;

        let next = match (self, event) {
            (Unlocked, BeginWrite) => Writing,
            (BackingUp, BeginWrite) => WritingBackingUp,
            (Unlocked, BeginCompact) => Compacting,
            (BackingUp, BeginCompact) => CompactingBackingUp,
            (Unlocked, BeginBackup) => BackingUp,
            (Writing, BeginBackup) => WritingBackingUp,
            (Compacting, BeginBackup) => CompactingBackingUp,

            (Writing, EndWrite) => Unlocked,
            (WritingBackingUp, EndWrite) => BackingUp,
            (Compacting, EndCompact) => Unlocked,
            (CompactingBackingUp, EndCompact) => BackingUp,
            (BackingUp, EndBackup) => Unlocked,
            (WritingBackingUp, EndBackup) => Writing,
            (CompactingBackingUp, EndBackup) => Compacting,

            (Writing | WritingBackingUp | Compacting | CompactingBackingUp, BeginWrite | BeginCompact)
            | (BackingUp | WritingBackingUp | CompactingBackingUp, BeginBackup) => {
                return Err(BlobError::busy(format!("repository is {self}")));
            }

            (Unlocked | BackingUp | Compacting | CompactingBackingUp, EndWrite)
            | (Unlocked | BackingUp | Writing | WritingBackingUp, EndCompact)
            | (Unlocked | Writing | Compacting, EndBackup) => {
                return Err(BlobError::invalid_argument(format!(
                    "cannot apply {event:?} to a repository that is {self}"
                )));
            }
        };
        Ok(next)
    }

    /// Returns true while a writer owns the file.
    pub fn is_writing(self) -> bool {
        matches!(self, Self::Writing | Self::WritingBackingUp)
    }

    /// Returns true while the compactor owns the file.
    pub fn is_compacting(self) -> bool {
        matches!(self, Self::Compacting | Self::CompactingBackingUp)
    }

    /// Returns true while a backup runs on the file.
    pub fn is_backing_up(self) -> bool {
        matches!(
            self,
            Self::BackingUp | Self::WritingBackingUp | Self::CompactingBackingUp
        )
    }
}

impl fmt::Display for RepoLockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unlocked => "unlocked",
            Self::Writing => "writing",
            Self::Compacting => "compacting",
            Self::BackingUp => "backing-up",
            Self::WritingBackingUp => "writing+backing-up",
            Self::CompactingBackingUp => "compacting+backing-up",
        };
        f.write_str(name)
    }
}

/// RAII guard for a repository lock mode; the release event is applied on
/// drop.
pub struct RepoStateGuard {
    repo: Arc<Repository>,
    release: LockEvent,
}

impl RepoStateGuard {
    pub(crate) fn new(repo: Arc<Repository>, release: LockEvent) -> Self {
        Self { repo, release }
    }

    /// The guarded repository.
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }
}

impl std::ops::Deref for RepoStateGuard {
    type Target = Repository;

    fn deref(&self) -> &Repository {
        &self.repo
    }
}

impl Drop for RepoStateGuard {
    fn drop(&mut self) {
        if let Err(e) = self.repo.apply_event(self.release) {
            tracing::error!(repo = %self.repo.id(), error = %e, "failed to release repository state");
        }
    }
}

impl fmt::Debug for RepoStateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoStateGuard")
            .field("repo", &self.repo.id())
            .field("release", &self.release)
            .finish()
    }
}
