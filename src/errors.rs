//! Typed failure taxonomy for the tracking engine.
//!
//! Errors travel through `anyhow::Error` so call sites keep their context
//! chains; callers that need to branch on a category recover the variant
//! with `downcast_ref::<TrackError>()`.

use std::path::PathBuf;
use thiserror::Error;

/// Invariant violations raised by the run-tracking engine.
///
/// Cancellation is deliberately absent: declining a destructive prompt or an
/// interactive commit yields a result value (`BeginOutcome::Cancelled`,
/// `CommitOutcome::Cancelled`), not an error.
#[derive(Debug, Error)]
pub enum TrackError {
    /// An operation requiring a clean tree found uncommitted changes.
    #[error("uncommitted changes in repository {}: {details}", repo.display())]
    DirtyState { repo: PathBuf, details: String },

    /// The code repository moved between `begin` and `commit_run`.
    #[error("code repository changed during tracked run (entered at {entered}, now at {current})")]
    ConcurrentModification { entered: String, current: String },

    /// Ledger header on disk does not match the canonical header.
    #[error("ledger header mismatch in {}: expected [{expected}], found [{found}]", path.display())]
    Schema {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// An options value cannot be expressed in the canonical codec.
    #[error("unsupported options value at '{key}': {reason}")]
    Serialization { key: String, reason: String },

    /// Pinned external data no longer matches its recorded state.
    #[error("pinned external data at {} was modified: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },

    /// A run commit was attempted with nothing staged.
    #[error("no output produced on branch '{branch}'")]
    NoOutputProduced { branch: String },

    /// A remote operation was requested on a repository without remotes.
    #[error("no remote configured for repository {}", repo.display())]
    RemoteNotConfigured { repo: PathBuf },
}

/// Returns the `TrackError` behind an `anyhow::Error`, if there is one.
pub fn as_track_error(err: &anyhow::Error) -> Option<&TrackError> {
    err.downcast_ref::<TrackError>()
}
