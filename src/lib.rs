//! Run tracking and result lookup for computational experiments.
//!
//! A project pairs a code repository with a results repository. Each run
//! gets its own results branch, a ledger row keyed by that branch, a
//! metadata bundle under `run_history/`, and a read-only snapshot of its
//! output tree. Previous runs are found again by matching configuration
//! fingerprint, code commit, and environment against the ledger.
//!
//! Typical use from experiment code:
//!
//! ```no_run
//! use runtrack::{
//!     MismatchPolicy, Options, Project, ResultLocator, RunLedger, RunRequest, RunTracker,
//!     TrackedRun,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let project = Project::open(std::path::Path::new("."))?;
//! let options = Options::new();
//! let fingerprint = options.fingerprint();
//!
//! let ledger = RunLedger::load(&project.ledger_path())?;
//! let commit = project.code().current_commit_hash()?;
//! if let Some(hit) =
//!     ResultLocator::new(&ledger).find(&fingerprint, &commit, None, MismatchPolicy::strict())
//! {
//!     println!("reusing {}", hit.branch);
//!     return Ok(());
//! }
//!
//! let mut tracker = RunTracker::new(&project);
//! let outcome = tracker.track(RunRequest::new(options), "simulation results", |out| {
//!     std::fs::write(out.join("result.csv"), "x,y\n")?;
//!     Ok(())
//! })?;
//! matches!(outcome, TrackedRun::Finished { .. });
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cache;
pub mod environment;
pub mod errors;
pub mod git;
pub mod ledger;
pub mod locator;
pub mod options;
pub mod repo;
pub mod tracker;
pub mod util;
pub mod verify;

pub use cache::SnapshotCache;
pub use environment::{Environment, Version, VersionSpec};
pub use errors::{as_track_error, TrackError};
pub use ledger::{LogEntry, RunLedger};
pub use locator::{LocatedRun, MismatchPolicy, ResultLocator};
pub use options::{OptionValue, Options};
pub use repo::{
    BranchState, CommitOutcome, ConfirmMode, Project, ProjectMetadata, RepositoryHandle,
};
pub use tracker::{
    BeginOutcome, CommandEnvironmentExporter, CommitRunOutcome, CompletedRun, EnvironmentExporter,
    RunRequest, RunTracker, TrackedRun,
};
pub use verify::{CacheManifest, ExternalCacheVerifier, PinnedEntry};
