//! End-to-end tracking tests over real git repositories.

mod common;

use common::ProjectFixture;

use anyhow::anyhow;
use runtrack::{
    as_track_error, BeginOutcome, CommitRunOutcome, ConfirmMode, MismatchPolicy, OptionValue,
    Options, ResultLocator, RunRequest, RunTracker, SnapshotCache, TrackError,
};

fn forced_request(options: Options) -> RunRequest {
    let mut request = RunRequest::new(options);
    request.confirm = ConfirmMode::Force;
    request
}

#[test]
fn end_to_end_run_is_logged_and_findable() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let outcome = tracker
        .begin(forced_request(Options::new()))
        .expect("begin run");
    let BeginOutcome::Branch(branch) = outcome else {
        panic!("expected a results branch, got {outcome:?}");
    };
    std::fs::write(fixture.results_path().join("a.txt"), "1").unwrap();
    let committed = tracker.commit_run("first", None).expect("commit run");
    let CommitRunOutcome::Logged(run) = committed else {
        panic!("expected a logged run");
    };
    assert_eq!(run.branch, branch);

    let cache = SnapshotCache::new(&project);
    let ledger = cache.ledger().expect("load ledger from main snapshot");
    assert_eq!(ledger.len(), 1);
    let entry = ledger.get(&branch).expect("ledger row for branch");
    assert_eq!(entry.commit_message, "first");
    assert_eq!(entry.options_fingerprint, Options::new().fingerprint());
    assert_eq!(entry.output_commit_hash, run.output_commit);

    // run_history on main carries the metadata bundle for the branch.
    let history = project.snapshot_root().join("main").join("run_history").join(&branch);
    assert!(history.join("metadata.json").exists());
    assert!(history.join("code.zip").exists());

    // The same options and commit find the run again; different options
    // find nothing.
    let commit = project.code().current_commit_hash().unwrap();
    let located = ResultLocator::new(&ledger)
        .find(
            &Options::new().fingerprint(),
            &commit,
            None,
            MismatchPolicy::strict(),
        )
        .expect("previous run found");
    assert_eq!(located.branch, branch);
    assert!(located.is_exact());

    let mut other = Options::new();
    other.insert("n_samples", OptionValue::from_i64(200));
    let missing = ResultLocator::new(&ledger).find(
        &other.fingerprint(),
        &commit,
        None,
        MismatchPolicy::strict(),
    );
    assert!(missing.is_none());
}

#[test]
fn excluded_option_keys_reuse_the_same_run() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let mut options = Options::new();
    options.insert("n_samples", OptionValue::from_i64(100));
    tracker.begin(forced_request(options)).expect("begin run");
    std::fs::write(fixture.results_path().join("a.txt"), "1").unwrap();
    tracker.commit_run("first", None).expect("commit run");

    let mut same_but_noisy = Options::new();
    same_but_noisy.insert("n_samples", OptionValue::from_i64(100));
    same_but_noisy.insert("commit_message", OptionValue::from_text("different"));
    same_but_noisy.insert("push", OptionValue::Bool(true));

    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    let commit = project.code().current_commit_hash().unwrap();
    let located = ResultLocator::new(&ledger).find(
        &same_but_noisy.fingerprint(),
        &commit,
        None,
        MismatchPolicy::strict(),
    );
    assert!(located.is_some());
}

#[test]
fn concurrent_code_change_fails_commit_and_leaves_no_entry() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    tracker
        .begin(forced_request(Options::new()))
        .expect("begin run");
    fixture.commit_code_change("main.py", "print('changed mid-run')\n");
    std::fs::write(fixture.results_path().join("a.txt"), "1").unwrap();

    let err = tracker.commit_run("first", None).unwrap_err();
    match as_track_error(&err) {
        Some(TrackError::ConcurrentModification { entered, current }) => {
            assert_ne!(entered, current);
        }
        other => panic!("expected ConcurrentModification, got {other:?}"),
    }
    tracker.abort(&err).expect("abort failed run");

    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    assert!(ledger.is_empty());
}

#[test]
fn uncommitted_code_edit_fails_commit_and_leaves_no_entry() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    tracker
        .begin(forced_request(Options::new()))
        .expect("begin run");
    // Edit a tracked code file mid-run without committing it.
    std::fs::write(fixture.code_path.join("main.py"), "print('edited mid-run')\n").unwrap();
    std::fs::write(fixture.results_path().join("a.txt"), "1").unwrap();

    let err = tracker.commit_run("first", None).unwrap_err();
    match as_track_error(&err) {
        Some(TrackError::ConcurrentModification { entered, current }) => {
            assert_ne!(entered, current);
            assert!(current.contains("uncommitted"));
        }
        other => panic!("expected ConcurrentModification, got {other:?}"),
    }
    tracker.abort(&err).expect("abort failed run");

    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    assert!(ledger.is_empty());
}

#[test]
fn empty_run_is_rejected_and_branch_removed() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let BeginOutcome::Branch(branch) = tracker
        .begin(forced_request(Options::new()))
        .expect("begin run")
    else {
        panic!("expected a branch");
    };
    let err = tracker.commit_run("nothing", None).unwrap_err();
    assert!(matches!(
        as_track_error(&err),
        Some(TrackError::NoOutputProduced { .. })
    ));

    let branches = common::run_git(&fixture.results_path(), &["branch", "--list"]);
    assert!(!branches.contains(&branch), "empty branch should be deleted");

    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    assert!(ledger.is_empty());
}

#[test]
fn snapshot_is_read_only_and_idempotent() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let BeginOutcome::Branch(branch) = tracker
        .begin(forced_request(Options::new()))
        .expect("begin run")
    else {
        panic!("expected a branch");
    };
    std::fs::write(fixture.results_path().join("a.txt"), "1").unwrap();
    tracker.commit_run("first", None).expect("commit run");

    let cache = SnapshotCache::new(&project);
    let snapshot = cache.snapshot_path(&branch);
    let file = snapshot.join("a.txt");
    assert!(file.exists());
    let permissions = std::fs::metadata(&file).unwrap().permissions();
    assert!(permissions.readonly(), "snapshot files must be read-only");

    let before = std::fs::metadata(&file).unwrap().modified().unwrap();
    let again = cache.materialize(&branch).expect("second materialize");
    assert_eq!(again, snapshot);
    let after = std::fs::metadata(&file).unwrap().modified().unwrap();
    assert_eq!(before, after, "existing snapshots must not be recopied");
}

#[test]
fn debug_mode_tracks_nothing() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let mut options = Options::new();
    options.insert("debug", OptionValue::Bool(true));
    let outcome = tracker.begin(forced_request(options)).expect("begin run");
    assert_eq!(outcome, BeginOutcome::Debug);

    std::fs::write(fixture.results_path().join("scratch.txt"), "x").unwrap();
    let committed = tracker.commit_run("debug", None).expect("commit run");
    assert_eq!(committed, CommitRunOutcome::Skipped);

    let branches = common::run_git(&fixture.results_path(), &["branch", "--list"]);
    assert_eq!(branches.trim_start_matches("* "), "main");
}

#[test]
fn dirty_code_repository_blocks_begin() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    std::fs::write(fixture.code_path.join("main.py"), "print('uncommitted')\n").unwrap();
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let err = tracker.begin(forced_request(Options::new())).unwrap_err();
    assert!(matches!(
        as_track_error(&err),
        Some(TrackError::DirtyState { .. })
    ));
}

#[test]
fn aborted_run_keeps_branch_with_error_trace() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let BeginOutcome::Branch(branch) = tracker
        .begin(forced_request(Options::new()))
        .expect("begin run")
    else {
        panic!("expected a branch");
    };
    std::fs::write(fixture.results_path().join("partial.txt"), "incomplete").unwrap();
    tracker
        .abort(&anyhow!("simulation diverged"))
        .expect("abort run");

    let branches = common::run_git(&fixture.results_path(), &["branch", "--list"]);
    assert!(branches.contains(&branch), "failed branch must be kept");
    let tree = common::run_git(
        &fixture.results_path(),
        &["ls-tree", "--name-only", &branch],
    );
    assert!(tree.contains("error.trace"));
    assert!(tree.contains("partial.txt"));

    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    assert!(ledger.is_empty(), "aborted runs never enter the ledger");
}

#[test]
fn track_closure_aborts_on_error() {
    let Some(fixture) = ProjectFixture::create() else {
        return;
    };
    let project = fixture.open_project();
    let mut tracker = RunTracker::new(&project);

    let err = tracker
        .track(forced_request(Options::new()), "never logged", |out| {
            std::fs::write(out.join("partial.txt"), "incomplete")?;
            Err::<(), _>(anyhow!("boom"))
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");

    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    assert!(ledger.is_empty());

    // A new run can start immediately afterwards.
    let mut options = Options::new();
    options.insert("attempt", OptionValue::from_i64(2));
    let outcome = tracker
        .track(forced_request(options), "second attempt", |out| {
            std::fs::write(out.join("a.txt"), "2")?;
            Ok(())
        })
        .expect("second tracked run");
    assert!(matches!(
        outcome,
        runtrack::TrackedRun::Finished {
            outcome: CommitRunOutcome::Logged(_),
            ..
        }
    ));
    let ledger = SnapshotCache::new(&project).ledger().unwrap();
    assert_eq!(ledger.len(), 1);
}
