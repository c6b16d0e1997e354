//! Lookup of previously completed runs in the ledger.
//!
//! The locator answers "has this exact run already happened?" by matching
//! a configuration fingerprint, a code commit, and an environment
//! requirement against ledger rows. Callers may explicitly relax individual
//! predicates to reuse near-matching results; this is a deliberately lossy
//! cache lookup that trades strict reproducibility for iteration speed, and
//! every relaxation is reported rather than hidden.

use crate::environment::Environment;
use crate::ledger::{LogEntry, RunLedger};

/// Which match predicates the caller permits to fail.
///
/// Nothing is relaxed by default; in particular an environment mismatch is
/// never tolerated without explicit permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MismatchPolicy {
    pub allow_commit_mismatch: bool,
    pub allow_fingerprint_mismatch: bool,
    pub allow_environment_mismatch: bool,
}

impl MismatchPolicy {
    pub fn strict() -> Self {
        Self::default()
    }
}

/// A ledger hit, with an explanation of any predicates that were relaxed
/// to accept it. An empty `relaxations` means an exact match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedRun {
    pub branch: String,
    pub relaxations: Vec<String>,
}

impl LocatedRun {
    pub fn is_exact(&self) -> bool {
        self.relaxations.is_empty()
    }
}

/// Matches runs in `ledger` against a required fingerprint, code commit,
/// and optional environment.
#[derive(Debug)]
pub struct ResultLocator<'a> {
    ledger: &'a RunLedger,
}

impl<'a> ResultLocator<'a> {
    pub fn new(ledger: &'a RunLedger) -> Self {
        Self { ledger }
    }

    /// Finds the most recent run matching all three predicates, or --
    /// failing that -- the most recent run whose only violated predicates
    /// are all permitted by `policy`. Returns `None` when nothing
    /// qualifies.
    ///
    /// The relaxed pass takes the first qualifying entry in reverse append
    /// order without ranking candidates by how many predicates they
    /// violate, so an older entry with more (permitted) mismatches can win
    /// over a newer one that scan order reaches later.
    pub fn find(
        &self,
        fingerprint: &str,
        code_commit: &str,
        required_env: Option<&Environment>,
        policy: MismatchPolicy,
    ) -> Option<LocatedRun> {
        for entry in self.ledger.entries().rev() {
            if self.violations(entry, fingerprint, code_commit, required_env).is_empty() {
                tracing::info!(branch = %entry.branch, "found exact previous run");
                return Some(LocatedRun {
                    branch: entry.branch.clone(),
                    relaxations: Vec::new(),
                });
            }
        }

        if policy == MismatchPolicy::strict() {
            return None;
        }

        for entry in self.ledger.entries().rev() {
            let violations = self.violations(entry, fingerprint, code_commit, required_env);
            if violations.is_empty() {
                continue;
            }
            if violations.iter().all(|violation| violation.permitted(policy)) {
                let relaxations: Vec<String> = violations
                    .iter()
                    .map(|violation| violation.describe(entry))
                    .collect();
                for relaxation in &relaxations {
                    tracing::warn!(branch = %entry.branch, "{relaxation}");
                }
                return Some(LocatedRun {
                    branch: entry.branch.clone(),
                    relaxations,
                });
            }
        }
        None
    }

    fn violations(
        &self,
        entry: &LogEntry,
        fingerprint: &str,
        code_commit: &str,
        required_env: Option<&Environment>,
    ) -> Vec<Violation> {
        let mut violations = Vec::new();
        if !entry.matches_fingerprint(fingerprint) {
            violations.push(Violation::Fingerprint);
        }
        if !entry.matches_project_commit(code_commit) {
            violations.push(Violation::CodeCommit);
        }
        if !entry.fulfils_environment(required_env) {
            violations.push(Violation::Environment);
        }
        violations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Violation {
    Fingerprint,
    CodeCommit,
    Environment,
}

impl Violation {
    fn permitted(self, policy: MismatchPolicy) -> bool {
        match self {
            Violation::Fingerprint => policy.allow_fingerprint_mismatch,
            Violation::CodeCommit => policy.allow_commit_mismatch,
            Violation::Environment => policy.allow_environment_mismatch,
        }
    }

    fn describe(self, entry: &LogEntry) -> String {
        match self {
            Violation::Fingerprint => format!(
                "accepted run {} despite differing options (recorded fingerprint {})",
                entry.branch, entry.options_fingerprint
            ),
            Violation::CodeCommit => format!(
                "accepted run {} despite differing code (recorded commit {})",
                entry.branch, entry.project_commit_hash
            ),
            Violation::Environment => format!(
                "accepted run {} despite an environment that does not satisfy the requirement",
                entry.branch
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LogEntry;

    fn entry(branch: &str, commit: &str, fingerprint: &str) -> LogEntry {
        LogEntry::new(
            "run".to_string(),
            branch.to_string(),
            format!("out-{branch}"),
            commit.to_string(),
            "project".to_string(),
            String::new(),
            String::new(),
            String::new(),
            fingerprint.to_string(),
        )
    }

    fn ledger(entries: Vec<LogEntry>) -> RunLedger {
        RunLedger::from_entries(entries)
    }

    #[test]
    fn newest_exact_match_wins() {
        let ledger = ledger(vec![
            entry("b1", "commit-a", "fp-a"),
            entry("b2", "commit-a", "fp-a"),
        ]);
        let located = ResultLocator::new(&ledger)
            .find("fp-a", "commit-a", None, MismatchPolicy::strict())
            .unwrap();
        assert_eq!(located.branch, "b2");
        assert!(located.is_exact());
    }

    #[test]
    fn strict_policy_rejects_near_matches() {
        let ledger = ledger(vec![entry("b1", "commit-a", "fp-a")]);
        let located = ResultLocator::new(&ledger).find(
            "fp-b",
            "commit-a",
            None,
            MismatchPolicy::strict(),
        );
        assert!(located.is_none());
    }

    #[test]
    fn permitted_relaxation_is_reported() {
        let ledger = ledger(vec![entry("b1", "commit-old", "fp-a")]);
        let policy = MismatchPolicy {
            allow_commit_mismatch: true,
            ..MismatchPolicy::default()
        };
        let located = ResultLocator::new(&ledger)
            .find("fp-a", "commit-new", None, policy)
            .unwrap();
        assert_eq!(located.branch, "b1");
        assert_eq!(located.relaxations.len(), 1);
        assert!(located.relaxations[0].contains("commit-old"));
    }

    #[test]
    fn unpermitted_violation_disqualifies_entry() {
        let ledger = ledger(vec![entry("b1", "commit-old", "fp-old")]);
        let policy = MismatchPolicy {
            allow_commit_mismatch: true,
            ..MismatchPolicy::default()
        };
        let located = ResultLocator::new(&ledger).find("fp-new", "commit-new", None, policy);
        assert!(located.is_none());
    }

    #[test]
    fn newer_environment_mismatch_beats_older_commit_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(crate::ledger::LEDGER_FILE_NAME);
        RunLedger::append(&path, &entry("b_old", "commit-old", "fp-a")).unwrap();
        RunLedger::append(&path, &entry("b_new", "commit-a", "fp-a")).unwrap();
        for (branch, version) in [("b_old", "2.0.0"), ("b_new", "1.26.0")] {
            let side = dir
                .path()
                .join(crate::ledger::RUN_HISTORY_DIR)
                .join(branch);
            std::fs::create_dir_all(&side).unwrap();
            std::fs::write(
                side.join(crate::ledger::ENVIRONMENT_FILE_NAME),
                format!("dependencies:\n  - numpy={version}=py\n"),
            )
            .unwrap();
        }

        let ledger = RunLedger::load(&path).unwrap();
        let required = Environment::from_pairs([("numpy", "2.0.0")]);
        let policy = MismatchPolicy {
            allow_commit_mismatch: true,
            allow_fingerprint_mismatch: false,
            allow_environment_mismatch: true,
        };
        let located = ResultLocator::new(&ledger)
            .find("fp-a", "commit-a", Some(&required), policy)
            .unwrap();
        assert_eq!(located.branch, "b_new");
        assert!(located.relaxations[0].contains("environment"));
    }

    #[test]
    fn relaxed_pass_prefers_most_recent_qualifying_entry() {
        // Older entry mismatches on commit, newer on fingerprint; with both
        // relaxations permitted the newer one wins.
        let ledger = ledger(vec![
            entry("b-commit-off", "commit-old", "fp-a"),
            entry("b-fp-off", "commit-a", "fp-other"),
        ]);
        let policy = MismatchPolicy {
            allow_commit_mismatch: true,
            allow_fingerprint_mismatch: true,
            allow_environment_mismatch: false,
        };
        let located = ResultLocator::new(&ledger)
            .find("fp-a", "commit-a", None, policy)
            .unwrap();
        assert_eq!(located.branch, "b-fp-off");
    }
}
