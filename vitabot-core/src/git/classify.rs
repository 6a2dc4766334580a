//! The single table of git output patterns the operator relies on.
//!
//! Where git offers an exit code the operator uses it instead (ancestry via
//! `merge-base --is-ancestor`, conflicts via `diff --diff-filter=U`). The
//! remaining conditions are only reported as text on stderr. Those messages
//! are not stable across git versions and are translated under non-English
//! locales, so the operator forces `LC_ALL=C` and every pattern it matches on
//! lives here.

/// What a failed git invocation most likely means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitFailureKind {
    /// The remote is unreachable, does not exist, or lacks the requested ref.
    RemoteUnavailable,
    /// A merge or pull refused to fast-forward.
    NotFastForward,
    /// A merge or rebase stopped on conflicting changes.
    MergeConflict,
}

const PATTERNS: &[(&str, GitFailureKind)] = &[
    ("Could not read from remote repository", GitFailureKind::RemoteUnavailable),
    ("does not appear to be a git repository", GitFailureKind::RemoteUnavailable),
    ("Could not resolve host", GitFailureKind::RemoteUnavailable),
    ("Repository not found", GitFailureKind::RemoteUnavailable),
    ("couldn't find remote ref", GitFailureKind::RemoteUnavailable),
    ("not found in upstream origin", GitFailureKind::RemoteUnavailable),
    ("unable to access", GitFailureKind::RemoteUnavailable),
    ("does not exist", GitFailureKind::RemoteUnavailable),
    ("Not possible to fast-forward", GitFailureKind::NotFastForward),
    ("Failed to merge", GitFailureKind::MergeConflict),
    ("could not apply", GitFailureKind::MergeConflict),
    ("CONFLICT (", GitFailureKind::MergeConflict),
];

/// Classify git's diagnostic output. Returns the first matching kind in table
/// order, or `None` when nothing matches.
pub fn classify(output: &str) -> Option<GitFailureKind> {
    PATTERNS
        .iter()
        .find(|(pattern, _)| output.contains(pattern))
        .map(|(_, kind)| *kind)
}
