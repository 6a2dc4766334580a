//! Error taxonomy for the version-control operator and the update tasks.
//!
//! Two conditions are deliberately *not* errors: a rebase that stops on a
//! conflict is reported through [`crate::git::RebaseOutcome`], and an update
//! that finds nothing to do is an [`crate::update::UpdateResult`] with
//! `success == false`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`crate::git::GitOperator`].
#[derive(Debug, Error)]
pub enum GitError {
    /// The remote could not be reached, or the requested branch does not
    /// exist there. Fatal for the current repository's tick.
    #[error("repository unavailable: {url} (branch {branch}): {message}")]
    RepositoryUnavailable {
        url: String,
        branch: String,
        message: String,
    },

    /// The local branch has diverged from the remote branch. Expected during
    /// submodule updates, where it triggers a forced update.
    #[error("not possible to fast-forward {branch} to {remote}/{branch}")]
    NotFastForwardable { remote: String, branch: String },

    /// git exited unsuccessfully for a reason we do not classify.
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// A git subprocess exceeded the configured timeout and was killed.
    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// The git binary could not be started or waited on.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unparseable git log record: {0}")]
    InvalidLog(String),

    #[error("invalid commit date '{value}': {source}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl GitError {
    pub fn is_not_fast_forwardable(&self) -> bool {
        matches!(self, GitError::NotFastForwardable { .. })
    }

    pub fn is_repository_unavailable(&self) -> bool {
        matches!(self, GitError::RepositoryUnavailable { .. })
    }
}

/// Errors raised while performing an update task.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Git(#[from] GitError),

    /// The superproject does not contain an initialized submodule at the
    /// configured path.
    #[error("no submodule checked out at '{0}'")]
    MissingSubmodule(String),

    #[error("invalid tag pattern '{0}': expands to an empty tag name")]
    InvalidTagPattern(String),
}

pub type Result<T, E = GitError> = std::result::Result<T, E>;
