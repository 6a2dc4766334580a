//! Update tasks: one complete update cycle for one tracked submodule or
//! branch, composed from [`GitOperator`] primitives.

mod branch;
mod submodule;

pub use branch::BranchUpdate;
pub use submodule::SubmoduleUpdate;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::git::{CommitSnapshot, GitOperator, RebaseOutcome};
use crate::metadata::TaskMetadata;
use crate::report::{UpdateKind, UpdateReport};

/// Remote name under which a branch update's upstream is fetched.
pub const UPSTREAM: &str = "upstream";

/// What to keep in sync, as configured for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UpdateTarget {
    Submodule {
        path: String,
        /// Branch of the submodule's own `origin` to follow.
        tracked_branch: String,
    },
    Branch {
        upstream_url: String,
        upstream_branch: String,
        local_branch: String,
        #[serde(default)]
        fast_forward_only: bool,
        #[serde(default)]
        tag_pattern: Option<String>,
    },
}

impl UpdateTarget {
    pub fn metadata(&self) -> TaskMetadata {
        match self {
            UpdateTarget::Submodule { path, .. } => TaskMetadata::Submodule { path: path.clone() },
            UpdateTarget::Branch { local_branch, .. } => TaskMetadata::Branch {
                name: local_branch.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// An effective change happened and is ready to be pushed. `false` with
    /// no rebase failure simply means there was nothing to do.
    pub success: bool,
    pub kind: UpdateKind,
    pub before_head: CommitSnapshot,
    pub upstream_head: CommitSnapshot,
    pub after_head: CommitSnapshot,
    /// Set for branch updates.
    pub rebase: Option<RebaseOutcome>,
    pub report: UpdateReport,
    /// Tag created after a successful branch update.
    pub tag: Option<String>,
}

impl UpdateResult {
    pub fn forced(&self) -> bool {
        self.kind == UpdateKind::Forced
    }

    /// The update was attempted but stopped on conflicts.
    pub fn conflicted(&self) -> bool {
        self.rebase
            .as_ref()
            .is_some_and(|r| !r.success && r.conflicted_paths.is_some())
    }
}

pub trait UpdateTask {
    /// Bring the working copy up to date. Leaves the tree holding the
    /// change, ready for [`UpdateTask::push_branch`].
    fn perform_update(&mut self) -> Result<UpdateResult, UpdateError>;

    /// Force-push the updated tree to `branch` on `remote` (a URL or remote
    /// name), together with any tag the update created.
    fn push_branch(&self, remote: &str, branch: &str) -> Result<(), UpdateError>;

    fn metadata(&self) -> TaskMetadata;
}

/// Either kind of update task, as built from an [`UpdateTarget`].
#[derive(Debug)]
pub enum UpdateJob {
    Submodule(SubmoduleUpdate),
    Branch(BranchUpdate),
}

impl UpdateJob {
    /// `repo_url`/`repo_branch` name the repository the working copy at
    /// `operator.path()` is cloned from and the branch it sits on.
    /// Branch updates work on their own local branch instead.
    pub fn new(
        operator: GitOperator,
        repo_url: impl Into<String>,
        repo_branch: impl Into<String>,
        target: &UpdateTarget,
    ) -> Self {
        match target {
            UpdateTarget::Submodule {
                path,
                tracked_branch,
            } => UpdateJob::Submodule(SubmoduleUpdate::new(
                operator,
                repo_url,
                repo_branch,
                path.clone(),
                tracked_branch.clone(),
            )),
            UpdateTarget::Branch {
                upstream_url,
                upstream_branch,
                local_branch,
                fast_forward_only,
                tag_pattern,
            } => UpdateJob::Branch(
                BranchUpdate::new(
                    operator,
                    repo_url,
                    local_branch.clone(),
                    upstream_url.clone(),
                    upstream_branch.clone(),
                )
                .fast_forward_only(*fast_forward_only)
                .with_tag_pattern(tag_pattern.clone()),
            ),
        }
    }

    pub fn path(&self) -> PathBuf {
        match self {
            UpdateJob::Submodule(task) => task.repository().path().to_path_buf(),
            UpdateJob::Branch(task) => task.repository().path().to_path_buf(),
        }
    }
}

impl UpdateTask for UpdateJob {
    fn perform_update(&mut self) -> Result<UpdateResult, UpdateError> {
        match self {
            UpdateJob::Submodule(task) => task.perform_update(),
            UpdateJob::Branch(task) => task.perform_update(),
        }
    }

    fn push_branch(&self, remote: &str, branch: &str) -> Result<(), UpdateError> {
        match self {
            UpdateJob::Submodule(task) => task.push_branch(remote, branch),
            UpdateJob::Branch(task) => task.push_branch(remote, branch),
        }
    }

    fn metadata(&self) -> TaskMetadata {
        match self {
            UpdateJob::Submodule(task) => task.metadata(),
            UpdateJob::Branch(task) => task.metadata(),
        }
    }
}

/// Expand `{date}` (UTC date of `upstream`, `YYYY-MM-DD`) and `{short}`
/// (first 8 hex digits of its hash) in a tag pattern.
pub fn expand_tag_pattern(pattern: &str, upstream: &CommitSnapshot) -> Result<String, UpdateError> {
    let date = upstream.date_utc().format("%Y-%m-%d").to_string();
    let tag = pattern
        .replace("{date}", &date)
        .replace("{short}", upstream.short_hash())
        .trim()
        .to_string();
    if tag.is_empty() {
        return Err(UpdateError::InvalidTagPattern(pattern.to_string()));
    }
    Ok(tag)
}
