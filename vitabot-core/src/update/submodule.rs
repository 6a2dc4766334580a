use tracing::{info, instrument};

use super::{UpdateResult, UpdateTask};
use crate::error::UpdateError;
use crate::git::{GitOperator, ORIGIN};
use crate::metadata::TaskMetadata;
use crate::report::{UpdateKind, UpdateReport};

/// Moves a submodule to the tip of a branch of its own `origin` and commits
/// the new pointer in the superproject.
#[derive(Debug)]
pub struct SubmoduleUpdate {
    repo: GitOperator,
    repo_url: String,
    repo_branch: String,
    path: String,
    tracked_branch: String,
}

impl SubmoduleUpdate {
    pub fn new(
        repo: GitOperator,
        repo_url: impl Into<String>,
        repo_branch: impl Into<String>,
        path: impl Into<String>,
        tracked_branch: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            repo_url: repo_url.into(),
            repo_branch: repo_branch.into(),
            path: path.into(),
            tracked_branch: tracked_branch.into(),
        }
    }

    /// The superproject's operator.
    pub fn repository(&self) -> &GitOperator {
        &self.repo
    }

    pub fn submodule(&self) -> GitOperator {
        self.repo.at(self.repo.path().join(&self.path))
    }
}

impl UpdateTask for SubmoduleUpdate {
    #[instrument(skip(self), fields(path = %self.path, branch = %self.tracked_branch))]
    fn perform_update(&mut self) -> Result<UpdateResult, UpdateError> {
        self.repo.clone_or_update(&self.repo_url, &self.repo_branch)?;
        self.repo.submodule_update(&self.path)?;

        let sub = self.submodule();
        if !sub.is_repository() {
            return Err(UpdateError::MissingSubmodule(self.path.clone()));
        }

        let before_head = sub.get_head()?;

        // A submodule checkout is a detached HEAD, so the tracked branch has
        // to be recreated at the recorded commit on every run.
        sub.checkout_branch_at(&self.tracked_branch, "HEAD")?;
        sub.fetch(ORIGIN, Some(&self.tracked_branch))?;
        let upstream_head = sub.get_head_of(&format!("{}/{}", ORIGIN, self.tracked_branch))?;

        let kind = match sub.fast_forward(ORIGIN, &self.tracked_branch) {
            Ok(()) => UpdateKind::FastForward,
            Err(e) if e.is_not_fast_forwardable() => {
                info!(
                    "Submodule {} cannot be fast-forwarded, forcing it to {}",
                    self.path,
                    upstream_head.short_hash()
                );
                sub.force_update(ORIGIN, &self.tracked_branch)?;
                UpdateKind::Forced
            }
            Err(e) => return Err(e.into()),
        };

        let after_head = sub.get_head()?;
        let success = before_head.hash != after_head.hash;

        let report = UpdateReport {
            target: self.metadata(),
            previous_date: before_head.committer_date,
            upstream_date: upstream_head.committer_date,
            upstream_url: sub.remote_url(ORIGIN)?,
            upstream_branch: self.tracked_branch.clone(),
            kind,
            conflicts: None,
        };

        if success {
            self.repo.commit(&self.path, &report.commit_message())?;
            info!(
                "Updated submodule {} from {} to {}",
                self.path,
                before_head.short_hash(),
                after_head.short_hash()
            );
        } else {
            info!("Submodule {} is already up to date", self.path);
        }

        Ok(UpdateResult {
            success,
            kind,
            before_head,
            upstream_head,
            after_head,
            rebase: None,
            report,
            tag: None,
        })
    }

    fn push_branch(&self, remote: &str, branch: &str) -> Result<(), UpdateError> {
        self.repo.force_push(remote, "HEAD", branch)?;
        Ok(())
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::Submodule {
            path: self.path.clone(),
        }
    }
}
