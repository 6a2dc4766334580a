use tracing::{info, instrument, warn};

use super::{expand_tag_pattern, UpdateResult, UpdateTask, UPSTREAM};
use crate::error::UpdateError;
use crate::git::{GitOperator, RebaseOutcome};
use crate::metadata::TaskMetadata;
use crate::report::{UpdateKind, UpdateReport};

/// Rebases a local branch onto a branch of another repository.
#[derive(Debug)]
pub struct BranchUpdate {
    repo: GitOperator,
    repo_url: String,
    local_branch: String,
    upstream_url: String,
    upstream_branch: String,
    fast_forward_only: bool,
    tag_pattern: Option<String>,
    tag: Option<String>,
}

impl BranchUpdate {
    pub fn new(
        repo: GitOperator,
        repo_url: impl Into<String>,
        local_branch: impl Into<String>,
        upstream_url: impl Into<String>,
        upstream_branch: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            repo_url: repo_url.into(),
            local_branch: local_branch.into(),
            upstream_url: upstream_url.into(),
            upstream_branch: upstream_branch.into(),
            fast_forward_only: false,
            tag_pattern: None,
            tag: None,
        }
    }

    /// Only accept updates that fast-forward the local branch.
    pub fn fast_forward_only(mut self, enabled: bool) -> Self {
        self.fast_forward_only = enabled;
        self
    }

    /// Tag the updated head, see [`expand_tag_pattern`].
    pub fn with_tag_pattern(mut self, pattern: Option<String>) -> Self {
        self.tag_pattern = pattern;
        self
    }

    pub fn repository(&self) -> &GitOperator {
        &self.repo
    }

    fn upstream_ref(&self) -> String {
        format!("{}/{}", UPSTREAM, self.upstream_branch)
    }

    fn update_by_fast_forward(&self) -> Result<(UpdateKind, RebaseOutcome), UpdateError> {
        match self.repo.fast_forward(UPSTREAM, &self.upstream_branch) {
            Ok(()) => Ok((
                UpdateKind::FastForward,
                RebaseOutcome {
                    success: true,
                    message: String::new(),
                    conflicted_paths: None,
                },
            )),
            Err(e) if e.is_not_fast_forwardable() => {
                warn!(
                    "Branch {} has diverged from {} and is not fast-forwardable",
                    self.local_branch,
                    self.upstream_ref()
                );
                Ok((
                    UpdateKind::FastForward,
                    RebaseOutcome {
                        success: false,
                        message: format!(
                            "{} is not fast-forwardable to {}",
                            self.local_branch,
                            self.upstream_ref()
                        ),
                        conflicted_paths: None,
                    },
                ))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl UpdateTask for BranchUpdate {
    #[instrument(skip(self), fields(branch = %self.local_branch, upstream = %self.upstream_url))]
    fn perform_update(&mut self) -> Result<UpdateResult, UpdateError> {
        self.tag = None;
        self.repo.clone_or_update(&self.repo_url, &self.local_branch)?;
        self.repo.ensure_remote(UPSTREAM, &self.upstream_url)?;
        self.repo.fetch(UPSTREAM, Some(&self.upstream_branch))?;

        let before_head = self.repo.get_head_of(&self.local_branch)?;
        let upstream_head = self.repo.get_head_of(&self.upstream_ref())?;

        let (kind, outcome) = if self.fast_forward_only {
            self.update_by_fast_forward()?
        } else {
            let outcome = self.repo.rebase(&self.local_branch, &self.upstream_ref())?;
            let head = self.repo.get_head()?;
            let kind = if head.hash == upstream_head.hash {
                UpdateKind::FastForward
            } else {
                UpdateKind::Rebase
            };
            (kind, outcome)
        };

        let after_head = self.repo.get_head()?;
        let success = outcome.success && before_head.hash != after_head.hash;

        if success {
            if let Some(pattern) = &self.tag_pattern {
                let tag = expand_tag_pattern(pattern, &upstream_head)?;
                self.repo.tag(&tag, "HEAD")?;
                self.tag = Some(tag);
            }
            info!(
                "Updated branch {} from {} to {}",
                self.local_branch,
                before_head.short_hash(),
                after_head.short_hash()
            );
        } else if !outcome.success {
            info!("Branch {} could not be updated: {}", self.local_branch, outcome.message);
        } else {
            info!("Branch {} is already up to date", self.local_branch);
        }

        let report = UpdateReport {
            target: self.metadata(),
            previous_date: before_head.committer_date,
            upstream_date: upstream_head.committer_date,
            upstream_url: self.upstream_url.clone(),
            upstream_branch: self.upstream_branch.clone(),
            kind,
            conflicts: outcome.conflicted_paths.clone(),
        };

        Ok(UpdateResult {
            success,
            kind,
            before_head,
            upstream_head,
            after_head,
            rebase: Some(outcome),
            report,
            tag: self.tag.clone(),
        })
    }

    fn push_branch(&self, remote: &str, branch: &str) -> Result<(), UpdateError> {
        self.repo.force_push(remote, "HEAD", branch)?;
        if let Some(tag) = &self.tag {
            self.repo.push_tag(remote, tag)?;
        }
        Ok(())
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::Branch {
            name: self.local_branch.clone(),
        }
    }
}
