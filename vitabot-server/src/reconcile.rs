//! Maps a finished update onto exactly one open pull request per task.
//!
//! Which pull request represents which task is recorded only in the hidden
//! metadata block of its body, so the search runs against the hosting
//! service on every run.

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, info};
use vitabot_core::metadata::{with_data, MetadataError};
use vitabot_core::{BotIdentity, TaskMetadata, UpdateReport};

use crate::remote::{NewPullRequest, PullRequest, RemoteRepositoryApi};
use crate::resolver::WorkingCopy;

/// Numbered suffixes tried after the dated branch name.
pub const MAX_BRANCH_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no free branch name for {base} after {} numbered attempts", MAX_BRANCH_SUFFIX)]
    BranchNameExhausted { base: String },

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// An open pull request the bot opened earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRecord {
    pub number: u64,
    pub head_branch: String,
    pub metadata: Option<TaskMetadata>,
}

impl From<&PullRequest> for PullRequestRecord {
    fn from(pr: &PullRequest) -> Self {
        Self {
            number: pr.number,
            head_branch: pr.head.ref_name.clone(),
            metadata: pr.body.as_deref().and_then(TaskMetadata::from_body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    CreatedNew { number: u64 },
    UpdatedExisting { number: u64, comment_id: u64 },
}

pub struct Reconciler<'a> {
    /// Acts on the target repository, where pull requests are opened.
    api: &'a dyn RemoteRepositoryApi,
    /// Acts on the bot's fork, where branches are pushed.
    fork_api: &'a dyn RemoteRepositoryApi,
    bot: &'a BotIdentity,
    owner: &'a str,
    repo: &'a str,
    target_branch: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        api: &'a dyn RemoteRepositoryApi,
        fork_api: &'a dyn RemoteRepositoryApi,
        bot: &'a BotIdentity,
        owner: &'a str,
        repo: &'a str,
        target_branch: &'a str,
    ) -> Self {
        Self {
            api,
            fork_api,
            bot,
            owner,
            repo,
            target_branch,
        }
    }

    /// The first open pull request from the bot whose metadata matches
    /// `task`.
    pub async fn find_existing(
        &self,
        task: &TaskMetadata,
    ) -> Result<Option<PullRequestRecord>, ReconcileError> {
        let prs = self
            .api
            .list_pull_requests(self.owner, self.repo, "open")
            .await?;

        let found = prs
            .iter()
            .filter(|pr| self.opened_by_bot(pr))
            .map(PullRequestRecord::from)
            .find(|record| record.metadata.as_ref() == Some(task));

        match &found {
            Some(record) => debug!(
                "Found open pull request #{} for {}",
                record.number,
                task.describe()
            ),
            None => debug!("No open pull request for {}", task.describe()),
        }
        Ok(found)
    }

    /// A branch name for a new pull request that does not exist in `fork`.
    pub async fn branch_name(
        &self,
        fork: &WorkingCopy,
        report: &UpdateReport,
    ) -> Result<String, ReconcileError> {
        let existing: HashSet<String> = self
            .fork_api
            .list_branches(&fork.remote_owner, &fork.remote_repo)
            .await?
            .into_iter()
            .map(|b| b.name)
            .collect();
        choose_branch_name(&base_branch_name(&report.target), &report.upstream_day(), &existing)
    }

    /// Open a pull request for `head_branch`, or comment on `existing`.
    pub async fn propose(
        &self,
        existing: Option<&PullRequestRecord>,
        fork: &WorkingCopy,
        head_branch: &str,
        report: &UpdateReport,
    ) -> Result<Proposal, ReconcileError> {
        if let Some(existing) = existing {
            let comment = self
                .api
                .create_issue_comment(
                    self.owner,
                    self.repo,
                    existing.number,
                    &report.follow_up_comment(),
                )
                .await?;
            info!(
                "Updated existing pull request #{} in {}/{}",
                existing.number, self.owner, self.repo
            );
            return Ok(Proposal::UpdatedExisting {
                number: existing.number,
                comment_id: comment.id,
            });
        }

        let request = NewPullRequest {
            title: report.title(),
            head: format!("{}:{}", fork.remote_owner, head_branch),
            base: self.target_branch.to_string(),
            body: with_data(&report.pull_request_body(), &report.target)?,
        };
        let pr = self
            .api
            .create_pull_request(self.owner, self.repo, &request)
            .await?;
        Ok(Proposal::CreatedNew { number: pr.number })
    }

    /// Describe a conflicting update on its open pull request. Returns the
    /// comment id, or `None` when there is no pull request to comment on.
    pub async fn report_conflict(
        &self,
        existing: Option<&PullRequestRecord>,
        report: &UpdateReport,
    ) -> Result<Option<u64>, ReconcileError> {
        let Some(existing) = existing else {
            return Ok(None);
        };
        let comment = self
            .api
            .create_issue_comment(
                self.owner,
                self.repo,
                existing.number,
                &report.conflict_comment(),
            )
            .await?;
        Ok(Some(comment.id))
    }

    fn opened_by_bot(&self, pr: &PullRequest) -> bool {
        pr.user.login == self.bot.account
            || pr
                .head
                .user
                .as_ref()
                .is_some_and(|u| u.login == self.bot.account)
    }
}

/// `update-<path>` for submodules and `update-branch-<name>` for branches,
/// with slashes turned into dashes.
pub fn base_branch_name(task: &TaskMetadata) -> String {
    match task {
        TaskMetadata::Submodule { path } => format!("update-{}", path.replace('/', "-")),
        TaskMetadata::Branch { name } => format!("update-branch-{}", name.replace('/', "-")),
    }
}

/// First of `base`, `base-<day>`, `base-<day>-1`, `base-<day>-2`, ... not in
/// `existing`.
pub fn choose_branch_name(
    base: &str,
    day: &str,
    existing: &HashSet<String>,
) -> Result<String, ReconcileError> {
    if !existing.contains(base) {
        return Ok(base.to_string());
    }

    let dated = format!("{}-{}", base, day);
    if !existing.contains(&dated) {
        return Ok(dated);
    }

    (1..=MAX_BRANCH_SUFFIX)
        .map(|n| format!("{}-{}", dated, n))
        .find(|name| !existing.contains(name))
        .ok_or_else(|| ReconcileError::BranchNameExhausted {
            base: base.to_string(),
        })
}
