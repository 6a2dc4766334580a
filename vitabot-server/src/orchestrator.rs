//! Runs every configured update task of a repository: resolve the fork,
//! update the working copy, push, and reconcile with open pull requests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;
use vitabot_core::{BotIdentity, GitOperator, TaskMetadata, UpdateJob, UpdateTarget, UpdateTask};

use crate::config::ProjectConfigSource;
use crate::logging::CORRELATION_ID;
use crate::reconcile::{Proposal, Reconciler};
use crate::remote::{Installation, InstallationSource, RemoteRepositoryApi, RepositoryRef};
use crate::resolver::{ForkResolver, WorkingCopy};
use crate::scheduler::RepositoryHandler;

/// What happened to one update task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Pushed and proposed.
    Proposed(Proposal),
    /// Stopped on conflicts. Carries the id of the comment describing them,
    /// if there was an open pull request to put it on.
    Conflicted { comment_id: Option<u64> },
    /// Nothing to push.
    Unchanged,
}

/// Result of processing one repository.
#[derive(Debug, Default)]
pub struct RepositoryRun {
    pub outcomes: Vec<(TaskMetadata, TaskOutcome)>,
    pub failures: Vec<(TaskMetadata, anyhow::Error)>,
}

pub struct Orchestrator {
    installations: Arc<dyn InstallationSource>,
    configs: Arc<dyn ProjectConfigSource>,
    bot: BotIdentity,
    working_copy_root: PathBuf,
    git_timeout: Option<Duration>,
    git_config: Vec<(String, String)>,
    /// API of the installation on the bot's own account, found on first use.
    bot_api: OnceCell<Arc<dyn RemoteRepositoryApi>>,
}

impl Orchestrator {
    pub fn new(
        installations: Arc<dyn InstallationSource>,
        configs: Arc<dyn ProjectConfigSource>,
        bot: BotIdentity,
        working_copy_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            installations,
            configs,
            bot,
            working_copy_root: working_copy_root.into(),
            git_timeout: None,
            git_config: Vec::new(),
            bot_api: OnceCell::new(),
        }
    }

    pub fn with_git_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.git_timeout = timeout;
        self
    }

    /// Extra `-c key=value` for every git invocation.
    pub fn with_git_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.git_config.push((key.into(), value.into()));
        self
    }

    async fn bot_api(&self) -> Result<Arc<dyn RemoteRepositoryApi>> {
        let api = self
            .bot_api
            .get_or_try_init(|| async {
                let installation = self
                    .installations
                    .list_installations()
                    .await?
                    .into_iter()
                    .find(|i| i.account.login == self.bot.account)
                    .ok_or_else(|| {
                        anyhow!("App is not installed on bot account {}", self.bot.account)
                    })?;
                info!(
                    "Using installation {} for bot account {}",
                    installation.id, self.bot.account
                );
                Ok::<_, anyhow::Error>(self.installations.installation_api(installation.id))
            })
            .await?;
        Ok(api.clone())
    }

    fn operator(&self, working_copy: &WorkingCopy) -> GitOperator {
        self.git_config.iter().fold(
            GitOperator::new(&working_copy.path, self.bot.clone()).with_timeout(self.git_timeout),
            |operator, (key, value)| operator.with_config(key.clone(), value.clone()),
        )
    }

    /// Run every configured task of `repository` in order. A failing task is
    /// recorded and does not stop the ones after it.
    pub async fn process_repository(
        &self,
        installation: &Installation,
        repository: &RepositoryRef,
    ) -> Result<RepositoryRun> {
        let mut run = RepositoryRun::default();

        let Some(config) = self
            .configs
            .project_config(&repository.owner, &repository.name)
            .await?
        else {
            debug!("No configuration for {}, skipping", repository.full_name());
            return Ok(run);
        };

        let targets = config.targets();
        if targets.is_empty() {
            debug!("Nothing configured to update in {}", repository.full_name());
            return Ok(run);
        }

        let api = self.installations.installation_api(installation.id);
        let bot_api = self.bot_api().await?;

        let working_copy = ForkResolver::new(
            api.as_ref(),
            bot_api.as_ref(),
            &self.bot,
            &self.working_copy_root,
        )
        .resolve(&repository.owner, &repository.name)
        .await
        .with_context(|| format!("Failed to resolve fork of {}", repository.full_name()))?;

        let reconciler = Reconciler::new(
            api.as_ref(),
            bot_api.as_ref(),
            &self.bot,
            &repository.owner,
            &repository.name,
            &config.target_branch,
        );

        for target in &targets {
            let task = target.metadata();
            match self
                .run_task(&reconciler, repository, &working_copy, &config.target_branch, target)
                .await
            {
                Ok(outcome) => run.outcomes.push((task, outcome)),
                Err(e) => {
                    warn!("Updating {} in {} failed: {:#}", task.describe(), repository.full_name(), e);
                    run.failures.push((task, e));
                }
            }
        }

        Ok(run)
    }

    async fn run_task(
        &self,
        reconciler: &Reconciler<'_>,
        repository: &RepositoryRef,
        working_copy: &WorkingCopy,
        target_branch: &str,
        target: &UpdateTarget,
    ) -> Result<TaskOutcome> {
        let task = target.metadata();
        let mut job = UpdateJob::new(
            self.operator(working_copy),
            repository.clone_url.clone(),
            target_branch,
            target,
        );

        let (job, result) = tokio::task::spawn_blocking(move || {
            let result = job.perform_update();
            (job, result)
        })
        .await
        .context("Update task panicked")?;
        let result = result?;

        if result.success {
            let existing = reconciler.find_existing(&task).await?;
            let branch = match &existing {
                Some(record) => record.head_branch.clone(),
                None => reconciler.branch_name(working_copy, &result.report).await?,
            };

            let push_url = working_copy.push_url.clone();
            let push_branch = branch.clone();
            tokio::task::spawn_blocking(move || job.push_branch(&push_url, &push_branch))
                .await
                .context("Push panicked")??;

            let proposal = reconciler
                .propose(existing.as_ref(), working_copy, &branch, &result.report)
                .await?;
            match &proposal {
                Proposal::CreatedNew { number } => info!(
                    "Opened pull request #{} for {} in {}",
                    number,
                    task.describe(),
                    repository.full_name()
                ),
                Proposal::UpdatedExisting { number, .. } => info!(
                    "Pushed {} to pull request #{} in {}",
                    task.describe(),
                    number,
                    repository.full_name()
                ),
            }
            return Ok(TaskOutcome::Proposed(proposal));
        }

        if result.conflicted() {
            let existing = reconciler.find_existing(&task).await?;
            let comment_id = reconciler
                .report_conflict(existing.as_ref(), &result.report)
                .await?;
            if comment_id.is_none() {
                warn!(
                    "Update of {} in {} conflicts in {:?} and there is no open pull request to report it on",
                    task.describe(),
                    repository.full_name(),
                    result.report.conflicts.as_deref().unwrap_or_default()
                );
            }
            return Ok(TaskOutcome::Conflicted { comment_id });
        }

        debug!("Nothing to do for {} in {}", task.describe(), repository.full_name());
        Ok(TaskOutcome::Unchanged)
    }
}

#[async_trait]
impl RepositoryHandler for Orchestrator {
    async fn process(&self, installation: Installation, repository: RepositoryRef) -> Result<()> {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "repository",
            repository = %repository.full_name(),
            correlation_id = %correlation_id
        );

        let run = CORRELATION_ID
            .scope(
                correlation_id,
                self.process_repository(&installation, &repository)
                    .instrument(span),
            )
            .await?;

        if !run.failures.is_empty() {
            bail!(
                "{} of {} update tasks failed in {}",
                run.failures.len(),
                run.failures.len() + run.outcomes.len(),
                repository.full_name()
            );
        }
        Ok(())
    }
}
