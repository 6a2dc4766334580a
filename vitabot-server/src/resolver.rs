//! Finds or creates the bot's fork of a repository.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use vitabot_core::BotIdentity;

use crate::remote::{RemoteRepository, RemoteRepositoryApi};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Requested repository not found: {owner}/{repo}")]
    RepositoryNotFound { owner: String, repo: String },

    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// The bot's copy of a target repository: where it lives on disk and on the
/// hosting service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingCopy {
    /// Stable across runs, so state from earlier runs is reused.
    pub path: PathBuf,
    /// Owner of the fork, i.e. the bot account.
    pub remote_owner: String,
    /// Name of the fork, which may differ from the target's.
    pub remote_repo: String,
    pub clone_url: String,
    /// URL with push credentials.
    pub push_url: String,
    pub existing_fork: bool,
}

pub struct ForkResolver<'a> {
    /// Acts on behalf of the target repository's installation.
    target_api: &'a dyn RemoteRepositoryApi,
    /// Acts on behalf of the bot account's installation.
    bot_api: &'a dyn RemoteRepositoryApi,
    bot: &'a BotIdentity,
    working_copy_root: &'a Path,
}

impl<'a> ForkResolver<'a> {
    pub fn new(
        target_api: &'a dyn RemoteRepositoryApi,
        bot_api: &'a dyn RemoteRepositoryApi,
        bot: &'a BotIdentity,
        working_copy_root: &'a Path,
    ) -> Self {
        Self {
            target_api,
            bot_api,
            bot,
            working_copy_root,
        }
    }

    pub async fn resolve(&self, owner: &str, repo: &str) -> Result<WorkingCopy, ResolveError> {
        let target = self
            .target_api
            .get_repository(owner, repo)
            .await?
            .ok_or_else(|| ResolveError::RepositoryNotFound {
                owner: owner.to_string(),
                repo: repo.to_string(),
            })?;

        let (source_owner, source_repo) = match (target.fork, &target.source) {
            (true, Some(source)) => (source.owner.login.clone(), source.name.clone()),
            _ => (owner.to_string(), repo.to_string()),
        };

        let account = &self.bot.account;
        let bot_repo = self.bot_api.get_repository(account, repo).await?;

        let fork = match bot_repo {
            Some(candidate) if candidate.is_fork_of(&source_owner, &source_repo) => {
                debug!("Reusing fork {}/{}", account, candidate.name);
                Some(candidate)
            }
            Some(_) => {
                info!(
                    "{}/{} is not a fork of {}/{}, searching for a renamed fork",
                    account, repo, source_owner, source_repo
                );
                self.find_renamed_fork(repo, &source_owner, &source_repo)
                    .await?
            }
            None => None,
        };

        let (fork, existing_fork) = match fork {
            Some(fork) => (fork, true),
            None => {
                let fork = self
                    .bot_api
                    .create_fork(&source_owner, &source_repo, account)
                    .await?;
                info!(
                    "Created fork {}/{} of {}/{}",
                    account, fork.name, source_owner, source_repo
                );
                (fork, false)
            }
        };

        let push_url = self.bot_api.push_url(&fork.clone_url).await?;

        Ok(WorkingCopy {
            path: self.working_copy_root.join(owner).join(repo),
            remote_owner: account.clone(),
            remote_repo: fork.name,
            clone_url: fork.clone_url,
            push_url,
            existing_fork,
        })
    }

    /// A fork of the canonical source in the bot account whose name extends
    /// `repo`, such as the `SOMns-1` the hosting service picks when `SOMns`
    /// is taken.
    async fn find_renamed_fork(
        &self,
        repo: &str,
        source_owner: &str,
        source_repo: &str,
    ) -> anyhow::Result<Option<RemoteRepository>> {
        let account = &self.bot.account;
        let forks = self.bot_api.list_organization_forks(account).await?;

        for candidate in forks
            .iter()
            .filter(|r| r.name.starts_with(repo) && r.name != repo)
        {
            // List entries carry no source, so fetch the details.
            let Some(details) = self.bot_api.get_repository(account, &candidate.name).await? else {
                continue;
            };
            if details.is_fork_of(source_owner, source_repo) {
                debug!("Found renamed fork {}/{}", account, details.name);
                return Ok(Some(details));
            }
        }

        Ok(None)
    }
}
