//! The remote repository API as the bot sees it, independent of any HTTP
//! client. [`crate::github::InstallationClient`] is the production
//! implementation; tests use an in-memory one.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies a repository to check. Built from scheduler/API responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub clone_url: String,
}

impl RepositoryRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl From<&RemoteRepository> for RepositoryRef {
    fn from(repo: &RemoteRepository) -> Self {
        Self {
            owner: repo.owner.login.clone(),
            name: repo.name.clone(),
            clone_url: repo.clone_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub name: String,
    pub owner: Account,
    #[serde(default)]
    pub fork: bool,
    pub clone_url: String,
    #[serde(default)]
    pub ssh_url: String,
    /// Root of the fork network. Only present on single-repository responses.
    #[serde(default)]
    pub source: Option<Box<RemoteRepository>>,
}

impl RemoteRepository {
    /// Whether this repository is a fork whose network root is `owner/name`.
    pub fn is_fork_of(&self, owner: &str, name: &str) -> bool {
        self.fork
            && self
                .source
                .as_ref()
                .is_some_and(|s| s.owner.login == owner && s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Owner of the repository the branch lives in.
    #[serde(default)]
    pub user: Option<Account>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub user: Account,
    pub head: PullRequestRef,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    /// `owner:branch` for a branch in a fork.
    pub head: String,
    pub base: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Installation {
    pub id: u64,
    pub account: Account,
}

/// Authenticated operations on repositories, as one installation.
///
/// Every list operation returns all pages.
#[async_trait]
pub trait RemoteRepositoryApi: Send + Sync {
    /// `Ok(None)` if the repository does not exist or is not visible.
    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Option<RemoteRepository>>;

    /// Fork `owner/repo` into `organization`. The hosting service may pick a
    /// different name than `repo`; the returned repository has the real one.
    async fn create_fork(
        &self,
        owner: &str,
        repo: &str,
        organization: &str,
    ) -> Result<RemoteRepository>;

    async fn list_organization_forks(&self, org: &str) -> Result<Vec<RemoteRepository>>;

    async fn list_branches(&self, owner: &str, repo: &str) -> Result<Vec<Branch>>;

    async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<PullRequest>>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &NewPullRequest,
    ) -> Result<PullRequest>;

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment>;

    /// URL git can push to for a repository with this clone URL.
    async fn push_url(&self, clone_url: &str) -> Result<String> {
        Ok(clone_url.to_string())
    }
}

/// Enumerates installations of the app and hands out an API bound to each.
#[async_trait]
pub trait InstallationSource: Send + Sync {
    async fn list_installations(&self) -> Result<Vec<Installation>>;

    async fn list_installation_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<RemoteRepository>>;

    fn installation_api(&self, installation_id: u64) -> Arc<dyn RemoteRepositoryApi>;
}
