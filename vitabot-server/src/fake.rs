//! In-memory implementation of the remote repository API.
//!
//! Holds repositories, forks, branches, pull requests and comments for any
//! number of accounts. Every API handle acts as one account, which becomes
//! the author of the pull requests and comments it creates. All state is
//! lost when the last handle is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::remote::{
    Account, Branch, Comment, Installation, InstallationSource, NewPullRequest, PullRequest,
    PullRequestRef, RemoteRepository, RemoteRepositoryApi,
};

type RepoKey = (String, String);

fn key(owner: &str, repo: &str) -> RepoKey {
    (owner.to_string(), repo.to_string())
}

#[derive(Debug, Clone)]
struct StoredPullRequest {
    owner: String,
    repo: String,
    pr: PullRequest,
    open: bool,
    comments: Vec<Comment>,
}

#[derive(Default)]
struct FakeState {
    repositories: BTreeMap<RepoKey, RemoteRepository>,
    branches: BTreeMap<RepoKey, BTreeSet<String>>,
    pull_requests: Vec<StoredPullRequest>,
    installations: Vec<(Installation, Vec<RepoKey>)>,
    /// Clone URL forks get when created under a given name.
    fork_urls: BTreeMap<RepoKey, String>,
    next_number: u64,
    next_comment_id: u64,
}

/// Shared in-memory hosting service.
#[derive(Clone, Default)]
pub struct FakeGitHub {
    state: Arc<RwLock<FakeState>>,
}

impl FakeGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// An API handle acting as `login`.
    pub fn api(&self, login: &str) -> FakeApi {
        FakeApi {
            state: self.state.clone(),
            login: login.to_string(),
        }
    }

    /// Add a repository that is not a fork.
    pub async fn add_repository(&self, owner: &str, name: &str, clone_url: &str) {
        let repo = RemoteRepository {
            name: name.to_string(),
            owner: Account {
                login: owner.to_string(),
            },
            fork: false,
            clone_url: clone_url.to_string(),
            ssh_url: String::new(),
            source: None,
        };
        self.state
            .write()
            .await
            .repositories
            .insert(key(owner, name), repo);
    }

    /// Add `owner/name` as a fork of `source_owner/source_name`, which must
    /// already exist.
    pub async fn add_fork(
        &self,
        owner: &str,
        name: &str,
        source_owner: &str,
        source_name: &str,
        clone_url: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let source = network_root(&state, source_owner, source_name)?;
        state.repositories.insert(
            key(owner, name),
            RemoteRepository {
                name: name.to_string(),
                owner: Account {
                    login: owner.to_string(),
                },
                fork: true,
                clone_url: clone_url.to_string(),
                ssh_url: String::new(),
                source: Some(Box::new(source)),
            },
        );
        Ok(())
    }

    pub async fn add_branch(&self, owner: &str, repo: &str, branch: &str) {
        self.state
            .write()
            .await
            .branches
            .entry(key(owner, repo))
            .or_default()
            .insert(branch.to_string());
    }

    /// Make the app installed on `login`'s account with access to `repos`.
    pub async fn add_installation(&self, id: u64, login: &str, repos: &[&str]) {
        let keys = repos.iter().map(|r| key(login, r)).collect();
        self.state.write().await.installations.push((
            Installation {
                id,
                account: Account {
                    login: login.to_string(),
                },
            },
            keys,
        ));
    }

    /// Clone URL a fork created later as `owner/name` will get.
    pub async fn set_fork_url(&self, owner: &str, name: &str, clone_url: &str) {
        self.state
            .write()
            .await
            .fork_urls
            .insert(key(owner, name), clone_url.to_string());
    }

    pub async fn repository(&self, owner: &str, name: &str) -> Option<RemoteRepository> {
        self.state
            .read()
            .await
            .repositories
            .get(&key(owner, name))
            .cloned()
    }

    /// Pull requests against `owner/repo`, open or not, oldest first.
    pub async fn pull_requests(&self, owner: &str, repo: &str) -> Vec<PullRequest> {
        self.state
            .read()
            .await
            .pull_requests
            .iter()
            .filter(|p| p.owner == owner && p.repo == repo)
            .map(|p| p.pr.clone())
            .collect()
    }

    pub async fn comments(&self, owner: &str, repo: &str, number: u64) -> Vec<Comment> {
        self.state
            .read()
            .await
            .pull_requests
            .iter()
            .find(|p| p.owner == owner && p.repo == repo && p.pr.number == number)
            .map(|p| p.comments.clone())
            .unwrap_or_default()
    }

    pub async fn close_pull_request(&self, owner: &str, repo: &str, number: u64) {
        let mut state = self.state.write().await;
        if let Some(pr) = state
            .pull_requests
            .iter_mut()
            .find(|p| p.owner == owner && p.repo == repo && p.pr.number == number)
        {
            pr.open = false;
        }
    }
}

/// The root of the fork network `owner/name` belongs to, without its own
/// source.
fn network_root(state: &FakeState, owner: &str, name: &str) -> Result<RemoteRepository> {
    let repo = state
        .repositories
        .get(&key(owner, name))
        .ok_or_else(|| anyhow!("GitHub API error (404 Not Found): {}/{}", owner, name))?;
    let root = match (repo.fork, &repo.source) {
        (true, Some(source)) => source.as_ref().clone(),
        _ => repo.clone(),
    };
    Ok(RemoteRepository {
        source: None,
        ..root
    })
}

#[async_trait]
impl InstallationSource for FakeGitHub {
    async fn list_installations(&self) -> Result<Vec<Installation>> {
        Ok(self
            .state
            .read()
            .await
            .installations
            .iter()
            .map(|(installation, _)| installation.clone())
            .collect())
    }

    async fn list_installation_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<RemoteRepository>> {
        let state = self.state.read().await;
        let (_, keys) = state
            .installations
            .iter()
            .find(|(installation, _)| installation.id == installation_id)
            .ok_or_else(|| anyhow!("unknown installation {}", installation_id))?;
        Ok(keys
            .iter()
            .filter_map(|k| state.repositories.get(k).cloned())
            .collect())
    }

    fn installation_api(&self, installation_id: u64) -> Arc<dyn RemoteRepositoryApi> {
        // The account is looked up on every call.
        Arc::new(FakeInstallationApi {
            github: self.clone(),
            installation_id,
        })
    }
}

/// A handle acting as one account.
#[derive(Clone)]
pub struct FakeApi {
    state: Arc<RwLock<FakeState>>,
    login: String,
}

impl FakeApi {
    pub fn login(&self) -> &str {
        &self.login
    }
}

#[async_trait]
impl RemoteRepositoryApi for FakeApi {
    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Option<RemoteRepository>> {
        Ok(self
            .state
            .read()
            .await
            .repositories
            .get(&key(owner, repo))
            .cloned())
    }

    async fn create_fork(
        &self,
        owner: &str,
        repo: &str,
        organization: &str,
    ) -> Result<RemoteRepository> {
        let mut state = self.state.write().await;
        let source = network_root(&state, owner, repo)?;

        let mut name = source.name.clone();
        let mut suffix = 0;
        while state.repositories.contains_key(&key(organization, &name)) {
            suffix += 1;
            name = format!("{}-{}", source.name, suffix);
        }

        let clone_url = state
            .fork_urls
            .get(&key(organization, &name))
            .cloned()
            .unwrap_or_else(|| format!("https://github.com/{}/{}.git", organization, name));
        let fork = RemoteRepository {
            name: name.clone(),
            owner: Account {
                login: organization.to_string(),
            },
            fork: true,
            clone_url,
            ssh_url: String::new(),
            source: Some(Box::new(source)),
        };
        state.repositories.insert(key(organization, &name), fork.clone());
        Ok(fork)
    }

    async fn list_organization_forks(&self, org: &str) -> Result<Vec<RemoteRepository>> {
        Ok(self
            .state
            .read()
            .await
            .repositories
            .values()
            .filter(|r| r.owner.login == org && r.fork)
            .map(|r| RemoteRepository {
                source: None,
                ..r.clone()
            })
            .collect())
    }

    async fn list_branches(&self, owner: &str, repo: &str) -> Result<Vec<Branch>> {
        Ok(self
            .state
            .read()
            .await
            .branches
            .get(&key(owner, repo))
            .map(|names| {
                names
                    .iter()
                    .map(|name| Branch { name: name.clone() })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<PullRequest>> {
        let want_open = match state {
            "open" => Some(true),
            "closed" => Some(false),
            _ => None,
        };
        Ok(self
            .state
            .read()
            .await
            .pull_requests
            .iter()
            .filter(|p| p.owner == owner && p.repo == repo)
            .filter(|p| want_open.map_or(true, |open| p.open == open))
            .map(|p| p.pr.clone())
            .collect())
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &NewPullRequest,
    ) -> Result<PullRequest> {
        let mut state = self.state.write().await;
        if !state.repositories.contains_key(&key(owner, repo)) {
            return Err(anyhow!("GitHub API error (404 Not Found): {}/{}", owner, repo));
        }

        let (head_user, head_ref) = match request.head.split_once(':') {
            Some((user, branch)) => (user.to_string(), branch.to_string()),
            None => (owner.to_string(), request.head.clone()),
        };
        state.next_number += 1;
        let pr = PullRequest {
            number: state.next_number,
            user: Account {
                login: self.login.clone(),
            },
            head: PullRequestRef {
                ref_name: head_ref,
                user: Some(Account { login: head_user }),
            },
            body: Some(request.body.clone()),
        };
        state.pull_requests.push(StoredPullRequest {
            owner: owner.to_string(),
            repo: repo.to_string(),
            pr: pr.clone(),
            open: true,
            comments: Vec::new(),
        });
        Ok(pr)
    }

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment> {
        let mut state = self.state.write().await;
        state.next_comment_id += 1;
        let comment = Comment {
            id: state.next_comment_id,
            body: body.to_string(),
        };
        let pr = state
            .pull_requests
            .iter_mut()
            .find(|p| p.owner == owner && p.repo == repo && p.pr.number == number)
            .ok_or_else(|| {
                anyhow!(
                    "GitHub API error (404 Not Found): {}/{}#{}",
                    owner,
                    repo,
                    number
                )
            })?;
        pr.comments.push(comment.clone());
        Ok(comment)
    }
}

/// API handle for an installation, acting as the installation's account.
struct FakeInstallationApi {
    github: FakeGitHub,
    installation_id: u64,
}

impl FakeInstallationApi {
    async fn api(&self) -> Result<FakeApi> {
        let state = self.github.state.read().await;
        let login = state
            .installations
            .iter()
            .find(|(installation, _)| installation.id == self.installation_id)
            .map(|(installation, _)| installation.account.login.clone())
            .ok_or_else(|| anyhow!("unknown installation {}", self.installation_id))?;
        Ok(self.github.api(&login))
    }
}

#[async_trait]
impl RemoteRepositoryApi for FakeInstallationApi {
    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Option<RemoteRepository>> {
        self.api().await?.get_repository(owner, repo).await
    }

    async fn create_fork(
        &self,
        owner: &str,
        repo: &str,
        organization: &str,
    ) -> Result<RemoteRepository> {
        self.api().await?.create_fork(owner, repo, organization).await
    }

    async fn list_organization_forks(&self, org: &str) -> Result<Vec<RemoteRepository>> {
        self.api().await?.list_organization_forks(org).await
    }

    async fn list_branches(&self, owner: &str, repo: &str) -> Result<Vec<Branch>> {
        self.api().await?.list_branches(owner, repo).await
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<PullRequest>> {
        self.api().await?.list_pull_requests(owner, repo, state).await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &NewPullRequest,
    ) -> Result<PullRequest> {
        self.api().await?.create_pull_request(owner, repo, request).await
    }

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment> {
        self.api()
            .await?
            .create_issue_comment(owner, repo, number, body)
            .await
    }
}
