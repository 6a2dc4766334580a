use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vitabot_core::{BotIdentity, UpdateTarget};

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub bot: BotIdentity,
    /// One working copy per managed repository lives below this directory.
    pub working_copy_root: PathBuf,
    pub projects_file: PathBuf,
    /// Zero runs a single check and exits.
    pub check_interval: Duration,
    /// Zero disables throttling.
    pub requests_per_interval: u32,
    pub rate_interval: Duration,
    pub git_timeout: Option<Duration>,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let bot_name =
            env::var("BOT_NAME").context("BOT_NAME environment variable is required")?;
        let bot_email =
            env::var("BOT_EMAIL").context("BOT_EMAIL environment variable is required")?;
        let bot_account =
            env::var("BOT_ACCOUNT").context("BOT_ACCOUNT environment variable is required")?;

        let working_copy_root = env::var("WORKING_COPY_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".base/working-copies"));

        let projects_file = env::var("PROJECTS_FILE")
            .map(PathBuf::from)
            .context("PROJECTS_FILE environment variable is required")?;

        let check_interval = Duration::from_secs(parse_number("CHECK_INTERVAL_SECS", 0)?);
        let requests_per_interval = parse_number("REQUESTS_PER_INTERVAL", 0)?;
        let rate_interval = Duration::from_secs(parse_number("RATE_INTERVAL_SECS", 1)?);

        let git_timeout = env::var("GIT_TIMEOUT_SECS")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse::<u64>())
            .transpose()
            .context("GIT_TIMEOUT_SECS must be a valid number")?
            .map(Duration::from_secs);

        let port = parse_number("PORT", 3000)?;

        Ok(Config {
            github_app_id,
            github_private_key,
            bot: BotIdentity::new(bot_name, bot_email, bot_account),
            working_copy_root,
            projects_file,
            check_interval,
            requests_per_interval,
            rate_interval,
            git_timeout,
            port,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

/// Per-repository configuration: what to keep up to date and where pull
/// requests go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProjectConfig {
    /// Branch submodule updates are applied to, and the base of every pull
    /// request.
    pub target_branch: String,
    #[serde(default)]
    pub update_submodules: BTreeMap<String, SubmoduleConfig>,
    /// Keyed by the local branch to update.
    #[serde(default)]
    pub update_branches: BTreeMap<String, BranchConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmoduleConfig {
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BranchConfig {
    pub url: String,
    pub branch: String,
    #[serde(default)]
    pub fast_forward_only: bool,
    #[serde(default)]
    pub tag_pattern: Option<String>,
}

impl ProjectConfig {
    /// Submodule updates first, then branch updates, each in path order.
    pub fn targets(&self) -> Vec<UpdateTarget> {
        let submodules = self
            .update_submodules
            .iter()
            .map(|(path, sub)| UpdateTarget::Submodule {
                path: path.clone(),
                tracked_branch: sub.branch.clone(),
            });
        let branches = self
            .update_branches
            .iter()
            .map(|(local, branch)| UpdateTarget::Branch {
                upstream_url: branch.url.clone(),
                upstream_branch: branch.branch.clone(),
                local_branch: local.clone(),
                fast_forward_only: branch.fast_forward_only,
                tag_pattern: branch.tag_pattern.clone(),
            });
        submodules.chain(branches).collect()
    }
}

/// Where per-repository configuration comes from.
#[async_trait]
pub trait ProjectConfigSource: Send + Sync {
    /// `Ok(None)` for repositories the bot is not configured for.
    async fn project_config(&self, owner: &str, repo: &str) -> Result<Option<ProjectConfig>>;
}

/// Configuration for all repositories, loaded once. The file maps
/// `owner/repo` to a [`ProjectConfig`].
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    projects: HashMap<String, ProjectConfig>,
}

impl StaticConfigSource {
    pub fn new(projects: HashMap<String, ProjectConfig>) -> Self {
        Self { projects }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let projects = serde_json::from_str(json).context("Failed to parse project configuration")?;
        Ok(Self { projects })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[async_trait]
impl ProjectConfigSource for StaticConfigSource {
    async fn project_config(&self, owner: &str, repo: &str) -> Result<Option<ProjectConfig>> {
        Ok(self.projects.get(&format!("{}/{}", owner, repo)).cloned())
    }
}
