//! Version-control operator.
//!
//! [`GitOperator`] wraps one on-disk working tree and shells out to the system
//! `git` binary, the same way the rest of our tooling does, so SSH keys,
//! credential helpers and `~/.gitconfig` all apply. Every invocation carries
//! the bot's identity as `user.name`/`user.email` and runs with `LC_ALL=C`.
//!
//! The operator knows nothing about GitHub or scheduling.

mod classify;
mod log;

pub use classify::{classify, GitFailureKind};
pub use log::CommitSnapshot;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::error::{GitError, Result};
use crate::identity::BotIdentity;
use self::log::{parse_log, LOG_FORMAT};

/// The remote a working copy is cloned from.
pub const ORIGIN: &str = "origin";

/// Prefix of the disposable branch rebases are performed on, so the branch
/// being updated never sits half-rebased between runs.
pub const WIP_BRANCH_PREFIX: &str = "vita-bot/wip/";

/// Result of [`GitOperator::rebase`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseOutcome {
    pub success: bool,
    /// git's own output, for reports.
    pub message: String,
    /// Paths with unresolved conflicts at the first stop. Only set on failure.
    pub conflicted_paths: Option<Vec<String>>,
}

#[derive(Debug)]
struct GitOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn diagnostics(&self) -> String {
        format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct GitOperator {
    path: PathBuf,
    identity: BotIdentity,
    timeout: Option<Duration>,
    config: Vec<(String, String)>,
}

impl GitOperator {
    pub fn new(path: impl Into<PathBuf>, identity: BotIdentity) -> Self {
        Self {
            path: path.into(),
            identity,
            timeout: None,
            config: Vec::new(),
        }
    }

    /// Kill any git subprocess running longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pass an extra `-c key=value` to every git invocation.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.push((key.into(), value.into()));
        self
    }

    /// An operator for another tree (a submodule, say) with the same
    /// identity, timeout and extra configuration.
    pub fn at(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    pub fn is_repository(&self) -> bool {
        if !self.path.join(".git").exists() {
            return false;
        }
        matches!(
            self.exec_here(&["rev-parse", "--is-inside-work-tree"]),
            Ok(out) if out.success
        )
    }

    /// Make the tree sit on `branch` at the tip of `url`'s `branch`, cloning
    /// if there is no repository yet. Local commits and uncommitted changes
    /// from earlier runs are discarded.
    pub fn clone_or_update(&self, url: &str, branch: &str) -> Result<()> {
        if !self.is_repository() {
            info!("Cloning {} ({}) into {}", url, branch, self.path.display());
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| GitError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }

            let target = self.path.to_string_lossy().into_owned();
            let out = self.exec(None, &["clone", "--quiet", "--branch", branch, url, &target])?;
            if !out.success {
                return Err(GitError::RepositoryUnavailable {
                    url: url.to_string(),
                    branch: branch.to_string(),
                    message: out.diagnostics(),
                });
            }
            return Ok(());
        }

        info!(
            "Updating working copy {} to {} ({})",
            self.path.display(),
            url,
            branch
        );
        self.abort_stale_rebase()?;
        self.run(&["reset", "--hard", "--quiet"])?;
        self.ensure_remote(ORIGIN, url)?;
        self.fetch(ORIGIN, Some(branch)).map_err(|e| match e {
            GitError::Command { stderr, .. } => GitError::RepositoryUnavailable {
                url: url.to_string(),
                branch: branch.to_string(),
                message: stderr,
            },
            GitError::RepositoryUnavailable { message, .. } => GitError::RepositoryUnavailable {
                url: url.to_string(),
                branch: branch.to_string(),
                message,
            },
            other => other,
        })?;
        let tip = format!("{}/{}", ORIGIN, branch);
        self.run(&["checkout", "--quiet", "--force", "-B", branch, &tip])?;
        Ok(())
    }

    /// Add remote `name` pointing at `url`, replacing it if it points
    /// elsewhere. No-op when it already matches.
    pub fn ensure_remote(&self, name: &str, url: &str) -> Result<()> {
        let out = self.exec_here(&["remote", "get-url", name])?;
        if out.success {
            if out.stdout.trim() == url {
                return Ok(());
            }
            info!(
                "Remote {} points to {}, replacing with {}",
                name,
                out.stdout.trim(),
                url
            );
            self.run(&["remote", "remove", name])?;
        }
        self.run(&["remote", "add", name, url])?;
        Ok(())
    }

    /// Fetch from a configured remote. With a branch, only that branch is
    /// fetched, into `refs/remotes/<remote>/<branch>`.
    pub fn fetch(&self, remote: &str, branch: Option<&str>) -> Result<()> {
        let refspec = branch.map(|b| format!("+refs/heads/{b}:refs/remotes/{remote}/{b}"));
        let mut args = vec!["fetch", "--quiet", remote];
        if let Some(refspec) = refspec.as_deref() {
            args.push(refspec);
        }

        let out = self.exec_here(&args)?;
        if out.success {
            return Ok(());
        }
        Err(transport_failure("fetch", remote, branch.unwrap_or_default(), &out))
    }

    /// Fast-forward the checked-out branch to the already fetched
    /// `<remote>/<branch>`.
    pub fn fast_forward(&self, remote: &str, branch: &str) -> Result<()> {
        let upstream = format!("{}/{}", remote, branch);
        let ancestry = self.exec_here(&["merge-base", "--is-ancestor", "HEAD", &upstream])?;
        match ancestry.code {
            Some(0) => {}
            Some(1) => {
                return Err(GitError::NotFastForwardable {
                    remote: remote.to_string(),
                    branch: branch.to_string(),
                })
            }
            _ => return Err(command_error(&["merge-base", "--is-ancestor"], &ancestry)),
        }

        let out = self.exec_here(&["merge", "--ff-only", "--quiet", &upstream])?;
        if out.success {
            return Ok(());
        }
        match classify(&out.diagnostics()) {
            Some(GitFailureKind::NotFastForward) => Err(GitError::NotFastForwardable {
                remote: remote.to_string(),
                branch: branch.to_string(),
            }),
            _ => Err(command_error(&["merge", "--ff-only"], &out)),
        }
    }

    /// Fetch `<remote>/<branch>` and hard-reset the checked-out branch to it.
    pub fn force_update(&self, remote: &str, branch: &str) -> Result<()> {
        self.fetch(remote, Some(branch))?;
        let upstream = format!("{}/{}", remote, branch);
        self.run(&["reset", "--hard", "--quiet", &upstream])?;
        Ok(())
    }

    /// Rebase a disposable copy of `branch` onto `onto`.
    ///
    /// Leaves the work-in-progress branch checked out. On conflict the rebase
    /// is aborted, restoring the pre-rebase state, and the conflicted paths
    /// of the first stop are reported.
    pub fn rebase(&self, branch: &str, onto: &str) -> Result<RebaseOutcome> {
        let wip = format!("{}{}", WIP_BRANCH_PREFIX, branch);
        self.run(&["checkout", "--quiet", branch])?;
        if self.has_branch(&wip)? {
            debug!("Deleting stale work-in-progress branch {}", wip);
            self.run(&["branch", "-D", &wip])?;
        }
        self.run(&["checkout", "--quiet", "-b", &wip])?;

        let out = self.exec_here(&["rebase", onto])?;
        if out.success {
            return Ok(RebaseOutcome {
                success: true,
                message: out.diagnostics(),
                conflicted_paths: None,
            });
        }

        let conflicts = self.conflicted_paths()?;
        let conflicted = !conflicts.is_empty()
            || classify(&out.diagnostics()) == Some(GitFailureKind::MergeConflict);
        if self.rebase_in_progress()? {
            self.run(&["rebase", "--abort"])?;
        }

        if !conflicted {
            return Err(command_error(&["rebase", onto], &out));
        }

        info!(
            "Rebase of {} onto {} stopped on conflicts in: {}",
            branch,
            onto,
            conflicts.join(", ")
        );
        Ok(RebaseOutcome {
            success: false,
            message: out.diagnostics(),
            conflicted_paths: Some(conflicts),
        })
    }

    /// Initialize the submodule at `path` and check out the commit the
    /// superproject records for it.
    pub fn submodule_update(&self, path: &str) -> Result<()> {
        let out = self.exec_here(&["submodule", "update", "--init", "--force", "--", path])?;
        if out.success {
            return Ok(());
        }
        Err(transport_failure("submodule update", path, "", &out))
    }

    /// Point `branch` at `start_point` and check it out.
    pub fn checkout_branch_at(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run(&["checkout", "--quiet", "-B", branch, start_point])?;
        Ok(())
    }

    pub fn get_head(&self) -> Result<CommitSnapshot> {
        self.get_head_of("HEAD")
    }

    /// Metadata of the commit `rev` resolves to, e.g. `upstream/master`.
    pub fn get_head_of(&self, rev: &str) -> Result<CommitSnapshot> {
        self.log_ref(1, rev)?
            .into_iter()
            .next()
            .ok_or_else(|| GitError::InvalidLog(format!("no commit found for {}", rev)))
    }

    /// The last `n` commits of the current branch, newest first.
    pub fn log(&self, n: usize) -> Result<Vec<CommitSnapshot>> {
        self.log_ref(n, "HEAD")
    }

    pub fn log_ref(&self, n: usize, rev: &str) -> Result<Vec<CommitSnapshot>> {
        let max_count = format!("--max-count={}", n);
        let out = self.run(&["log", "-z", &max_count, LOG_FORMAT, rev, "--"])?;
        parse_log(&out)
    }

    /// Stage `path` and commit it as the bot.
    pub fn commit(&self, path: &str, message: &str) -> Result<()> {
        self.run(&["add", "--", path])?;
        self.run(&["commit", "--quiet", "-m", message, "--", path])?;
        Ok(())
    }

    /// Force-push `local_ref` (a branch name or `HEAD`) to `remote_branch`.
    /// `remote` may be a remote name or a URL.
    pub fn force_push(&self, remote: &str, local_ref: &str, remote_branch: &str) -> Result<()> {
        let refspec = format!("{}:refs/heads/{}", local_ref, remote_branch);
        info!(
            "Force-pushing {} to {} on {}",
            local_ref,
            remote_branch,
            redact(remote)
        );
        let out = self.exec_here(&["push", "--force", "--quiet", remote, &refspec])?;
        if out.success {
            return Ok(());
        }
        Err(transport_failure("push", remote, remote_branch, &out))
    }

    pub fn tag(&self, name: &str, rev: &str) -> Result<()> {
        self.run(&["tag", "--force", name, rev])?;
        Ok(())
    }

    pub fn push_tag(&self, remote: &str, name: &str) -> Result<()> {
        let refspec = format!("refs/tags/{0}:refs/tags/{0}", name);
        let out = self.exec_here(&["push", "--force", "--quiet", remote, &refspec])?;
        if out.success {
            return Ok(());
        }
        Err(transport_failure("push", remote, name, &out))
    }

    pub fn has_branch(&self, name: &str) -> Result<bool> {
        let full = format!("refs/heads/{}", name);
        let out = self.exec_here(&["rev-parse", "--verify", "--quiet", &full])?;
        Ok(out.success)
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    pub fn remote_url(&self, name: &str) -> Result<String> {
        Ok(self.run(&["remote", "get-url", name])?.trim().to_string())
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    fn rebase_in_progress(&self) -> Result<bool> {
        for state_dir in ["rebase-merge", "rebase-apply"] {
            let git_path = self.run(&["rev-parse", "--git-path", state_dir])?;
            if self.path.join(git_path.trim()).exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn abort_stale_rebase(&self) -> Result<()> {
        if self.rebase_in_progress()? {
            warn!(
                "Found an interrupted rebase in {}, aborting it",
                self.path.display()
            );
            self.run(&["rebase", "--abort"])?;
        }
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let out = self.exec_here(args)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(command_error(args, &out))
        }
    }

    fn exec_here(&self, args: &[&str]) -> Result<GitOutput> {
        self.exec(Some(&self.path), args)
    }

    fn exec(&self, dir: Option<&Path>, args: &[&str]) -> Result<GitOutput> {
        let command = describe(args);
        let mut cmd = Command::new("git");
        cmd.arg("-c")
            .arg(format!("user.name={}", self.identity.display_name))
            .arg("-c")
            .arg(format!("user.email={}", self.identity.email));
        for (key, value) in &self.config {
            cmd.arg("-c").arg(format!("{}={}", key, value));
        }
        cmd.args(args)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        debug!("git {} (in {})", command, dir.unwrap_or(Path::new(".")).display());

        let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;
        let stdout = child.stdout.take().map(read_in_background);
        let stderr = child.stderr.take().map(read_in_background);

        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => status,
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GitError::Timeout { command, timeout });
                }
                Err(source) => return Err(GitError::Spawn { command, source }),
            },
            None => child
                .wait()
                .map_err(|source| GitError::Spawn {
                    command: command.clone(),
                    source,
                })?,
        };

        Ok(GitOutput {
            success: status.success(),
            code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

fn read_in_background<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// First few arguments, enough to identify the command in errors and logs
/// without dumping commit messages.
fn describe(args: &[&str]) -> String {
    args.iter().take(3).copied().collect::<Vec<_>>().join(" ")
}

fn command_error(args: &[&str], out: &GitOutput) -> GitError {
    GitError::Command {
        command: describe(args),
        stderr: out.diagnostics(),
    }
}

/// `url` without credentials embedded in its user-info part.
pub fn redact(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}***{}", &url[..scheme_end + 3], &rest[at..]),
        None => url.to_string(),
    }
}

fn transport_failure(command: &str, remote: &str, branch: &str, out: &GitOutput) -> GitError {
    let remote = redact(remote);
    match classify(&out.diagnostics()) {
        Some(GitFailureKind::RemoteUnavailable) => GitError::RepositoryUnavailable {
            url: remote,
            branch: branch.to_string(),
            message: out.diagnostics(),
        },
        _ => GitError::Command {
            command: format!("{} {}", command, remote),
            stderr: out.diagnostics(),
        },
    }
}
