#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;
use vitabot_core::BotIdentity;
use vitabot_server::config::{ProjectConfig, StaticConfigSource};
use vitabot_server::fake::FakeGitHub;
use vitabot_server::Orchestrator;

pub const BOT_ACCOUNT: &str = "vita-bot";
pub const OWNER: &str = "smarr";
pub const REPO: &str = "SOMns";

pub const TARGET_INSTALLATION: u64 = 1;
pub const BOT_INSTALLATION: u64 = 2;

pub fn bot() -> BotIdentity {
    BotIdentity::new("Vita Bot", "bot@example.org", BOT_ACCOUNT)
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args([
            "-c",
            "user.name=Test User",
            "-c",
            "user.email=user@example.org",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "protocol.file.allow=always",
        ])
        .args(args)
        .current_dir(dir)
        .env("LC_ALL", "C")
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

pub fn rev_parse(dir: &Path, rev: &str) -> String {
    git(dir, &["rev-parse", rev]).trim().to_string()
}

fn commit_file(dir: &Path, file: &str, content: &str, message: &str) {
    fs::write(dir.join(file), content).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "--quiet", "-m", message]);
}

fn init(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "--quiet"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/master"]);
}

fn url(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Local repositories standing in for the hosted ones:
///
/// - `foo`: a library whose `master` the superproject tracks; it also has
///   `extended` (extends `file-1`), `replaced` (replaces `file-1`, so it
///   conflicts with `extended`) and `partial` (changes `file-2`)
/// - `target`: the managed repository, a superproject with `foo` at
///   `libs/foo` on `master`, plus the `replaced` and `partial` branches of
///   `foo`
/// - `fork.git`: empty bare repository the bot's fork pushes go to
pub struct Remotes {
    pub dir: TempDir,
}

impl Remotes {
    pub fn new() -> Self {
        let remotes = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        remotes.populate();
        remotes
    }

    pub fn foo(&self) -> PathBuf {
        self.dir.path().join("foo")
    }

    pub fn target(&self) -> PathBuf {
        self.dir.path().join("target")
    }

    pub fn fork(&self) -> PathBuf {
        self.dir.path().join("fork.git")
    }

    pub fn working_copies(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn foo_url(&self) -> String {
        url(&self.foo())
    }

    pub fn target_url(&self) -> String {
        url(&self.target())
    }

    pub fn fork_url(&self) -> String {
        url(&self.fork())
    }

    /// Add a commit to `foo`'s `master` and return its hash.
    pub fn advance_foo(&self, message: &str) -> String {
        let foo = self.foo();
        git(&foo, &["checkout", "--quiet", "master"]);
        commit_file(&foo, "file-3", message, message);
        rev_parse(&foo, "HEAD")
    }

    fn populate(&self) {
        let text = "1\n2\n3\n4\n5\n6\n7\n8\n9\n0\n";

        let foo = self.foo();
        init(&foo);
        commit_file(&foo, "file-1", text, "Initial Commit");
        commit_file(&foo, "file-2", text, "Add file-2");
        let root = rev_parse(&foo, "HEAD");

        git(&foo, &["checkout", "--quiet", "-b", "extended", &root]);
        commit_file(&foo, "file-1", &text.repeat(2), "Extend file-1");
        git(&foo, &["checkout", "--quiet", "-b", "replaced", &root]);
        commit_file(&foo, "file-1", "replaced", "Replace file-1");
        git(&foo, &["checkout", "--quiet", "-b", "partial", &root]);
        commit_file(&foo, "file-2", "changed\n", "Change file-2");
        git(&foo, &["checkout", "--quiet", "master"]);

        let target = self.target();
        init(&target);
        commit_file(&target, "README", "superproject\n", "Initial Commit");
        git(
            &target,
            &["submodule", "add", "--quiet", "-b", "master", &self.foo_url(), "libs/foo"],
        );
        git(&target, &["commit", "--quiet", "-m", "Add libs/foo"]);
        git(&target, &["fetch", "--quiet", &self.foo_url(), "replaced:replaced", "partial:partial"]);

        let fork = self.fork();
        fs::create_dir_all(&fork).unwrap();
        git(&fork, &["init", "--quiet", "--bare"]);
    }
}

/// A hosting service with `smarr/SOMns` served from `remotes`, the app
/// installed on `smarr` and on the bot account, and no fork yet.
pub async fn hosting(remotes: &Remotes) -> FakeGitHub {
    let github = FakeGitHub::new();
    github.add_repository(OWNER, REPO, &remotes.target_url()).await;
    github.add_installation(TARGET_INSTALLATION, OWNER, &[REPO]).await;
    github.add_installation(BOT_INSTALLATION, BOT_ACCOUNT, &[]).await;
    github.set_fork_url(BOT_ACCOUNT, REPO, &remotes.fork_url()).await;
    github
}

pub fn projects(config: &str) -> StaticConfigSource {
    let config: ProjectConfig = serde_json::from_str(config).unwrap();
    StaticConfigSource::new(HashMap::from([(format!("{}/{}", OWNER, REPO), config)]))
}

pub fn orchestrator(github: &FakeGitHub, remotes: &Remotes, config: &str) -> Orchestrator {
    Orchestrator::new(
        Arc::new(github.clone()),
        Arc::new(projects(config)),
        bot(),
        remotes.working_copies(),
    )
    .with_git_config("protocol.file.allow", "always")
}
