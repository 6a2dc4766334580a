#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use vitabot_core::{BotIdentity, GitOperator};

pub const TEST_TEXT: &str = "1\n2\n3\n4\n5\n6\n7\n8\n9\n0\n";

pub const FILE1: &str = "file-1";
pub const FILE2: &str = "file-2";

pub const BRANCH_ROOT: &str = "root-master";
pub const BRANCH_UPSTREAM: &str = "extended";
pub const BRANCH_CONFLICT: &str = "replaced";
pub const BRANCH_NO_CONFLICT: &str = "partial";

pub const SUBMODULE_UPDATE: &str = "has-update";
pub const SUBMODULE_CONFLICT: &str = "has-conflict";

pub fn test_bot() -> BotIdentity {
    BotIdentity::new("Test Bot", "test@example.org", "test-bot")
}

/// Operator for `path` that may clone local submodules.
pub fn operator(path: impl Into<PathBuf>) -> GitOperator {
    GitOperator::new(path, test_bot()).with_config("protocol.file.allow", "always")
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args([
            "-c",
            "user.name=Test Bot",
            "-c",
            "user.email=test@example.org",
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

/// Upstream repository with the branches every test works against:
///
/// - `root-master`: the initial commit
/// - `extended`: two commits on top of `root-master`, extending `file-1`
/// - `replaced`: one commit on `root-master` replacing `file-1` (conflicts
///   with `extended`)
/// - `partial`: one commit on `root-master` changing `file-2` (rebases
///   cleanly onto `extended`)
pub struct Fixtures {
    pub dir: TempDir,
}

impl Fixtures {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = Self { dir };
        fixtures.populate_upstream();
        fixtures.populate_superproject();
        fixtures
    }

    pub fn upstream(&self) -> PathBuf {
        self.dir.path().join("upstream")
    }

    pub fn superproject(&self) -> PathBuf {
        self.dir.path().join("with-submodule")
    }

    pub fn upstream_url(&self) -> String {
        self.upstream().to_string_lossy().into_owned()
    }

    pub fn superproject_url(&self) -> String {
        self.superproject().to_string_lossy().into_owned()
    }

    /// A not yet existing directory for a working copy.
    pub fn work_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join("work").join(name)
    }

    /// A bare repository standing in for the bot's fork.
    pub fn bare(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::create_dir_all(&path).unwrap();
        git(&path, &["init", "--quiet", "--bare"]);
        path
    }

    pub fn advance_upstream(&self, branch: &str, message: &str) -> String {
        let up = self.upstream();
        git(&up, &["checkout", "--quiet", branch]);
        commit_file(&up, "file-3", message, message);
        rev_parse(&up, "HEAD")
    }

    fn populate_upstream(&self) {
        let up = self.upstream();
        init(&up);

        commit_file(&up, FILE1, TEST_TEXT, "Initial Commit");
        fs::write(up.join(FILE2), TEST_TEXT).unwrap();
        git(&up, &["add", FILE2]);
        git(&up, &["commit", "--quiet", "--amend", "--no-edit"]);
        git(&up, &["branch", BRANCH_ROOT]);

        commit_file(&up, FILE1, &TEST_TEXT.repeat(2), "Extend file-1");
        commit_file(&up, FILE1, &TEST_TEXT.repeat(3), "Extend file-1 more");
        git(&up, &["branch", BRANCH_UPSTREAM]);

        git(&up, &["checkout", "--quiet", "-b", BRANCH_CONFLICT, BRANCH_ROOT]);
        commit_file(&up, FILE1, "replaced", "Replaced file-1");

        git(&up, &["checkout", "--quiet", "-b", BRANCH_NO_CONFLICT, BRANCH_ROOT]);
        commit_file(&up, FILE2, "changed locally\n", "Change file-2");

        git(&up, &["checkout", "--quiet", "master"]);
    }

    fn populate_superproject(&self) {
        let sup = self.superproject();
        init(&sup);

        commit_file(&sup, FILE1, TEST_TEXT, "Initial Commit");
        let url = self.upstream_url();
        git(
            &sup,
            &["submodule", "add", "--quiet", "-b", BRANCH_CONFLICT, &url, SUBMODULE_CONFLICT],
        );
        git(
            &sup,
            &["submodule", "add", "--quiet", "-b", BRANCH_ROOT, &url, SUBMODULE_UPDATE],
        );
        git(&sup, &["commit", "--quiet", "-m", "Added submodules"]);
    }
}
