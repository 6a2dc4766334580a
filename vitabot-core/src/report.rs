//! Human-facing description of a finished update.
//!
//! An [`UpdateReport`] carries only dates, URLs and flags so the code that
//! talks to the hosting service never needs git types. All user-visible text
//! (commit messages, pull-request bodies, follow-up comments) is generated
//! from it deterministically.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::TaskMetadata;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// How the updated tree was brought to the upstream version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    FastForward,
    Rebase,
    Forced,
}

impl UpdateKind {
    fn sentence(self) -> &'static str {
        match self {
            UpdateKind::FastForward => "This update was a simple fast-forward.",
            UpdateKind::Rebase => "This update was a rebase without conflicts.",
            UpdateKind::Forced => {
                "This update was forced: the previous version is not an ancestor of the upstream branch."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub target: TaskMetadata,
    pub previous_date: DateTime<FixedOffset>,
    pub upstream_date: DateTime<FixedOffset>,
    pub upstream_url: String,
    pub upstream_branch: String,
    pub kind: UpdateKind,
    /// Conflicted paths of a failed rebase.
    pub conflicts: Option<Vec<String>>,
}

impl UpdateReport {
    pub fn forced(&self) -> bool {
        self.kind == UpdateKind::Forced
    }

    pub fn title(&self) -> String {
        match &self.target {
            TaskMetadata::Submodule { path } => format!("Update submodule {}", path),
            TaskMetadata::Branch { name } => format!("Update branch {}", name),
        }
    }

    /// UTC calendar date of the upstream commit, without zero padding
    /// (`2019-1-5`), as used in branch names.
    pub fn upstream_day(&self) -> String {
        self.upstream_date
            .with_timezone(&Utc)
            .format("%Y-%-m-%-d")
            .to_string()
    }

    pub fn commit_message(&self) -> String {
        format!(
            "{}\n\n{}\n\n{}",
            self.title(),
            self.version_lines(),
            self.kind.sentence()
        )
    }

    /// Body of a newly opened pull request, before the metadata block is
    /// appended.
    pub fn pull_request_body(&self) -> String {
        let mut body = format!(
            "This pull request updates {}.\n\n```\n{}\n```\n\n{}\n",
            self.target.describe(),
            self.version_lines(),
            self.kind.sentence()
        );
        if let Some(conflicts) = self.conflict_list() {
            body.push('\n');
            body.push_str(&conflicts);
        }
        body
    }

    /// Comment posted on an already open pull request for the same task.
    pub fn follow_up_comment(&self) -> String {
        let mut comment = format!(
            "Updated to the upstream version from {}.",
            self.upstream_date.format(DATE_FORMAT)
        );
        if self.forced() {
            comment.push_str(" The update was forced.");
        }
        comment.push('\n');
        comment
    }

    /// Comment describing a rebase that stopped on conflicts.
    pub fn conflict_comment(&self) -> String {
        format!(
            "Could not update {} to the upstream version from {}.\n\n{}",
            self.target.describe(),
            self.upstream_date.format(DATE_FORMAT),
            self.conflict_list().unwrap_or_default()
        )
    }

    fn version_lines(&self) -> String {
        format!(
            "Previous version from: {}\nCurrent version from:  {}\n\nUpdated based on: {}\nUsing branch:     {}",
            self.previous_date.format(DATE_FORMAT),
            self.upstream_date.format(DATE_FORMAT),
            self.upstream_url,
            self.upstream_branch
        )
    }

    fn conflict_list(&self) -> Option<String> {
        let conflicts = self.conflicts.as_ref()?;
        let mut text = String::from("Conflicting files:\n");
        for path in conflicts {
            text.push_str(&format!("- `{}`\n", path));
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: UpdateKind) -> UpdateReport {
        UpdateReport {
            target: TaskMetadata::Submodule {
                path: "libs/truffle".to_string(),
            },
            previous_date: DateTime::parse_from_rfc3339("2019-01-05T10:00:00+01:00").unwrap(),
            upstream_date: DateTime::parse_from_rfc3339("2019-02-03T23:30:00-02:00").unwrap(),
            upstream_url: "https://github.com/graalvm/truffle.git".to_string(),
            upstream_branch: "master".to_string(),
            kind,
            conflicts: None,
        }
    }

    #[test]
    fn test_commit_message_fast_forward() {
        insta::assert_snapshot!(report(UpdateKind::FastForward).commit_message(), @r"
        Update submodule libs/truffle

        Previous version from: 2019-01-05 10:00:00 +0100
        Current version from:  2019-02-03 23:30:00 -0200

        Updated based on: https://github.com/graalvm/truffle.git
        Using branch:     master

        This update was a simple fast-forward.
        ");
    }

    #[test]
    fn test_commit_message_mentions_forced_update() {
        let message = report(UpdateKind::Forced).commit_message();
        assert!(message.starts_with("Update submodule libs/truffle\n"));
        assert!(message.ends_with("is not an ancestor of the upstream branch."));
    }

    #[test]
    fn test_upstream_day_is_utc_and_unpadded() {
        // 23:30 at -02:00 is already the next day in UTC.
        assert_eq!(report(UpdateKind::Rebase).upstream_day(), "2019-2-4");
    }

    #[test]
    fn test_follow_up_comment() {
        assert_eq!(
            report(UpdateKind::Forced).follow_up_comment(),
            "Updated to the upstream version from 2019-02-03 23:30:00 -0200. The update was forced.\n"
        );
        assert!(!report(UpdateKind::FastForward)
            .follow_up_comment()
            .contains("forced"));
    }

    #[test]
    fn test_conflict_comment_lists_paths() {
        let mut r = report(UpdateKind::Rebase);
        r.target = TaskMetadata::Branch {
            name: "dev".to_string(),
        };
        r.conflicts = Some(vec!["file-1".to_string(), "src/a.rs".to_string()]);
        insta::assert_snapshot!(r.conflict_comment(), @r"
        Could not update branch dev to the upstream version from 2019-02-03 23:30:00 -0200.

        Conflicting files:
        - `file-1`
        - `src/a.rs`
        ");
    }

    #[test]
    fn test_pull_request_body() {
        let body = report(UpdateKind::Rebase).pull_request_body();
        assert!(body.starts_with("This pull request updates submodule libs/truffle.\n"));
        assert!(body.contains("Using branch:     master"));
        assert!(body.ends_with("This update was a rebase without conflicts.\n"));
    }
}
