//! Machine-readable `git log` output and its parser.
//!
//! Records are requested with `-z`, so commits are separated by NUL, which
//! git cannot emit inside a commit message. Within a record the fixed fields
//! (hash, identities, ISO dates) come one per line. Git refuses newlines in
//! identities and hashes and dates never contain one, so any other byte,
//! control characters included, may appear in a name or email without
//! shifting the fields. The raw message (`%B`) is always the *last* field
//! and the record is split into at most [`FIELD_COUNT`] parts, so newlines
//! inside a subject or body stay part of the message.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GitError, Result};

pub(crate) const FIELD_SEPARATOR: char = '\n';
pub(crate) const RECORD_SEPARATOR: char = '\0';
const FIELD_COUNT: usize = 8;

/// `--format` argument producing records understood by [`parse_log`].
pub(crate) const LOG_FORMAT: &str = "--format=%H%n%an%n%ae%n%aI%n%cn%n%ce%n%cI%n%B";

/// Structured metadata of a single commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSnapshot {
    pub hash: String,
    pub author_name: String,
    pub author_email: String,
    pub author_date: DateTime<FixedOffset>,
    pub committer_name: String,
    pub committer_email: String,
    pub committer_date: DateTime<FixedOffset>,
    pub subject: String,
    pub body: String,
}

impl CommitSnapshot {
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(8)]
    }

    /// Committer date in UTC, the date shown for "version from" in reports.
    pub fn date_utc(&self) -> DateTime<Utc> {
        self.committer_date.with_timezone(&Utc)
    }
}

pub(crate) fn parse_log(output: &str) -> Result<Vec<CommitSnapshot>> {
    output
        .split(RECORD_SEPARATOR)
        .map(|record| record.trim_start_matches('\n'))
        .filter(|record| !record.trim().is_empty())
        .map(parse_record)
        .collect()
}

fn parse_record(record: &str) -> Result<CommitSnapshot> {
    let fields: Vec<&str> = record.splitn(FIELD_COUNT, FIELD_SEPARATOR).collect();
    if fields.len() != FIELD_COUNT {
        return Err(GitError::InvalidLog(format!(
            "expected {} fields, found {}",
            FIELD_COUNT,
            fields.len()
        )));
    }

    let hash = fields[0].trim();
    if hash.len() < 40 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(GitError::InvalidLog(format!("bad commit hash '{}'", hash)));
    }

    let (subject, body) = split_message(fields[7]);

    Ok(CommitSnapshot {
        hash: hash.to_string(),
        author_name: fields[1].to_string(),
        author_email: fields[2].to_string(),
        author_date: parse_date(fields[3])?,
        committer_name: fields[4].to_string(),
        committer_email: fields[5].to_string(),
        committer_date: parse_date(fields[6])?,
        subject,
        body,
    })
}

fn parse_date(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.trim()).map_err(|source| GitError::InvalidDate {
        value: value.to_string(),
        source,
    })
}

/// Split a raw commit message into subject (first paragraph, joined onto one
/// line the way `%s` does) and body.
fn split_message(raw: &str) -> (String, String) {
    let raw = raw.trim_end_matches('\n');
    let (subject, body) = match raw.find("\n\n") {
        Some(idx) => (&raw[..idx], raw[idx + 2..].trim_start_matches('\n')),
        None => (raw, ""),
    };
    let subject = subject.lines().map(str::trim).collect::<Vec<_>>().join(" ");
    (subject, body.to_string())
}
