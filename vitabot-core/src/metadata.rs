//! Hidden metadata blocks in pull-request bodies.
//!
//! The bot keeps no database. The only state that survives restarts is a
//! JSON payload appended to the body of each pull request it opens:
//!
//! ```text
//! <human text>
//! <!-- vita-bot {"kind":"submodule","path":"libs/foo"} -->
//! ```
//!
//! HTML comments cannot contain `--`, so the JSON is escaped first:
//! backslashes are doubled, then every `-` becomes `\-`. Decoding undoes the
//! hyphen escaping first and the backslash doubling second.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! bot_marker {
    () => {
        "vita-bot"
    };
}

/// Marker identifying the bot's comment block.
pub const BOT_MARKER: &str = bot_marker!();

const BLOCK_START: &str = concat!("\n<!-- ", bot_marker!(), " ");
const BLOCK_END: &str = " -->\n";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to serialize metadata: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("metadata block does not hold the expected data: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Identifies the logical task a pull request represents. At most one open
/// pull request per repository carries any given value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskMetadata {
    Submodule { path: String },
    Branch { name: String },
}

impl TaskMetadata {
    /// Decode the task from a pull-request body. Bodies without a block, with
    /// an unknown `kind`, or with unreadable JSON carry no task.
    pub fn from_body(body: &str) -> Option<Self> {
        read_data(body).ok().flatten()
    }

    pub fn describe(&self) -> String {
        match self {
            TaskMetadata::Submodule { path } => format!("submodule {}", path),
            TaskMetadata::Branch { name } => format!("branch {}", name),
        }
    }
}

pub fn encode_for_comment(text: &str) -> String {
    text.replace('\\', "\\\\").replace('-', "\\-")
}

pub fn decode_from_comment(text: &str) -> String {
    text.replace("\\-", "-").replace("\\\\", "\\")
}

/// `body` with any previous block replaced by one holding `data`.
pub fn with_data<T: Serialize>(body: &str, data: &T) -> Result<String, MetadataError> {
    let json = serde_json::to_string(data).map_err(MetadataError::Serialize)?;
    Ok(format!(
        "{}{}{}{}",
        without_data(body),
        BLOCK_START,
        encode_for_comment(&json),
        BLOCK_END
    ))
}

/// Decode the first block in `body`, or `Ok(None)` if there is none.
pub fn read_data<T: DeserializeOwned>(body: &str) -> Result<Option<T>, MetadataError> {
    let Some((start, end)) = find_block(body) else {
        return Ok(None);
    };
    let payload = &body[start + BLOCK_START.len()..end - BLOCK_END.len()];
    let json = decode_from_comment(payload);
    serde_json::from_str(&json)
        .map(Some)
        .map_err(MetadataError::Deserialize)
}

/// `body` with its first block removed.
pub fn without_data(body: &str) -> String {
    match find_block(body) {
        Some((start, end)) => format!("{}{}", &body[..start], &body[end..]),
        None => body.to_string(),
    }
}

/// Byte range of the first complete block, including its framing newlines.
/// The payload never contains `-->` because every hyphen in it is escaped,
/// and never a newline because it is single-line JSON.
fn find_block(body: &str) -> Option<(usize, usize)> {
    let mut search_from = 0;
    while let Some(offset) = body[search_from..].find(BLOCK_START) {
        let start = search_from + offset;
        let payload_start = start + BLOCK_START.len();
        let line_end = body[payload_start..]
            .find('\n')
            .map(|i| payload_start + i)
            .unwrap_or(body.len());
        if let Some(end_offset) = body[payload_start..].find(BLOCK_END) {
            let end = payload_start + end_offset + BLOCK_END.len();
            // The closing marker must be on the same line as the opening one.
            if end - 1 == line_end {
                return Some((start, end));
            }
        }
        search_from = payload_start;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const COMMENT: &str = "Initial Comment\n";

    #[test]
    fn test_block_is_framed_by_marker() {
        let body = with_data(COMMENT, &json!({"a": 1})).unwrap();
        let block = &body[COMMENT.len()..];
        assert!(block.starts_with(&format!("\n<!-- {} ", BOT_MARKER)));
        assert!(block.ends_with(" -->\n"));
        assert_eq!(BLOCK_START.trim(), format!("<!-- {}", BOT_MARKER));
    }

    #[test]
    fn test_encode_basic_object() {
        let data = json!({"foo": "bar", "baz": 323});
        let body = with_data(COMMENT, &data).unwrap();
        let decoded: serde_json::Value = read_data(&body).unwrap().unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_encode_nested_object() {
        let data = json!({
            "foo": "bar",
            "baz": 323,
            "obj": {"obj": {"obj": {"foo--bar": "baz\n fff", "32323": 32323.33}}}
        });
        let body = with_data(COMMENT, &data).unwrap();
        assert!(!body[COMMENT.len()..].contains("--"));
        let decoded: serde_json::Value = read_data(&body).unwrap().unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_update_replaces_previous_block() {
        let nested = json!({"a": {"b": {"c": "long value to make the block bigger"}}});
        let simple = json!({"foo": "bar"});

        let first = with_data(COMMENT, &nested).unwrap();
        let second = with_data(&first, &simple).unwrap();

        let decoded: serde_json::Value = read_data(&second).unwrap().unwrap();
        assert_eq!(decoded, simple);
        assert!(first.len() > second.len());
        assert_eq!(second.matches("<!-- vita-bot").count(), 1);
    }

    #[test]
    fn test_remove_block_restores_body() {
        let body = with_data(COMMENT, &json!({"x": 1})).unwrap();
        assert_eq!(without_data(&body), COMMENT);
    }

    #[test]
    fn test_body_without_block() {
        assert!(read_data::<serde_json::Value>("just text\n").unwrap().is_none());
        assert_eq!(without_data("just text\n"), "just text\n");
    }

    #[test]
    fn test_task_metadata_wire_format() {
        let meta = TaskMetadata::Submodule {
            path: "libs/truffle".to_string(),
        };
        let body = with_data("Please pull\n", &meta).unwrap();
        insta::assert_snapshot!(body, @r#"
        Please pull

        <!-- vita-bot {"kind":"submodule","path":"libs/truffle"} -->
        "#);
        assert_eq!(TaskMetadata::from_body(&body), Some(meta));
    }

    #[test]
    fn test_task_metadata_branch_with_hyphens() {
        let meta = TaskMetadata::Branch {
            name: "debugger--master".to_string(),
        };
        let body = with_data("", &meta).unwrap();
        assert!(body.contains(r"debugger\-\-master"));
        assert_eq!(TaskMetadata::from_body(&body), Some(meta));
    }

    #[test]
    fn test_unknown_kind_is_no_match() {
        let body = with_data("text\n", &json!({"kind": "issue", "number": 3})).unwrap();
        assert_eq!(TaskMetadata::from_body(&body), None);
    }

    #[test]
    fn test_garbage_payload_is_no_match() {
        let body = "text\n<!-- vita-bot {not json -->\n";
        assert_eq!(TaskMetadata::from_body(body), None);
        assert!(read_data::<serde_json::Value>(body).is_err());
    }

    #[test]
    fn test_escaping_examples() {
        let examples = [
            "foobar--baz",
            "-- ddsd -- dsd d--f",
            "- 4 d- d sd-- sd",
            "fo\\oba\r--\n baz",
            "-- ddsd \\-\\- dsd d-------f",
            "- 4 d\\- d sd-\\- s--d",
        ];
        for s in examples {
            let encoded = encode_for_comment(s);
            assert!(!encoded.contains("--"), "{:?} encoded to {:?}", s, encoded);
            assert_eq!(decode_from_comment(&encoded), s);
        }
    }

    proptest! {
        #[test]
        fn escaping_round_trips(s in "[-\\\\a-z ]{0,40}") {
            let encoded = encode_for_comment(&s);
            prop_assert!(!encoded.contains("--"));
            prop_assert_eq!(decode_from_comment(&encoded), s);
        }

        #[test]
        fn metadata_round_trips(body in "[a-zA-Z0-9 \n.-]{0,60}", path in "[-a-z/\\\\]{1,20}") {
            let meta = TaskMetadata::Submodule { path };
            let encoded = with_data(&body, &meta).unwrap();
            prop_assert_eq!(TaskMetadata::from_body(&encoded), Some(meta));
            prop_assert_eq!(without_data(&encoded), without_data(&body));
        }
    }
}
