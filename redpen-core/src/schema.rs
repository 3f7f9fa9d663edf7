//! On-disk document format for feedback collections.
//!
//! Every collection is a YAML mapping with a single `items` sequence. Status is
//! not stored as a field: `submitted_at` / `resolved_at` presence encodes it and
//! is converted to [`FeedbackStatus`] here and nowhere else.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{FeedbackItem, FeedbackStatus};

/// Directory under the reviewed root that holds every feedback document.
pub const DATA_DIR: &str = ".redpen";

/// Draft and submitted items.
pub const ACTIVE_FILE: &str = "feedback.yaml";

/// Resolved items.
pub const RESOLVED_FILE: &str = "feedback-resolved.yaml";

/// Single-collection predecessor of [`ACTIVE_FILE`]; read only for migration.
pub const LEGACY_FILE: &str = "feedback-unsent.yaml";

/// Fresh collision-free id for a hand-off snapshot (UUID v4 text).
pub fn new_handoff_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// File name of a hand-off snapshot for the given id.
pub fn handoff_file_name(id: &str) -> String {
    format!("feedback-{id}.yaml")
}

/// One serialized feedback item.
///
/// Line numbers are signed so that a negative value in a hand-edited file is
/// rejected per record instead of failing the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number_end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whole_file: Option<bool>,
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

impl From<&FeedbackItem> for FeedbackRecord {
    fn from(item: &FeedbackItem) -> Self {
        let whole_file = item.is_whole_file();
        Self {
            file_path: item.file_path.clone(),
            line_number: Some(i64::from(item.line_number)),
            line_number_end: if whole_file {
                None
            } else {
                item.line_number_end.map(i64::from)
            },
            whole_file: whole_file.then_some(true),
            comment: item.comment.clone(),
            submitted_at: item.status.submitted_at().map(format_timestamp),
            resolved_at: item.status.resolved_at().map(format_timestamp),
        }
    }
}

impl FeedbackRecord {
    /// Converts a decoded record into an item, or `None` if it is unusable.
    ///
    /// An out-of-order `line_number_end` is dropped rather than rejecting the
    /// record; an unparsable timestamp is dropped the same way.
    pub fn into_item(self) -> Option<FeedbackItem> {
        let whole_file = self.whole_file == Some(true);
        let line_number = if whole_file {
            0
        } else {
            u32::try_from(self.line_number?).ok()?
        };
        let line_number_end = if line_number == 0 {
            None
        } else {
            self.line_number_end
                .and_then(|end| u32::try_from(end).ok())
                .filter(|end| *end > line_number)
        };

        let status = match (
            parse_timestamp(self.resolved_at.as_deref()),
            parse_timestamp(self.submitted_at.as_deref()),
        ) {
            (Some(at), _) => FeedbackStatus::Resolved { at },
            (None, Some(at)) => FeedbackStatus::Submitted { at },
            (None, None) => FeedbackStatus::Draft,
        };

        Some(FeedbackItem {
            file_path: self.file_path,
            line_number,
            line_number_end,
            comment: self.comment,
            status,
        })
    }
}

#[derive(Debug, Serialize)]
struct FeedbackDocument {
    items: Vec<FeedbackRecord>,
}

/// Decodes a collection document.
///
/// Never fails: an unparsable document, or one without an `items` sequence,
/// decodes to an empty collection; individual bad records are skipped.
pub fn decode(raw: &str, origin: &Path) -> Vec<FeedbackItem> {
    let root: serde_yaml::Value = match serde_yaml::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %origin.display(), %err, "unparsable feedback document, treating as empty");
            return Vec::new();
        }
    };
    let Some(items) = root.get("items").and_then(|v| v.as_sequence()) else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    for (index, value) in items.iter().enumerate() {
        let decoded = serde_yaml::from_value::<FeedbackRecord>(value.clone())
            .ok()
            .and_then(FeedbackRecord::into_item);
        match decoded {
            Some(item) => out.push(item),
            None => warn!(path = %origin.display(), index, "skipping malformed feedback record"),
        }
    }
    out
}

/// Encodes items into a collection document.
///
/// # Errors
///
/// Returns the `serde_yaml` error if serialization fails.
pub fn encode(items: &[FeedbackItem]) -> Result<String, serde_yaml::Error> {
    let doc = FeedbackDocument {
        items: items.iter().map(FeedbackRecord::from).collect(),
    };
    serde_yaml::to_string(&doc)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(err) => {
            warn!(value = raw, %err, "ignoring unparsable timestamp");
            None
        }
    }
}

/// Seeds the active collection from the legacy file, once.
///
/// Runs before every active read. Copies the legacy document byte-for-byte
/// when the active file is absent and the legacy file exists. When both exist
/// the active file wins and the legacy file is left untouched.
///
/// # Errors
///
/// Returns the I/O error if the copy fails; callers treat this as a read
/// failure and fall back to an empty collection.
pub async fn ensure_migrated(active: &Path, legacy: &Path) -> std::io::Result<bool> {
    if tokio::fs::try_exists(active).await.unwrap_or(false) {
        return Ok(false);
    }
    if !tokio::fs::try_exists(legacy).await.unwrap_or(false) {
        return Ok(false);
    }
    if let Some(parent) = active.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(legacy, active).await?;
    Ok(true)
}
