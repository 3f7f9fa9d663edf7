use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::paths;

/// Lifecycle state of a feedback item.
///
/// On disk the state is encoded only by the presence of `submitted_at` /
/// `resolved_at` (see [`crate::schema::FeedbackRecord`]); inside the crate it is
/// always this enum so transitions can be matched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackStatus {
    /// Written by the reviewer, not yet handed to the agent.
    #[default]
    Draft,
    /// Handed to the agent at `at`, pending resolution.
    Submitted { at: DateTime<Utc> },
    /// Marked complete at `at`; lives in the resolved collection.
    Resolved { at: DateTime<Utc> },
}

impl FeedbackStatus {
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FeedbackStatus::Submitted { at } => Some(*at),
            _ => None,
        }
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        match self {
            FeedbackStatus::Resolved { at } => Some(*at),
            _ => None,
        }
    }
}

/// A single review comment anchored to a file and an optional line range.
///
/// `line_number == 0` means the comment applies to the whole file, in which
/// case `line_number_end` is always `None`. When present, `line_number_end` is
/// an inclusive end that is strictly greater than `line_number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackItem {
    pub file_path: String,
    pub line_number: u32,
    pub line_number_end: Option<u32>,
    pub comment: String,
    pub status: FeedbackStatus,
}

impl FeedbackItem {
    /// Creates a draft comment on a single line (or the whole file for line 0).
    pub fn draft(file_path: impl Into<String>, line_number: u32, comment: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            line_number,
            line_number_end: None,
            comment: comment.into(),
            status: FeedbackStatus::Draft,
        }
    }

    /// Builder-style setter for the inclusive range end.
    pub fn with_end(mut self, line_number_end: u32) -> Self {
        self.line_number_end = Some(line_number_end);
        self
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.file_path, self.line_number, self.line_number_end)
    }

    pub fn is_whole_file(&self) -> bool {
        self.line_number == 0
    }

    /// Collapses a range whose end equals its start into a single-line item.
    pub fn normalized(mut self) -> Self {
        if self.line_number_end == Some(self.line_number) {
            self.line_number_end = None;
        }
        self
    }

    /// Checks the structural rules a new or edited item must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] with a human-readable reason.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.file_path.trim().is_empty() {
            return Err(StoreError::Validation("file_path is required".to_owned()));
        }
        paths::validate_relative(&self.file_path)?;
        if self.comment.trim().is_empty() {
            return Err(StoreError::Validation("comment must not be empty".to_owned()));
        }
        if let Some(end) = self.line_number_end {
            if self.line_number == 0 {
                return Err(StoreError::Validation(
                    "whole-file feedback cannot carry line_number_end".to_owned(),
                ));
            }
            if end < self.line_number {
                return Err(StoreError::Validation(format!(
                    "line_number_end ({end}) is before line_number ({})",
                    self.line_number
                )));
            }
        }
        Ok(())
    }
}

/// Canonical collection order: `file_path`, then `line_number`.
///
/// Ties are broken by range end so the order is total.
pub fn canonical_order(a: &FeedbackItem, b: &FeedbackItem) -> Ordering {
    a.file_path
        .cmp(&b.file_path)
        .then(a.line_number.cmp(&b.line_number))
        .then(
            a.line_number_end
                .unwrap_or(a.line_number)
                .cmp(&b.line_number_end.unwrap_or(b.line_number)),
        )
}

/// Identity of a feedback item within a collection.
///
/// An absent range end is stored as `line_number`, so `a.ts:10` and
/// `a.ts:10-10` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub file_path: String,
    pub line_number: u32,
    pub line_number_end: u32,
}

impl ItemKey {
    pub fn new(file_path: &str, line_number: u32, line_number_end: Option<u32>) -> Self {
        Self {
            file_path: file_path.to_owned(),
            line_number,
            line_number_end: line_number_end.unwrap_or(line_number),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line_number == 0 {
            write!(f, "{} (whole file)", self.file_path)
        } else if self.line_number_end == self.line_number {
            write!(f, "{}:{}", self.file_path, self.line_number)
        } else {
            write!(f, "{}:{}-{}", self.file_path, self.line_number, self.line_number_end)
        }
    }
}

/// Kind of a settled filesystem change, named the way the browser client expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

/// One coalesced change under a watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Path relative to the watched root, `/`-separated.
    pub path: String,
}
