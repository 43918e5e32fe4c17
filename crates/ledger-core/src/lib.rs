use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod id;
pub mod slug;
pub mod timestamp;
pub mod validate;

pub use id::new_id;
pub use slug::project_slug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    #[default]
    Active,
    Overridden,
    Archived,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Active => "active",
            DecisionStatus::Overridden => "overridden",
            DecisionStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = ParseEnumError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(DecisionStatus::Active),
            "overridden" => Ok(DecisionStatus::Overridden),
            "archived" => Ok(DecisionStatus::Archived),
            other => Err(ParseEnumError {
                kind: "decision status",
                value: other.to_string(),
            }),
        }
    }
}

/// A recorded choice. `alternatives_rejected` is persisted as a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub decision: String,
    #[serde(default)]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternatives_rejected: Option<Vec<String>>,
    pub status: DecisionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub id: String,
    pub decision_id: String,
    pub session_id: String,
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    #[default]
    Pending,
    Worked,
    Failed,
    Partial,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Worked => "worked",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Partial => "partial",
        }
    }

    /// Failed and partial outcomes are the only ones a failure reason describes.
    pub fn carries_failure_reason(&self) -> bool {
        matches!(self, AttemptOutcome::Failed | AttemptOutcome::Partial)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = ParseEnumError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "pending" => Ok(AttemptOutcome::Pending),
            "worked" => Ok(AttemptOutcome::Worked),
            "failed" => Ok(AttemptOutcome::Failed),
            "partial" => Ok(AttemptOutcome::Partial),
            other => Err(ParseEnumError {
                kind: "attempt outcome",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiAttempt {
    pub id: String,
    pub project_id: String,
    pub session_id: String,
    pub problem: String,
    pub suggestion: String,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// Creation inputs. Unset ids and project ids are filled in by the store.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewProject {
    pub id: Option<String>,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSession {
    pub id: Option<String>,
    pub project_id: Option<String>,
    pub name: String,
    pub parent_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewDecision {
    pub id: Option<String>,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub category: Option<String>,
    pub decision: String,
    pub rationale: Option<String>,
    pub alternatives_rejected: Option<Vec<String>>,
    pub status: Option<DecisionStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewOverride {
    pub id: Option<String>,
    pub decision_id: String,
    pub session_id: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewAttempt {
    pub id: Option<String>,
    pub project_id: Option<String>,
    pub session_id: String,
    pub problem: String,
    pub suggestion: String,
    pub outcome: Option<AttemptOutcome>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewNote {
    pub id: Option<String>,
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub content: String,
}

/// Filter for listing decisions. Present fields are ANDed together; an
/// absent `project_id` means the store's bound project. `offset` only
/// applies when `limit` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionFilter {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub category: Option<String>,
    pub status: Option<DecisionStatus>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Filter for listing AI attempts; `search` matches problem or suggestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptFilter {
    pub project_id: Option<String>,
    pub session_id: Option<String>,
    pub outcome: Option<AttemptOutcome>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridePattern {
    pub decision: Decision,
    pub override_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringFailure {
    pub suggestion: String,
    pub failure_count: u32,
    pub last_failure: DateTime<Utc>,
}

/// Words in an override rationale that mark the override as a stopgap.
pub const TEMPORARY_MARKERS: [&str; 5] = ["temporary", "temp", "quick fix", "for now", "hack"];

/// Tokens shorter than this (in characters) are ignored by keyword search.
pub const MIN_KEYWORD_CHARS: usize = 3;

/// Result cap for keyword relevance queries.
pub const KEYWORD_RESULT_LIMIT: u32 = 10;

/// Lower-cased whitespace tokens long enough to be worth matching.
pub fn keyword_tokens(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .collect()
}
