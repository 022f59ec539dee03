//! Core record model, identifier derivation, and sync report types for Synapse.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "synapse-core";

/// One untyped destination or source row.
pub type Record = serde_json::Map<String, Value>;

/// Canonical slug derivation used on both the write path and every read path.
///
/// ASCII-lowercases the input, collapses each run of characters that are not
/// ASCII alphanumerics into a single `-`, and trims leading/trailing hyphens.
/// Non-ASCII characters count as separators. May return an empty string.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Text form of a scalar JSON value when used as a key component.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Ordered key-column values of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier(Vec<String>);

impl Identifier {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn single(part: impl Into<String>) -> Self {
        Self(vec![part.into()])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("|"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("field `{0}` is missing or not a scalar")]
    MissingField(String),
    #[error("field `{field}` value {value:?} normalizes to an empty slug")]
    EmptySlug { field: String, value: String },
    #[error("expected {expected} key components, got {got}")]
    Arity { expected: usize, got: usize },
}

/// How a destination row's conflict key is obtained from a source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentifierRule {
    /// `column = slugify(record[from])`.
    Slug { from: String, column: String },
    /// Existing fields already form the key.
    Natural { columns: Vec<String> },
}

impl IdentifierRule {
    pub fn key_columns(&self) -> Vec<String> {
        match self {
            Self::Slug { column, .. } => vec![column.clone()],
            Self::Natural { columns } => columns.clone(),
        }
    }

    /// Derive the identifier, writing the derived slug column into the record.
    pub fn apply(&self, record: &mut Record) -> Result<Identifier, IdentifierError> {
        match self {
            Self::Slug { from, column } => {
                let raw = record
                    .get(from)
                    .and_then(key_text)
                    .ok_or_else(|| IdentifierError::MissingField(from.clone()))?;
                let slug = slugify(&raw);
                if slug.is_empty() {
                    return Err(IdentifierError::EmptySlug {
                        field: from.clone(),
                        value: raw,
                    });
                }
                record.insert(column.clone(), Value::String(slug.clone()));
                Ok(Identifier::single(slug))
            }
            Self::Natural { .. } => self.identifier_of(record),
        }
    }

    /// Read the identifier back out of an already-shaped destination row.
    pub fn identifier_of(&self, record: &Record) -> Result<Identifier, IdentifierError> {
        let mut parts = Vec::new();
        for column in self.key_columns() {
            let text = record
                .get(&column)
                .and_then(key_text)
                .filter(|t| !t.is_empty())
                .ok_or(IdentifierError::MissingField(column))?;
            parts.push(text);
        }
        Ok(Identifier(parts))
    }

    /// Identifier for a human-supplied lookup value, using the same derivation as writes.
    ///
    /// Multi-column natural keys take their components separated by `|`.
    pub fn identifier_for_lookup(&self, raw: &str) -> Result<Identifier, IdentifierError> {
        match self {
            Self::Slug { from, .. } => {
                let slug = slugify(raw);
                if slug.is_empty() {
                    return Err(IdentifierError::EmptySlug {
                        field: from.clone(),
                        value: raw.to_string(),
                    });
                }
                Ok(Identifier::single(slug))
            }
            Self::Natural { columns } => {
                let parts: Vec<String> = raw.split('|').map(|p| p.trim().to_string()).collect();
                if parts.len() != columns.len() {
                    return Err(IdentifierError::Arity {
                        expected: columns.len(),
                        got: parts.len(),
                    });
                }
                Ok(Identifier(parts))
            }
        }
    }
}

/// Destination write strategy; every job must choose one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Upsert in place on the conflict key; rows absent from the source are kept.
    Merge,
    /// Delete every destination row once, then insert the source.
    Replace,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge => f.write_str("merge"),
            Self::Replace => f.write_str("replace"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Reading,
    Transforming,
    Writing,
    Verifying,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    Committed,
    /// Already committed by an earlier run of the same input.
    Resumed,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub records: usize,
    #[serde(flatten)]
    pub status: BatchStatus,
}

impl BatchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, BatchStatus::Failed { .. })
    }
}

/// Several source records that derived the same identifier; the last one was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollapsedDuplicate {
    pub key: String,
    pub source_indexes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub source_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingKey {
    pub key: String,
    /// Nearest existing destination key, when one looks similar.
    pub closest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub expected: u64,
    pub observed: u64,
    pub table_total: u64,
    pub matches: bool,
    pub samples: Vec<Record>,
    pub missing: Vec<MissingKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    PartialFailure,
    VerificationFailed,
}

/// Machine-readable result of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub job: String,
    pub table: String,
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_records: usize,
    pub distinct_records: usize,
    pub collapsed_duplicates: Vec<CollapsedDuplicate>,
    pub rejected: Vec<RejectedRecord>,
    pub batches: Vec<BatchOutcome>,
    pub verification: Option<Verification>,
}

impl SyncReport {
    pub fn batches_succeeded(&self) -> usize {
        self.batches.iter().filter(|b| !b.is_failed()).count()
    }

    pub fn batches_failed(&self) -> usize {
        self.batches.iter().filter(|b| b.is_failed()).count()
    }

    /// Records confirmed in the destination: this run's commits plus resumed batches.
    pub fn records_written(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| !b.is_failed())
            .map(|b| b.records)
            .sum()
    }

    pub fn status(&self) -> RunStatus {
        if self.batches_failed() > 0 {
            RunStatus::PartialFailure
        } else if self.verification.as_ref().is_some_and(|v| !v.matches) {
            RunStatus::VerificationFailed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "job={} table={} mode={} records={} distinct={} batches_ok={} batches_failed={} written={} status={:?}",
            self.job,
            self.table,
            self.mode,
            self.source_records,
            self.distinct_records,
            self.batches_succeeded(),
            self.batches_failed(),
            self.records_written(),
            self.status(),
        )
    }
}
