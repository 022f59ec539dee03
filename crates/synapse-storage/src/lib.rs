//! Destination table access (REST + in-memory), HTTP retry policy, and resumable checkpoints.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use synapse_core::{key_text, Record};
use thiserror::Error;

mod checkpoint;
mod http;
mod memory;
mod rest;

pub use checkpoint::{write_atomic, Checkpoint, CheckpointStore};
pub use http::{retry_after, BackoffPolicy, HttpClientConfig, Replay, RetryDisposition};
pub use memory::MemoryTableStore;
pub use rest::RestTableStore;

pub const CRATE_NAME: &str = "synapse-storage";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} on {table}: {body}")]
    Status {
        status: u16,
        table: String,
        body: String,
    },
    #[error("malformed response from {table}: {detail}")]
    Decode { table: String, detail: String },
    #[error("refusing to {op} every row of {table} without a filter")]
    Unfiltered { op: &'static str, table: String },
    #[error("{0}")]
    Rejected(String),
}

/// Which key a request authenticates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// Anonymous key; row-level policies apply.
    Public,
    /// Service-role key; bypasses row-level policies.
    Service,
}

/// Row predicate in PostgREST terms.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    In(String, Vec<Value>),
    NotNull(String),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Self::Eq(c, _)
            | Self::Neq(c, _)
            | Self::Gt(c, _)
            | Self::Gte(c, _)
            | Self::Lt(c, _)
            | Self::Lte(c, _)
            | Self::In(c, _)
            | Self::NotNull(c) => c,
        }
    }

    /// `(column, "op.value")` query pair.
    pub fn to_query_pair(&self) -> (String, String) {
        let scalar = |v: &Value| key_text(v).unwrap_or_else(|| v.to_string());
        let expr = match self {
            Self::Eq(_, v) => format!("eq.{}", scalar(v)),
            Self::Neq(_, v) => format!("neq.{}", scalar(v)),
            Self::Gt(_, v) => format!("gt.{}", scalar(v)),
            Self::Gte(_, v) => format!("gte.{}", scalar(v)),
            Self::Lt(_, v) => format!("lt.{}", scalar(v)),
            Self::Lte(_, v) => format!("lte.{}", scalar(v)),
            Self::In(_, values) => {
                let items = values
                    .iter()
                    .map(|v| quote_list_item(&scalar(v)))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("in.({items})")
            }
            Self::NotNull(_) => "not.is.null".to_string(),
        };
        (self.column().to_string(), expr)
    }

    pub fn matches(&self, record: &Record) -> bool {
        let field = record.get(self.column()).filter(|v| !v.is_null());
        match (self, field) {
            (Self::NotNull(_), field) => field.is_some(),
            (_, None) => false,
            (Self::Eq(_, v), Some(f)) => compare(f, v) == Some(Ordering::Equal),
            (Self::Neq(_, v), Some(f)) => compare(f, v) != Some(Ordering::Equal),
            (Self::Gt(_, v), Some(f)) => compare(f, v) == Some(Ordering::Greater),
            (Self::Gte(_, v), Some(f)) => {
                matches!(compare(f, v), Some(Ordering::Greater | Ordering::Equal))
            }
            (Self::Lt(_, v), Some(f)) => compare(f, v) == Some(Ordering::Less),
            (Self::Lte(_, v), Some(f)) => {
                matches!(compare(f, v), Some(Ordering::Less | Ordering::Equal))
            }
            (Self::In(_, values), Some(f)) => values
                .iter()
                .any(|v| compare(f, v) == Some(Ordering::Equal)),
        }
    }
}

fn quote_list_item(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Numeric comparison when both sides are numbers, text comparison otherwise.
fn compare(field: &Value, operand: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (field.as_f64(), operand.as_f64()) {
        return a.partial_cmp(&b);
    }
    let a = key_text(field)?;
    let b = key_text(operand)?;
    Some(a.cmp(&b))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub columns: Vec<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order.push(Order {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// The five request kinds of the destination REST table API.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, TableError>;

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, TableError>;

    async fn insert(&self, table: &str, rows: &[Record]) -> Result<(), TableError>;

    /// Insert, or update in place the row sharing `conflict_key` values.
    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        conflict_key: &[String],
    ) -> Result<(), TableError>;

    async fn update(&self, table: &str, filters: &[Filter], patch: &Record)
        -> Result<(), TableError>;

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), TableError>;
}
