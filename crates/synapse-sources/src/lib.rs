//! Source reader contracts + JSON file, JSON directory, and upstream-table readers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use synapse_core::Record;
use synapse_storage::{Filter, Query, TableError, TableStore};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "synapse-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {detail}", .path.display())]
    Shape { path: PathBuf, detail: String },
    #[error("querying upstream table {table}: {source}")]
    Query {
        table: String,
        #[source]
        source: TableError,
    },
    #[error("table source `{0}` has no upstream store configured")]
    NoUpstream(String),
}

/// Produces the complete, ordered list of source records for one run.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn describe(&self) -> String;

    async fn read(&self) -> Result<Vec<Record>, SourceError>;
}

/// Manifest form of a source; relative paths resolve against the manifest directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    JsonFile {
        path: PathBuf,
    },
    JsonDir {
        path: PathBuf,
        /// Field that receives the file stem when the object lacks it.
        #[serde(default)]
        id_from_filename: Option<String>,
    },
    Table {
        table: String,
        #[serde(default)]
        eq: BTreeMap<String, Value>,
        #[serde(default)]
        order_by: Option<String>,
    },
}

pub fn reader_for_spec(
    spec: &SourceSpec,
    base_dir: &Path,
    upstream: Option<Arc<dyn TableStore>>,
) -> Result<Box<dyn SourceReader>, SourceError> {
    match spec {
        SourceSpec::JsonFile { path } => Ok(Box::new(JsonArrayFile::new(base_dir.join(path)))),
        SourceSpec::JsonDir {
            path,
            id_from_filename,
        } => Ok(Box::new(JsonDirectory {
            dir: base_dir.join(path),
            id_from_filename: id_from_filename.clone(),
        })),
        SourceSpec::Table {
            table,
            eq,
            order_by,
        } => {
            let store = upstream.ok_or_else(|| SourceError::NoUpstream(table.clone()))?;
            let mut query = Query::all();
            for (column, value) in eq {
                query = query.filter(Filter::Eq(column.clone(), value.clone()));
            }
            if let Some(column) = order_by {
                query = query.order_by(column.clone(), false);
            }
            Ok(Box::new(UpstreamTable {
                store,
                table: table.clone(),
                query,
            }))
        }
    }
}

async fn read_json_file(path: &Path) -> Result<Value, SourceError> {
    let text = fs::read_to_string(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SourceError::FileNotFound(path.to_path_buf())
        } else {
            SourceError::Io {
                path: path.to_path_buf(),
                source: err,
            }
        }
    })?;
    serde_json::from_str(&text).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// A file holding one top-level array of flat objects.
#[derive(Debug, Clone)]
pub struct JsonArrayFile {
    path: PathBuf,
}

impl JsonArrayFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SourceReader for JsonArrayFile {
    fn describe(&self) -> String {
        format!("json file {}", self.path.display())
    }

    async fn read(&self) -> Result<Vec<Record>, SourceError> {
        let Value::Array(items) = read_json_file(&self.path).await? else {
            return Err(SourceError::Shape {
                path: self.path.clone(),
                detail: "expected a top-level array".to_string(),
            });
        };
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(record) => Ok(record),
                _ => Err(SourceError::Shape {
                    path: self.path.clone(),
                    detail: format!("element {index} is not an object"),
                }),
            })
            .collect()
    }
}

/// One object per `*.json` file, read in file-name order.
#[derive(Debug, Clone)]
pub struct JsonDirectory {
    dir: PathBuf,
    id_from_filename: Option<String>,
}

impl JsonDirectory {
    pub fn new(dir: impl Into<PathBuf>, id_from_filename: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            id_from_filename,
        }
    }

    async fn list_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let io_err = |source: std::io::Error| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SourceError::FileNotFound(self.dir.clone())
            } else {
                SourceError::Io {
                    path: self.dir.clone(),
                    source,
                }
            }
        };
        let mut entries = fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl SourceReader for JsonDirectory {
    fn describe(&self) -> String {
        format!("json directory {}", self.dir.display())
    }

    async fn read(&self) -> Result<Vec<Record>, SourceError> {
        let files = self.list_files().await?;
        let mut records = Vec::with_capacity(files.len());
        for path in files {
            let Value::Object(mut record) = read_json_file(&path).await? else {
                return Err(SourceError::Shape {
                    path,
                    detail: "expected a single top-level object".to_string(),
                });
            };
            if let Some(field) = &self.id_from_filename {
                if !record.contains_key(field) {
                    let stem = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    record.insert(field.clone(), Value::String(stem));
                }
            }
            records.push(record);
        }
        debug!(dir = %self.dir.display(), records = records.len(), "read json directory");
        Ok(records)
    }
}

/// Rows of a table reachable through a [`TableStore`].
pub struct UpstreamTable {
    store: Arc<dyn TableStore>,
    table: String,
    query: Query,
}

impl UpstreamTable {
    pub fn new(store: Arc<dyn TableStore>, table: impl Into<String>, query: Query) -> Self {
        Self {
            store,
            table: table.into(),
            query,
        }
    }
}

#[async_trait]
impl SourceReader for UpstreamTable {
    fn describe(&self) -> String {
        format!("upstream table {}", self.table)
    }

    async fn read(&self) -> Result<Vec<Record>, SourceError> {
        self.store
            .select(&self.table, &self.query)
            .await
            .map_err(|source| SourceError::Query {
                table: self.table.clone(),
                source,
            })
    }
}
