//! In-memory table store with PostgREST-like upsert semantics and failure injection.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use synapse_core::{key_text, Record};
use tokio::sync::Mutex;

use crate::{Filter, Query, TableError, TableStore};

#[derive(Debug, Default)]
pub struct MemoryTableStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Record>>,
    unique_keys: BTreeMap<String, Vec<String>>,
    write_calls: usize,
    failing_write_calls: BTreeSet<usize>,
}

fn key_of(row: &Record, columns: &[String]) -> Option<Vec<String>> {
    columns
        .iter()
        .map(|c| row.get(c).and_then(key_text))
        .collect()
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce uniqueness of `columns` on plain inserts into `table`.
    pub async fn with_unique_key(self, table: &str, columns: &[&str]) -> Self {
        self.state.lock().await.unique_keys.insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    /// Make the given 1-based insert/upsert calls fail without touching any row.
    pub async fn fail_write_calls(&self, calls: impl IntoIterator<Item = usize>) {
        self.state.lock().await.failing_write_calls.extend(calls);
    }

    pub async fn seed(&self, table: &str, rows: Vec<Record>) {
        self.state
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Record> {
        self.state
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn write_calls(&self) -> usize {
        self.state.lock().await.write_calls
    }
}

impl MemoryState {
    fn begin_write(&mut self, table: &str) -> Result<(), TableError> {
        self.write_calls += 1;
        if self.failing_write_calls.contains(&self.write_calls) {
            return Err(TableError::Rejected(format!(
                "injected failure on write call {} to {table}",
                self.write_calls
            )));
        }
        Ok(())
    }

    fn matching<'a>(
        &'a self,
        table: &str,
        filters: &'a [Filter],
    ) -> impl Iterator<Item = &'a Record> + 'a {
        self.tables
            .get(table)
            .into_iter()
            .flatten()
            .filter(move |row| filters.iter().all(|f| f.matches(row)))
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Record>, TableError> {
        let state = self.state.lock().await;
        let mut rows: Vec<Record> = state.matching(table, &query.filters).cloned().collect();

        for order in query.order.iter().rev() {
            rows.sort_by(|a, b| {
                let ka = a.get(&order.column).and_then(key_text);
                let kb = b.get(&order.column).and_then(key_text);
                if order.descending {
                    kb.cmp(&ka)
                } else {
                    ka.cmp(&kb)
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if !query.columns.is_empty() {
            for row in &mut rows {
                row.retain(|k, _| query.columns.iter().any(|c| c == k));
            }
        }
        Ok(rows)
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64, TableError> {
        let state = self.state.lock().await;
        Ok(state.matching(table, filters).count() as u64)
    }

    async fn insert(&self, table: &str, rows: &[Record]) -> Result<(), TableError> {
        let mut state = self.state.lock().await;
        state.begin_write(table)?;

        if let Some(unique) = state.unique_keys.get(table).cloned() {
            let mut seen: HashSet<Vec<String>> = state
                .tables
                .get(table)
                .into_iter()
                .flatten()
                .filter_map(|row| key_of(row, &unique))
                .collect();
            for row in rows {
                if let Some(key) = key_of(row, &unique) {
                    if !seen.insert(key.clone()) {
                        return Err(TableError::Rejected(format!(
                            "duplicate key value {key:?} violates unique constraint on {table}"
                        )));
                    }
                }
            }
        }

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Record],
        conflict_key: &[String],
    ) -> Result<(), TableError> {
        let mut state = self.state.lock().await;
        state.begin_write(table)?;

        let mut keys = Vec::with_capacity(rows.len());
        let mut seen = HashSet::new();
        for row in rows {
            let key = key_of(row, conflict_key).ok_or_else(|| {
                TableError::Rejected(format!(
                    "row is missing conflict key columns {conflict_key:?}"
                ))
            })?;
            if !seen.insert(key.clone()) {
                return Err(TableError::Rejected(
                    "ON CONFLICT DO UPDATE command cannot affect row a second time".to_string(),
                ));
            }
            keys.push(key);
        }

        let existing = state.tables.entry(table.to_string()).or_default();
        for (row, key) in rows.iter().zip(keys) {
            match existing
                .iter_mut()
                .find(|current| key_of(current, conflict_key).as_ref() == Some(&key))
            {
                Some(current) => {
                    for (column, value) in row {
                        current.insert(column.clone(), value.clone());
                    }
                }
                None => existing.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Record,
    ) -> Result<(), TableError> {
        if filters.is_empty() {
            return Err(TableError::Unfiltered {
                op: "update",
                table: table.to_string(),
            });
        }
        let mut state = self.state.lock().await;
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| filters.iter().all(|f| f.matches(row))) {
                for (column, value) in patch {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<(), TableError> {
        if filters.is_empty() {
            return Err(TableError::Unfiltered {
                op: "delete",
                table: table.to_string(),
            });
        }
        let mut state = self.state.lock().await;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| !filters.iter().all(|f| f.matches(row)));
        }
        Ok(())
    }
}
