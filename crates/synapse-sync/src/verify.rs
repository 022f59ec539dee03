//! Post-write verification: key presence counts, table totals, samples, near-miss keys.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;
use strsim::jaro_winkler;
use synapse_core::{Identifier, IdentifierRule, MissingKey, SyncMode, Verification};
use synapse_storage::{Filter, Query, TableError, TableStore};
use tracing::{info, warn};

const KEY_CHUNK: usize = 100;
const SAMPLE_ROWS: usize = 3;
const MAX_MISSING_REPORTED: usize = 20;
const NEAR_MISS_SCAN_LIMIT: usize = 5000;
const NEAR_MISS_THRESHOLD: f64 = 0.85;

pub struct Verifier<'a> {
    store: &'a dyn TableStore,
    table: &'a str,
    rule: &'a IdentifierRule,
    mode: SyncMode,
}

impl<'a> Verifier<'a> {
    pub fn new(
        store: &'a dyn TableStore,
        table: &'a str,
        rule: &'a IdentifierRule,
        mode: SyncMode,
    ) -> Self {
        Self {
            store,
            table,
            rule,
            mode,
        }
    }

    /// Identifiers among `expected` that exist in the destination.
    async fn present_keys(
        &self,
        expected: &[Identifier],
        key_columns: &[String],
    ) -> Result<HashSet<Identifier>, TableError> {
        let first_column = &key_columns[0];
        let leading: Vec<String> = expected
            .iter()
            .map(|id| id.parts()[0].clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut present = HashSet::new();
        for chunk in leading.chunks(KEY_CHUNK) {
            let values = chunk.iter().cloned().map(Value::String).collect();
            let rows = self
                .store
                .select(
                    self.table,
                    &Query::all()
                        .columns(key_columns.iter().cloned())
                        .filter(Filter::In(first_column.clone(), values)),
                )
                .await?;
            present.extend(rows.iter().filter_map(|row| self.rule.identifier_of(row).ok()));
        }
        Ok(present)
    }

    async fn samples(
        &self,
        expected: &[Identifier],
        key_columns: &[String],
    ) -> Result<Vec<synapse_core::Record>, TableError> {
        if expected.is_empty() {
            return Ok(Vec::new());
        }
        let values = expected
            .iter()
            .take(SAMPLE_ROWS)
            .map(|id| Value::String(id.parts()[0].clone()))
            .collect();
        self.store
            .select(
                self.table,
                &Query::all()
                    .filter(Filter::In(key_columns[0].clone(), values))
                    .limit(SAMPLE_ROWS),
            )
            .await
    }

    async fn near_misses(
        &self,
        missing: &[&Identifier],
        key_columns: &[String],
    ) -> Result<Vec<MissingKey>, TableError> {
        let existing: Vec<String> = self
            .store
            .select(
                self.table,
                &Query::all()
                    .columns(key_columns.iter().cloned())
                    .limit(NEAR_MISS_SCAN_LIMIT),
            )
            .await?
            .iter()
            .filter_map(|row| self.rule.identifier_of(row).ok())
            .map(|id| id.to_string())
            .collect();

        Ok(missing
            .iter()
            .map(|id| {
                let key = id.to_string();
                let closest = existing
                    .iter()
                    .map(|candidate| (jaro_winkler(&key, candidate), candidate))
                    .filter(|(score, _)| *score >= NEAR_MISS_THRESHOLD)
                    .max_by(|a, b| a.0.total_cmp(&b.0))
                    .map(|(_, candidate)| candidate.clone());
                MissingKey { key, closest }
            })
            .collect())
    }

    /// `matches` requires every expected identifier to be present; replace
    /// mode additionally requires the table to hold nothing else.
    pub async fn verify(&self, expected: &[Identifier]) -> Result<Verification, TableError> {
        let key_columns = self.rule.key_columns();
        if key_columns.is_empty() {
            return Err(TableError::Rejected(
                "identifier rule names no key columns".to_string(),
            ));
        }
        let table_total = self.store.count(self.table, &[]).await?;
        let present = if expected.is_empty() {
            HashSet::new()
        } else {
            self.present_keys(expected, &key_columns).await?
        };

        let missing_ids: Vec<&Identifier> =
            expected.iter().filter(|id| !present.contains(*id)).collect();
        let observed = (expected.len() - missing_ids.len()) as u64;
        let expected_count = expected.len() as u64;

        let mut matches = observed == expected_count;
        if self.mode == SyncMode::Replace && table_total != expected_count {
            matches = false;
        }

        let missing = if missing_ids.is_empty() {
            Vec::new()
        } else {
            let reported = &missing_ids[..missing_ids.len().min(MAX_MISSING_REPORTED)];
            self.near_misses(reported, &key_columns).await?
        };
        let samples = self.samples(expected, &key_columns).await?;

        if matches {
            info!(
                table = self.table,
                expected = expected_count,
                observed,
                table_total,
                "verification passed"
            );
        } else {
            warn!(
                table = self.table,
                expected = expected_count,
                observed,
                table_total,
                missing = missing_ids.len(),
                "verification mismatch"
            );
        }

        Ok(Verification {
            expected: expected_count,
            observed,
            table_total,
            matches,
            samples,
            missing,
        })
    }
}
