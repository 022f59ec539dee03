//! Reading → transforming → writing → verifying → done, plus run reports and key lookups.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use synapse_core::{PipelineStage, Record, SyncMode, SyncReport, Verification};
use synapse_sources::SourceReader;
use synapse_storage::{write_atomic, CheckpointStore, Filter, Query, TableStore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::JobSpec;
use crate::transform::{NoopTransformHook, TransformHook, TransformOutput, Transformer};
use crate::verify::Verifier;
use crate::writer::{BatchWriter, CheckpointTarget, InterruptFlag};
use crate::SyncError;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Skip batches a previous run of the same input already committed.
    pub resume: bool,
    pub verify: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            verify: true,
        }
    }
}

pub struct SyncPipeline {
    store: Arc<dyn TableStore>,
    state_dir: Option<PathBuf>,
    hook: Box<dyn TransformHook>,
    interrupt: InterruptFlag,
}

fn enter(job: &str, stage: PipelineStage) {
    info!(job, stage = ?stage, "entering stage");
}

impl SyncPipeline {
    pub fn new(store: Arc<dyn TableStore>) -> Self {
        Self {
            store,
            state_dir: None,
            hook: Box::<NoopTransformHook>::default(),
            interrupt: InterruptFlag::new(),
        }
    }

    /// Enables checkpoints and on-disk run reports under `state_dir`.
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(state_dir.into());
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn TransformHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Reading and transforming stages only.
    pub async fn prepare(
        &self,
        job: &JobSpec,
        reader: &dyn SourceReader,
    ) -> Result<TransformOutput, SyncError> {
        enter(&job.name, PipelineStage::Reading);
        let source = reader.read().await?;
        info!(records = source.len(), source = %reader.describe(), "source read");

        enter(&job.name, PipelineStage::Transforming);
        let output =
            Transformer::new(&job.identifier, &job.mapping, self.hook.as_ref()).transform(source);
        for collapsed in &output.collapsed {
            warn!(
                key = %collapsed.key,
                source_indexes = ?collapsed.source_indexes,
                "records share an identifier; keeping the last one"
            );
        }
        for rejected in &output.rejected {
            warn!(source_index = rejected.source_index, reason = %rejected.reason, "record rejected");
        }
        info!(
            distinct = output.records.len(),
            collapsed = output.collapsed.len(),
            rejected = output.rejected.len(),
            "records transformed"
        );

        if output.records.is_empty() && output.source_records > 0 {
            return Err(SyncError::Transform(format!(
                "all {} source records were rejected",
                output.source_records
            )));
        }
        if output.records.is_empty() && job.mode == SyncMode::Replace {
            return Err(SyncError::Transform(
                "replace mode with an empty source would wipe the destination".to_string(),
            ));
        }
        Ok(output)
    }

    pub async fn run(
        &self,
        job: &JobSpec,
        reader: &dyn SourceReader,
        options: &RunOptions,
    ) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, job = %job.name);
        self.run_inner(run_id, job, reader, options)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        job: &JobSpec,
        reader: &dyn SourceReader,
        options: &RunOptions,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let prepared = self.prepare(job, reader).await?;

        enter(&job.name, PipelineStage::Writing);
        let writer = BatchWriter::new(
            self.store.as_ref(),
            &job.destination.table,
            &job.destination.conflict_key,
            job.mode,
            job.batch_size,
        );
        let checkpoints = self.state_dir.clone().map(CheckpointStore::new);
        let target = checkpoints.as_ref().map(|store| CheckpointTarget {
            store,
            job: &job.name,
            resume: options.resume,
        });
        let written = writer
            .write(&prepared.records, target, &self.interrupt)
            .await?;

        let mut report = SyncReport {
            run_id,
            job: job.name.clone(),
            table: job.destination.table.clone(),
            mode: job.mode,
            started_at,
            finished_at: Utc::now(),
            source_records: prepared.source_records,
            distinct_records: prepared.records.len(),
            collapsed_duplicates: prepared.collapsed,
            rejected: prepared.rejected,
            batches: written.batches,
            verification: None,
        };

        if written.interrupted {
            report.finished_at = Utc::now();
            self.persist_report(&report).await;
            return Err(SyncError::Interrupted(Box::new(report)));
        }

        if options.verify {
            enter(&job.name, PipelineStage::Verifying);
            let verification = Verifier::new(
                self.store.as_ref(),
                &job.destination.table,
                &job.identifier,
                job.mode,
            )
            .verify(&prepared.identifiers)
            .await?;
            report.verification = Some(verification);
        }

        enter(&job.name, PipelineStage::Done);
        report.finished_at = Utc::now();
        self.persist_report(&report).await;
        info!("{}", report.summary_line());
        Ok(report)
    }

    /// Reads and transforms the source, then checks the destination without writing.
    pub async fn verify_only(
        &self,
        job: &JobSpec,
        reader: &dyn SourceReader,
    ) -> Result<Verification, SyncError> {
        let prepared = self.prepare(job, reader).await?;
        enter(&job.name, PipelineStage::Verifying);
        let verification = Verifier::new(
            self.store.as_ref(),
            &job.destination.table,
            &job.identifier,
            job.mode,
        )
        .verify(&prepared.identifiers)
        .await?;
        Ok(verification)
    }

    async fn persist_report(&self, report: &SyncReport) {
        let Some(state_dir) = &self.state_dir else {
            return;
        };
        match write_reports(state_dir, report).await {
            Ok(dir) => info!(reports_dir = %dir.display(), "run report written"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to write run report"),
        }
    }
}

/// Destination row for a human-supplied key, derived exactly as the write path derives it.
pub async fn lookup(
    store: &dyn TableStore,
    job: &JobSpec,
    raw: &str,
) -> Result<Option<Record>, SyncError> {
    let identifier = job
        .identifier
        .identifier_for_lookup(raw)
        .map_err(|err| SyncError::Configuration(format!("lookup key {raw:?}: {err}")))?;
    let mut query = Query::all().limit(1);
    for (column, part) in job.identifier.key_columns().into_iter().zip(identifier.parts()) {
        query = query.filter(Filter::Eq(column, Value::String(part.clone())));
    }
    let rows = store.select(&job.destination.table, &query).await?;
    Ok(rows.into_iter().next())
}

/// Writes `report.json` and `summary.md` under `reports/{run_id}`, each via temp file + rename.
pub async fn write_reports(state_dir: &Path, report: &SyncReport) -> anyhow::Result<PathBuf> {
    let reports_dir = state_dir.join("reports").join(report.run_id.to_string());

    let json = serde_json::to_vec_pretty(report).context("serializing sync report")?;
    write_atomic(&reports_dir.join("report.json"), &json)
        .await
        .context("writing report.json")?;
    write_atomic(
        &reports_dir.join("summary.md"),
        summary_markdown(report).as_bytes(),
    )
    .await
    .context("writing summary.md")?;
    Ok(reports_dir)
}

pub fn summary_markdown(report: &SyncReport) -> String {
    let mut lines = vec![
        format!("# Sync `{}` → `{}`", report.job, report.table),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Mode: {}", report.mode),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Status: {:?}", report.status()),
        format!("- Source records: {}", report.source_records),
        format!("- Distinct records: {}", report.distinct_records),
        format!(
            "- Batches: {} ok, {} failed",
            report.batches_succeeded(),
            report.batches_failed()
        ),
        format!("- Records written: {}", report.records_written()),
    ];

    if !report.collapsed_duplicates.is_empty() {
        lines.push(String::new());
        lines.push("## Collapsed identifiers".to_string());
        for dup in &report.collapsed_duplicates {
            lines.push(format!("- `{}` from source rows {:?}", dup.key, dup.source_indexes));
        }
    }
    if !report.rejected.is_empty() {
        lines.push(String::new());
        lines.push("## Rejected records".to_string());
        for rejected in &report.rejected {
            lines.push(format!("- row {}: {}", rejected.source_index, rejected.reason));
        }
    }
    let failed: Vec<_> = report.batches.iter().filter(|b| b.is_failed()).collect();
    if !failed.is_empty() {
        lines.push(String::new());
        lines.push("## Failed batches".to_string());
        for batch in failed {
            if let synapse_core::BatchStatus::Failed { error } = &batch.status {
                lines.push(format!("- batch {} ({} records): {}", batch.index + 1, batch.records, error));
            }
        }
    }
    if let Some(v) = &report.verification {
        lines.push(String::new());
        lines.push("## Verification".to_string());
        lines.push(format!(
            "- expected {} / observed {} / table total {} → {}",
            v.expected,
            v.observed,
            v.table_total,
            if v.matches { "match" } else { "MISMATCH" }
        ));
        for missing in &v.missing {
            match &missing.closest {
                Some(closest) => lines.push(format!(
                    "- missing `{}` (closest existing: `{closest}`)",
                    missing.key
                )),
                None => lines.push(format!("- missing `{}`", missing.key)),
            }
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestinationSpec;
    use crate::transform::FieldMapping;
    use serde_json::json;
    use synapse_core::IdentifierRule;
    use synapse_sources::{JsonArrayFile, SourceSpec};
    use synapse_storage::MemoryTableStore;
    use tempfile::tempdir;

    fn job(mode: SyncMode) -> JobSpec {
        JobSpec {
            name: "industry-profiles".into(),
            source: SourceSpec::JsonFile {
                path: "industries.json".into(),
            },
            destination: DestinationSpec {
                table: "industry_profiles".into(),
                conflict_key: vec!["slug".into()],
            },
            identifier: IdentifierRule::Slug {
                from: "name".into(),
                column: "slug".into(),
            },
            mapping: FieldMapping {
                payload_column: Some("profile_data".into()),
                keep: Some(vec!["name".into()]),
                ..Default::default()
            },
            batch_size: 2,
            mode,
        }
    }

    #[tokio::test]
    async fn run_writes_verifies_and_persists_reports() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("industries.json");
        std::fs::write(
            &source,
            r#"[{"name":"Dentist","tagline":"Smile"},{"name":"Plumber"},{"name":"Roofing Contractor"}]"#,
        )
        .expect("write");

        let store = Arc::new(MemoryTableStore::new());
        let pipeline = SyncPipeline::new(store.clone()).with_state_dir(dir.path().join("state"));
        let report = pipeline
            .run(&job(SyncMode::Merge), &JsonArrayFile::new(&source), &RunOptions::default())
            .await
            .expect("run");

        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.records_written(), 3);
        assert!(report.verification.as_ref().is_some_and(|v| v.matches));
        let rows = store.rows("industry_profiles").await;
        assert_eq!(rows[0]["profile_data"], json!({"tagline": "Smile"}));

        let reports_dir = dir
            .path()
            .join("state/reports")
            .join(report.run_id.to_string());
        let saved: SyncReport = serde_json::from_str(
            &std::fs::read_to_string(reports_dir.join("report.json")).expect("report.json"),
        )
        .expect("parse report");
        assert_eq!(saved, report);
        let summary = std::fs::read_to_string(reports_dir.join("summary.md")).expect("summary");
        assert!(summary.contains("2 ok, 0 failed"));

        let mut entries: Vec<String> = std::fs::read_dir(&reports_dir)
            .expect("read reports dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["report.json", "summary.md"]);
    }

    #[tokio::test]
    async fn interrupted_run_returns_partial_report() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("industries.json");
        std::fs::write(&source, r#"[{"name":"A"},{"name":"B"},{"name":"C"}]"#).expect("write");

        let interrupt = InterruptFlag::new();
        interrupt.trigger();
        let pipeline = SyncPipeline::new(Arc::new(MemoryTableStore::new()))
            .with_state_dir(dir.path().join("state"))
            .with_interrupt(interrupt);
        let err = pipeline
            .run(&job(SyncMode::Merge), &JsonArrayFile::new(&source), &RunOptions::default())
            .await
            .expect_err("interrupted");
        match err {
            SyncError::Interrupted(report) => {
                assert!(report.batches.is_empty());
                assert_eq!(report.distinct_records, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn replace_with_empty_source_is_refused() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("industries.json");
        std::fs::write(&source, "[]").expect("write");
        let store = Arc::new(MemoryTableStore::new());
        store
            .seed("industry_profiles", vec![json!({"slug": "keep"}).as_object().cloned().expect("obj")])
            .await;

        let pipeline = SyncPipeline::new(store.clone());
        let err = pipeline
            .run(&job(SyncMode::Replace), &JsonArrayFile::new(&source), &RunOptions::default())
            .await
            .expect_err("refused");
        assert!(matches!(err, SyncError::Transform(_)));
        assert_eq!(store.rows("industry_profiles").await.len(), 1);
    }

    #[tokio::test]
    async fn lookup_slugifies_the_query_value() {
        let store = MemoryTableStore::new();
        store
            .seed(
                "industry_profiles",
                vec![json!({"slug": "tax-preparation", "name": "Tax Preparation"})
                    .as_object()
                    .cloned()
                    .expect("obj")],
            )
            .await;
        let found = lookup(&store, &job(SyncMode::Merge), "Tax  Preparation")
            .await
            .expect("lookup")
            .expect("row");
        assert_eq!(found["name"], json!("Tax Preparation"));
        assert!(lookup(&store, &job(SyncMode::Merge), "Bookkeeping")
            .await
            .expect("lookup")
            .is_none());
    }
}
