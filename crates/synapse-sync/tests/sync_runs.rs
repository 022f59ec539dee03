use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use synapse_core::{BatchStatus, RunStatus, SyncMode};
use synapse_sources::JsonArrayFile;
use synapse_storage::{Filter, MemoryTableStore, TableStore};
use synapse_sync::{require_success, JobManifest, JobSpec, RunOptions, SyncError, SyncPipeline};
use tempfile::tempdir;

const MANIFEST: &str = r#"
jobs:
  - name: industry-profiles
    source: { kind: json_file, path: industries.json }
    destination: { table: industry_profiles, conflict_key: [slug] }
    identifier: { kind: slug, from: name, column: slug }
    mapping:
      keep: [name]
      payload_column: profile_data
    batch_size: 10
    mode: merge
"#;

fn job() -> JobSpec {
    JobManifest::parse(MANIFEST, ".".into())
        .expect("manifest")
        .job("industry-profiles")
        .expect("job")
        .clone()
}

fn write_source(dir: &Path, records: &[Value]) -> JsonArrayFile {
    let path = dir.join("industries.json");
    std::fs::write(&path, serde_json::to_string(records).expect("json")).expect("write source");
    JsonArrayFile::new(path)
}

/// 143 distinct industries plus one record that re-spells an earlier name.
fn industries() -> Vec<Value> {
    let mut records: Vec<Value> = (0..143)
        .map(|i| json!({"name": format!("Industry {i}"), "rank": i}))
        .collect();
    records.push(json!({"name": "INDUSTRY   7", "rank": 1007}));
    records
}

#[tokio::test]
async fn rerunning_the_same_input_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let reader = write_source(dir.path(), &industries());
    let store = Arc::new(MemoryTableStore::new());
    let pipeline = SyncPipeline::new(store.clone());

    let first = pipeline
        .run(&job(), &reader, &RunOptions::default())
        .await
        .expect("first run");
    let after_first = store.rows("industry_profiles").await;
    let second = pipeline
        .run(&job(), &reader, &RunOptions::default())
        .await
        .expect("second run");
    let after_second = store.rows("industry_profiles").await;

    assert_eq!(first.status(), RunStatus::Succeeded);
    assert_eq!(second.status(), RunStatus::Succeeded);
    assert_eq!(after_first.len(), 143);
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn respelled_names_collapse_into_one_row_last_write_wins() {
    let dir = tempdir().expect("tempdir");
    let reader = write_source(dir.path(), &industries());
    let store = Arc::new(MemoryTableStore::new());

    let report = SyncPipeline::new(store.clone())
        .run(&job(), &reader, &RunOptions::default())
        .await
        .expect("run");

    assert_eq!(report.source_records, 144);
    assert_eq!(report.distinct_records, 143);
    assert_eq!(report.collapsed_duplicates.len(), 1);
    assert_eq!(report.collapsed_duplicates[0].key, "industry-7");
    assert_eq!(report.collapsed_duplicates[0].source_indexes, vec![7, 143]);

    let rows = store.rows("industry_profiles").await;
    let industry_7 = rows
        .iter()
        .find(|row| row["slug"] == json!("industry-7"))
        .expect("industry-7 row");
    assert_eq!(industry_7["profile_data"], json!({"rank": 1007}));
}

#[tokio::test]
async fn one_failed_batch_is_isolated_and_reported() {
    let dir = tempdir().expect("tempdir");
    let reader = write_source(dir.path(), &industries());
    let store = Arc::new(MemoryTableStore::new());
    store.fail_write_calls([5]).await;

    let report = SyncPipeline::new(store.clone())
        .run(&job(), &reader, &RunOptions::default())
        .await
        .expect("run completes despite the failed batch");

    assert_eq!(report.batches.len(), 15);
    assert_eq!(report.batches_succeeded(), 14);
    assert_eq!(report.batches_failed(), 1);
    assert!(matches!(report.batches[4].status, BatchStatus::Failed { .. }));
    assert_eq!(store.rows("industry_profiles").await.len(), 133);

    let verification = report.verification.as_ref().expect("verified");
    assert_eq!(verification.expected, 143);
    assert_eq!(verification.observed, 133);
    assert!(!verification.matches);
    assert_eq!(verification.missing.len(), 10);

    let err = require_success(&report).expect_err("partial failure");
    assert!(matches!(err, SyncError::PartialFailure { failed: 1, total: 15 }));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn a_single_missing_row_fails_verification() {
    let dir = tempdir().expect("tempdir");
    let records: Vec<Value> = (0..5).map(|i| json!({"name": format!("Shop {i}")})).collect();
    let reader = write_source(dir.path(), &records);
    let store = Arc::new(MemoryTableStore::new());
    let pipeline = SyncPipeline::new(store.clone());

    pipeline
        .run(&job(), &reader, &RunOptions::default())
        .await
        .expect("seed run");
    // Somebody deletes a row behind the tool's back.
    store
        .delete("industry_profiles", &[Filter::Eq("slug".into(), json!("shop-3"))])
        .await
        .expect("delete");

    let verification = pipeline.verify_only(&job(), &reader).await.expect("verify");
    assert_eq!(verification.expected, 5);
    assert_eq!(verification.observed, 4);
    assert!(!verification.matches);
    assert_eq!(verification.missing[0].key, "shop-3");
}

#[tokio::test]
async fn replace_mode_leaves_exactly_the_source_rows() {
    let dir = tempdir().expect("tempdir");
    let reader = write_source(dir.path(), &[json!({"name": "Dentist"}), json!({"name": "Plumber"})]);
    let store = Arc::new(MemoryTableStore::new());
    store
        .seed(
            "industry_profiles",
            vec![json!({"slug": "obsolete", "name": "Obsolete"})
                .as_object()
                .cloned()
                .expect("obj")],
        )
        .await;

    let mut replace = job();
    replace.mode = SyncMode::Replace;
    let report = SyncPipeline::new(store.clone())
        .run(&replace, &reader, &RunOptions::default())
        .await
        .expect("run");

    assert_eq!(report.status(), RunStatus::Succeeded);
    let slugs: Vec<Value> = store
        .rows("industry_profiles")
        .await
        .into_iter()
        .map(|row| row["slug"].clone())
        .collect();
    assert_eq!(slugs, vec![json!("dentist"), json!("plumber")]);
}

#[tokio::test]
async fn resume_skips_batches_committed_by_the_failed_run() {
    let dir = tempdir().expect("tempdir");
    let reader = write_source(dir.path(), &industries());
    let store = Arc::new(MemoryTableStore::new());
    store.fail_write_calls([2]).await;
    let pipeline = SyncPipeline::new(store.clone()).with_state_dir(dir.path().join("state"));

    let failed = pipeline
        .run(&job(), &reader, &RunOptions::default())
        .await
        .expect("first run");
    assert_eq!(failed.batches_failed(), 1);
    let calls_after_first = store.write_calls().await;

    let resumed = pipeline
        .run(
            &job(),
            &reader,
            &RunOptions {
                resume: true,
                verify: true,
            },
        )
        .await
        .expect("resumed run");
    assert_eq!(store.write_calls().await, calls_after_first + 1);
    assert_eq!(resumed.status(), RunStatus::Succeeded);
    assert_eq!(resumed.records_written(), 143);
    assert_eq!(store.rows("industry_profiles").await.len(), 143);
}

#[tokio::test]
async fn bundled_manifest_syncs_its_sample_data() {
    let manifest_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../sync-jobs.yaml");
    let manifest = JobManifest::load(&manifest_path).expect("bundled manifest");
    assert_eq!(manifest.jobs.len(), 3);

    let job = manifest.job("industry-profiles").expect("job");
    let reader = synapse_sources::reader_for_spec(&job.source, &manifest.base_dir, None)
        .expect("reader");
    let store = Arc::new(MemoryTableStore::new());
    let report = SyncPipeline::new(store.clone())
        .run(job, reader.as_ref(), &RunOptions::default())
        .await
        .expect("run");

    assert_eq!(report.status(), RunStatus::Succeeded);
    let rows = store.rows("industry_profiles").await;
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["slug"], json!("tax-preparation"));
    assert_eq!(rows[0]["is_active"], json!(true));
    assert_eq!(rows[0]["profile_data"]["avg_ticket_usd"], json!(280));
}
