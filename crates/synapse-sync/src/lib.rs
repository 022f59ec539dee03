//! Idempotent upsert-based sync jobs: manifest, transformer, batched writer, verifier, pipeline.

pub mod config;
pub mod pipeline;
pub mod transform;
pub mod verify;
pub mod writer;

use synapse_core::{RunStatus, SyncReport};
use synapse_sources::SourceError;
use synapse_storage::TableError;
use thiserror::Error;

pub use config::{DestinationSpec, JobManifest, JobSpec, SyncConfig, MAX_BATCH_SIZE};
pub use pipeline::{lookup, summary_markdown, write_reports, RunOptions, SyncPipeline};
pub use transform::{FieldMapping, NoopTransformHook, TransformHook, TransformOutput, Transformer};
pub use verify::Verifier;
pub use writer::{BatchWriter, CheckpointTarget, InterruptFlag, SignalResponse, WriteResult};

pub const CRATE_NAME: &str = "synapse-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    SourceRead(#[from] SourceError),
    #[error("transform failed: {0}")]
    Transform(String),
    #[error("destination error: {0}")]
    Destination(#[from] TableError),
    #[error("interrupted after {} of {} distinct records", .0.records_written(), .0.distinct_records)]
    Interrupted(Box<SyncReport>),
    #[error("{failed} of {total} batches failed")]
    PartialFailure { failed: usize, total: usize },
    #[error("verification mismatch on {table}: expected {expected}, observed {observed}")]
    VerificationMismatch {
        table: String,
        expected: u64,
        observed: u64,
    },
}

impl SyncError {
    /// Process exit code: 1 fatal, 2 some batches failed, 3 data landed but does not verify.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PartialFailure { .. } => 2,
            Self::VerificationMismatch { .. } => 3,
            _ => 1,
        }
    }
}

/// Turns a finished report into an error when any batch failed or verification did not match.
pub fn require_success(report: &SyncReport) -> Result<(), SyncError> {
    match report.status() {
        RunStatus::PartialFailure => Err(SyncError::PartialFailure {
            failed: report.batches_failed(),
            total: report.batches.len(),
        }),
        RunStatus::VerificationFailed => {
            let (expected, observed) = report
                .verification
                .as_ref()
                .map(|v| (v.expected, v.observed))
                .unwrap_or_default();
            Err(SyncError::VerificationMismatch {
                table: report.table.clone(),
                expected,
                observed,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use synapse_core::{BatchOutcome, BatchStatus, SyncMode, Verification};
    use uuid::Uuid;

    fn report(batches: Vec<BatchStatus>, verification: Option<Verification>) -> SyncReport {
        SyncReport {
            run_id: Uuid::new_v4(),
            job: "demo".into(),
            table: "demo_rows".into(),
            mode: SyncMode::Merge,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            source_records: 4,
            distinct_records: 4,
            collapsed_duplicates: Vec::new(),
            rejected: Vec::new(),
            batches: batches
                .into_iter()
                .enumerate()
                .map(|(index, status)| BatchOutcome {
                    index,
                    records: 2,
                    status,
                })
                .collect(),
            verification,
        }
    }

    fn verification(observed: u64) -> Verification {
        Verification {
            expected: 4,
            observed,
            table_total: observed,
            matches: observed == 4,
            samples: Vec::new(),
            missing: Vec::new(),
        }
    }

    #[test]
    fn exit_codes_distinguish_partial_failure_from_mismatch() {
        let ok = report(
            vec![BatchStatus::Committed, BatchStatus::Committed],
            Some(verification(4)),
        );
        assert!(require_success(&ok).is_ok());

        let mismatch = report(
            vec![BatchStatus::Committed, BatchStatus::Committed],
            Some(verification(3)),
        );
        let err = require_success(&mismatch).expect_err("mismatch");
        assert_eq!(err.exit_code(), 3);
        assert_eq!(
            err.to_string(),
            "verification mismatch on demo_rows: expected 4, observed 3"
        );

        let partial = report(
            vec![
                BatchStatus::Committed,
                BatchStatus::Failed {
                    error: "boom".into(),
                },
            ],
            Some(verification(2)),
        );
        let err = require_success(&partial).expect_err("partial");
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.to_string(), "1 of 2 batches failed");

        assert_eq!(SyncError::Configuration("x".into()).exit_code(), 1);
    }
}
