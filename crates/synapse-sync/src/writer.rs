//! Sequential batched writer with best-effort batches, checkpoints, and interrupt handling.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use synapse_core::{BatchOutcome, BatchStatus, Record, SyncMode};
use synapse_storage::{Checkpoint, CheckpointStore, Filter, TableStore};
use tracing::{info, warn};

use crate::SyncError;

/// What a received interrupt asks of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalResponse {
    /// First interrupt: finish the in-flight batch, then stop.
    FinishBatch,
    /// Interrupt while already stopping: exit immediately.
    Abort,
}

/// Set once an interrupt arrives; the writer stops before its next batch.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Records one interrupt; a second one escalates to [`SignalResponse::Abort`].
    pub fn record_signal(&self) -> SignalResponse {
        if self.0.swap(true, Ordering::SeqCst) {
            SignalResponse::Abort
        } else {
            SignalResponse::FinishBatch
        }
    }

    /// First Ctrl-C flips the flag; a second one exits with status 130.
    /// Requires a running tokio runtime.
    pub fn install_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match flag.record_signal() {
                    SignalResponse::FinishBatch => warn!(
                        "interrupt received; finishing the in-flight batch (Ctrl-C again to abort)"
                    ),
                    SignalResponse::Abort => {
                        warn!("second interrupt; aborting without waiting for the batch");
                        std::process::exit(130);
                    }
                }
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub batches: Vec<BatchOutcome>,
    pub interrupted: bool,
}

/// Where committed batch indexes are persisted between runs.
pub struct CheckpointTarget<'a> {
    pub store: &'a CheckpointStore,
    pub job: &'a str,
    pub resume: bool,
}

pub struct BatchWriter<'a> {
    store: &'a dyn TableStore,
    table: &'a str,
    conflict_key: &'a [String],
    mode: SyncMode,
    batch_size: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(
        store: &'a dyn TableStore,
        table: &'a str,
        conflict_key: &'a [String],
        mode: SyncMode,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            table,
            conflict_key,
            mode,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_count(&self, records: usize) -> usize {
        records.div_ceil(self.batch_size)
    }

    async fn load_checkpoint(
        &self,
        target: &CheckpointTarget<'_>,
        fingerprint: &str,
    ) -> Checkpoint {
        let fresh = Checkpoint::new(target.job, fingerprint, self.batch_size);
        if !target.resume {
            return fresh;
        }
        match target.store.load(target.job).await {
            Ok(Some(existing)) if existing.applies_to(fingerprint, self.batch_size) => {
                info!(
                    job = target.job,
                    committed = existing.committed.len(),
                    "resuming from checkpoint"
                );
                existing
            }
            Ok(Some(_)) => {
                warn!(job = target.job, "checkpoint belongs to different input; starting over");
                fresh
            }
            Ok(None) => fresh,
            Err(err) => {
                warn!(job = target.job, error = %format!("{err:#}"), "unreadable checkpoint; starting over");
                fresh
            }
        }
    }

    async fn clear_destination(&self) -> Result<(), SyncError> {
        let first_key = self.conflict_key.first().ok_or_else(|| {
            SyncError::Configuration(format!("no conflict key for {}", self.table))
        })?;
        info!(table = self.table, "replace mode: clearing destination");
        self.store
            .delete(self.table, &[Filter::NotNull(first_key.clone())])
            .await?;
        Ok(())
    }

    /// Both modes upsert on the conflict key; on a cleared table that is an insert.
    async fn write_batch(&self, rows: &[Record]) -> Result<(), String> {
        self.store
            .upsert(self.table, rows, self.conflict_key)
            .await
            .map_err(|err| err.to_string())
    }

    /// Replaces any earlier checkpoint for the job before this run clears or writes.
    async fn start_fresh(&self, target: &CheckpointTarget<'_>, checkpoint: &Checkpoint) {
        if let Err(err) = target.store.save(checkpoint).await {
            warn!(job = target.job, error = %format!("{err:#}"), "failed to reset checkpoint");
            if let Err(err) = target.store.clear(target.job).await {
                warn!(job = target.job, error = %format!("{err:#}"), "failed to remove stale checkpoint");
            }
        }
    }

    /// Writes every batch in order. A failed batch is recorded and skipped;
    /// only a failed replace-mode clear aborts the run.
    pub async fn write(
        &self,
        records: &[Record],
        checkpoint: Option<CheckpointTarget<'_>>,
        interrupt: &InterruptFlag,
    ) -> Result<WriteResult, SyncError> {
        let total_batches = self.batch_count(records.len());
        let mut state = match &checkpoint {
            Some(target) => {
                let fingerprint = CheckpointStore::fingerprint(records)
                    .map_err(|err| SyncError::Transform(format!("{err:#}")))?;
                Some(self.load_checkpoint(target, &fingerprint).await)
            }
            None => None,
        };
        let resumed: BTreeSet<usize> = state
            .as_ref()
            .map(|cp| cp.committed.clone())
            .unwrap_or_default();

        if resumed.is_empty() {
            if let (Some(target), Some(cp)) = (&checkpoint, state.as_ref()) {
                self.start_fresh(target, cp).await;
            }
        }
        if self.mode == SyncMode::Replace && resumed.is_empty() {
            self.clear_destination().await?;
        }

        let mut batches = Vec::with_capacity(total_batches);
        let mut written = 0usize;
        let mut interrupted = false;

        for (index, rows) in records.chunks(self.batch_size).enumerate() {
            let ordinal = index + 1;
            if resumed.contains(&index) {
                written += rows.len();
                info!(
                    "batch {ordinal}/{total_batches} resumed {written}/{} records",
                    records.len()
                );
                batches.push(BatchOutcome {
                    index,
                    records: rows.len(),
                    status: BatchStatus::Resumed,
                });
                continue;
            }
            if interrupt.is_triggered() {
                interrupted = true;
                warn!(
                    "stopping before batch {ordinal}/{total_batches}; {} batches left unwritten",
                    total_batches - index
                );
                break;
            }

            match self.write_batch(rows).await {
                Ok(()) => {
                    written += rows.len();
                    info!(
                        "batch {ordinal}/{total_batches} ok {written}/{} records",
                        records.len()
                    );
                    batches.push(BatchOutcome {
                        index,
                        records: rows.len(),
                        status: BatchStatus::Committed,
                    });
                    if let (Some(target), Some(cp)) = (&checkpoint, state.as_mut()) {
                        cp.committed.insert(index);
                        cp.updated_at = chrono::Utc::now();
                        if let Err(err) = target.store.save(cp).await {
                            warn!(error = %format!("{err:#}"), "failed to persist checkpoint");
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        "batch {ordinal}/{total_batches} failed {written}/{} records: {error}",
                        records.len()
                    );
                    batches.push(BatchOutcome {
                        index,
                        records: rows.len(),
                        status: BatchStatus::Failed { error },
                    });
                }
            }
        }

        let failed = batches.iter().any(BatchOutcome::is_failed);
        if let Some(target) = &checkpoint {
            if !failed && !interrupted {
                if let Err(err) = target.store.clear(target.job).await {
                    warn!(error = %format!("{err:#}"), "failed to clear checkpoint");
                }
            }
        }

        Ok(WriteResult {
            batches,
            interrupted,
        })
    }
}
