//! Resumable per-job checkpoints written with atomic temp-file renames.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use synapse_core::{slugify, Record};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Write `bytes` to a sibling temp file, then rename it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Which batches of one exact input already committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job: String,
    pub fingerprint: String,
    pub batch_size: usize,
    pub committed: BTreeSet<usize>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job: &str, fingerprint: &str, batch_size: usize) -> Self {
        Self {
            job: job.to_string(),
            fingerprint: fingerprint.to_string(),
            batch_size,
            committed: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// A checkpoint only applies to the same records split the same way.
    pub fn applies_to(&self, fingerprint: &str, batch_size: usize) -> bool {
        self.fingerprint == fingerprint && self.batch_size == batch_size
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into().join("checkpoints"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, job: &str) -> PathBuf {
        self.root.join(format!("{}.json", slugify(job)))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Content fingerprint of a transformed record list.
    pub fn fingerprint(records: &[Record]) -> anyhow::Result<String> {
        let bytes = serde_json::to_vec(records).context("serializing records for fingerprint")?;
        Ok(Self::sha256_hex(&bytes))
    }

    pub async fn load(&self, job: &str) -> anyhow::Result<Option<Checkpoint>> {
        let path = self.path_for(job);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking checkpoint path {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let checkpoint =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(checkpoint))
    }

    /// Replace the job's checkpoint atomically so an interrupt never leaves a torn file.
    pub async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<PathBuf> {
        let path = self.path_for(&checkpoint.job);
        let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    pub async fn clear(&self, job: &str) -> anyhow::Result<()> {
        let path = self.path_for(job);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            CheckpointStore::sha256_hex(b"industry_profiles"),
            "3b1d4bc1700a401c64286319bf9d2e4bd11278c37a0afb2da33f366095b1cd00"
        );
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = vec![json!({"slug": "a"}).as_object().cloned().expect("obj")];
        let b = vec![json!({"slug": "b"}).as_object().cloned().expect("obj")];
        assert_eq!(
            CheckpointStore::fingerprint(&a).expect("fp"),
            CheckpointStore::fingerprint(&a).expect("fp")
        );
        assert_ne!(
            CheckpointStore::fingerprint(&a).expect("fp"),
            CheckpointStore::fingerprint(&b).expect("fp")
        );
    }

    #[tokio::test]
    async fn save_load_and_clear_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("Industry Profiles").await.expect("load").is_none());

        let mut checkpoint = Checkpoint::new("Industry Profiles", "abc", 10);
        checkpoint.committed.extend([0, 1, 3]);
        let path = store.save(&checkpoint).await.expect("save");
        assert!(path.ends_with("checkpoints/industry-profiles.json"));

        checkpoint.committed.insert(4);
        store.save(&checkpoint).await.expect("overwrite");

        let loaded = store.load("Industry Profiles").await.expect("load").expect("present");
        assert_eq!(loaded.committed.len(), 4);
        assert!(loaded.applies_to("abc", 10));
        assert!(!loaded.applies_to("abc", 25));
        assert!(!loaded.applies_to("def", 10));

        store.clear("Industry Profiles").await.expect("clear");
        store.clear("Industry Profiles").await.expect("clear twice");
        assert!(store.load("Industry Profiles").await.expect("load").is_none());
    }
}
