//! Environment configuration and the YAML job manifest.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use synapse_core::{IdentifierRule, SyncMode};
use synapse_sources::SourceSpec;
use synapse_storage::{Credential, HttpClientConfig, RestTableStore};

use crate::transform::FieldMapping;
use crate::SyncError;

pub const MAX_BATCH_SIZE: usize = 500;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Connection settings and local paths, injected once and threaded through every job.
#[derive(Clone)]
pub struct SyncConfig {
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    pub service_role_key: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub state_dir: PathBuf,
    pub jobs_file: PathBuf,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "<redacted>");
        f.debug_struct("SyncConfig")
            .field("supabase_url", &self.supabase_url)
            .field("anon_key", &redact(&self.anon_key))
            .field("service_role_key", &redact(&self.service_role_key))
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("state_dir", &self.state_dir)
            .field("jobs_file", &self.jobs_file)
            .finish()
    }
}

impl SyncConfig {
    /// Missing connection settings only fail once a store is actually requested.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            supabase_url: non_empty("SUPABASE_URL"),
            anon_key: non_empty("SUPABASE_ANON_KEY"),
            service_role_key: non_empty("SUPABASE_SERVICE_ROLE_KEY"),
            http_timeout_secs: non_empty("SYNAPSE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs >= 1)
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            user_agent: non_empty("SYNAPSE_USER_AGENT")
                .unwrap_or_else(|| "synapse-sync/0.1".to_string()),
            state_dir: non_empty("SYNAPSE_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.synapse")),
            jobs_file: non_empty("SYNAPSE_JOBS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sync-jobs.yaml")),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn credential(&self, role: Credential) -> Result<&str, SyncError> {
        let (key, var) = match role {
            Credential::Public => (&self.anon_key, "SUPABASE_ANON_KEY"),
            Credential::Service => (&self.service_role_key, "SUPABASE_SERVICE_ROLE_KEY"),
        };
        key.as_deref()
            .ok_or_else(|| SyncError::Configuration(format!("{var} is not set")))
    }

    pub fn table_store(&self, role: Credential) -> Result<RestTableStore, SyncError> {
        let url = self
            .supabase_url
            .as_deref()
            .ok_or_else(|| SyncError::Configuration("SUPABASE_URL is not set".to_string()))?;
        let key = self.credential(role)?;
        RestTableStore::new(url, key, &self.http_config())
            .map_err(|err| SyncError::Configuration(format!("{err:#}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationSpec {
    pub table: String,
    pub conflict_key: Vec<String>,
}

fn default_batch_size() -> usize {
    25
}

/// One parameterized synchronization: source, identifier, mapping, destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub source: SourceSpec,
    pub destination: DestinationSpec,
    pub identifier: IdentifierRule,
    #[serde(default)]
    pub mapping: FieldMapping,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub mode: SyncMode,
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), SyncError> {
        let fail = |detail: String| {
            Err(SyncError::Configuration(format!("job `{}`: {detail}", self.name)))
        };
        if self.name.trim().is_empty() {
            return Err(SyncError::Configuration("job with an empty name".to_string()));
        }
        if self.destination.table.trim().is_empty() {
            return fail("destination table is empty".to_string());
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return fail(format!(
                "batch_size {} outside 1..={MAX_BATCH_SIZE}",
                self.batch_size
            ));
        }
        if self.destination.conflict_key.is_empty() {
            return fail("conflict_key must name at least one column".to_string());
        }
        for column in self.identifier.key_columns() {
            if !self.destination.conflict_key.contains(&column) {
                return fail(format!(
                    "identifier column `{column}` is not part of conflict_key {:?}",
                    self.destination.conflict_key
                ));
            }
        }
        if let IdentifierRule::Natural { columns } = &self.identifier {
            if columns.is_empty() {
                return fail("natural identifier needs at least one column".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    jobs: Vec<JobSpec>,
}

/// Validated jobs plus the directory relative source paths resolve against.
#[derive(Debug, Clone)]
pub struct JobManifest {
    pub base_dir: PathBuf,
    pub jobs: Vec<JobSpec>,
}

impl JobManifest {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Configuration(format!("reading job manifest {}: {err}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&text, base_dir).map_err(|err| match err {
            SyncError::Configuration(detail) => {
                SyncError::Configuration(format!("{}: {detail}", path.display()))
            }
            other => other,
        })
    }

    pub fn parse(text: &str, base_dir: PathBuf) -> Result<Self, SyncError> {
        let file: ManifestFile = serde_yaml::from_str(text)
            .map_err(|err| SyncError::Configuration(format!("parsing job manifest: {err}")))?;
        let mut names = HashSet::new();
        for job in &file.jobs {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "duplicate job name `{}`",
                    job.name
                )));
            }
        }
        Ok(Self {
            base_dir,
            jobs: file.jobs,
        })
    }

    pub fn job(&self, name: &str) -> Result<&JobSpec, SyncError> {
        self.jobs.iter().find(|j| j.name == name).ok_or_else(|| {
            let known = self
                .jobs
                .iter()
                .map(|j| j.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            SyncError::Configuration(format!("unknown job `{name}` (known: {known})"))
        })
    }
}
