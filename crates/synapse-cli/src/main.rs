use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use synapse_llm::{load_topics, EncyclopediaGenerator, GenerationSettings, LlmConfig, OpenAiCompatClient};
use synapse_sources::{reader_for_spec, SourceReader, SourceSpec};
use synapse_storage::{Credential, MemoryTableStore, TableStore};
use synapse_sync::{
    lookup, require_success, InterruptFlag, JobManifest, JobSpec, RunOptions, SyncConfig,
    SyncError, SyncPipeline,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "synapse")]
#[command(about = "Idempotent table sync and LLM content generation")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    debug: bool,
    /// Job manifest; ./sync-jobs.yaml when unset.
    #[arg(long, global = true, env = "SYNAPSE_JOBS_FILE")]
    jobs: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the jobs in the manifest.
    Jobs,
    /// Run one job: read, transform, write in batches, verify.
    Sync {
        job: String,
        /// Skip batches a previous interrupted or partially failed run committed.
        #[arg(long)]
        resume: bool,
        /// Write into an in-memory table instead of the destination; keeps no
        /// checkpoint or report, so it cannot resume.
        #[arg(long, conflicts_with = "resume")]
        dry_run: bool,
        /// Print the final report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Compare the destination against the job's source without writing.
    Verify { job: String },
    /// Print the destination row for a name or key, derived the way sync derives it.
    Lookup {
        job: String,
        value: String,
        /// Read with the service-role key instead of the anonymous key.
        #[arg(long)]
        privileged: bool,
    },
    /// Generate one merged article per topic from several models.
    Generate {
        #[arg(long)]
        topics: PathBuf,
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "debug,reqwest=info,hyper=info"
    } else {
        "info,reqwest=warn,hyper=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

struct Workspace {
    config: SyncConfig,
    manifest: JobManifest,
}

impl Workspace {
    fn load(jobs: Option<PathBuf>) -> Result<Self> {
        let mut config = SyncConfig::from_env();
        if let Some(path) = jobs {
            config.jobs_file = path;
        }
        let manifest = JobManifest::load(&config.jobs_file)?;
        Ok(Self { config, manifest })
    }

    fn job(&self, name: &str) -> Result<&JobSpec> {
        Ok(self.manifest.job(name)?)
    }

    fn store(&self, role: Credential) -> Result<Arc<dyn TableStore>> {
        Ok(Arc::new(self.config.table_store(role)?))
    }

    fn reader(&self, job: &JobSpec) -> Result<Box<dyn SourceReader>> {
        let upstream = match job.source {
            SourceSpec::Table { .. } => Some(self.store(Credential::Service)?),
            _ => None,
        };
        Ok(reader_for_spec(&job.source, &self.manifest.base_dir, upstream)?)
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

async fn sync(workspace: &Workspace, name: &str, resume: bool, dry_run: bool, json: bool) -> Result<()> {
    let job = workspace.job(name)?;
    let reader = workspace.reader(job)?;
    let interrupt = InterruptFlag::new();
    interrupt.install_ctrl_c();

    let pipeline = if dry_run {
        info!(job = name, "dry run: writing into an in-memory table");
        SyncPipeline::new(Arc::new(MemoryTableStore::new()))
    } else {
        SyncPipeline::new(workspace.store(Credential::Service)?)
            .with_state_dir(workspace.config.state_dir.clone())
    }
    .with_interrupt(interrupt);

    let options = RunOptions {
        resume,
        verify: true,
    };
    let report = match pipeline.run(job, reader.as_ref(), &options).await {
        Ok(report) => report,
        Err(SyncError::Interrupted(report)) => {
            if json {
                print_json(&report)?;
            }
            return Err(SyncError::Interrupted(report).into());
        }
        Err(err) => return Err(err.into()),
    };

    if json {
        print_json(&report)?;
    } else {
        println!("{}", report.summary_line());
    }
    require_success(&report)?;
    Ok(())
}

async fn verify(workspace: &Workspace, name: &str) -> Result<()> {
    let job = workspace.job(name)?;
    let reader = workspace.reader(job)?;
    let verification = SyncPipeline::new(workspace.store(Credential::Service)?)
        .verify_only(job, reader.as_ref())
        .await?;
    print_json(&verification)?;
    if !verification.matches {
        return Err(SyncError::VerificationMismatch {
            table: job.destination.table.clone(),
            expected: verification.expected,
            observed: verification.observed,
        }
        .into());
    }
    Ok(())
}

async fn lookup_row(workspace: &Workspace, name: &str, value: &str, privileged: bool) -> Result<()> {
    let job = workspace.job(name)?;
    let role = if privileged {
        Credential::Service
    } else {
        Credential::Public
    };
    let store = workspace.store(role)?;
    match lookup(store.as_ref(), job, value).await? {
        Some(row) => print_json(&row),
        None => anyhow::bail!("no row in {} for {value:?}", job.destination.table),
    }
}

async fn generate(
    topics: PathBuf,
    models: Vec<String>,
    out: PathBuf,
    concurrency: usize,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
) -> Result<bool> {
    let client = OpenAiCompatClient::from_config(&LlmConfig::from_env())?;
    let topics = load_topics(&topics).await?;
    let defaults = GenerationSettings::default();
    let settings = GenerationSettings {
        models,
        concurrency,
        temperature: temperature.or(defaults.temperature),
        max_tokens: max_tokens.or(defaults.max_tokens),
    };
    let summary = EncyclopediaGenerator::new(Arc::new(client), settings, &out)
        .generate(&topics)
        .await?;
    println!(
        "generated {}/{} articles into {} ({} failed requests, {} tokens)",
        summary.written(),
        summary.topics.len(),
        out.display(),
        summary.failed_requests(),
        summary.total_tokens
    );
    Ok(summary.failed_requests() == 0)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Jobs => {
            let workspace = Workspace::load(cli.jobs)?;
            for job in &workspace.manifest.jobs {
                println!(
                    "{}\t{}\t{}\tbatch_size={}",
                    job.name, job.destination.table, job.mode, job.batch_size
                );
            }
        }
        Commands::Sync {
            job,
            resume,
            dry_run,
            json,
        } => {
            let workspace = Workspace::load(cli.jobs)?;
            sync(&workspace, &job, resume, dry_run, json).await?;
        }
        Commands::Verify { job } => {
            let workspace = Workspace::load(cli.jobs)?;
            verify(&workspace, &job).await?;
        }
        Commands::Lookup {
            job,
            value,
            privileged,
        } => {
            let workspace = Workspace::load(cli.jobs)?;
            lookup_row(&workspace, &job, &value, privileged).await?;
        }
        Commands::Generate {
            topics,
            models,
            out,
            concurrency,
            temperature,
            max_tokens,
        } => {
            if !generate(topics, models, out, concurrency, temperature, max_tokens).await? {
                return Ok(ExitCode::from(2));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let code = err
                .downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(1);
            warn!(exit_code = code, "{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(code as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn dry_run_cannot_resume() {
        let err = Cli::try_parse_from(["synapse", "sync", "naics-codes", "--dry-run", "--resume"])
            .expect_err("conflicting flags");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);

        let cli = Cli::try_parse_from(["synapse", "sync", "naics-codes", "--dry-run", "--json"])
            .expect("dry run");
        assert!(matches!(
            cli.command,
            Commands::Sync { dry_run: true, resume: false, json: true, .. }
        ));
    }
}
