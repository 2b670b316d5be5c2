//! Site Archiver - Main entry point
//!
//! Every command prints one JSON document on stdout. Failures print
//! `{"error": ...}` and exit non-zero.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use site_archiver::job::{JobKind, JobRecord};
use site_archiver::options::{parse_pairs, ExportOptions, RestoreOptions};
use site_archiver::{utils, ArchiverConfig, ArchiverError, Pipeline};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Content tree root (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    content_dir: Option<PathBuf>,

    /// SQLite database file (overrides config)
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    /// Storage root for archives, jobs and checkpoints (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    storage: Option<PathBuf>,

    /// Slice budget in seconds (overrides config)
    #[arg(long, global = true)]
    slice_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a complete export
    Export {
        /// Export option as key=value (repeatable)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Start an export, or advance one by a single slice
    ExportSlice {
        /// Existing export job; a new one is started when omitted
        job_id: Option<String>,
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Run a complete restore of an archive
    Restore {
        archive_id: String,
        /// Restore option as key=value (repeatable)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Start a restore, or advance one by a single slice
    RestoreSlice {
        /// Existing restore job
        job_id: Option<String>,
        /// Archive to restore when starting a new job
        #[arg(long, conflicts_with = "job_id")]
        archive: Option<String>,
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Show a job record
    Status { job_id: String },
    /// Cancel a job and remove its working directory
    Cancel { job_id: String },
    /// List archives, newest first
    List,
    /// Show archive metadata
    Show { archive_id: String },
    /// Print the container path of an archive
    Path { archive_id: String },
    /// Delete an archive
    Delete { archive_id: String },
    /// Admit an externally produced container into the catalog
    Upload { file: PathBuf },
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(output) => {
            println!("{}", pretty(&output));
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            println!("{}", pretty(&json!({ "error": format!("{:#}", e) })));
            ExitCode::FAILURE
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn load_config(args: &Args) -> Result<ArchiverConfig> {
    let mut config = if let Some(config_path) = &args.config {
        ArchiverConfig::from_file(config_path)?
    } else {
        ArchiverConfig::default()
    };

    if let Some(dir) = &args.content_dir {
        config.site.content_dir = dir.clone();
    }
    if let Some(db) = &args.database {
        config.site.database_path = db.clone();
    }
    if let Some(dir) = &args.storage {
        config.storage.dir = dir.clone();
    }
    if let Some(secs) = args.slice_secs {
        config.budget.slice_secs = secs;
    }
    Ok(config)
}

fn run(args: Args) -> Result<Value> {
    let config = load_config(&args)?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "site-archiver v{} (content: {}, storage: {})",
        env!("CARGO_PKG_VERSION"),
        config.site.content_dir.display(),
        config.storage.dir.display()
    );

    let pipeline = Pipeline::new(config)?;

    let output = match args.command {
        Command::Export { options } => {
            let options = ExportOptions::from_map(&parse_pairs(&options)?);
            job_output(pipeline.run_export_to_completion(options)?)?
        }
        Command::ExportSlice { job_id, options } => {
            let job_id = match job_id {
                Some(id) => id,
                None => {
                    let options = ExportOptions::from_map(&parse_pairs(&options)?);
                    pipeline.init_export(options)?.id
                }
            };
            job_output(pipeline.process_export_slice(&job_id)?)?
        }
        Command::Restore { archive_id, options } => {
            let options = RestoreOptions::from_map(&parse_pairs(&options)?);
            job_output(pipeline.run_restore_to_completion(&archive_id, options)?)?
        }
        Command::RestoreSlice { job_id, archive, options } => {
            let job_id = match (job_id, archive) {
                (Some(id), _) => id,
                (None, Some(archive_id)) => {
                    let options = RestoreOptions::from_map(&parse_pairs(&options)?);
                    pipeline.init_restore(&archive_id, options)?.id
                }
                (None, None) => anyhow::bail!("either a job id or --archive is required"),
            };
            job_output(pipeline.process_restore_slice(&job_id)?)?
        }
        Command::Status { job_id } => serde_json::to_value(pipeline.job_status(&job_id)?)?,
        Command::Cancel { job_id } => {
            match pipeline.job_status(&job_id).map(|r| r.kind) {
                Ok(JobKind::Restore) => pipeline.cancel_restore(&job_id)?,
                // Export jobs are the default; a record-less directory is still removable.
                _ => pipeline.cancel_export(&job_id)?,
            }
            json!({ "cancelled": job_id })
        }
        Command::List => serde_json::to_value(pipeline.list_archives())?,
        Command::Show { archive_id } => {
            let metadata = pipeline
                .get_archive_metadata(&archive_id)
                .ok_or_else(|| ArchiverError::ArchiveNotFound(archive_id.clone()))?;
            serde_json::to_value(metadata)?
        }
        Command::Path { archive_id } => {
            let path = pipeline
                .get_archive_file_path(&archive_id)
                .ok_or_else(|| ArchiverError::ArchiveNotFound(archive_id.clone()))?;
            json!({ "path": path })
        }
        Command::Delete { archive_id } => {
            let deleted = pipeline.delete_archive(&archive_id)?;
            json!({ "deleted": deleted, "id": archive_id })
        }
        Command::Upload { file } => serde_json::to_value(pipeline.handle_uploaded_archive(&file)?)?,
    };

    Ok(output)
}

/// A job that ended in a phase failure is reported as an error.
fn job_output(record: JobRecord) -> Result<Value> {
    if let Some(error) = &record.error {
        anyhow::bail!("job {} failed: {}", record.id, error);
    }
    Ok(serde_json::to_value(record)?)
}
