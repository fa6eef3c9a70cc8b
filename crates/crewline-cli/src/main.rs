use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crewline_core::RawRow;
use crewline_import::{ImportConfig, ImportPipeline, ImportRequest};
use crewline_mapping::normalize_header;
use crewline_storage::{connect_from_env, PgJobStore, PgRecordStore};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "crewline-cli")]
#[command(about = "Crewline bulk import command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a CSV export and commit it under a new import job.
    Import {
        file: PathBuf,
        #[arg(long)]
        data_type: String,
        #[arg(long)]
        company: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Commit a previously held import after manual approval.
    Approve { job_id: Uuid, file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Import {
            file,
            data_type,
            company,
            user,
            dry_run,
        } => {
            let (headers, rows) = read_rows(&file)?;
            let pipeline = build_pipeline().await?;
            let summary = pipeline
                .run(ImportRequest {
                    rows,
                    headers,
                    data_type,
                    dry_run,
                    file_name: file
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    company_id: company,
                    user_id: user,
                })
                .await?;
            println!(
                "import complete: job_id={} total={} valid={} errors={} duplicates={} approval={} message={:?}",
                summary.job_id,
                summary.total_rows,
                summary.valid_rows,
                summary.error_rows,
                summary.duplicate_groups,
                summary.requires_approval,
                summary.message
            );
        }
        Commands::Approve { job_id, file } => {
            let (_headers, rows) = read_rows(&file)?;
            let pipeline = build_pipeline().await?;
            let summary = pipeline.commit_approved(job_id, &rows).await?;
            println!(
                "approval complete: job_id={} errors={} message={:?}",
                summary.job_id, summary.error_rows, summary.message
            );
        }
    }

    Ok(())
}

async fn build_pipeline() -> Result<ImportPipeline> {
    let pool = connect_from_env().await?;
    Ok(ImportPipeline::new(
        ImportConfig::from_env(),
        Arc::new(PgRecordStore::new(pool.clone())),
        Arc::new(PgJobStore::new(pool)),
    ))
}

/// Reads a CSV export into header-keyed rows. Headers are normalized the same
/// way the mapper expects them; blank cells are dropped.
fn read_rows(path: &Path) -> Result<(Vec<String>, Vec<RawRow>)> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let headers = reader
        .headers()
        .context("reading header row")?
        .iter()
        .map(normalize_header)
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("reading data row")?;
        let mut row = RawRow::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            let value = value.trim();
            if !value.is_empty() {
                row.insert(header.clone(), value.to_string());
            }
        }
        rows.push(row);
    }
    Ok((headers, rows))
}
