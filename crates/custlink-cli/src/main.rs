use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use custlink_recon::{load_match_list, open_store, write_match_report, ReconConfig, Reconciler};
use custlink_storage::PgRecordStore;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "custlink")]
#[command(about = "Link ERP customers to CRM companies")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match customers to companies and write a review report.
    Match {
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Write links back to customer records.
    Apply {
        /// Reviewed `matches.json` or bare match array. Without it a fresh
        /// match is applied.
        #[arg(long = "from")]
        from: Option<PathBuf>,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = fmt().with_env_filter(EnvFilter::from_default_env()).try_init() {
        warn!(error = %e, "tracing init failed");
    }

    let cli = Cli::parse();
    let config = ReconConfig::from_env();

    match cli.command.unwrap_or(Commands::Match { reports_dir: None }) {
        Commands::Match { reports_dir } => {
            let reports_root = reports_dir.unwrap_or_else(|| config.reports_dir.clone());
            let reconciler = Reconciler::new(open_store(&config).await?, config);
            let run = reconciler.run_match().await?;
            let run_dir = write_match_report(&reports_root, &run).await?;
            let stats = &run.report.stats;
            println!(
                "match complete: run_id={} sources={} targets={} matched={} unmatched={} report={}",
                run.run_id,
                stats.total_source,
                stats.total_target,
                stats.matched_count,
                stats.unmatched_count,
                run_dir.display()
            );
        }
        Commands::Apply { from } => {
            let matches = match from {
                Some(path) => Some(load_match_list(&path).await?),
                None => None,
            };
            let reconciler = Reconciler::new(open_store(&config).await?, config);
            let summary = reconciler.apply(matches).await?;
            println!(
                "apply complete: updated={} total={} skipped={} batches={}",
                summary.updated, summary.requested, summary.skipped, summary.batches
            );
        }
        Commands::Migrate => {
            let Some(pg) = config.pg_store_config() else {
                bail!("DATABASE_URL is not set; nothing to migrate");
            };
            PgRecordStore::connect(&pg).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            custlink_web::serve_from_env().await?;
        }
    }

    Ok(())
}
