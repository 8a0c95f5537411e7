use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fxb_adapters::slugify;
use fxb_storage::PgStore;
use fxb_sync::{report_recent_markdown, JobRun, LookupTables, Pipeline, PipelineConfig, TierClassifier};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fxb-cli")]
#[command(about = "Forex broker data normalization pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match logo files to brokers, upload them and set `logo_url`
    MatchLogos {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Match labels from a saved broker directory page (report only)
    MatchLabels {
        #[arg(long)]
        bundle: PathBuf,
    },
    /// Infer and write regulation tiers
    ClassifyTiers {
        #[arg(long)]
        dry_run: bool,
    },
    /// Strip review/logo markers and stray whitespace from display names
    CleanNames {
        #[arg(long)]
        dry_run: bool,
    },
    /// Check every broker row and report errors and warnings
    Validate,
    /// Report near-duplicate brokers
    Dedup,
    /// Delete placeholder/test rows; previews unless --execute is given
    Purge {
        #[arg(long)]
        execute: bool,
    },
    /// Upsert brokers from a seed bundle keyed on slug
    Seed {
        #[arg(long)]
        bundle: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Classify one broker without touching the store
    Classify {
        #[arg(long)]
        name: String,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long = "regulation")]
        regulations: Vec<String>,
    },
    /// Expand regulator abbreviations to full names
    Regulators { entries: Vec<String> },
    /// Print a digest of the latest runs under reports/
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Apply SQL migrations to DATABASE_URL
    Migrate,
}

fn print_run(run: &JobRun) {
    let s = &run.report.summary;
    println!(
        "{} complete: run_id={} loaded={} planned={} updated={} skipped={} failed={} retried={} review={} reports={}",
        s.job,
        s.run_id,
        s.loaded,
        s.planned,
        s.updated,
        s.skipped,
        s.failed,
        s.retried,
        s.review_items,
        run.reports_dir.display()
    );
}

fn local_tables(config: &PipelineConfig) -> Result<Arc<LookupTables>> {
    Ok(Arc::new(LookupTables::from_workspace_root(&config.workspace_root)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    let run = match cli.command {
        Commands::MatchLogos { dir, dry_run } => {
            Pipeline::connect(config).await?.run_logo_job(&dir, dry_run).await?
        }
        Commands::MatchLabels { bundle } => Pipeline::connect(config).await?.run_label_job(&bundle).await?,
        Commands::ClassifyTiers { dry_run } => Pipeline::connect(config).await?.run_tier_job(dry_run).await?,
        Commands::CleanNames { dry_run } => Pipeline::connect(config).await?.run_name_job(dry_run).await?,
        Commands::Validate => Pipeline::connect(config).await?.run_validate_job().await?,
        Commands::Dedup => Pipeline::connect(config).await?.run_dedup_job().await?,
        Commands::Purge { execute } => Pipeline::connect(config).await?.run_purge_job(execute).await?,
        Commands::Seed {
            bundle,
            force,
            dry_run,
        } => {
            Pipeline::connect(config)
                .await?
                .run_seed_job(&bundle, force, dry_run)
                .await?
        }
        Commands::Classify {
            name,
            slug,
            regulations,
        } => {
            let classifier = TierClassifier::new(local_tables(&config)?);
            let slug = slug.unwrap_or_else(|| slugify(&name));
            let decision = classifier.classify(&slug, &name, Some(regulations.as_slice()));
            println!("{slug}: {} ({})", decision.tier, decision.basis.label());
            if !regulations.is_empty() {
                println!("regulators: {}", classifier.expand_regulations(&regulations).join("; "));
            }
            return Ok(());
        }
        Commands::Regulators { entries } => {
            let classifier = TierClassifier::new(local_tables(&config)?);
            for entry in &entries {
                match classifier.expand_regulator(entry) {
                    Some(full) => println!("{entry}: {full}"),
                    None => println!("{entry}: (not recognised)"),
                }
            }
            return Ok(());
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(runs, &config.workspace_root)?);
            return Ok(());
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgStore::connect(url, &config.brokers_table).await?;
            store.migrate().await?;
            println!("migrations applied");
            return Ok(());
        }
    };
    print_run(&run);

    Ok(())
}
