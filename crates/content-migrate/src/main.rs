//! Content Migration CLI
//!
//! CLI tool for migrating content between endpoints in dependency order.
//! Pedantic lints relaxed for CLI ergonomics.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use content_migrate::{
    HookRegistry, Manifest, MigrationConfig, MigrationEngine, MigrationResult, MigrationStatus,
};

#[derive(Parser)]
#[command(name = "content-migrate")]
#[command(version)]
#[command(about = "Migrate content between endpoints in dependency order", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a migration
    Run {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Dry run mode (don't publish or write the manifest)
        #[arg(long)]
        dry_run: bool,

        /// Batch size override
        #[arg(long)]
        batch_size: Option<usize>,

        /// Leave items that failed in an earlier run alone
        #[arg(long)]
        skip_failed: bool,
    },

    /// Validate configuration file and print the stage order
    Validate {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Show per-content-type progress from a manifest
    Status {
        /// Manifest file path
        #[arg(short, long, value_name = "FILE", default_value = "migration-manifest.json")]
        manifest: PathBuf,
    },

    /// Generate example configuration
    Init {
        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase())),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            config,
            dry_run,
            batch_size,
            skip_failed,
        } => {
            let result = run_migration(&config, dry_run, batch_size, skip_failed).await?;
            if !result.status.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Validate { config } => {
            validate_config(&config)?;
        }
        Commands::Status { manifest } => {
            show_status(&manifest)?;
        }
        Commands::Init { output } => {
            generate_config(&output)?;
        }
    }

    Ok(())
}

async fn run_migration(
    config_path: &Path,
    dry_run: bool,
    batch_size: Option<usize>,
    skip_failed: bool,
) -> anyhow::Result<MigrationResult> {
    info!("Loading configuration from {:?}", config_path);

    let mut config = MigrationConfig::from_file(config_path)?;

    if dry_run {
        config.options.dry_run = true;
    }
    if let Some(bs) = batch_size {
        config.options.batch_size = bs;
    }
    if skip_failed {
        config.options.skip_failed = true;
    }
    config.options.show_progress = true;

    let engine = MigrationEngine::from_config(&config, HookRegistry::empty())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight items");
            on_signal.cancel();
        }
    });

    let result = engine.run(&cancel).await;
    print_result(&result);
    Ok(result)
}

fn print_result(result: &MigrationResult) {
    let headline = match result.status {
        MigrationStatus::Completed => "Migration complete",
        MigrationStatus::CompletedWithErrors => "Migration complete with errors",
        MigrationStatus::Failed => "Migration failed",
        MigrationStatus::Cancelled => "Migration cancelled, rerun to resume",
    };
    println!("\n{headline}");
    println!(
        "   {:<12} {:>9} {:>9} {:>9} {:>9}",
        "Stage", "Migrated", "Skipped", "Failed", "Done"
    );
    for stage in &result.stages {
        println!(
            "   {:<12} {:>9} {:>9} {:>9} {:>9}",
            stage.content_type.as_str(),
            stage.migrated, stage.skipped, stage.failed, stage.already_migrated
        );
    }
    println!("   Duration:  {:.2}s", result.duration_secs);

    if let Some(fatal) = &result.fatal_error {
        println!("\n   Fatal: [{}] {}", fatal.code, fatal.message);
    }
    let errors: Vec<_> = result.errors().collect();
    if !errors.is_empty() {
        println!("\n   Item errors:");
        for error in errors.iter().take(20) {
            println!("     - {error}");
        }
        if errors.len() > 20 {
            println!("     ... and {} more", errors.len() - 20);
        }
    }
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    info!("Validating configuration from {:?}", config_path);

    let config = MigrationConfig::from_file(config_path)?;
    config.validate()?;
    let plan = config.pipeline().execution_plan()?;

    println!("Configuration is valid!");
    println!("   Source:      {:?}", config.source);
    println!("   Destination: {:?}", config.destination);
    println!("   Manifest:    {}", config.manifest.display());
    println!("\n{plan}");

    Ok(())
}

fn show_status(manifest_path: &Path) -> anyhow::Result<()> {
    if !manifest_path.exists() {
        anyhow::bail!("manifest {} does not exist", manifest_path.display());
    }
    let manifest = Manifest::load(manifest_path)?;
    let summary = manifest.summary();

    let errors = manifest.errors();

    if summary.is_empty() && errors.is_empty() {
        println!("Manifest is empty");
        return Ok(());
    }

    println!(
        "   {:<12} {:>9} {:>9} {:>9} {:>9}",
        "Type", "Pending", "Migrated", "Skipped", "Failed"
    );
    for (content_type, counts) in &summary {
        println!(
            "   {:<12} {:>9} {:>9} {:>9} {:>9}",
            content_type.as_str(),
            counts.pending,
            counts.migrated,
            counts.skipped,
            counts.failed
        );
    }

    if !errors.is_empty() {
        println!("\n   Run errors:");
        for error in &errors {
            println!("     - {error}");
        }
    }

    Ok(())
}

fn generate_config(output: &Path) -> anyhow::Result<()> {
    std::fs::write(output, MigrationConfig::example_yaml())?;
    println!("Generated configuration: {:?}", output);
    println!(
        "   Edit the file and run: content-migrate run --config {:?}",
        output
    );

    Ok(())
}
