use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vaultstore::{
    MigrationJob, RetentionJob, StaticPermissions, VaultConfig, VaultKey, VaultManager,
};

#[derive(Parser)]
#[command(name = "vaultctl")]
#[command(about = "Operator tooling for the vault store")]
struct Cli {
    /// Configuration file; created with defaults when missing
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Log at debug level regardless of the config
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert vaults from the legacy per-identity layout
    Migrate,
    /// Delete vaults not modified for the configured number of days
    Purge {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        days: Option<u32>,
    },
    /// List an owner's stored vaults
    List { owner: String },
    /// Print the occupied slots of one vault
    Inspect { owner: String, index: u32 },
    /// Load, normalize and print the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = VaultConfig::load_or_init(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;
    init_logging(cli.verbose || config.debug);

    if let Command::CheckConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let permissions = Arc::new(StaticPermissions::new(config.max_vault_amount));
    let (manager, _events) = VaultManager::open(config.clone(), permissions)
        .context("Failed to open vault store")?;

    let outcome = run(&cli.command, &manager, &config).await;
    manager.shutdown().await.context("Failed to drain vault store")?;
    outcome
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .init();
}

async fn run(command: &Command, manager: &VaultManager, config: &VaultConfig) -> Result<()> {
    match command {
        Command::Migrate => {
            let report = MigrationJob::new().run(manager).await?;
            println!(
                "Migrated {} of {} legacy vaults ({} already present, {} open, {} unmapped identities)",
                report.migrated,
                report.total,
                report.already_present,
                report.skipped_open,
                report.unmapped
            );
            for failure in &report.failures {
                println!("  failed {}: {}", failure.source.display(), failure.cause);
            }
            Ok(())
        }
        Command::Purge { days } => {
            let days = purge_days(*days, config)?;
            let job = RetentionJob::new(chrono::Duration::days(i64::from(days)));
            let report = job.sweep(manager).await?;
            println!(
                "Scanned {} vaults: {} deleted, {} fresh, {} open, {} failed",
                report.scanned,
                report.deleted,
                report.skipped_fresh,
                report.skipped_open,
                report.failed
            );
            Ok(())
        }
        Command::List { owner } => {
            let indices = manager.list_vaults(owner).await?;
            if indices.is_empty() {
                println!("{} has no vaults", owner);
            }
            for index in indices {
                let key = VaultKey::new(owner.as_str(), index)?;
                let meta = manager.store().stat(&key)?;
                println!(
                    "#{:<3} {:>8} bytes  modified {}",
                    index,
                    meta.len,
                    meta.modified.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(())
        }
        Command::Inspect { owner, index } => {
            let container = manager.preview_vault(owner, *index).await?;
            println!(
                "{}#{}: {} rows, {} occupied",
                owner,
                index,
                container.rows(),
                container.occupied_count()
            );
            for (slot, item) in container.occupied() {
                let name = item.meta.display_name.as_deref().unwrap_or("");
                println!("  [{:>2}] {} x{} {}", slot, item.material, item.amount, name);
            }
            Ok(())
        }
        Command::CheckConfig => Ok(()),
    }
}

/// `--days` wins over the config; either way a zero threshold is refused.
fn purge_days(days: Option<u32>, config: &VaultConfig) -> Result<u32> {
    let days = days.unwrap_or(config.purge.days_since_last_edit);
    anyhow::ensure!(days > 0, "purge threshold must be at least one day");
    Ok(days)
}
