use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reportpal_entities::discover_entities;
use reportpal_sync::{load_config_file, migrate_config_file, FeedConfig, FeedCoordinator};
use reportpal_web::{port_from_env, serve, AppState};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "reportpal-cli")]
#[command(about = "Report Pal mountain feed command-line interface")]
struct Cli {
    /// Persisted config file; environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch-and-parse cycle and print the summary.
    Fetch,
    /// Start the refresh loop and the JSON API.
    Serve,
    /// Fetch once and list every entity the document supports.
    Entities,
    /// Upgrade a persisted config file to the current version.
    MigrateConfig { path: PathBuf },
}

fn load_config(cli: &Cli) -> Result<FeedConfig> {
    match &cli.config {
        Some(path) => load_config_file(path)
            .with_context(|| format!("loading config file {}", path.display())),
        None => Ok(FeedConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command.as_ref().unwrap_or(&Commands::Fetch) {
        Commands::Fetch => {
            let coordinator = FeedCoordinator::new(load_config(&cli)?)?;
            let summary = coordinator.refresh().await?;
            println!(
                "refresh complete: run_id={} bytes={} entities={}",
                summary.run_id, summary.byte_size, summary.entity_count
            );
        }
        Commands::Serve => {
            let config = load_config(&cli)?;
            let coordinator = Arc::new(FeedCoordinator::new(config.clone())?);
            let state = AppState::new(coordinator.subscribe(), config);
            let loop_coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { loop_coordinator.run().await });
            let port = port_from_env();
            println!("serving entity API on port {port}");
            serve(state, port).await?;
        }
        Commands::Entities => {
            let config = load_config(&cli)?;
            let coordinator = FeedCoordinator::new(config.clone())?;
            if let Err(err) = coordinator.refresh().await {
                warn!(error = %err, "initial refresh failed");
            }
            match coordinator.current() {
                Some(snapshot) => {
                    for descriptor in
                        discover_entities(&snapshot.document, config.discovery_options())
                    {
                        println!("{}\t{}", descriptor.unique_id, descriptor.name);
                    }
                }
                None => println!("no document available"),
            }
        }
        Commands::MigrateConfig { path } => {
            let config = migrate_config_file(path)
                .with_context(|| format!("migrating config file {}", path.display()))?;
            println!(
                "config migrated: url={} interval={}m lifts={} trails={}",
                config.feed_url,
                config.update_interval_minutes,
                config.create_lift_entities,
                config.create_trail_entities
            );
        }
    }

    Ok(())
}
