use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scale_store::{
    config::Config,
    models::{Direction, ScaleRecord, ScaleRequest},
    scaling::ImageScaler,
    services::ScaleStore,
    storage::SandboxedBlobStore,
};

#[derive(Parser)]
#[command(name = "scale-store")]
#[command(version)]
#[command(about = "Find-or-create cache for derived image scales")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Original image the scales are derived from
    #[arg(short, long, value_name = "FILE")]
    original: PathBuf,

    /// Image field name (overrides config file)
    #[arg(short, long)]
    field: Option<String>,

    /// Storage directory (overrides config file)
    #[arg(short, long, value_name = "DIR")]
    storage_path: Option<PathBuf>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find a scale by parameters, creating it unless --no-create is given
    Scale {
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        /// down, up or thumbnail
        #[arg(short, long)]
        direction: Option<Direction>,
        #[arg(short, long)]
        quality: Option<u8>,
        /// Only look up an existing scale
        #[arg(long)]
        no_create: bool,
        /// Write the scale's bytes to this file
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Show a scale by id
    Get {
        id: String,
        /// Write the scale's bytes to this file
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// List all scales in creation order
    List,
    /// Remove a scale by id
    Remove { id: String },
    /// Remove all scales
    Clear,
    /// Remove scales older than the configured (or given) maximum age
    Purge {
        #[arg(long, value_parser = humantime::parse_duration)]
        max_age: Option<Duration>,
    },
    /// Delete stored blobs no scale refers to
    Vacuum,
    /// Print scale count and total size as JSON
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("scale_store={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(field) = cli.field {
        config.storage.field = field;
    }
    if let Some(path) = cli.storage_path {
        config.storage.path = path;
    }
    config.validate()?;

    let original = tokio::fs::read(&cli.original)
        .await
        .with_context(|| format!("Failed to read original image {}", cli.original.display()))?;

    let substrate = SandboxedBlobStore::new(config.storage.path.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to open storage directory {}",
                config.storage.path.display()
            )
        })?;

    let store = ScaleStore::builder()
        .field(config.storage.field.clone())
        .original(original)
        .substrate(Arc::new(substrate))
        .scaler(Arc::new(
            ImageScaler::new().with_max_output_pixels(config.scaling.max_output_pixels),
        ))
        .defaults(config.scale_defaults())
        .open()
        .await?;

    run(&store, &config, cli.command).await
}

async fn run(store: &ScaleStore, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Scale {
            width,
            height,
            direction,
            quality,
            no_create,
            output,
        } => {
            let request = ScaleRequest {
                width,
                height,
                direction,
                quality,
            };
            match store.get_scale(&request, !no_create).await? {
                Some(record) => print_record(&record, output.as_deref()).await?,
                None => println!("No scale stored for these parameters"),
            }
        }
        Command::Get { id, output } => match store.get(&id).await? {
            Some(record) => print_record(&record, output.as_deref()).await?,
            None => println!("Scale {id} not found"),
        },
        Command::List => {
            let mut records = Box::pin(store.iter());
            while let Some(record) = records.next().await {
                println!("{}", record?);
            }
        }
        Command::Remove { id } => {
            if store.remove(&id).await? {
                println!("Removed scale {id}");
            } else {
                println!("Scale {id} not found");
            }
        }
        Command::Clear => {
            let removed = store.clear().await?;
            println!("Removed {removed} scales");
        }
        Command::Purge { max_age } => {
            let max_age = max_age.unwrap_or(config.maintenance.max_age);
            let removed = store.purge_older_than(max_age).await?;
            println!(
                "Removed {removed} scales older than {}",
                humantime::format_duration(max_age)
            );
        }
        Command::Vacuum => {
            let deleted = store.vacuum().await?;
            println!("Deleted {deleted} orphaned blobs");
        }
        Command::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn print_record(record: &ScaleRecord, output: Option<&Path>) -> Result<()> {
    println!("{record}");
    if let Some(path) = output {
        tokio::fs::write(path, record.data())
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {} bytes to {}", record.size(), path.display());
    }
    Ok(())
}
