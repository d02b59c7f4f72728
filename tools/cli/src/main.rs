//! Stowage CLI - Command line interface for configured storage disks.
//!
//! This tool loads a disk configuration and runs single operations or
//! batches against one disk.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use stowage_batch::{delete_all_by_prefix, delete_batch, BatchOutcome, CancellationToken};
use stowage_manager::{Manager, ResolvedConfig};
use stowage_storage::{
    download_to_file, require_advanced, upload_file, DriverRegistry, ListOptions, Storage,
    UploadOptions,
};

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Stowage - one interface for many storage backends")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Storage configuration file (YAML or JSON).
    #[arg(short, long, global = true, default_value = "stowage.yaml")]
    config: PathBuf,

    /// Read the storage section from this dotted key of an application
    /// config instead of the top level.
    #[arg(long, global = true)]
    embedded_key: Option<String>,

    /// Disk to operate on (default: the configured default disk).
    #[arg(short, long, global = true, default_value = "")]
    disk: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file.
    Put {
        /// Destination key.
        key: String,

        /// Source file.
        file: PathBuf,

        /// Content type (default: detected from the file name).
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Download an object to a local file.
    Get {
        /// Source key.
        key: String,

        /// Destination file.
        file: PathBuf,
    },

    /// Write an object to stdout.
    Cat {
        key: String,
    },

    /// Delete objects.
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,

        /// Deletes in flight at once.
        #[arg(short = 'j', long, default_value_t = 8)]
        concurrency: usize,
    },

    /// List objects under a prefix.
    Ls {
        #[arg(default_value = "")]
        prefix: String,

        /// Only list direct children of the prefix.
        #[arg(long)]
        shallow: bool,
    },

    /// Delete every object under a prefix.
    Purge {
        prefix: String,

        /// Deletes in flight at once.
        #[arg(short = 'j', long, default_value_t = 16)]
        concurrency: usize,

        /// Required; purging cannot be undone.
        #[arg(long)]
        yes: bool,
    },

    /// Print the public URL of an object.
    Url {
        key: String,
    },

    /// Print a pre-signed URL of an object.
    SignedUrl {
        key: String,

        /// Validity in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },

    /// List registered storage drivers.
    Drivers,

    /// List configured disks.
    Disks,

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    // Commands that need no configuration.
    match &cli.command {
        Commands::Drivers => {
            for name in DriverRegistry::global().names() {
                println!("{}", name);
            }
            return Ok(());
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(*shell, &mut command, "stowage", &mut std::io::stdout());
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(&cli.config, cli.embedded_key.as_deref())?;
    let manager = Manager::new(config);

    let result = run(&manager, &cli.disk, cli.command).await;

    if let Err(err) = manager.close().await {
        warn!("Failed to close storage: {}", err);
    }
    result
}

fn init_logging(verbose: bool) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn load_config(path: &Path, embedded_key: Option<&str>) -> Result<ResolvedConfig> {
    let config = match embedded_key {
        Some(key) => ResolvedConfig::load_embedded_with_key(path, key),
        None => ResolvedConfig::load(path),
    };
    config.with_context(|| format!("Failed to load config {}", path.display()))
}

/// Cancellation token fired by Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for in-flight operations");
            trigger.cancel();
        }
    });
    cancel
}

async fn run(manager: &Manager, disk_name: &str, command: Commands) -> Result<()> {
    if let Commands::Disks = command {
        return cmd_disks(manager);
    }

    let disk = manager
        .disk(disk_name)
        .with_context(|| format!("Failed to open disk '{}'", disk_name))?;

    match command {
        Commands::Put {
            key,
            file,
            content_type,
        } => cmd_put(&disk, &key, &file, content_type).await,

        Commands::Get { key, file } => cmd_get(&disk, &key, &file).await,

        Commands::Cat { key } => cmd_cat(&disk, &key).await,

        Commands::Rm { keys, concurrency } => cmd_rm(disk, keys, concurrency).await,

        Commands::Ls { prefix, shallow } => cmd_ls(&disk, &prefix, shallow).await,

        Commands::Purge {
            prefix,
            concurrency,
            yes,
        } => cmd_purge(disk, &prefix, concurrency, yes).await,

        Commands::Url { key } => {
            println!("{}", disk.public_url(&key).await?);
            Ok(())
        }

        Commands::SignedUrl { key, ttl } => {
            let url = require_advanced(disk.as_ref())?
                .signed_url(&key, Duration::from_secs(ttl))
                .await?;
            println!("{}", url);
            Ok(())
        }

        Commands::Drivers | Commands::Disks | Commands::Completions { .. } => Ok(()),
    }
}

/// Upload a local file.
async fn cmd_put(
    disk: &Arc<dyn Storage>,
    key: &str,
    file: &Path,
    content_type: Option<String>,
) -> Result<()> {
    info!("Uploading {} to {}", file.display(), key);

    let mut options = UploadOptions::new();
    if let Some(content_type) = content_type {
        options = options.with_content_type(content_type);
    }

    let result = upload_file(disk.as_ref(), key, file, options)
        .await
        .with_context(|| format!("Failed to upload {}", file.display()))?;

    println!("Uploaded {} ({} bytes)", result.key, result.size);
    if let Some(url) = result.url {
        println!("  URL: {}", url);
    }
    Ok(())
}

/// Download an object to a local file.
async fn cmd_get(disk: &Arc<dyn Storage>, key: &str, file: &Path) -> Result<()> {
    let written = download_to_file(disk.as_ref(), key, file)
        .await
        .with_context(|| format!("Failed to download {}", key))?;
    println!("Downloaded {} to {} ({} bytes)", key, file.display(), written);
    Ok(())
}

async fn cmd_cat(disk: &Arc<dyn Storage>, key: &str) -> Result<()> {
    let mut stream = disk.download(key).await?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await {
        stdout.write_all(&chunk?).await?;
    }
    stdout.flush().await?;
    Ok(())
}

async fn cmd_rm(disk: Arc<dyn Storage>, keys: Vec<String>, concurrency: usize) -> Result<()> {
    let cancel = interrupt_token();
    let outcome = delete_batch(disk, keys, concurrency, &cancel).await;
    report(&outcome, "deleted")
}

async fn cmd_ls(disk: &Arc<dyn Storage>, prefix: &str, shallow: bool) -> Result<()> {
    let advanced = require_advanced(disk.as_ref())?;

    let mut marker: Option<String> = None;
    let mut count = 0usize;
    loop {
        let mut options = ListOptions::default();
        if shallow {
            options = options.with_delimiter("/");
        }
        if let Some(marker) = marker.take() {
            options = options.with_marker(marker);
        }

        let page = advanced.list(prefix, options).await?;
        for file in &page.files {
            let modified = file
                .last_modified
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:>12}  {}  {}", file.size, modified, file.key);
        }
        count += page.files.len();

        if !page.is_truncated || page.next_marker.is_none() {
            break;
        }
        marker = page.next_marker;
    }

    info!("{} object(s)", count);
    Ok(())
}

async fn cmd_purge(
    disk: Arc<dyn Storage>,
    prefix: &str,
    concurrency: usize,
    yes: bool,
) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to purge '{}' without --yes", prefix);
    }

    let cancel = interrupt_token();
    let outcome = delete_all_by_prefix(disk, prefix, concurrency, &cancel)
        .await
        .with_context(|| format!("Failed to list '{}'", prefix))?;
    report(&outcome, "deleted")
}

fn cmd_disks(manager: &Manager) -> Result<()> {
    let config = manager.config();
    for name in config.disk_names() {
        let marker = if name == config.default { "*" } else { " " };
        let driver = config.disk(name).map(|d| d.driver.as_str()).unwrap_or("?");
        println!("{} {:<20} {}", marker, name, driver);
    }
    Ok(())
}

fn report<R>(outcome: &BatchOutcome<R>, verb: &str) -> Result<()> {
    for failure in &outcome.failed {
        eprintln!("  {}: {}", failure.key, failure.error);
    }
    println!(
        "{} {} of {} object(s)",
        verb,
        outcome.succeeded.len(),
        outcome.total()
    );

    if !outcome.is_success() {
        anyhow::bail!("{} object(s) failed", outcome.failed.len());
    }
    Ok(())
}
