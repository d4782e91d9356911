//! recordpool server binary
//!
//! Command-line interface for the shared account pool:
//! - Serving the HTTP API
//! - Offline record administration (list, add, reset, delete)
//! - Offline claims written straight to a file
//! - Journal maintenance and statistics
//!
//! # Examples
//!
//! ```bash
//! # Start server
//! API_KEY=s3cret recordpool serve --bind 0.0.0.0 --port 8080
//!
//! # Add a record
//! recordpool records add some_account
//!
//! # Claim 25 records into a file
//! recordpool claim 25 --output accounts.txt
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use recordpool::config::Settings;
use recordpool::server::{start_server, LogSource};
use recordpool::{export, ClaimAllocator, NewRecord, RecordFilter, RecordId, RecordPatch, RecordStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// recordpool - shared pool of scraped accounts
#[derive(Parser, Debug)]
#[command(name = "recordpool")]
#[command(version = recordpool::VERSION)]
#[command(about = "Shared account pool with disjoint batch claims", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "RECORDPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory path
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),

    /// Record administration
    Records {
        #[command(subcommand)]
        command: RecordCommands,
    },

    /// Claim records offline and print or save them
    Claim(ClaimArgs),

    /// Show record counts per status
    Stats,

    /// Rewrite the journal with live records only
    Compact,

    /// Print the effective configuration
    Config,

    /// Show version
    Version,
}

/// Server arguments; anything left out falls back to the configuration
#[derive(Args, Debug)]
struct ServeArgs {
    /// HTTP bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Shared secret expected in `x-api-key`
    #[arg(long)]
    api_key: Option<String>,

    /// Disable the API key check (development mode)
    #[arg(long)]
    dev_mode: bool,

    /// Keep records in memory only
    #[arg(long)]
    in_memory: bool,

    /// Enable permissive CORS
    #[arg(long)]
    cors: bool,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum RecordCommands {
    /// List records, optionally filtered
    List {
        /// Name substring
        #[arg(short, long)]
        name: Option<String>,
        /// Exact status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Add a record
    Add {
        /// Account name
        name: String,
        /// Initial status (default: unused)
        #[arg(short, long)]
        status: Option<String>,
        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Put a record back into the pool
    Reset {
        /// Record id
        id: String,
    },

    /// Delete a record
    Delete {
        /// Record id
        id: String,
    },
}

#[derive(Args, Debug)]
struct ClaimArgs {
    /// Number of records to claim
    #[arg(allow_negative_numbers = true)]
    count: i64,

    /// Write the batch to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        settings.store.data_dir = dir.clone();
    }
    if let Some(dir) = &cli.log_dir {
        settings.logging.dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }

    // Setup logging
    setup_logging(&settings, cli.no_color)?;

    // Execute command
    match cli.command {
        Commands::Serve(args) => serve_command(settings, args).await,
        Commands::Records { command } => records_command(&settings, command).await,
        Commands::Claim(args) => claim_command(&settings, args).await,
        Commands::Stats => stats_command(&settings).await,
        Commands::Compact => compact_command(&settings),
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("recordpool {}", recordpool::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(settings: &Settings, no_color: bool) -> anyhow::Result<()> {
    let logging = &settings.logging;
    std::fs::create_dir_all(&logging.dir)
        .with_context(|| format!("creating log directory {}", logging.dir.display()))?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &logging.dir, &logging.file_prefix);

    let log_level = logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    // Console output goes to stderr so exports on stdout stay clean
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Serve command - start the HTTP server
async fn serve_command(mut settings: Settings, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        settings.server.http_addr = bind;
    }
    if let Some(port) = args.port {
        settings.server.http_port = port;
    }
    if let Some(timeout) = args.timeout {
        settings.server.timeout_secs = timeout;
    }
    if let Some(key) = args.api_key {
        settings.auth.api_key = Some(key);
    }
    settings.server.enable_cors |= args.cors;
    settings.auth.dev_mode |= args.dev_mode;
    settings.store.in_memory |= args.in_memory;

    info!(version = %recordpool::VERSION, "recordpool starting");

    let auth = settings.auth.auth_state()?;
    if settings.store.in_memory {
        warn!("In-memory store: records will not survive a restart");
    }
    let storage = settings.open_storage()?;
    info!(
        data_dir = %settings.store.data_dir.display(),
        in_memory = settings.store.in_memory,
        "Storage initialized"
    );

    let logs: LogSource = settings.logging.log_source();
    start_server(settings.server, storage, auth, logs).await
}

/// Record administration
async fn records_command(settings: &Settings, command: RecordCommands) -> anyhow::Result<()> {
    let storage = settings.open_storage()?;

    let result = match command {
        RecordCommands::List { name, status } => {
            let filter = RecordFilter {
                name,
                status: status.map(RecordStatus::from),
            };
            let records = storage.find(&filter).await?;
            if records.is_empty() {
                println!("No records found.");
            } else {
                println!("{:<36}  {:<10}  {:<25}  name", "id", "status", "scraped_at");
                for record in &records {
                    println!(
                        "{:<36}  {:<10}  {:<25}  {}",
                        record.id,
                        record.status,
                        record.scraped_at.to_rfc3339(),
                        record.name
                    );
                }
                println!("{} record(s)", records.len());
            }
            Ok(())
        }
        RecordCommands::Add {
            name,
            status,
            notes,
        } => {
            let mut new = NewRecord::named(name);
            if let Some(status) = status {
                new = new.with_status(status);
            }
            if let Some(notes) = notes {
                new = new.with_notes(notes);
            }
            let record = storage.insert(new).await?;
            println!("Added {} ({})", record.name, record.id);
            Ok(())
        }
        RecordCommands::Reset { id } => {
            let id: RecordId = id.parse()?;
            let record = storage
                .update(id, RecordPatch::status(RecordStatus::Unused))
                .await?;
            println!("Reset {} ({}) to unused", record.name, record.id);
            Ok(())
        }
        RecordCommands::Delete { id } => {
            let id: RecordId = id.parse()?;
            storage.delete(id).await?;
            println!("Deleted {}", id);
            Ok(())
        }
    };

    storage.close().await?;
    result
}

/// Offline claim
async fn claim_command(settings: &Settings, args: ClaimArgs) -> anyhow::Result<()> {
    let storage = settings.open_storage()?;
    let allocator = ClaimAllocator::new(Arc::clone(&storage));

    let batch = allocator.claim_accounts(args.count).await;
    storage.close().await?;
    let batch = batch?;

    let text = export::format_batch(&batch.records);
    match &args.output {
        Some(path) => {
            let mut contents = text;
            if !contents.is_empty() {
                contents.push('\n');
            }
            std::fs::write(path, contents)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Wrote {} record(s) to {}", batch.len(), path.display());
        }
        None => {
            if !text.is_empty() {
                println!("{}", text);
            }
        }
    }

    if batch.is_partial() {
        eprintln!(
            "Only {} of {} requested record(s) were available",
            batch.len(),
            batch.requested
        );
    }
    Ok(())
}

/// Counts per status
async fn stats_command(settings: &Settings) -> anyhow::Result<()> {
    let storage = settings.open_storage()?;
    let counts = storage.status_counts().await?;
    storage.close().await?;

    println!("Records ({})", counts.total);
    println!("───────────────────────────────");
    for (status, count) in &counts.by_status {
        println!("  {:<12} {}", status, count);
    }
    Ok(())
}

/// Journal compaction
fn compact_command(settings: &Settings) -> anyhow::Result<()> {
    let store = settings.store.open_file_store()?;
    info!("Compacting journal...");
    let live = store.compact()?;
    println!("Compacted journal: {} live record(s)", live);
    Ok(())
}
