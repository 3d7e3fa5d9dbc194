//! Discogs ingest - operator CLI for the dump ingestion pipeline

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use discogs_common::logging::{init_logging, LogConfig};
use discogs_ingest::config::{IngestConfig, Limits};
use discogs_ingest::models::{FileType, PeriodKey};
use discogs_ingest::progress::{BroadcastProgress, ProgressEvent, Stage};
use discogs_ingest::service::IngestService;
use discogs_ingest::store::{connect_pool, run_migrations};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
#[command(name = "discogs-ingest")]
#[command(author, version, about = "Discogs dump ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Do not render progress bars
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Download and verify the dump files of a period
    Download {
        /// Period, YYYY-MM
        period: PeriodKey,

        /// File types to download (default: all)
        #[arg(short, long, value_delimiter = ',')]
        file_types: Vec<FileType>,
    },

    /// Process downloaded files into the database
    Process(RunArgs),

    /// Decode, hash and classify without writing
    Parse(RunArgs),

    /// Show the state of one period, or of all periods
    Status {
        period: Option<PeriodKey>,
    },

    /// Return a completed or failed period to not_started
    Reset {
        period: PeriodKey,
    },

    /// Recover a period stuck downloading or processing and delete partial downloads
    ResetStuck {
        period: PeriodKey,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Period, YYYY-MM (default: newest period on disk)
    period: Option<PeriodKey>,

    /// File types to process (default: all)
    #[arg(short, long, value_delimiter = ',')]
    file_types: Vec<FileType>,

    /// Stop after this many records per file type
    #[arg(long)]
    max_records: Option<u64>,

    /// Records per transaction
    #[arg(long)]
    max_batch_size: Option<usize>,
}

impl RunArgs {
    fn limits(&self, defaults: Limits) -> Result<Limits> {
        let limits = Limits::new(
            self.max_records.or(defaults.max_records),
            self.max_batch_size.unwrap_or(defaults.max_batch_size),
        )?;
        Ok(limits)
    }
}

fn file_types_or_all(requested: &[FileType]) -> Vec<FileType> {
    if requested.is_empty() {
        FileType::ALL.to_vec()
    } else {
        requested.to_vec()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>9} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Render progress events as one bar per file type
fn spawn_progress_bars(mut rx: Receiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let mut bars: HashMap<FileType, ProgressBar> = HashMap::new();

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            let Some(file_type) = event.file_type else {
                if event.stage == Stage::Aggregated {
                    break;
                }
                continue;
            };

            let bar = bars.entry(file_type).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(bar_style());
                bar.set_prefix(file_type.as_str());
                bar
            });
            bar.set_position(event.percentage as u64);
            match event.stage {
                Stage::Downloading => bar.set_message(format!(
                    "{} / {} bytes",
                    event.records_processed,
                    event.total_records.map(|t| t.to_string()).unwrap_or_else(|| "?".into())
                )),
                stage => bar.set_message(format!("{} ({} records)", stage, event.records_processed)),
            }
            if event.stage.is_terminal() {
                bar.finish();
            }
        }

        for bar in bars.values() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    })
}

/// Cancel the period's job on Ctrl-C
fn spawn_ctrl_c_handler(service: &IngestService, period: PeriodKey) -> JoinHandle<()> {
    let service = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(period = %period, "Interrupt received; stopping after the current batch");
            let _ = service.cancel(period);
        }
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    // Environment variables take precedence
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("discogs-ingest")
        .build()
        .merge_env()
        .context("Invalid logging configuration")?;
    let _log_guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Invalid ingestion configuration")?;

    if let Command::Migrate = cli.command {
        let pool = connect_pool(&config.database)
            .await
            .context("Failed to connect to database")?;
        run_migrations(&pool).await?;
        info!("Migrations complete");
        return Ok(ExitCode::SUCCESS);
    }

    let broadcast = Arc::new(BroadcastProgress::default());
    let renderer = (!cli.no_progress).then(|| spawn_progress_bars(broadcast.subscribe()));

    let service = IngestService::connect(config.clone(), broadcast.clone())
        .await
        .context("Failed to start ingestion service")?;

    let success = match cli.command {
        Command::Migrate => true,
        Command::Download { period, file_types } => {
            let started = service
                .trigger_download(period, &file_types_or_all(&file_types))
                .await?;
            info!(period = %period, job_id = ?started.job_id, "Download running");

            let ctrl_c = spawn_ctrl_c_handler(&service, period);
            service.wait(period).await?;
            ctrl_c.abort();

            let status = service.get_status(period).await?;
            print_json(&status)?;
            status.period.error_message.is_none()
        },
        Command::Process(args) => {
            let limits = args.limits(config.limits)?;
            let period = service.resolve_period(args.period)?;
            let ctrl_c = spawn_ctrl_c_handler(&service, period);
            let summary = service
                .process(Some(period), &file_types_or_all(&args.file_types), limits)
                .await;
            ctrl_c.abort();
            let summary = summary?;
            print_json(&summary)?;
            summary.success
        },
        Command::Parse(args) => {
            let limits = args.limits(config.limits)?;
            let summary = service
                .parse(args.period, &file_types_or_all(&args.file_types), limits)
                .await?;
            print_json(&summary)?;
            summary.success
        },
        Command::Status { period: Some(period) } => {
            print_json(&service.get_status(period).await?)?;
            true
        },
        Command::Status { period: None } => {
            print_json(&service.list_periods().await?)?;
            true
        },
        Command::Reset { period } => {
            let summary = service.reset(period).await?;
            print_json(&summary)?;
            summary.success
        },
        Command::ResetStuck { period } => {
            let summary = service.reset_stuck_download(period).await?;
            print_json(&summary)?;
            summary.success
        },
    };

    service.shutdown().await;
    if let Some(renderer) = renderer {
        renderer.abort();
    }

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
