//! CLI entry point for the mediadl tool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use mediadl_core::{
    EvictionPolicy, RetryPolicy, SessionConfig, SessionRegistry, TaskState,
};
use tracing::{debug, info};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Mediadl starting");

    let mut config = SessionConfig::new(&args.root)
        .with_client_id(&args.client_id)
        .with_concurrency(usize::from(args.concurrency))
        .with_retry_policy(RetryPolicy::with_max_attempts(u32::from(args.max_retries)));
    if let Some(primary) = &args.primary_root {
        config = config.with_primary_root(primary);
    }
    if let Some(budget_mb) = args.cache_budget_mb {
        config = config.with_eviction(EvictionPolicy::LeastRecentlyUsed {
            max_total_bytes: budget_mb * 1024 * 1024,
        });
    }

    let session = SessionRegistry::open(config).await?;
    let manager = session.task_manager();

    match args.command {
        Command::Add { urls, priority } => {
            for url in &urls {
                manager.enqueue(url, priority).await?;
                debug!(url = %url, priority, "queued");
            }
            println!("queued {} task(s)", urls.len());
        }

        Command::Fetch => {
            let total = manager.index().count_by_state(TaskState::Queued).await?;
            if total == 0 {
                println!("nothing queued");
            } else {
                let use_spinner = !args.quiet;
                let (progress_handle, progress_stop) =
                    spawn_progress_ui(use_spinner, Arc::clone(&session));

                let stats = manager.run_until_idle().await?;

                progress_stop.store(true, Ordering::SeqCst);
                if let Some(handle) = progress_handle {
                    let _ = handle.await;
                }

                info!(
                    completed = stats.completed(),
                    failed = stats.failed(),
                    retried = stats.retried(),
                    total = stats.total(),
                    "Fetch complete"
                );
                println!(
                    "completed {}, failed {}, retried {}",
                    stats.completed(),
                    stats.failed(),
                    stats.retried()
                );
            }
        }

        Command::List { state } => {
            let state = state
                .as_deref()
                .map(str::parse::<TaskState>)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let records = manager.list(state).await?;
            if records.is_empty() {
                println!("no tasks");
            }
            for record in records {
                let size = match record.total_bytes {
                    Some(total) => format!("{}/{}", record.bytes_downloaded, total),
                    None => format!("{}/?", record.bytes_downloaded),
                };
                println!("{:<12} {:>24} {}", record.state_str, size, record.content_id);
            }
        }

        Command::Status { url } => match manager.status(&url).await? {
            Some(record) => {
                println!("state:   {}", record.state_str);
                println!("bytes:   {}", record.bytes_downloaded);
                if let Some(total) = record.total_bytes {
                    println!("total:   {total}");
                }
                if let Some(error) = &record.last_error {
                    println!("error:   {error}");
                }
                println!("updated: {}", record.updated_at);
            }
            None => println!("no task for {url}"),
        },

        Command::Pause { url } => {
            if manager.pause(&url).await? {
                println!("paused {url}");
            } else {
                println!("{url} is not queued; nothing to pause");
            }
        }

        Command::Resume { url } => {
            if manager.resume(&url).await? {
                println!("queued {url}");
            } else {
                println!("{url} is not paused or failed; nothing to resume");
            }
        }

        Command::Remove { url } => {
            manager.remove(&url).await?;
            println!("removed {url}");
        }
    }

    session.shutdown().await;
    Ok(())
}

/// Spawns the progress UI (spinner) when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
fn spawn_progress_ui(
    use_spinner: bool,
    session: Arc<SessionRegistry>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);

    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop_signal.load(Ordering::SeqCst) {
            let counts = session.tracker().counts();
            let done = counts.completed + counts.failed;
            let total = done + counts.downloading + counts.queued;
            spinner.set_message(format!(
                "[{done}/{total}] downloading ({} active, {} queued)",
                counts.downloading, counts.queued
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        spinner.finish_and_clear();
    });

    (Some(handle), stop)
}
