//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mediadl_core::{DEFAULT_CLIENT_ID, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES};

/// Manage an offline media download session.
///
/// Mediadl fetches remote content into a resumable on-disk cache with
/// durable task state, so interrupted downloads continue where they left
/// off.
#[derive(Parser, Debug)]
#[command(name = "mediadl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Storage root for the session (index database and cached content)
    #[arg(long, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Preferred storage root, tried before --root
    #[arg(long, global = true)]
    pub primary_root: Option<PathBuf>,

    /// Client identifier sent in the User-Agent
    #[arg(long, default_value = DEFAULT_CLIENT_ID, global = true)]
    pub client_id: String,

    /// Maximum concurrent downloads (1-32)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY as u8, value_parser = clap::value_parser!(u8).range(1..=32), global = true)]
    pub concurrency: u8,

    /// Maximum retry attempts for transient failures (1-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(1..=10), global = true)]
    pub max_retries: u8,

    /// Cache budget in MiB; omit for unbounded growth (the default)
    #[arg(long, global = true)]
    pub cache_budget_mb: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Session operations.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue one or more content URLs for download
    Add {
        /// Content URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Priority (higher is claimed first)
        #[arg(short, long, default_value_t = 0)]
        priority: i64,
    },

    /// Download all queued tasks
    Fetch,

    /// List tasks, optionally filtered by state
    List {
        /// One of: queued, downloading, paused, completed, failed, removed
        #[arg(long)]
        state: Option<String>,
    },

    /// Show the status of one content URL
    Status {
        /// Content URL
        url: String,
    },

    /// Pause a queued task
    Pause {
        /// Content URL
        url: String,
    },

    /// Return a paused or failed task to the queue
    Resume {
        /// Content URL
        url: String,
    },

    /// Remove a task and its cached bytes
    Remove {
        /// Content URL
        url: String,
    },
}
