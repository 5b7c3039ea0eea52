//! CLI/env configuration surfaces for each binary. Values are parsed with
//! `clap`'s `env` feature so every flag doubles as an environment variable;
//! no `.env` file is read (that wiring is left to the process supervisor).

use std::path::PathBuf;

use clap::Args;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Args)]
pub struct JobStoreArgs {
    #[arg(long, env, default_value = "queue.jsonl")]
    /// Path to the append-only queue log.
    pub queue_file: PathBuf,

    #[arg(long, env, default_value = "results.jsonl")]
    /// Path to the append-only terminal-results log.
    pub results_file: PathBuf,

    #[arg(long, env, default_value = ".queue.lock")]
    /// Path to the advisory lock file guarding queue/results mutation.
    pub queue_lock_file: PathBuf,

    #[arg(long, env, default_value_t = 2)]
    /// Maximum claim attempts before a job is marked failed.
    pub max_attempts: u32,

    #[arg(long, env, default_value_t = 1000)]
    /// Compact a log once it exceeds this many lines (minimum enforced: 100).
    pub compact_after_lines: usize,
}

#[derive(Debug, Clone, Args)]
pub struct AccessArgs {
    #[arg(long, env, default_value = "authorized_chats.json")]
    pub authorized_chats_file: PathBuf,

    #[arg(long, env, default_value = "whitelist.txt")]
    pub whitelist_file: PathBuf,

    #[arg(long, env, default_value = ".access.lock")]
    pub access_lock_file: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct EnqueueApiArgs {
    #[command(flatten)]
    pub job_store: JobStoreArgs,

    #[arg(long, env, default_value = "0.0.0.0")]
    pub service_host: String,

    #[arg(long, env, default_value_t = 8000)]
    pub service_port: u16,

    #[arg(long, env)]
    pub debug: bool,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub job_store: JobStoreArgs,

    #[arg(long, env, default_value = "downloads")]
    pub downloads_dir: PathBuf,

    #[arg(long, env, default_value_t = 2.0)]
    /// Seconds to sleep between empty polls (minimum enforced: 0.2).
    pub worker_poll_seconds: f64,

    #[arg(long, env, default_value = "http://127.0.0.1:8090/internal/job-events")]
    pub bot_callback_url: String,

    #[arg(long, env, default_value = "change-me")]
    pub bot_callback_secret: String,

    #[arg(long, env)]
    /// Process exactly one queued job, then exit.
    pub run_once: bool,

    #[arg(long, env)]
    pub debug: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CallbackServerArgs {
    #[command(flatten)]
    pub access: AccessArgs,

    #[arg(long, env, default_value = "127.0.0.1")]
    pub callback_host: String,

    #[arg(long, env, default_value_t = 8090)]
    pub callback_port: u16,

    #[arg(long, env, default_value = "change-me")]
    pub bot_callback_secret: String,

    #[arg(long, env, default_value = ".telegram_bot.lock")]
    pub lock_file: PathBuf,

    #[arg(long, env)]
    pub debug: bool,
}

#[derive(Debug, Clone, Args)]
pub struct StackArgs {
    #[command(flatten)]
    pub job_store: JobStoreArgs,

    #[command(flatten)]
    pub access: AccessArgs,

    #[arg(long, env, default_value = "0.0.0.0")]
    pub service_host: String,

    #[arg(long, env, default_value_t = 8000)]
    pub service_port: u16,

    #[arg(long, env, default_value = "downloads")]
    pub downloads_dir: PathBuf,

    #[arg(long, env, default_value_t = 2.0)]
    pub worker_poll_seconds: f64,

    #[arg(long, env, default_value = "127.0.0.1")]
    pub callback_host: String,

    #[arg(long, env, default_value_t = 8090)]
    pub callback_port: u16,

    #[arg(long, env, default_value = "change-me")]
    pub bot_callback_secret: String,

    #[arg(long, env, default_value = ".clipdrop_stack.lock")]
    pub lock_file: PathBuf,

    #[arg(long, env)]
    pub debug: bool,
}

pub fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let default_filter = if debug { "debug" } else { "info" };
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))?;
    tracing_subscriber::registry().with(filter_layer).with(format_layer).init();
    Ok(())
}
