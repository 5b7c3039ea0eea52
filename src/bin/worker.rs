use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clipdrop::config::{self, WorkerArgs};
use clipdrop::job_store::JobStore;
use clipdrop::worker::WorkerState;
use clipdrop::ytdlp_downloader::YtDlpDownloader;
use tracing::{Level, event};

async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = WorkerArgs::parse();
    config::init_tracing(args.debug)?;
    event!(Level::DEBUG, "Launching worker...");

    let store = Arc::new(JobStore::new(
        args.job_store.queue_file,
        args.job_store.results_file,
        args.job_store.queue_lock_file,
        args.job_store.max_attempts,
        args.job_store.compact_after_lines,
    ));

    let poll_interval = Duration::from_secs_f64(args.worker_poll_seconds.max(0.2));
    let worker_state = WorkerState::new(
        store,
        Arc::new(YtDlpDownloader),
        args.downloads_dir,
        args.bot_callback_url,
        args.bot_callback_secret,
        args.debug,
    );

    let (send_shutdown, recv_shutdown) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_handle = tokio::task::spawn(shutdown_upon_signal(send_shutdown));

    worker_state.run(poll_interval, args.run_once, recv_shutdown).await;
    shutdown_handle.abort();

    Ok(())
}
