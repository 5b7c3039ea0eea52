//! Runs the enqueue API, worker, and callback server in a single process.
//! Convenient for local development and small deployments; production setups
//! may instead run the three binaries independently against shared files.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clipdrop::access_store::AccessStore;
use clipdrop::callback_server::{self, CallbackServerState, EventDispatcher, JobEvent};
use clipdrop::config::{self, StackArgs};
use clipdrop::enqueue_api::{self, EnqueueApiState};
use clipdrop::file_lock;
use clipdrop::job_store::JobStore;
use clipdrop::worker::WorkerState;
use clipdrop::ytdlp_downloader::YtDlpDownloader;
use tracing::{Level, event};

async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

async fn handle_job_event(job_event: JobEvent) -> anyhow::Result<()> {
    if job_event.subscribers.is_empty() {
        event!(Level::WARN, "Callback has no subscribers job_id={}", job_event.job_id);
        return Ok(());
    }
    event!(
        Level::INFO,
        "Dispatching job event job_id={} status={} subscribers={}",
        job_event.job_id,
        job_event.status,
        job_event.subscribers.len(),
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = StackArgs::parse();
    config::init_tracing(args.debug)?;
    event!(Level::DEBUG, "Launching clipdrop stack...");

    let _instance_lock = file_lock::try_lock_single_instance(&args.lock_file)?;

    let store = Arc::new(JobStore::new(
        args.job_store.queue_file,
        args.job_store.results_file,
        args.job_store.queue_lock_file,
        args.job_store.max_attempts,
        args.job_store.compact_after_lines,
    ));

    let access = Arc::new(AccessStore::new(
        args.access.authorized_chats_file,
        args.access.whitelist_file,
        args.access.access_lock_file,
    ));
    let dispatcher = EventDispatcher::new();
    let callback_state = CallbackServerState::new(dispatcher.clone(), access);
    let consumer_handle = tokio::task::spawn(dispatcher.run(handle_job_event));

    let callback_router = callback_server::router(callback_state, &args.bot_callback_secret);
    let callback_listener = tokio::net::TcpListener::bind(format!("{}:{}", args.callback_host, args.callback_port)).await?;
    event!(Level::INFO, "Callback server listening on {}:{}", args.callback_host, args.callback_port);

    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    let callback_shutdown = send_shutdown.subscribe();
    let callback_handle = tokio::task::spawn(async move {
        let mut recv_shutdown = callback_shutdown;
        axum::serve(callback_listener, callback_router)
            .with_graceful_shutdown(async move {
                let _ = recv_shutdown.recv().await;
            })
            .await
    });

    let callback_url = format!("http://{}:{}/internal/job-events", args.callback_host, args.callback_port);
    let worker_state = WorkerState::new(
        store.clone(),
        Arc::new(YtDlpDownloader),
        args.downloads_dir,
        callback_url,
        args.bot_callback_secret,
        args.debug,
    );
    let worker_shutdown = send_shutdown.subscribe();
    let poll_interval = Duration::from_secs_f64(args.worker_poll_seconds.max(0.2));
    let worker_handle = tokio::task::spawn(worker_state.run(poll_interval, false, worker_shutdown));

    let enqueue_router = enqueue_api::router(EnqueueApiState { store });
    let enqueue_listener = tokio::net::TcpListener::bind(format!("{}:{}", args.service_host, args.service_port)).await?;
    event!(Level::INFO, "Listening for HTTP requests on {}:{}...", args.service_host, args.service_port);

    axum::serve(enqueue_listener, enqueue_router)
        .with_graceful_shutdown(shutdown_upon_signal(send_shutdown))
        .await?;

    let _ = worker_handle.await;
    let _ = callback_handle.await;
    consumer_handle.abort();

    Ok(())
}
