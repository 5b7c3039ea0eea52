use std::sync::Arc;

use clap::Parser;
use clipdrop::config::{self, EnqueueApiArgs};
use clipdrop::enqueue_api::{self, EnqueueApiState};
use clipdrop::job_store::JobStore;
use tracing::{Level, event};

async fn shutdown_upon_signal() {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = EnqueueApiArgs::parse();
    config::init_tracing(args.debug)?;
    event!(Level::DEBUG, "Launching enqueue API...");

    let store = Arc::new(JobStore::new(
        args.job_store.queue_file,
        args.job_store.results_file,
        args.job_store.queue_lock_file,
        args.job_store.max_attempts,
        args.job_store.compact_after_lines,
    ));

    let router = enqueue_api::router(EnqueueApiState { store });

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.service_host, args.service_port)).await?;
    event!(Level::INFO, "Listening for HTTP requests on {}:{}...", args.service_host, args.service_port);

    axum::serve(listener, router).with_graceful_shutdown(shutdown_upon_signal()).await?;

    Ok(())
}
