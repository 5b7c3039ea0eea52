use std::sync::Arc;

use clap::Parser;
use clipdrop::access_store::AccessStore;
use clipdrop::callback_server::{self, CallbackServerState, EventDispatcher, JobEvent};
use clipdrop::config::{self, CallbackServerArgs};
use clipdrop::file_lock;
use tracing::{Level, event};

async fn shutdown_upon_signal() {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
}

/// Performs the user-visible side effect for one accepted job event. The
/// chat bot runtime that actually renders/sends media is an external
/// collaborator; this default handler only logs the transition.
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
    let args = CallbackServerArgs::parse();
    config::init_tracing(args.debug)?;
    event!(Level::DEBUG, "Launching callback server...");

    let _instance_lock = file_lock::try_lock_single_instance(&args.lock_file)?;

    let access = Arc::new(AccessStore::new(
        args.access.authorized_chats_file,
        args.access.whitelist_file,
        args.access.access_lock_file,
    ));
    let dispatcher = EventDispatcher::new();
    let state = CallbackServerState::new(dispatcher.clone(), access);

    let consumer_handle = tokio::task::spawn(dispatcher.run(handle_job_event));

    let router = callback_server::router(state, &args.bot_callback_secret);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.callback_host, args.callback_port)).await?;
    event!(Level::INFO, "Callback server listening on {}:{}", args.callback_host, args.callback_port);

    axum::serve(listener, router).with_graceful_shutdown(shutdown_upon_signal()).await?;
    consumer_handle.abort();

    Ok(())
}
