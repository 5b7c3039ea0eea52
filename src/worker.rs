//! Claim → download → mark → notify loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{Level, event};

use crate::downloader::{DownloadResult, Downloader};
use crate::job_store::{Job, JobStatus, JobStore, Subscriber};

pub fn build_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

#[derive(Debug, Clone, Serialize)]
pub struct JobEventPayload<'a> {
    pub event_id: String,
    pub job_id: &'a str,
    pub status: &'a str,
    pub platform: String,
    pub input_url: &'a str,
    pub result: &'a Option<DownloadResult>,
    pub error: &'a Option<String>,
    pub subscribers: &'a [Subscriber],
}

fn build_event_payload<'a>(job: &'a Job, status: &'a str) -> JobEventPayload<'a> {
    JobEventPayload {
        event_id: format!("{}:{}:{}", job.job_id, status, job.attempts),
        job_id: &job.job_id,
        status,
        platform: job.platform.to_string(),
        input_url: &job.input_url,
        result: &job.result,
        error: &job.error,
        subscribers: &job.subscribers,
    }
}

#[derive(Clone)]
pub struct WorkerState {
    store: Arc<JobStore>,
    downloader: Arc<dyn Downloader>,
    downloads_dir: PathBuf,
    bot_callback_url: String,
    bot_callback_secret: String,
    debug: bool,
    worker_id: String,
}

const CALLBACK_RETRIES: u32 = 3;
const CALLBACK_RETRY_DELAY: Duration = Duration::from_millis(800);

impl WorkerState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<JobStore>,
        downloader: Arc<dyn Downloader>,
        downloads_dir: PathBuf,
        bot_callback_url: String,
        bot_callback_secret: String,
        debug: bool,
    ) -> Self {
        Self {
            store,
            downloader,
            downloads_dir,
            bot_callback_url,
            bot_callback_secret,
            debug,
            worker_id: build_worker_id(),
        }
    }

    fn send_callback_with_retries(&self, payload: &JobEventPayload<'_>) -> anyhow::Result<()> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .pool_idle_timeout(Duration::from_secs(20))
            .build()?;

        let mut last_error = None;
        for attempt in 1..=CALLBACK_RETRIES.max(1) {
            let outcome = client
                .post(&self.bot_callback_url)
                .header("X-Internal-Token", &self.bot_callback_secret)
                .json(payload)
                .send()
                .and_then(reqwest::blocking::Response::error_for_status);

            match outcome {
                Ok(_) => return Ok(()),
                Err(err) => {
                    last_error = Some(err);
                    if attempt < CALLBACK_RETRIES {
                        std::thread::sleep(CALLBACK_RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_error.map_or_else(|| anyhow::anyhow!("callback failed"), Into::into))
    }

    fn emit_event(&self, job: &Job, status: &str) {
        let payload = build_event_payload(job, status);
        let event_id = payload.event_id.clone();
        let callback_error = match self.send_callback_with_retries(&payload) {
            Ok(()) => None,
            Err(err) => {
                event!(Level::WARN, "Callback failed job_id={} status={} error={err}", job.job_id, status);
                Some(err.to_string())
            }
        };
        if let Err(err) = self.store.mark_notification(&job.job_id, &event_id, callback_error) {
            event!(Level::ERROR, "Failed to record notification job_id={}: {err}", job.job_id);
        }
    }

    fn process_one(&self) -> anyhow::Result<bool> {
        let Some(job) = self.store.claim_next(&self.worker_id)? else {
            return Ok(false);
        };

        event!(
            Level::INFO,
            "Claimed job job_id={} platform={} attempt={}/{}",
            job.job_id,
            job.platform,
            job.attempts,
            job.max_attempts,
        );
        self.emit_event(&job, "started");

        match self.downloader.download(&job.input_url, job.platform, &self.downloads_dir, self.debug) {
            Ok(result) => self.finish_success(&job, result),
            Err(err) => self.finish_failure(&job, &err),
        }

        Ok(true)
    }

    fn finish_success(&self, job: &Job, result: DownloadResult) {
        match self.store.mark_done(&job.job_id, result) {
            Ok(Some(finished)) => {
                event!(Level::INFO, "Job done job_id={}", job.job_id);
                self.emit_event(&finished, "done");
            }
            Ok(None) => {
                event!(Level::ERROR, "Job disappeared before mark_done job_id={}", job.job_id);
            }
            Err(err) => {
                event!(Level::ERROR, "mark_done failed job_id={}: {err}", job.job_id);
            }
        }
    }

    fn finish_failure(&self, job: &Job, err: &anyhow::Error) {
        event!(Level::WARN, "Download failed job_id={}: {err:#}", job.job_id);
        match self.store.mark_failed_or_retry(&job.job_id, &format!("{err:#}")) {
            Ok((Some(_), Some(JobStatus::Queued))) => {
                event!(Level::WARN, "Job failed and re-queued job_id={}", job.job_id);
            }
            Ok((Some(updated), Some(JobStatus::Failed))) => {
                event!(Level::ERROR, "Job failed permanently job_id={}", job.job_id);
                self.emit_event(&updated, "failed");
            }
            Ok(_) => {
                event!(Level::ERROR, "Job update failed after error job_id={}", job.job_id);
            }
            Err(store_err) => {
                event!(Level::ERROR, "mark_failed_or_retry failed job_id={}: {store_err}", job.job_id);
            }
        }
    }

    pub async fn run(
        self,
        poll_interval: Duration,
        run_once: bool,
        mut recv_shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        event!(Level::INFO, "Worker started worker_id={}", self.worker_id);

        loop {
            tokio::select! {
                biased;
                _ = recv_shutdown.recv() => {
                    event!(Level::DEBUG, "Worker shutting down...");
                    return;
                }
                processed = async {
                    let state = self.clone();
                    tokio::task::spawn_blocking(move || state.process_one()).await
                } => {
                    match processed {
                        Ok(Ok(true)) => {
                            if run_once {
                                event!(Level::INFO, "Processed one job. Exiting due to --run-once.");
                                return;
                            }
                        }
                        Ok(Ok(false)) => {
                            if run_once {
                                event!(Level::INFO, "No queued jobs. Exiting due to --run-once.");
                                return;
                            }
                            tokio::select! {
                                () = tokio::time::sleep(poll_interval) => {}
                                _ = recv_shutdown.recv() => {
                                    event!(Level::DEBUG, "Worker shutting down...");
                                    return;
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            event!(Level::ERROR, "Worker iteration failed: {err}");
                        }
                        Err(join_err) => {
                            event!(Level::ERROR, "Worker task panicked: {join_err}");
                        }
                    }
                }
            }
        }
    }
}
