//! Durable, file-backed queue and results log with global dedup of active
//! work, FIFO claim, bounded retry, and compaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::downloader::DownloadResult;
use crate::file_lock;
use crate::url_classifier::{ExtractedUrl, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub chat_id: i64,
    pub message_id: i64,
    #[serde(default)]
    pub thread_id: Option<i64>,
    pub requested_at: String,
}

/// Identity used for subscriber dedup: `(chat_id, message_id, thread_id)`,
/// with an absent `thread_id` treated as a distinct "none".
pub struct SubscriberInput {
    pub chat_id: i64,
    pub message_id: i64,
    pub thread_id: Option<i64>,
}

fn same_subscriber(a: &Subscriber, input: &SubscriberInput) -> bool {
    a.chat_id == input.chat_id && a.message_id == input.message_id && a.thread_id == input.thread_id
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notification {
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub callback_attempts: u32,
    pub callback_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub input_url: String,
    pub normalized_url: String,
    pub platform: Platform,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    pub updated_at: String,
    pub result: Option<DownloadResult>,
    pub error: Option<String>,
    pub subscribers: Vec<Subscriber>,
    #[serde(default)]
    pub notification: Notification,
    #[serde(default)]
    pub claimed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueRow {
    pub job_id: String,
    pub status: JobStatus,
    pub deduplicated: bool,
    pub input_url: String,
    pub normalized_url: String,
    pub platform: Platform,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ResultRecord<'a> {
    Done {
        job_id: &'a str,
        result: &'a DownloadResult,
        created_at: &'a str,
        updated_at: &'a str,
    },
    Failed {
        job_id: &'a str,
        error: &'a str,
        attempts: u32,
        max_attempts: u32,
        created_at: &'a str,
        updated_at: &'a str,
    },
}

pub struct JobStore {
    queue_file: PathBuf,
    results_file: PathBuf,
    lock_file: PathBuf,
    max_attempts: u32,
    compact_after_lines: usize,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_jsonl(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Corrupted lines are skipped, not fatal: the log is append-only and
        // a single bad line must not block replay of everything after it.
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if value.is_object() {
                rows.push(value);
            }
        }
    }
    Ok(rows)
}

fn append_jsonl<T: Serialize>(path: &Path, payload: &T) -> anyhow::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(payload)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn count_lines(path: &Path) -> anyhow::Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content.lines().count())
}

fn job_id_of(row: &serde_json::Value) -> Option<String> {
    row.get("job_id")?.as_str().map(str::to_string)
}

fn materialize_jobs(queue_file: &Path) -> anyhow::Result<HashMap<String, Job>> {
    let mut jobs = HashMap::new();
    for row in read_jsonl(queue_file)? {
        let Some(job_id) = job_id_of(&row) else { continue };
        let Ok(job) = serde_json::from_value::<Job>(row) else {
            continue;
        };
        jobs.insert(job_id, job);
    }
    Ok(jobs)
}

fn compact_latest_by_job_id(path: &Path) -> anyhow::Result<()> {
    let rows = read_jsonl(path)?;
    if rows.is_empty() {
        return Ok(());
    }

    let mut latest: HashMap<String, serde_json::Value> = HashMap::new();
    for row in rows {
        let Some(job_id) = job_id_of(&row) else { continue };
        latest.insert(job_id, row);
    }

    let mut compacted: Vec<serde_json::Value> = latest.into_values().collect();
    compacted.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let tmp_path = path.with_file_name(format!(
        "{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("compact")
    ));

    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp_path)?;
        for row in &compacted {
            writeln!(file, "{}", serde_json::to_string(row)?)?;
        }
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn sort_key(row: &serde_json::Value) -> (String, String, String) {
    let get = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();
    (get("created_at"), get("updated_at"), get("job_id"))
}

impl JobStore {
    pub fn new(
        queue_file: PathBuf,
        results_file: PathBuf,
        lock_file: PathBuf,
        max_attempts: u32,
        compact_after_lines: usize,
    ) -> Self {
        Self {
            queue_file,
            results_file,
            lock_file,
            max_attempts: max_attempts.max(1),
            compact_after_lines: compact_after_lines.max(100),
        }
    }

    fn maybe_compact(&self) -> anyhow::Result<()> {
        if count_lines(&self.queue_file)? > self.compact_after_lines {
            compact_latest_by_job_id(&self.queue_file)?;
        }
        if count_lines(&self.results_file)? > self.compact_after_lines {
            compact_latest_by_job_id(&self.results_file)?;
        }
        Ok(())
    }

    pub fn enqueue_many(
        &self,
        inputs: &[ExtractedUrl],
        subscriber: &SubscriberInput,
    ) -> anyhow::Result<Vec<EnqueueRow>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        file_lock::with_lock(&self.lock_file, || {
            let jobs_by_id = materialize_jobs(&self.queue_file)?;
            let mut active_by_url: HashMap<String, Job> = jobs_by_id
                .into_values()
                .filter(|job| job.status.is_active())
                .map(|job| (job.normalized_url.clone(), job))
                .collect();

            let mut output = Vec::with_capacity(inputs.len());
            for item in inputs {
                if let Some(existing) = active_by_url.get(&item.normalized_url).cloned() {
                    let already_present = existing
                        .subscribers
                        .iter()
                        .any(|s| same_subscriber(s, subscriber));

                    let existing = if already_present {
                        existing
                    } else {
                        let now = now_rfc3339();
                        let mut updated = existing;
                        updated.subscribers.push(Subscriber {
                            chat_id: subscriber.chat_id,
                            message_id: subscriber.message_id,
                            thread_id: subscriber.thread_id,
                            requested_at: now.clone(),
                        });
                        updated.updated_at = now;
                        append_jsonl(&self.queue_file, &updated)?;
                        active_by_url.insert(item.normalized_url.clone(), updated.clone());
                        updated
                    };

                    output.push(EnqueueRow {
                        job_id: existing.job_id,
                        status: existing.status,
                        deduplicated: true,
                        input_url: existing.input_url,
                        normalized_url: existing.normalized_url,
                        platform: existing.platform,
                    });
                    continue;
                }

                let now = now_rfc3339();
                let job = Job {
                    job_id: Uuid::new_v4().to_string(),
                    input_url: item.input_url.clone(),
                    normalized_url: item.normalized_url.clone(),
                    platform: item.platform,
                    status: JobStatus::Queued,
                    attempts: 0,
                    max_attempts: self.max_attempts,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                    result: None,
                    error: None,
                    subscribers: vec![Subscriber {
                        chat_id: subscriber.chat_id,
                        message_id: subscriber.message_id,
                        thread_id: subscriber.thread_id,
                        requested_at: now,
                    }],
                    notification: Notification::default(),
                    claimed_by: None,
                };
                append_jsonl(&self.queue_file, &job)?;
                output.push(EnqueueRow {
                    job_id: job.job_id.clone(),
                    status: job.status,
                    deduplicated: false,
                    input_url: job.input_url.clone(),
                    normalized_url: job.normalized_url.clone(),
                    platform: job.platform,
                });
                active_by_url.insert(job.normalized_url.clone(), job);
            }

            self.maybe_compact()?;
            Ok(output)
        })
    }

    pub fn claim_next(&self, worker_id: &str) -> anyhow::Result<Option<Job>> {
        file_lock::with_lock(&self.lock_file, || {
            let jobs_by_id = materialize_jobs(&self.queue_file)?;
            let mut queued: Vec<Job> = jobs_by_id
                .into_values()
                .filter(|job| job.status == JobStatus::Queued)
                .collect();
            if queued.is_empty() {
                return Ok(None);
            }
            queued.sort_by(|a, b| (a.created_at.as_str(), a.job_id.as_str()).cmp(&(b.created_at.as_str(), b.job_id.as_str())));

            let mut job = queued.remove(0);
            job.status = JobStatus::Running;
            job.attempts = job.attempts.saturating_add(1);
            job.updated_at = now_rfc3339();
            job.claimed_by = Some(worker_id.to_string());
            job.error = None;

            append_jsonl(&self.queue_file, &job)?;
            self.maybe_compact()?;
            Ok(Some(job))
        })
    }

    pub fn mark_done(&self, job_id: &str, result: DownloadResult) -> anyhow::Result<Option<Job>> {
        file_lock::with_lock(&self.lock_file, || {
            let jobs_by_id = materialize_jobs(&self.queue_file)?;
            let Some(mut job) = jobs_by_id.get(job_id).cloned() else {
                return Ok(None);
            };

            let now = now_rfc3339();
            let created_at = job.created_at.clone();
            job.status = JobStatus::Done;
            job.updated_at = now.clone();
            job.error = None;
            job.result = Some(result.clone());

            append_jsonl(&self.queue_file, &job)?;
            append_jsonl(
                &self.results_file,
                &ResultRecord::Done {
                    job_id,
                    result: &result,
                    created_at: &created_at,
                    updated_at: &now,
                },
            )?;
            self.maybe_compact()?;
            Ok(Some(job))
        })
    }

    /// Returns `(job, next_status)`. `next_status` is `Queued` when the job
    /// was requeued for retry, `Failed` when it exhausted `max_attempts`.
    pub fn mark_failed_or_retry(
        &self,
        job_id: &str,
        error: &str,
    ) -> anyhow::Result<(Option<Job>, Option<JobStatus>)> {
        file_lock::with_lock(&self.lock_file, || {
            let jobs_by_id = materialize_jobs(&self.queue_file)?;
            let Some(mut job) = jobs_by_id.get(job_id).cloned() else {
                return Ok((None, None));
            };

            let now = now_rfc3339();
            let attempts = job.attempts;
            let max_attempts = job.max_attempts;

            job.error = Some(error.to_string());
            job.updated_at = now.clone();

            if attempts < max_attempts {
                job.status = JobStatus::Queued;
                append_jsonl(&self.queue_file, &job)?;
                self.maybe_compact()?;
                return Ok((Some(job), Some(JobStatus::Queued)));
            }

            job.status = JobStatus::Failed;
            append_jsonl(&self.queue_file, &job)?;
            append_jsonl(
                &self.results_file,
                &ResultRecord::Failed {
                    job_id,
                    error,
                    attempts,
                    max_attempts,
                    created_at: &job.created_at,
                    updated_at: &now,
                },
            )?;
            self.maybe_compact()?;
            Ok((Some(job), Some(JobStatus::Failed)))
        })
    }

    pub fn mark_notification(
        &self,
        job_id: &str,
        event_id: &str,
        callback_error: Option<String>,
    ) -> anyhow::Result<Option<Job>> {
        file_lock::with_lock(&self.lock_file, || {
            let jobs_by_id = materialize_jobs(&self.queue_file)?;
            let Some(mut job) = jobs_by_id.get(job_id).cloned() else {
                return Ok(None);
            };

            job.notification.last_event_id = Some(event_id.to_string());
            job.notification.callback_attempts = job.notification.callback_attempts.saturating_add(1);
            job.notification.callback_error = callback_error;
            job.updated_at = now_rfc3339();

            append_jsonl(&self.queue_file, &job)?;
            self.maybe_compact()?;
            Ok(Some(job))
        })
    }

    pub fn get_job(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        file_lock::with_lock(&self.lock_file, || {
            let jobs_by_id = materialize_jobs(&self.queue_file)?;
            Ok(jobs_by_id.get(job_id).cloned())
        })
    }
}
