use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::retry::Backoff;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub job_key: Option<String>,
    pub payload_json: Value,
    pub opts_json: Value,
    pub run_at: DateTime<Utc>,
    pub status: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub attempts_made: i32,
    pub stalled_count: i32,

    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub failed_reason: Option<String>,

    pub finished_at: Option<DateTime<Utc>>,
    pub keep_until: Option<DateTime<Utc>>,
    pub replay_of_job_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Options the job was enqueued with. Rows written by older producers
    /// fall back to defaults.
    pub fn options(&self) -> JobOptions {
        serde_json::from_value(self.opts_json.clone()).unwrap_or_default()
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload_json.clone())
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status)
    }

    /// Name used for failure snapshots and log lines: the idempotency key
    /// when there is one, else the row id.
    pub fn display_key(&self) -> String {
        self.job_key.clone().unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub opts: JobOptions,
    /// Failed job this one re-runs, set by failure replay.
    pub replay_of: Option<Uuid>,
}

impl NewJob {
    pub fn new(queue: &str, name: &str, payload: Value, opts: JobOptions) -> Self {
        Self {
            queue: queue.to_string(),
            name: name.to_string(),
            payload,
            opts,
            replay_of: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub id: Uuid,
    /// false when an equal-key job was already pending or active
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub priority: i32,
    pub delay_ms: u64,
    pub attempts: u32,
    pub backoff: Backoff,
    pub job_id: Option<String>,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay_ms: 0,
            attempts: 1,
            backoff: Backoff::default(),
            job_id: None,
            remove_on_complete: Retention::Keep,
            remove_on_fail: Retention::Keep,
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, key: impl Into<String>) -> Self {
        self.job_id = Some(key.into());
        self
    }

    pub fn max_attempts(&self) -> i32 {
        self.attempts.clamp(1, i32::MAX as u32) as i32
    }
}

/// What happens to a finished job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetentionRepr", into = "RetentionRepr")]
pub enum Retention {
    Keep,
    Remove,
    KeepFor(Duration),
}

impl Default for Retention {
    fn default() -> Self {
        Self::Keep
    }
}

impl Retention {
    /// `None` keeps the row forever. For `Remove` the row is deleted on finish.
    pub fn keep_until(&self, finished_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Keep => None,
            Self::Remove => Some(finished_at),
            Self::KeepFor(d) => Some(
                finished_at + ChronoDuration::from_std(*d).unwrap_or(ChronoDuration::days(3650)),
            ),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Word(String),
    Window { keep_for_secs: u64 },
}

impl TryFrom<RetentionRepr> for Retention {
    type Error = String;

    fn try_from(r: RetentionRepr) -> Result<Self, Self::Error> {
        match r {
            RetentionRepr::Word(w) => match w.as_str() {
                "keep" => Ok(Self::Keep),
                "remove" => Ok(Self::Remove),
                other => Err(format!("unknown retention {other:?}, expected keep|remove")),
            },
            RetentionRepr::Window { keep_for_secs } => {
                Ok(Self::KeepFor(Duration::from_secs(keep_for_secs)))
            }
        }
    }
}

impl From<Retention> for RetentionRepr {
    fn from(r: Retention) -> Self {
        match r {
            Retention::Keep => Self::Word("keep".into()),
            Retention::Remove => Self::Word("remove".into()),
            Retention::KeepFor(d) => Self::Window {
                keep_for_secs: d.as_secs(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max: u32,
    pub per_ms: u64,
}

/// Per-queue pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub lock_duration_ms: u64,
    pub stalled_interval_ms: u64,
    pub max_stalled_count: u32,
    pub rate_limiter: Option<RateLimiterConfig>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration_ms: 30_000,
            stalled_interval_ms: 30_000,
            max_stalled_count: 1,
            rate_limiter: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.lock_duration_ms / 2).max(1))
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct LeaseRequest {
    pub queue: String,
    pub worker_id: String,
    pub limit: usize,
    pub lock_duration: Duration,
    pub rate_limiter: Option<RateLimiterConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Default)]
pub struct StallReport {
    pub requeued: Vec<Uuid>,
    /// Jobs that stalled more than `max_stalled_count` times, now failed.
    pub failed: Vec<Job>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_reads_words_and_windows() {
        let keep: Retention = serde_json::from_str("\"keep\"").unwrap();
        let remove: Retention = serde_json::from_str("\"remove\"").unwrap();
        let window: Retention = serde_json::from_str(r#"{"keep_for_secs": 3600}"#).unwrap();
        assert_eq!(keep, Retention::Keep);
        assert_eq!(remove, Retention::Remove);
        assert_eq!(window, Retention::KeepFor(Duration::from_secs(3600)));
        assert!(serde_json::from_str::<Retention>("\"sometimes\"").is_err());
    }

    #[test]
    fn options_round_trip_through_json_column() {
        let opts = JobOptions {
            priority: 5,
            delay_ms: 200,
            attempts: 3,
            backoff: Backoff::fixed(500),
            job_id: Some("whales:page:2026101401:100".into()),
            remove_on_complete: Retention::KeepFor(Duration::from_secs(60)),
            remove_on_fail: Retention::Keep,
        };
        let v = serde_json::to_value(&opts).unwrap();
        assert_eq!(v["backoff"]["type"], "fixed");
        let back: JobOptions = serde_json::from_value(v).unwrap();
        assert_eq!(back, opts);
    }

    #[test]
    fn partial_options_fill_defaults() {
        let opts: JobOptions = serde_json::from_str(r#"{"attempts": 4}"#).unwrap();
        assert_eq!(opts.attempts, 4);
        assert_eq!(opts.priority, 0);
        assert_eq!(opts.remove_on_fail, Retention::Keep);
    }

    #[test]
    fn heartbeat_is_half_the_lock() {
        let cfg = WorkerPoolConfig {
            lock_duration_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(5));
    }
}
