//! Client-side view of a single job: status, info, result wait and abort.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{
    deserialize_job, deserialize_result, failure_parts, Codec, JobBlob, ResultBlob,
    FAILURE_CANCELLED, FAILURE_TIMEOUT,
};
use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::keys::Keys;
use crate::utils::{ms_to_datetime, timestamp_ms, Poller};

/// Default interval between result probes in `Job::result` / `Job::abort`.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(500);

/// Job lifecycle status as derived from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// In the queue, the time it should run not yet reached
    Deferred,

    /// In the queue, the time it should run has been reached
    Queued,

    /// Claimed by a worker and executing
    InProgress,

    /// Finished, result record available
    Complete,

    /// Not present in any namespace
    NotFound,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Deferred => write!(f, "deferred"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::NotFound => write!(f, "not_found"),
        }
    }
}

impl JobStatus {
    /// Terminal until the result TTL expires.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete)
    }
}

/// A decoded job definition, augmented with the live queue score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    pub job_try: Option<u32>,
    pub enqueue_time: DateTime<Utc>,
    /// Earliest-run timestamp while the job is still in the queue index
    pub score: Option<i64>,
    pub job_id: Option<String>,
}

impl JobDef {
    pub(crate) fn from_blob(blob: JobBlob, job_id: Option<String>, score: Option<i64>) -> Self {
        Self {
            function: blob.function,
            args: blob.args,
            kwargs: blob.kwargs,
            job_try: blob.job_try,
            enqueue_time: ms_to_datetime(blob.enqueue_time),
            score,
            job_id,
        }
    }
}

/// A decoded job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultData {
    pub function: String,
    pub args: Vec<Value>,
    pub kwargs: HashMap<String, Value>,
    /// Attempts consumed when the job finalized
    pub job_try: u32,
    pub enqueue_time: DateTime<Utc>,
    pub success: bool,
    /// Return value on success, failure representation otherwise
    pub result: Value,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub queue_name: String,
    pub worker_name: String,
    pub job_id: Option<String>,
}

impl JobResultData {
    pub(crate) fn from_blob(blob: ResultBlob, job_id: Option<String>) -> Self {
        Self {
            function: blob.function,
            args: blob.args,
            kwargs: blob.kwargs,
            job_try: blob.job_try,
            enqueue_time: ms_to_datetime(blob.enqueue_time),
            success: blob.success,
            result: blob.result,
            start_time: ms_to_datetime(blob.start_time),
            finish_time: ms_to_datetime(blob.finish_time),
            queue_name: blob.queue_name,
            worker_name: blob.worker_name,
            job_id,
        }
    }

    fn failure_kind(&self) -> Option<&str> {
        if self.success {
            None
        } else {
            failure_parts(&self.result).map(|(kind, _)| kind)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure_kind() == Some(FAILURE_CANCELLED)
    }

    pub fn is_timeout(&self) -> bool {
        self.failure_kind() == Some(FAILURE_TIMEOUT)
    }
}

/// Handle to a job held by callers of `enqueue_job`.
#[derive(Clone)]
pub struct Job {
    pub job_id: String,
    pool: RedisPool,
    queue_name: String,
    keys: Keys,
    codec: Arc<dyn Codec>,
    poll_delay: Duration,
}

impl Job {
    pub(crate) fn new(
        job_id: String,
        pool: RedisPool,
        queue_name: String,
        keys: Keys,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self {
            job_id,
            pool,
            queue_name,
            keys,
            codec,
            poll_delay: DEFAULT_POLL_DELAY,
        }
    }

    /// Override how often `result`/`abort` probe the store.
    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Derive the status: result record wins, then the claim marker, then
    /// the queue index (score against the clock), else not found.
    pub async fn status(&self) -> Result<JobStatus> {
        let mut conn = self.pool.get().await?;
        if conn.exists(&self.keys.result(&self.job_id)).await? {
            return Ok(JobStatus::Complete);
        }
        if conn.exists(&self.keys.in_progress(&self.job_id)).await? {
            return Ok(JobStatus::InProgress);
        }
        match conn.zscore(&self.queue_name, &self.job_id).await? {
            None => Ok(JobStatus::NotFound),
            Some(score) => {
                if score as i64 > timestamp_ms() {
                    Ok(JobStatus::Deferred)
                } else {
                    Ok(JobStatus::Queued)
                }
            }
        }
    }

    /// The job definition, without waiting for a result. Once a result
    /// exists its definition fields are returned instead and `score` is
    /// `None`.
    pub async fn info(&self) -> Result<Option<JobDef>> {
        if let Some(result) = self.result_info().await? {
            return Ok(Some(JobDef {
                function: result.function,
                args: result.args,
                kwargs: result.kwargs,
                job_try: Some(result.job_try),
                enqueue_time: result.enqueue_time,
                score: None,
                job_id: Some(self.job_id.clone()),
            }));
        }
        let mut conn = self.pool.get().await?;
        let bytes = match conn.get(&self.keys.job(&self.job_id)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let blob = deserialize_job(self.codec.as_ref(), &bytes)?;
        let score = conn
            .zscore(&self.queue_name, &self.job_id)
            .await?
            .map(|s| s as i64);
        Ok(Some(JobDef::from_blob(blob, Some(self.job_id.clone()), score)))
    }

    /// The result record if one exists. Never waits, never raises for a
    /// failed job.
    pub async fn result_info(&self) -> Result<Option<JobResultData>> {
        let mut conn = self.pool.get().await?;
        match conn.get(&self.keys.result(&self.job_id)).await? {
            Some(bytes) => {
                let blob = deserialize_result(self.codec.as_ref(), &bytes)?;
                Ok(Some(JobResultData::from_blob(blob, Some(self.job_id.clone()))))
            }
            None => Ok(None),
        }
    }

    /// Wait for the job to finish and return its value.
    ///
    /// Polls every `poll_delay` until a result record appears. A failed job
    /// surfaces as [`Error::Execution`], a cancelled one as
    /// [`Error::Aborted`], an execution timeout as [`Error::JobTimeout`].
    /// If `timeout` elapses first, [`Error::ResultTimeout`] is returned.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<Value> {
        let mut poller = Poller::new(self.poll_delay);
        loop {
            let elapsed = poller.tick().await;
            if let Some(info) = self.result_info().await? {
                if info.success {
                    return Ok(info.result);
                }
                return match failure_parts(&info.result) {
                    Some((FAILURE_CANCELLED, _)) => Err(Error::Aborted),
                    Some((FAILURE_TIMEOUT, _)) => Err(Error::JobTimeout),
                    Some((_, message)) => Err(Error::Execution(message.to_string())),
                    None => Err(Error::Execution(info.result.to_string())),
                };
            }
            if let Some(timeout) = timeout {
                if elapsed > timeout {
                    return Err(Error::ResultTimeout);
                }
            }
        }
    }

    /// Mark the job for cancellation and wait for the outcome.
    ///
    /// Returns `true` iff the awaited result carries a cancellation, else
    /// `false` — a success, an ordinary failure or an execution timeout all
    /// mean the abort did not take. A wait timeout still surfaces as
    /// [`Error::ResultTimeout`].
    pub async fn abort(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        conn.zadd(&self.keys.abort(), timestamp_ms(), &self.job_id)
            .await?;
        match self.result(timeout).await {
            Ok(_) => Ok(false),
            Err(Error::Aborted) => Ok(true),
            Err(Error::JobTimeout) | Err(Error::Execution(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Purge every trace of the job from the store.
    pub async fn delete(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(self.keys.job(&self.job_id))
            .arg(self.keys.result(&self.job_id))
            .arg(self.keys.retry(&self.job_id))
            .arg(self.keys.in_progress(&self.job_id))
            .ignore()
            .cmd("ZREM")
            .arg(&self.queue_name)
            .arg(&self.job_id)
            .ignore()
            .cmd("ZREM")
            .arg(self.keys.abort())
            .arg(&self.job_id)
            .ignore();
        conn.query_pipeline::<()>(&pipe).await
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("job_id", &self.job_id)
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::failure_value;
    use serde_json::json;

    fn result_data(success: bool, result: Value) -> JobResultData {
        JobResultData {
            function: "f".into(),
            args: vec![],
            kwargs: HashMap::new(),
            job_try: 1,
            enqueue_time: Utc::now(),
            success,
            result,
            start_time: Utc::now(),
            finish_time: Utc::now(),
            queue_name: "q".into(),
            worker_name: "w".into(),
            job_id: None,
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
        assert_eq!(JobStatus::NotFound.to_string(), "not_found");
        assert!(JobStatus::Complete.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_failure_kind_helpers() {
        let cancelled = result_data(false, failure_value(FAILURE_CANCELLED, "abort requested"));
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_timeout());

        let timed_out = result_data(false, failure_value(FAILURE_TIMEOUT, "job timed out"));
        assert!(timed_out.is_timeout());

        let succeeded = result_data(true, json!(42));
        assert!(!succeeded.is_cancelled());
        assert!(!succeeded.is_timeout());
    }
}
