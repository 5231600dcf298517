//! Producer API and read-only introspection queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Script;
use serde_json::Value;
use uuid::Uuid;

use crate::codec::{deserialize_job, deserialize_result, serialize_job, Codec, JobBlob, JsonCodec};
use crate::config::RedisSettings;
use crate::connection::RedisPool;
use crate::error::{Error, Result};
use crate::job::{Job, JobDef, JobResultData};
use crate::keys::{Keys, DEFAULT_QUEUE_NAME};
use crate::utils::{timestamp_ms, to_ms, to_unix_ms};
use crate::worker::{FunctionInfo, WorkerInfo};

/// Extra time after a job's earliest-run instant before its definition key
/// may expire: one day in ms.
pub const EXPIRES_EXTRA_MS: i64 = 86_400_000;

/// Atomic enqueue: bail if the definition or result key exists, otherwise
/// write the definition and the queue index entry in one step. The script
/// replaces the original's WATCH/MULTI dance; a concurrent writer simply
/// wins the EXISTS check.
const ENQUEUE_SCRIPT: &str = r#"
if redis.call('exists', KEYS[1]) + redis.call('exists', KEYS[2]) > 0 then
    return 0
end
redis.call('psetex', KEYS[1], ARGV[2], ARGV[1])
redis.call('zadd', KEYS[3], ARGV[3], ARGV[4])
return 1
"#;

/// Recognized options for `enqueue_job`.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Override the identity; enables deduplication
    pub job_id: Option<String>,

    /// Target queue, defaults to the client's default queue
    pub queue_name: Option<String>,

    /// Absolute wall-clock target; mutually exclusive with `defer_by`
    pub defer_until: Option<DateTime<Utc>>,

    /// Relative delay; mutually exclusive with `defer_until`
    pub defer_by: Option<Duration>,

    /// Definition TTL override
    pub expires: Option<Duration>,

    /// Initial attempt counter, for re-enqueue scenarios
    pub job_try: Option<u32>,
}

impl JobOptions {
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn defer_until(mut self, defer_until: DateTime<Utc>) -> Self {
        self.defer_until = Some(defer_until);
        self
    }

    pub fn defer_by(mut self, defer_by: Duration) -> Self {
        self.defer_by = Some(defer_by);
        self
    }

    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn job_try(mut self, job_try: u32) -> Self {
        self.job_try = Some(job_try);
        self
    }
}

/// Producer and introspection handle over the shared store.
#[derive(Clone)]
pub struct Client {
    pool: RedisPool,
    codec: Arc<dyn Codec>,
    keys: Keys,
    default_queue: String,
    enqueue_script: Arc<Script>,
}

impl Client {
    /// Connect with the default JSON codec and default queue name.
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let pool = RedisPool::connect(settings).await?;
        Ok(Self::from_pool(
            pool,
            Arc::new(JsonCodec),
            Keys::new(settings.key_prefix.clone()),
            DEFAULT_QUEUE_NAME,
        ))
    }

    pub fn from_pool(
        pool: RedisPool,
        codec: Arc<dyn Codec>,
        keys: Keys,
        default_queue: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            codec,
            keys,
            default_queue: default_queue.into(),
            enqueue_script: Arc::new(Script::new(ENQUEUE_SCRIPT)),
        }
    }

    /// Swap the serializer/deserializer pair.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Use a different default queue.
    pub fn with_default_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.default_queue = queue_name.into();
        self
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn codec(&self) -> Arc<dyn Codec> {
        self.codec.clone()
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// A handle to an existing job.
    pub fn job(&self, job_id: impl Into<String>, queue_name: Option<&str>) -> Job {
        Job::new(
            job_id.into(),
            self.pool.clone(),
            queue_name.unwrap_or(&self.default_queue).to_string(),
            self.keys.clone(),
            self.codec.clone(),
        )
    }

    /// Enqueue a job.
    ///
    /// Returns `None` when a job with this identity already has a pending
    /// definition or a result record — the conflicting writer wins and
    /// nothing is touched.
    pub async fn enqueue_job(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
        options: JobOptions,
    ) -> Result<Option<Job>> {
        if options.defer_until.is_some() && options.defer_by.is_some() {
            return Err(Error::Usage(
                "use either 'defer_until' or 'defer_by' or neither, not both".to_string(),
            ));
        }

        let queue_name = options
            .queue_name
            .unwrap_or_else(|| self.default_queue.clone());
        let job_id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let enqueue_time = timestamp_ms();
        let score = match (options.defer_until, options.defer_by) {
            (Some(until), _) => to_unix_ms(until),
            (_, Some(by)) => enqueue_time + to_ms(by),
            _ => enqueue_time,
        };
        let expires_ms = options
            .expires
            .map(to_ms)
            .unwrap_or(score - enqueue_time + EXPIRES_EXTRA_MS);

        let blob = JobBlob {
            function: function.to_string(),
            args,
            kwargs,
            job_try: options.job_try,
            enqueue_time,
            queue_name: queue_name.clone(),
        };
        let bytes = serialize_job(self.codec.as_ref(), &blob)?;

        let mut conn = self.pool.get().await?;
        let mut invocation = self.enqueue_script.prepare_invoke();
        invocation
            .key(self.keys.job(&job_id))
            .key(self.keys.result(&job_id))
            .key(&queue_name)
            .arg(bytes)
            .arg(expires_ms)
            .arg(score)
            .arg(&job_id);
        let created: i64 = conn.invoke_script(&invocation).await?;

        if created == 1 {
            Ok(Some(self.job(job_id, Some(&queue_name))))
        } else {
            Ok(None)
        }
    }

    /// Definitions currently in a queue index, with their scores.
    pub async fn queued_jobs(&self, queue_name: Option<&str>) -> Result<Vec<JobDef>> {
        let queue_name = queue_name.unwrap_or(&self.default_queue);
        let mut conn = self.pool.get().await?;
        let entries: Vec<(String, f64)> = conn
            .query(
                redis::cmd("ZRANGE")
                    .arg(queue_name)
                    .arg(0)
                    .arg(-1)
                    .arg("WITHSCORES"),
            )
            .await?;

        let mut jobs = Vec::with_capacity(entries.len());
        for (job_id, score) in entries {
            // the definition can expire between ZRANGE and GET
            if let Some(bytes) = conn.get(&self.keys.job(&job_id)).await? {
                let blob = deserialize_job(self.codec.as_ref(), &bytes)?;
                jobs.push(JobDef::from_blob(blob, Some(job_id), Some(score as i64)));
            }
        }
        Ok(jobs)
    }

    /// Every stored result, sorted by enqueue time.
    pub async fn all_job_results(&self) -> Result<Vec<JobResultData>> {
        let keys = self.scan_keys(&self.keys.result_pattern()).await?;
        let prefix = self.keys.result_prefix();
        let mut conn = self.pool.get().await?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = conn.get(&key).await? {
                let blob = deserialize_result(self.codec.as_ref(), &bytes)?;
                let job_id = key.strip_prefix(prefix.as_str()).map(str::to_string);
                results.push(JobResultData::from_blob(blob, job_id));
            }
        }
        results.sort_by_key(|r| r.enqueue_time);
        Ok(results)
    }

    /// Every live worker record.
    pub async fn all_workers(&self) -> Result<Vec<WorkerInfo>> {
        let keys = self.scan_keys(&self.keys.worker_pattern()).await?;
        let mut conn = self.pool.get().await?;
        let mut workers = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(bytes) = conn.get(&key).await? {
                let worker = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Deserialization(format!("bad worker record {}: {}", key, e)))?;
                workers.push(worker);
            }
        }
        Ok(workers)
    }

    /// The function registry published by workers.
    pub async fn all_functions(&self) -> Result<Vec<FunctionInfo>> {
        let mut conn = self.pool.get().await?;
        match conn.get(&self.keys.task_registry()).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Deserialization(format!("bad function registry: {}", e))),
            None => Ok(vec![]),
        }
    }

    /// Raw health blob for one worker, if fresh.
    pub async fn health_check(&self, worker_name: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get().await?;
        Ok(conn
            .get(&self.keys.health_check(worker_name))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = conn
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("default_queue", &self.default_queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutually_exclusive_defer_options() {
        let options = JobOptions::default()
            .defer_until(Utc::now())
            .defer_by(Duration::from_secs(10));
        assert!(options.defer_until.is_some() && options.defer_by.is_some());
    }

    #[test]
    fn test_job_options_builder() {
        let options = JobOptions::default()
            .job_id("dup1")
            .queue_name("pai:queue")
            .job_try(4);
        assert_eq!(options.job_id.as_deref(), Some("dup1"));
        assert_eq!(options.queue_name.as_deref(), Some("pai:queue"));
        assert_eq!(options.job_try, Some(4));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_both_defer_options() {
        // the usage check fires before any store round-trip, so a pool that
        // cannot connect is fine here
        let settings = RedisSettings {
            conn_retries: 0,
            ..Default::default()
        };
        if let Ok(client) = Client::connect(&settings).await {
            let err = client
                .enqueue_job(
                    "say_hi",
                    vec![],
                    HashMap::new(),
                    JobOptions::default()
                        .defer_until(Utc::now())
                        .defer_by(Duration::from_secs(1)),
                )
                .await
                .err()
                .unwrap();
            assert!(matches!(err, Error::Usage(_)));
        }
    }
}
