//! Worker runtime: poll, claim, execute, retry, record results, heartbeat.
//!
//! One worker is a single cooperative scheduler multiplexing up to
//! `max_jobs` in-flight executions plus housekeeping (polling, cron
//! injection, abort scan, heartbeat). Workers on different hosts coordinate
//! only through the store: claims are a server-side script around
//! `SET NX PX`, finalization is one MULTI/EXEC pipeline, and every scoped
//! acquisition carries a TTL so a crashed holder cannot wedge the queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Script;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, JobOptions};
use crate::codec::{
    failure_value, serialize_result, Codec, JobBlob, JsonCodec, ResultBlob, FAILURE_CANCELLED,
    FAILURE_ERROR, FAILURE_TIMEOUT,
};
use crate::config::WorkerSettings;
use crate::connection::{log_redis_info, RedisPool};
use crate::cron::CronJob;
use crate::error::{Error, Result};
use crate::function::{hook, new_ctx, Ctx, Hook, JobContext, JobError, WorkerFunction};
use crate::keys::Keys;
use crate::utils::{ms_to_datetime, timestamp_ms, to_ms};

/// Slack added to the job timeout when sizing the claim marker TTL.
const IN_PROGRESS_SLACK: Duration = Duration::from_secs(10);

/// Abort requests older than this are culled; a request whose job never
/// started expires harmlessly.
const ABORT_JOB_MAX_AGE_MS: i64 = 60_000;

/// How long the claim marker of a finished cron tick is kept to block
/// re-claims of the same tick identity.
const KEEP_CRONJOB_PROGRESS: Duration = Duration::from_secs(60);

/// Worker record TTL after a graceful shutdown.
const WORKER_CLOSE_EXPIRE: Duration = Duration::from_secs(3);

/// Retry counter TTL (seconds).
const RETRY_COUNTER_TTL_SECS: i64 = 88_400;

/// Atomic claim: refuse if the marker or a result already exists or the job
/// has left the queue index, otherwise take the marker with a TTL.
const CLAIM_SCRIPT: &str = r#"
if redis.call('exists', KEYS[1]) + redis.call('exists', KEYS[2]) > 0 then
    return 0
end
if redis.call('zscore', KEYS[3], ARGV[1]) == false then
    return 0
end
redis.call('set', KEYS[1], ARGV[2], 'px', ARGV[3])
return 1
"#;

/// Worker record published for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_name: String,
    pub queue_name: String,
    /// Registered function names
    pub functions: Vec<String>,
    /// Startup timestamp, ms since epoch
    pub started_at: i64,
    /// Flipped off on graceful shutdown
    pub is_active: bool,
}

/// One entry of the function registry blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub function_name: String,
    pub is_cron: bool,
    /// Registration timestamp, ms since epoch
    pub registered_at: i64,
}

/// Health counters written on each heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheck {
    pub j_complete: u64,
    pub j_failed: u64,
    pub j_retried: u64,
    pub j_ongoing: u64,
    pub queued: u64,
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Burst mode: the queue drained and nothing was in flight
    Drained,

    /// SIGINT/SIGTERM or an external stop request
    Stopped,

    /// SIGUSR1: the caller should rebuild the worker and run it again
    Reload,
}

#[derive(Default)]
struct Counters {
    complete: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// State shared between the run loop and spawned job tasks.
struct Shared {
    pool: RedisPool,
    codec: Arc<dyn Codec>,
    keys: Keys,
    settings: WorkerSettings,
    functions: HashMap<String, WorkerFunction>,
    ctx: Ctx,
    on_job_start: Option<Hook>,
    on_job_end: Option<Hook>,
    counters: Counters,
    /// Cancellation token per in-flight job, cancelled when the abort set
    /// names the job
    running: Mutex<HashMap<String, CancellationToken>>,
    claim_script: Script,
    started_at: i64,
}

/// The worker: register functions and cron jobs, then `run` (or `main` for
/// signal handling on top).
pub struct Worker {
    settings: WorkerSettings,
    codec: Arc<dyn Codec>,
    functions: HashMap<String, WorkerFunction>,
    cron_jobs: Vec<CronJob>,
    on_startup: Option<Hook>,
    on_shutdown: Option<Hook>,
    on_job_start: Option<Hook>,
    on_job_end: Option<Hook>,
    ctx: Ctx,
    stop: CancellationToken,
}

impl Worker {
    pub fn new(settings: WorkerSettings) -> Self {
        Self {
            settings,
            codec: Arc::new(JsonCodec),
            functions: HashMap::new(),
            cron_jobs: Vec::new(),
            on_startup: None,
            on_shutdown: None,
            on_job_start: None,
            on_job_end: None,
            ctx: new_ctx(),
            stop: CancellationToken::new(),
        }
    }

    /// Swap the serializer/deserializer pair.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn register(mut self, function: WorkerFunction) -> Self {
        self.functions.insert(function.name.clone(), function);
        self
    }

    pub fn register_cron(mut self, cron_job: CronJob) -> Self {
        self.functions
            .insert(cron_job.name.clone(), cron_job.function.clone());
        self.cron_jobs.push(cron_job);
        self
    }

    pub fn on_startup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_startup = Some(hook(f));
        self
    }

    pub fn on_shutdown<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_shutdown = Some(hook(f));
        self
    }

    pub fn on_job_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_job_start = Some(hook(f));
        self
    }

    pub fn on_job_end<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Ctx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_job_end = Some(hook(f));
        self
    }

    /// Token that stops the run loop when cancelled (used by `--watch` and
    /// tests).
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run with SIGINT/SIGTERM/SIGUSR1 handling installed.
    #[cfg(unix)]
    pub async fn main(&mut self) -> Result<StopReason> {
        use tokio::signal::unix::{signal, SignalKind};

        let stop = self.stop.clone();
        let reload = Arc::new(AtomicBool::new(false));
        let reload_flag = reload.clone();
        let signal_task = tokio::spawn(async move {
            let (mut sigint, mut sigterm, mut sigusr1) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
                signal(SignalKind::user_defined1()),
            ) {
                (Ok(a), Ok(b), Ok(c)) => (a, b, c),
                _ => {
                    error!("failed to install signal handlers");
                    return;
                }
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down..."),
                _ = sigusr1.recv() => {
                    info!("received SIGUSR1, reloading...");
                    reload_flag.store(true, Ordering::SeqCst);
                }
            }
            stop.cancel();
        });

        let result = self.run().await;
        signal_task.abort();
        match result {
            Ok(StopReason::Stopped) if reload.load(Ordering::SeqCst) => Ok(StopReason::Reload),
            other => other,
        }
    }

    #[cfg(not(unix))]
    pub async fn main(&mut self) -> Result<StopReason> {
        let stop = self.stop.clone();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received interrupt, shutting down...");
                stop.cancel();
            }
        });
        let result = self.run().await;
        signal_task.abort();
        result
    }

    /// Run the worker until the queue drains (burst mode) or the stop token
    /// fires.
    pub async fn run(&mut self) -> Result<StopReason> {
        if self.stop.is_cancelled() {
            self.stop = CancellationToken::new();
        }
        for cron_job in &self.cron_jobs {
            cron_job.schedule.validate()?;
        }

        let settings = self.settings.clone();
        let pool = RedisPool::connect(&settings.redis).await?;
        if let Err(e) = log_redis_info(&pool).await {
            warn!("could not read redis info: {}", e);
        }

        let keys = Keys::new(settings.redis.key_prefix.clone());
        let shared = Arc::new(Shared {
            pool: pool.clone(),
            codec: self.codec.clone(),
            keys: keys.clone(),
            settings: settings.clone(),
            functions: self.functions.clone(),
            ctx: self.ctx.clone(),
            on_job_start: self.on_job_start.clone(),
            on_job_end: self.on_job_end.clone(),
            counters: Counters::default(),
            running: Mutex::new(HashMap::new()),
            claim_script: Script::new(CLAIM_SCRIPT),
            started_at: timestamp_ms(),
        });
        let client = Client::from_pool(
            pool.clone(),
            self.codec.clone(),
            keys,
            settings.queue_name.clone(),
        );

        info!(
            "starting worker '{}': queue={} functions=[{}] max_jobs={}",
            settings.worker_name,
            settings.queue_name,
            {
                let mut names: Vec<_> = self.functions.keys().cloned().collect();
                names.sort();
                names.join(", ")
            },
            settings.max_jobs
        );

        if let Some(on_startup) = &self.on_startup {
            on_startup(self.ctx.clone())
                .await
                .map_err(|e| Error::Hook(format!("on_startup: {:#}", e)))?;
        }

        publish_registry(&shared).await?;
        heartbeat(&shared, true).await?;
        let mut last_heartbeat = Instant::now();

        let now = Utc::now();
        let mut cron_next: Vec<DateTime<Utc>> = Vec::with_capacity(self.cron_jobs.len());
        for cron_job in &self.cron_jobs {
            cron_next.push(if cron_job.run_at_startup {
                now
            } else {
                cron_job.next_run(now)?
            });
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        let poll_delay = settings.poll_delay();

        let reason = loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("job task panicked: {}", e);
                    }
                }
            }

            let in_flight = shared.running.lock().await.len();
            let free = settings.max_jobs.saturating_sub(in_flight);
            if free > 0 {
                let now_ms = timestamp_ms();
                let mut conn = shared.pool.get().await?;
                let ready: Vec<(String, f64)> = conn
                    .query(
                        redis::cmd("ZRANGEBYSCORE")
                            .arg(&settings.queue_name)
                            .arg("-inf")
                            .arg(now_ms)
                            .arg("WITHSCORES")
                            .arg("LIMIT")
                            .arg(0)
                            .arg(free as i64),
                    )
                    .await?;
                for (job_id, score) in ready {
                    try_start(&shared, &mut tasks, job_id, score as i64).await?;
                }
            }

            self.run_cron(&client, &mut cron_next).await?;

            if settings.allow_abort_jobs {
                scan_abort(&shared).await?;
            }

            if last_heartbeat.elapsed() >= settings.health_check_interval() {
                heartbeat(&shared, true).await?;
                last_heartbeat = Instant::now();
            }

            if settings.burst {
                let mut conn = shared.pool.get().await?;
                let pending: i64 = conn
                    .query(redis::cmd("ZCARD").arg(&settings.queue_name))
                    .await?;
                if pending == 0 && tasks.is_empty() && shared.running.lock().await.is_empty() {
                    info!("queue drained, exiting burst mode");
                    break StopReason::Drained;
                }
            }

            tokio::select! {
                _ = self.stop.cancelled() => break StopReason::Stopped,
                _ = tokio::time::sleep(poll_delay) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("job task panicked: {}", e);
                        }
                    }
                }
            }
        };

        drain(&shared, &mut tasks).await;

        if let Some(on_shutdown) = &self.on_shutdown {
            if let Err(e) = on_shutdown(self.ctx.clone()).await {
                error!("on_shutdown hook failed: {:#}", e);
            }
        }
        if let Err(e) = heartbeat(&shared, false).await {
            warn!("final heartbeat failed: {}", e);
        }
        pool.close().await;
        info!(
            "worker '{}' stopped: complete={} failed={} retried={}",
            settings.worker_name,
            shared.counters.complete.load(Ordering::Relaxed),
            shared.counters.failed.load(Ordering::Relaxed),
            shared.counters.retried.load(Ordering::Relaxed)
        );
        Ok(reason)
    }

    /// Enqueue every cron entry whose fire instant has been reached, using
    /// the deterministic per-tick identity for deduplication across
    /// workers.
    async fn run_cron(&self, client: &Client, cron_next: &mut [DateTime<Utc>]) -> Result<()> {
        let now = Utc::now();
        for (cron_job, next) in self.cron_jobs.iter().zip(cron_next.iter_mut()) {
            if *next > now {
                continue;
            }
            let mut options = JobOptions::default().defer_until(*next);
            if let Some(job_id) = cron_job.job_id(*next) {
                options = options.job_id(job_id);
            }
            match client
                .enqueue_job(&cron_job.name, vec![], HashMap::new(), options)
                .await?
            {
                Some(job) => debug!("cron {}: scheduled tick {} as {}", cron_job.name, next, job.job_id),
                None => debug!("cron {}: tick {} already scheduled", cron_job.name, next),
            }
            *next = cron_job.next_run(now)?;
        }
        Ok(())
    }
}

/// Claim one ready job and spawn its execution task.
async fn try_start(
    shared: &Arc<Shared>,
    tasks: &mut JoinSet<()>,
    job_id: String,
    score: i64,
) -> Result<()> {
    if shared.running.lock().await.contains_key(&job_id) {
        return Ok(());
    }
    let ttl_ms = to_ms(shared.settings.job_timeout() + IN_PROGRESS_SLACK);
    let mut conn = shared.pool.get().await?;
    let mut invocation = shared.claim_script.prepare_invoke();
    invocation
        .key(shared.keys.in_progress(&job_id))
        .key(shared.keys.result(&job_id))
        .key(&shared.settings.queue_name)
        .arg(&job_id)
        .arg(&shared.settings.worker_name)
        .arg(ttl_ms);
    let claimed: i64 = conn.invoke_script(&invocation).await?;
    if claimed == 0 {
        debug!("job {} already owned or finished, skipping", job_id);
        return Ok(());
    }

    let token = CancellationToken::new();
    shared
        .running
        .lock()
        .await
        .insert(job_id.clone(), token.clone());
    let shared = Arc::clone(shared);
    tasks.spawn(async move {
        if let Err(e) = execute_job(&shared, &job_id, score, token).await {
            error!("job {}: store failure during execution: {}", job_id, e);
        }
        shared.running.lock().await.remove(&job_id);
    });
    Ok(())
}

enum ExecOutcome {
    Success(Value),
    Retry(Option<Duration>),
    Failed(String),
    Cancelled,
    TimedOut,
}

/// Run one claimed job to a terminal store state.
async fn execute_job(
    shared: &Arc<Shared>,
    job_id: &str,
    score: i64,
    token: CancellationToken,
) -> Result<()> {
    let settings = &shared.settings;
    let mut conn = shared.pool.get().await?;

    // fetch the definition and consume one attempt in a single round-trip
    let mut pipe = redis::pipe();
    pipe.cmd("GET")
        .arg(shared.keys.job(job_id))
        .cmd("INCR")
        .arg(shared.keys.retry(job_id))
        .cmd("EXPIRE")
        .arg(shared.keys.retry(job_id))
        .arg(RETRY_COUNTER_TTL_SECS)
        .ignore();
    let (bytes, attempt): (Option<Vec<u8>>, u32) = conn.query_pipeline(&pipe).await?;

    let abort_requested = if settings.allow_abort_jobs {
        conn.zscore(&shared.keys.abort(), job_id).await?.is_some()
    } else {
        false
    };

    let start_ms = timestamp_ms();
    let placeholder = |function: &str| JobBlob {
        function: function.to_string(),
        args: vec![],
        kwargs: HashMap::new(),
        job_try: None,
        enqueue_time: score,
        queue_name: settings.queue_name.clone(),
    };

    let bytes = match bytes {
        Some(bytes) => bytes,
        None => {
            warn!("job {} expired before execution", job_id);
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            return finalize(
                shared,
                job_id,
                &placeholder("<unknown>"),
                attempt,
                false,
                failure_value(FAILURE_ERROR, "job expired"),
                start_ms,
                timestamp_ms(),
            )
            .await;
        }
    };

    let blob = match crate::codec::deserialize_job(shared.codec.as_ref(), &bytes) {
        Ok(blob) => blob,
        Err(e) => {
            // a decode failure is local to this record, never retried
            error!("job {}: {}", job_id, e);
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            return finalize(
                shared,
                job_id,
                &placeholder("<unknown>"),
                attempt,
                false,
                failure_value(FAILURE_ERROR, &e.to_string()),
                start_ms,
                timestamp_ms(),
            )
            .await;
        }
    };

    let job_try = blob.job_try.map(|t| t.max(attempt)).unwrap_or(attempt);

    let function = match shared.functions.get(&blob.function) {
        Some(function) => function,
        None => {
            error!("job {}: function '{}' not found", job_id, blob.function);
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            return finalize(
                shared,
                job_id,
                &blob,
                job_try,
                false,
                failure_value(
                    FAILURE_ERROR,
                    &format!("function '{}' not found", blob.function),
                ),
                start_ms,
                timestamp_ms(),
            )
            .await;
        }
    };
    let max_tries = function.max_tries.unwrap_or(settings.max_tries);

    if job_try > max_tries {
        warn!(
            "job {}: max {} retries exceeded before execution",
            job_id, max_tries
        );
        shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        return finalize(
            shared,
            job_id,
            &blob,
            job_try,
            false,
            failure_value(FAILURE_ERROR, &format!("max {} retries exceeded", max_tries)),
            start_ms,
            timestamp_ms(),
        )
        .await;
    }

    if abort_requested {
        info!("job {} aborted before start", job_id);
        shared.counters.failed.fetch_add(1, Ordering::Relaxed);
        return finalize(
            shared,
            job_id,
            &blob,
            job_try,
            false,
            failure_value(FAILURE_CANCELLED, "aborted before start"),
            start_ms,
            timestamp_ms(),
        )
        .await;
    }

    if let Some(on_job_start) = &shared.on_job_start {
        if let Err(e) = on_job_start(shared.ctx.clone()).await {
            error!("on_job_start hook failed: {:#}", e);
        }
    }

    let job_timeout = function.timeout.unwrap_or(settings.job_timeout());
    info!(
        "→ job {} {}() try={}/{}",
        job_id, blob.function, job_try, max_tries
    );

    let context = JobContext {
        job_id: job_id.to_string(),
        job_try,
        enqueue_time: ms_to_datetime(blob.enqueue_time),
        score,
        args: blob.args.clone(),
        kwargs: blob.kwargs.clone(),
        redis: shared.pool.clone(),
        worker_name: settings.worker_name.clone(),
        queue_name: settings.queue_name.clone(),
        ctx: shared.ctx.clone(),
    };

    let outcome = tokio::select! {
        _ = token.cancelled() => ExecOutcome::Cancelled,
        result = tokio::time::timeout(job_timeout, function.call(context)) => match result {
            Err(_) => ExecOutcome::TimedOut,
            Ok(Ok(value)) => ExecOutcome::Success(value),
            Ok(Err(JobError::Retry { defer })) => ExecOutcome::Retry(defer),
            Ok(Err(JobError::Fail(message))) => ExecOutcome::Failed(message),
        }
    };
    let finish_ms = timestamp_ms();

    match outcome {
        ExecOutcome::Success(value) => {
            shared.counters.complete.fetch_add(1, Ordering::Relaxed);
            info!(
                "← job {} {}() ok ({}ms)",
                job_id,
                blob.function,
                finish_ms - start_ms
            );
            finalize(shared, job_id, &blob, job_try, true, value, start_ms, finish_ms).await?;
        }
        ExecOutcome::Retry(defer) => {
            if !settings.retry_jobs {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                finalize(
                    shared,
                    job_id,
                    &blob,
                    job_try,
                    false,
                    failure_value(FAILURE_ERROR, "retry requested but retries are disabled"),
                    start_ms,
                    finish_ms,
                )
                .await?;
            } else if job_try >= max_tries {
                warn!("job {}: max {} retries exceeded", job_id, max_tries);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                finalize(
                    shared,
                    job_id,
                    &blob,
                    job_try,
                    false,
                    failure_value(FAILURE_ERROR, &format!("max {} retries exceeded", max_tries)),
                    start_ms,
                    finish_ms,
                )
                .await?;
            } else {
                let defer = defer.unwrap_or_else(|| retry_defer(settings, job_try));
                info!("↻ job {} retrying in {:?} (try {})", job_id, defer, job_try);
                shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                requeue(shared, job_id, defer).await?;
            }
        }
        ExecOutcome::Failed(message) => {
            if settings.retry_jobs && job_try < max_tries {
                let defer = retry_defer(settings, job_try);
                warn!(
                    "↻ job {} {}() failed, retrying in {:?}: {}",
                    job_id, blob.function, defer, message
                );
                shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                requeue(shared, job_id, defer).await?;
            } else {
                error!("✗ job {} {}() failed: {}", job_id, blob.function, message);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                finalize(
                    shared,
                    job_id,
                    &blob,
                    job_try,
                    false,
                    failure_value(FAILURE_ERROR, &message),
                    start_ms,
                    finish_ms,
                )
                .await?;
            }
        }
        ExecOutcome::Cancelled => {
            info!("✗ job {} {}() aborted", job_id, blob.function);
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            finalize(
                shared,
                job_id,
                &blob,
                job_try,
                false,
                failure_value(FAILURE_CANCELLED, "aborted"),
                start_ms,
                finish_ms,
            )
            .await?;
        }
        ExecOutcome::TimedOut => {
            warn!(
                "✗ job {} {}() timed out after {:?}",
                job_id, blob.function, job_timeout
            );
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            finalize(
                shared,
                job_id,
                &blob,
                job_try,
                false,
                failure_value(FAILURE_TIMEOUT, &format!("job timed out after {:?}", job_timeout)),
                start_ms,
                finish_ms,
            )
            .await?;
        }
    }

    if let Some(on_job_end) = &shared.on_job_end {
        if let Err(e) = on_job_end(shared.ctx.clone()).await {
            error!("on_job_end hook failed: {:#}", e);
        }
    }
    Ok(())
}

/// Backoff before a retry when the retry signal carries no delay:
/// exponential on the attempt number, capped.
fn retry_defer(settings: &WorkerSettings, attempt: u32) -> Duration {
    settings
        .retry_backoff()
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(settings.max_retry_delay())
}

/// Re-score the queue entry and release the claim without writing a result.
async fn requeue(shared: &Arc<Shared>, job_id: &str, defer: Duration) -> Result<()> {
    let mut conn = shared.pool.get().await?;
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("ZADD")
        .arg(&shared.settings.queue_name)
        .arg(timestamp_ms() + to_ms(defer))
        .arg(job_id)
        .ignore()
        .cmd("DEL")
        .arg(shared.keys.in_progress(job_id))
        .ignore();
    conn.query_pipeline::<()>(&pipe).await
}

/// Terminal transition, one atomic multi-op: write the result record, drop
/// the queue entry, the claim marker, the retry counter and any abort
/// entry.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    shared: &Arc<Shared>,
    job_id: &str,
    blob: &JobBlob,
    job_try: u32,
    success: bool,
    result: Value,
    start_ms: i64,
    finish_ms: i64,
) -> Result<()> {
    let settings = &shared.settings;
    let function = shared.functions.get(&blob.function);
    let keep_forever = function
        .and_then(|f| f.keep_result_forever)
        .unwrap_or(settings.keep_result_forever);
    let keep_result = function
        .and_then(|f| f.keep_result)
        .unwrap_or_else(|| settings.keep_result());
    let is_cron = function.map(|f| f.is_cron).unwrap_or(false);

    let result_blob = ResultBlob {
        function: blob.function.clone(),
        args: blob.args.clone(),
        kwargs: blob.kwargs.clone(),
        job_try,
        enqueue_time: blob.enqueue_time,
        success,
        result,
        start_time: start_ms,
        finish_time: finish_ms,
        queue_name: blob.queue_name.clone(),
        worker_name: settings.worker_name.clone(),
    };
    let bytes = serialize_result(shared.codec.as_ref(), &result_blob);

    let mut pipe = redis::pipe();
    pipe.atomic();
    if let Some(bytes) = &bytes {
        if keep_forever {
            pipe.cmd("SET")
                .arg(shared.keys.result(job_id))
                .arg(bytes.as_slice())
                .ignore();
        } else if keep_result > Duration::ZERO {
            pipe.cmd("PSETEX")
                .arg(shared.keys.result(job_id))
                .arg(to_ms(keep_result))
                .arg(bytes.as_slice())
                .ignore();
        }
    }
    if is_cron {
        // keep the marker around so the same tick identity cannot be
        // re-claimed even if no result is stored
        pipe.cmd("PEXPIRE")
            .arg(shared.keys.in_progress(job_id))
            .arg(to_ms(KEEP_CRONJOB_PROGRESS))
            .ignore();
    } else {
        pipe.cmd("DEL")
            .arg(shared.keys.in_progress(job_id))
            .ignore();
    }
    pipe.cmd("ZREM")
        .arg(&settings.queue_name)
        .arg(job_id)
        .ignore()
        .cmd("DEL")
        .arg(shared.keys.retry(job_id))
        .ignore()
        .cmd("ZREM")
        .arg(shared.keys.abort())
        .arg(job_id)
        .ignore();
    let mut conn = shared.pool.get().await?;
    conn.query_pipeline::<()>(&pipe).await
}

/// Cancel in-flight jobs named by the abort set and cull stale requests.
async fn scan_abort(shared: &Arc<Shared>) -> Result<()> {
    let mut conn = shared.pool.get().await?;
    let ids: Vec<String> = conn
        .query(redis::cmd("ZRANGE").arg(shared.keys.abort()).arg(0).arg(-1))
        .await?;
    if !ids.is_empty() {
        let running = shared.running.lock().await;
        for id in &ids {
            if let Some(token) = running.get(id) {
                debug!("abort requested for running job {}", id);
                token.cancel();
            }
        }
    }
    let cutoff = timestamp_ms() - ABORT_JOB_MAX_AGE_MS;
    let _: i64 = conn
        .query(
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(shared.keys.abort())
                .arg("-inf")
                .arg(cutoff),
        )
        .await?;
    Ok(())
}

/// Publish the function registry blob for introspection.
async fn publish_registry(shared: &Arc<Shared>) -> Result<()> {
    let now = timestamp_ms();
    let mut registry: Vec<FunctionInfo> = shared
        .functions
        .values()
        .map(|f| FunctionInfo {
            function_name: f.name.clone(),
            is_cron: f.is_cron,
            registered_at: now,
        })
        .collect();
    registry.sort_by(|a, b| a.function_name.cmp(&b.function_name));
    let json = serde_json::to_string(&registry).map_err(|e| Error::Serialization(e.to_string()))?;
    let mut conn = shared.pool.get().await?;
    let _: () = conn
        .query(redis::cmd("SET").arg(shared.keys.task_registry()).arg(json))
        .await?;
    Ok(())
}

/// Refresh the worker record and health counters. Record TTLs keep stale
/// workers ageing out on their own; a graceful shutdown shortens the TTL
/// instead of deleting so `--check` can still observe the final state.
async fn heartbeat(shared: &Arc<Shared>, active: bool) -> Result<()> {
    let settings = &shared.settings;
    let mut conn = shared.pool.get().await?;
    let queued: i64 = conn
        .query(redis::cmd("ZCARD").arg(&settings.queue_name))
        .await?;
    let ongoing = shared.running.lock().await.len() as u64;

    let health = HealthCheck {
        j_complete: shared.counters.complete.load(Ordering::Relaxed),
        j_failed: shared.counters.failed.load(Ordering::Relaxed),
        j_retried: shared.counters.retried.load(Ordering::Relaxed),
        j_ongoing: ongoing,
        queued: queued.max(0) as u64,
    };
    let health_json =
        serde_json::to_string(&health).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut functions: Vec<String> = shared.functions.keys().cloned().collect();
    functions.sort();
    let record = WorkerInfo {
        worker_name: settings.worker_name.clone(),
        queue_name: settings.queue_name.clone(),
        functions,
        started_at: shared.started_at,
        is_active: active,
    };
    let record_json =
        serde_json::to_string(&record).map_err(|e| Error::Serialization(e.to_string()))?;

    let interval = settings.health_check_interval();
    let health_ttl = interval + Duration::from_secs(60);
    let record_ttl = if active { interval * 2 } else { WORKER_CLOSE_EXPIRE };

    let mut pipe = redis::pipe();
    pipe.cmd("SET")
        .arg(shared.keys.health_check(&settings.worker_name))
        .arg(health_json)
        .arg("PX")
        .arg(to_ms(health_ttl))
        .ignore()
        .cmd("SET")
        .arg(shared.keys.worker(&settings.worker_name))
        .arg(record_json)
        .arg("PX")
        .arg(to_ms(record_ttl))
        .ignore();
    conn.query_pipeline::<()>(&pipe).await
}

/// Wait out the drain window for in-flight jobs, then cancel the rest.
/// Cancelled tasks write no result: their queue entries survive and the
/// claim markers expire, so the jobs re-run elsewhere.
async fn drain(shared: &Arc<Shared>, tasks: &mut JoinSet<()>) {
    if tasks.is_empty() {
        return;
    }
    info!(
        "waiting up to {:?} for {} in-flight jobs",
        shared.settings.drain(),
        tasks.len()
    );
    let deadline = tokio::time::sleep(shared.settings.drain());
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!("drain window elapsed, cancelling {} jobs", tasks.len());
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
            joined = tasks.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
        }
    }
    shared.running.lock().await.clear();
}

/// `worker --check`: true iff a fresh health record exists for the
/// configured worker name.
pub async fn check_health(settings: &WorkerSettings) -> Result<bool> {
    let pool = RedisPool::connect(&settings.redis).await?;
    let keys = Keys::new(settings.redis.key_prefix.clone());
    let mut conn = pool.get().await?;
    match conn.get(&keys.health_check(&settings.worker_name)).await? {
        Some(blob) => {
            info!("health check: {}", String::from_utf8_lossy(&blob));
            Ok(true)
        }
        None => {
            warn!(
                "health check failed: no health record for worker '{}'",
                settings.worker_name
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::func;
    use serde_json::json;

    #[test]
    fn test_retry_defer_is_exponential_and_capped() {
        let settings = WorkerSettings::default();
        assert_eq!(retry_defer(&settings, 1), Duration::from_secs(1));
        assert_eq!(retry_defer(&settings, 2), Duration::from_secs(2));
        assert_eq!(retry_defer(&settings, 3), Duration::from_secs(4));
        assert_eq!(retry_defer(&settings, 7), Duration::from_secs(60));
        assert_eq!(retry_defer(&settings, 100), Duration::from_secs(60));
    }

    #[test]
    fn test_health_check_serializes_with_expected_fields() {
        let health = HealthCheck {
            j_complete: 3,
            j_failed: 1,
            j_retried: 2,
            j_ongoing: 4,
            queued: 5,
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["j_complete"], 3);
        assert_eq!(json["j_failed"], 1);
        assert_eq!(json["j_retried"], 2);
        assert_eq!(json["j_ongoing"], 4);
        assert_eq!(json["queued"], 5);
    }

    #[test]
    fn test_worker_registration() {
        let worker = Worker::new(WorkerSettings::default())
            .register(func("say_hi", |_ctx| async { Ok(json!(null)) }))
            .register_cron(crate::cron::cron("tick", |_ctx| async { Ok(json!(null)) }).minute([40]));
        assert!(worker.functions.contains_key("say_hi"));
        // cron registration also lands in the function registry
        assert!(worker.functions.contains_key("tick"));
        assert!(worker.functions["tick"].is_cron);
        assert_eq!(worker.cron_jobs.len(), 1);
    }

    #[test]
    fn test_worker_info_round_trip() {
        let record = WorkerInfo {
            worker_name: "pai".into(),
            queue_name: "pai:queue".into(),
            functions: vec!["say_hello".into(), "say_hi".into()],
            started_at: 1_700_000_000_000,
            is_active: true,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: WorkerInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_name, "pai");
        assert!(back.is_active);
        assert_eq!(back.functions.len(), 2);
    }
}
