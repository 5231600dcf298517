//! The function registry: named async callables executed by workers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::connection::RedisPool;

/// Shared mutable state handed to every hook and job invocation.
///
/// An explicit map rather than process-wide globals: workers create one at
/// startup, `on_startup` typically seeds it (clients, caches), jobs read it
/// through [`JobContext::ctx`].
pub type Ctx = Arc<RwLock<HashMap<String, Value>>>;

pub fn new_ctx() -> Ctx {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Control outcome of a user function.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Re-queue the job after an optional delay, without recording a
    /// result. Subject to the worker's retry budget.
    #[error("job requested retry")]
    Retry { defer: Option<Duration> },

    /// Any other failure. Retried until the attempt cap, then recorded.
    #[error("{0}")]
    Fail(String),
}

impl JobError {
    /// Retry with the worker's default backoff.
    pub fn retry() -> Self {
        JobError::Retry { defer: None }
    }

    /// Retry after an explicit delay.
    pub fn retry_after(defer: Duration) -> Self {
        JobError::Retry { defer: Some(defer) }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        JobError::Fail(message.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Fail(format!("{:#}", err))
    }
}

/// Everything a user function receives about the invocation.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,

    /// 1-based attempt number for this execution
    pub job_try: u32,

    pub enqueue_time: DateTime<Utc>,

    /// The queue score the job was claimed at (ms since epoch)
    pub score: i64,

    /// Positional arguments from the enqueue call
    pub args: Vec<Value>,

    /// Keyword arguments from the enqueue call
    pub kwargs: HashMap<String, Value>,

    /// Store handle, for functions that enqueue follow-up jobs
    pub redis: RedisPool,

    pub worker_name: String,
    pub queue_name: String,

    /// Shared state seeded by `on_startup`
    pub ctx: Ctx,
}

type Handler =
    Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<Value, JobError>> + Send + Sync>;

/// A registered function plus its per-function overrides.
#[derive(Clone)]
pub struct WorkerFunction {
    pub name: String,
    pub(crate) handler: Handler,

    /// Override the worker's job timeout for this function
    pub timeout: Option<Duration>,

    /// Override the worker's result TTL for this function
    pub keep_result: Option<Duration>,

    /// Override the worker's keep-forever flag for this function
    pub keep_result_forever: Option<bool>,

    /// Override the worker's attempt cap for this function
    pub max_tries: Option<u32>,

    /// Set for functions registered through a cron entry
    pub(crate) is_cron: bool,
}

impl WorkerFunction {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Arc::new(move |ctx| Box::pin(f(ctx))),
            timeout: None,
            keep_result: None,
            keep_result_forever: None,
            max_tries: None,
            is_cron: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_keep_result(mut self, keep_result: Duration) -> Self {
        self.keep_result = Some(keep_result);
        self
    }

    pub fn with_keep_result_forever(mut self, keep: bool) -> Self {
        self.keep_result_forever = Some(keep);
        self
    }

    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    pub(crate) fn call(&self, ctx: JobContext) -> BoxFuture<'static, Result<Value, JobError>> {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for WorkerFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerFunction")
            .field("name", &self.name)
            .field("is_cron", &self.is_cron)
            .finish()
    }
}

/// Shorthand for registering a plain function.
pub fn func<F, Fut>(name: impl Into<String>, f: F) -> WorkerFunction
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    WorkerFunction::new(name, f)
}

/// Lifecycle hook: receives the shared context map.
pub type Hook = Arc<dyn Fn(Ctx) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Box a closure as a lifecycle hook.
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn(Ctx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_overrides() {
        let f = func("send_email", |_ctx| async { Ok(json!(null)) })
            .with_timeout(Duration::from_secs(30))
            .with_max_tries(2)
            .with_keep_result(Duration::from_secs(60));
        assert_eq!(f.name, "send_email");
        assert_eq!(f.timeout, Some(Duration::from_secs(30)));
        assert_eq!(f.max_tries, Some(2));
        assert_eq!(f.keep_result, Some(Duration::from_secs(60)));
        assert!(!f.is_cron);
    }

    #[test]
    fn test_job_error_constructors() {
        assert!(matches!(JobError::retry(), JobError::Retry { defer: None }));
        assert!(matches!(
            JobError::retry_after(Duration::from_secs(5)),
            JobError::Retry { defer: Some(d) } if d == Duration::from_secs(5)
        ));
        assert_eq!(JobError::fail("boom").to_string(), "boom");
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: JobError = anyhow::anyhow!("root cause").into();
        assert!(matches!(err, JobError::Fail(msg) if msg.contains("root cause")));
    }
}
