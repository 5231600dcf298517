//! rqueue: a distributed asynchronous job queue backed by redis.
//!
//! Producers enqueue named function invocations with optional scheduling
//! hints; a fleet of workers competes to claim ready jobs, executes them
//! under concurrency, retry and timeout discipline, and persists results
//! for later retrieval or polling. All coordination goes through atomic
//! redis primitives (server-side scripts, MULTI/EXEC, `SET NX PX`), so any
//! number of workers can share a queue without double-execution.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod cron;
pub mod error;
pub mod function;
pub mod job;
pub mod keys;
pub mod utils;
pub mod worker;

// Re-export commonly used types
pub use client::{Client, JobOptions, EXPIRES_EXTRA_MS};
pub use codec::{Codec, JobBlob, JsonCodec, ResultBlob};
pub use config::{RedisSettings, WorkerSettings};
pub use connection::{log_redis_info, RedisConnection, RedisPool};
pub use cron::{cron, next_cron, CronJob, CronSchedule};
pub use error::{Error, Result};
pub use function::{func, hook, new_ctx, Ctx, Hook, JobContext, JobError, WorkerFunction};
pub use job::{Job, JobDef, JobResultData, JobStatus};
pub use keys::{Keys, DEFAULT_QUEUE_NAME, DEFAULT_WORKER_NAME};
pub use worker::{check_health, FunctionInfo, HealthCheck, StopReason, Worker, WorkerInfo};

/// Current version of rqueue
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
