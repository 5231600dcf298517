//! Settings for the redis connection and the worker runtime.
//!
//! Both records are concrete structs with defaults: user code constructs
//! them directly or deserializes them from a TOML settings file. The redis
//! settings additionally honour the `REDIS_HOST`, `REDIS_PORT`,
//! `REDIS_DATABASE` and `REDIS_PASSWORD` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::keys::{DEFAULT_KEY_PREFIX, DEFAULT_QUEUE_NAME, DEFAULT_WORKER_NAME};

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Redis server host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database number (0-15)
    #[serde(default)]
    pub database: u8,

    /// Authentication password
    #[serde(default)]
    pub password: Option<String>,

    /// Use TLS for the connection (`rediss://`)
    #[serde(default = "default_false")]
    pub ssl: bool,

    /// Connect via sentinel instead of a direct host
    #[serde(default = "default_false")]
    pub sentinel: bool,

    /// Sentinel service name
    #[serde(default = "default_sentinel_master")]
    pub sentinel_master: String,

    /// Sentinel nodes as `host:port` strings (used when `sentinel` is set)
    #[serde(default)]
    pub sentinel_hosts: Vec<String>,

    /// Connection timeout (seconds)
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout_secs: u64,

    /// Max connection attempts before giving up
    #[serde(default = "default_conn_retries")]
    pub conn_retries: u32,

    /// Delay between connection attempts (seconds)
    #[serde(default = "default_conn_retry_delay")]
    pub conn_retry_delay_secs: u64,

    /// Key prefix to avoid collisions
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: 0,
            password: None,
            ssl: false,
            sentinel: false,
            sentinel_master: default_sentinel_master(),
            sentinel_hosts: vec![],
            conn_timeout_secs: default_conn_timeout(),
            conn_retries: default_conn_retries(),
            conn_retry_delay_secs: default_conn_retry_delay(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisSettings {
    /// Defaults overridden by the `REDIS_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    /// Overlay the `REDIS_*` environment variables onto these settings.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(database) = std::env::var("REDIS_DATABASE") {
            if let Ok(database) = database.parse() {
                self.database = database;
            }
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            if !password.is_empty() {
                self.password = Some(password);
            }
        }
    }

    /// Parse a `redis://` or `rediss://` DSN.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let url = Url::parse(dsn).map_err(|e| Error::Config(format!("invalid DSN: {}", e)))?;
        let ssl = match url.scheme() {
            "redis" => false,
            "rediss" => true,
            other => return Err(Error::Config(format!("invalid DSN scheme: {}", other))),
        };
        let database = url
            .path()
            .trim_matches('/')
            .parse()
            .unwrap_or(0);
        Ok(Self {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(6379),
            database,
            password: url.password().map(str::to_string),
            ssl,
            ..Self::default()
        })
    }

    /// Build the connection URL for the redis client.
    pub fn url(&self) -> String {
        self.url_for(&self.host, self.port)
    }

    /// Build a connection URL for an explicit host/port (used after
    /// sentinel master discovery).
    pub fn url_for(&self, host: &str, port: u16) -> String {
        let scheme = if self.ssl { "rediss" } else { "redis" };
        match &self.password {
            Some(password) => format!("{}://:{}@{}:{}/{}", scheme, password, host, port, self.database),
            None => format!("{}://{}:{}/{}", scheme, host, port, self.database),
        }
    }

    pub fn conn_timeout(&self) -> Duration {
        Duration::from_secs(self.conn_timeout_secs)
    }

    pub fn conn_retry_delay(&self) -> Duration {
        Duration::from_secs(self.conn_retry_delay_secs)
    }
}

/// Worker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Redis connection
    #[serde(default)]
    pub redis: RedisSettings,

    /// Queue this worker consumes
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Name this worker publishes itself under
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Maximum concurrent job executions
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Per-job wall-clock limit (seconds)
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Result TTL when not kept forever (seconds)
    #[serde(default = "default_keep_result")]
    pub keep_result_secs: u64,

    /// Disable result expiry entirely
    #[serde(default = "default_false")]
    pub keep_result_forever: bool,

    /// Queue poll interval (milliseconds)
    #[serde(default = "default_poll_delay")]
    pub poll_delay_ms: u64,

    /// Default attempt cap
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Whether failed jobs and retry signals are re-queued
    #[serde(default = "default_true")]
    pub retry_jobs: bool,

    /// Whether the abort set is consulted
    #[serde(default = "default_false")]
    pub allow_abort_jobs: bool,

    /// Heartbeat period (seconds)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Exit once the queue is drained and nothing is in flight
    #[serde(default = "default_false")]
    pub burst: bool,

    /// How long shutdown waits for in-flight jobs before cancelling them
    /// (seconds)
    #[serde(default = "default_drain")]
    pub drain_secs: u64,

    /// Base delay for retry backoff (milliseconds)
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Ceiling for retry backoff (seconds)
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            queue_name: default_queue_name(),
            worker_name: default_worker_name(),
            max_jobs: default_max_jobs(),
            job_timeout_secs: default_job_timeout(),
            keep_result_secs: default_keep_result(),
            keep_result_forever: false,
            poll_delay_ms: default_poll_delay(),
            max_tries: default_max_tries(),
            retry_jobs: true,
            allow_abort_jobs: false,
            health_check_interval_secs: default_health_check_interval(),
            burst: false,
            drain_secs: default_drain(),
            retry_backoff_ms: default_retry_backoff(),
            max_retry_delay_secs: default_max_retry_delay(),
        }
    }
}

impl WorkerSettings {
    /// Load settings from a TOML file, then overlay the `REDIS_*`
    /// environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut settings: Self = toml::from_str(&text)?;
        settings.redis.apply_env();
        Ok(settings)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn keep_result(&self) -> Duration {
        Duration::from_secs(self.keep_result_secs)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

// Default value helper functions
fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 6379 }
fn default_sentinel_master() -> String { "mymaster".to_string() }
fn default_conn_timeout() -> u64 { 1 }
fn default_conn_retries() -> u32 { 5 }
fn default_conn_retry_delay() -> u64 { 1 }
fn default_key_prefix() -> String { DEFAULT_KEY_PREFIX.to_string() }
fn default_queue_name() -> String { DEFAULT_QUEUE_NAME.to_string() }
fn default_worker_name() -> String { DEFAULT_WORKER_NAME.to_string() }
fn default_max_jobs() -> usize { 10 }
fn default_job_timeout() -> u64 { 300 }
fn default_keep_result() -> u64 { 3600 }
fn default_poll_delay() -> u64 { 500 }
fn default_max_tries() -> u32 { 5 }
fn default_health_check_interval() -> u64 { 3600 }
fn default_drain() -> u64 { 30 }
fn default_retry_backoff() -> u64 { 1000 }
fn default_max_retry_delay() -> u64 { 60 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_settings_default() {
        let settings = RedisSettings::default();
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 6379);
        assert_eq!(settings.conn_retries, 5);
        assert_eq!(settings.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_redis_url_with_password_and_tls() {
        let settings = RedisSettings {
            password: Some("s3cret".to_string()),
            ssl: true,
            database: 2,
            ..Default::default()
        };
        assert_eq!(settings.url(), "rediss://:s3cret@localhost:6379/2");
    }

    #[test]
    fn test_from_dsn() {
        let settings = RedisSettings::from_dsn("redis://:pw@redis.internal:6390/3").unwrap();
        assert_eq!(settings.host, "redis.internal");
        assert_eq!(settings.port, 6390);
        assert_eq!(settings.database, 3);
        assert_eq!(settings.password.as_deref(), Some("pw"));
        assert!(!settings.ssl);

        let settings = RedisSettings::from_dsn("rediss://redis.internal").unwrap();
        assert!(settings.ssl);
        assert_eq!(settings.port, 6379);

        assert!(RedisSettings::from_dsn("http://nope").is_err());
    }

    #[test]
    fn test_worker_settings_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.queue_name, "rqueue:queue");
        assert_eq!(settings.max_jobs, 10);
        assert_eq!(settings.job_timeout(), Duration::from_secs(300));
        assert_eq!(settings.poll_delay(), Duration::from_millis(500));
        assert_eq!(settings.max_tries, 5);
        assert!(settings.retry_jobs);
        assert!(!settings.allow_abort_jobs);
        assert!(!settings.burst);
    }

    #[test]
    fn test_worker_settings_from_toml() {
        let settings: WorkerSettings = toml::from_str(
            r#"
            queue_name = "pai:queue"
            worker_name = "pai"
            max_jobs = 2
            allow_abort_jobs = true

            [redis]
            host = "10.0.0.5"
            database = 1
            "#,
        )
        .unwrap();
        assert_eq!(settings.queue_name, "pai:queue");
        assert_eq!(settings.worker_name, "pai");
        assert_eq!(settings.max_jobs, 2);
        assert!(settings.allow_abort_jobs);
        assert_eq!(settings.redis.host, "10.0.0.5");
        assert_eq!(settings.redis.database, 1);
        // unspecified fields fall back to defaults
        assert_eq!(settings.max_tries, 5);
        assert_eq!(settings.redis.port, 6379);
    }
}
