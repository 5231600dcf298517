//! Redis connection management.
//!
//! A thin pool over the redis crate's `ConnectionManager` (which already
//! multiplexes and reconnects underneath) with the connect-retry budget from
//! [`RedisSettings`] applied on top. Sentinel deployments are supported by
//! resolving the master address through `SENTINEL get-master-addr-by-name`
//! before opening the client.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{Client as RedisClient, Cmd, FromRedisValue, Pipeline, ScriptInvocation};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RedisSettings;
use crate::error::{Error, Result};

/// Shared redis handle used by producers, job handles and workers.
#[derive(Clone)]
pub struct RedisPool {
    client: Arc<RedisClient>,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
    settings: Arc<RedisSettings>,
}

impl RedisPool {
    /// Connect, retrying up to `conn_retries` times with `conn_retry_delay`
    /// between attempts.
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let url = if settings.sentinel {
            let (host, port) = discover_master(settings).await?;
            settings.url_for(&host, port)
        } else {
            settings.url()
        };

        let client = RedisClient::open(url.as_str())
            .map_err(|e| Error::Connection(e.to_string()))?;

        let pool = Self {
            client: Arc::new(client),
            manager: Arc::new(RwLock::new(None)),
            settings: Arc::new(settings.clone()),
        };
        pool.reconnect().await?;
        debug!("redis pool created: url={}", redact(&url));
        Ok(pool)
    }

    /// Get a connection, re-establishing the manager if it was dropped.
    pub async fn get(&self) -> Result<RedisConnection> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(RedisConnection {
                manager: manager.clone(),
            });
        }
        self.reconnect().await?;
        let guard = self.manager.read().await;
        match guard.as_ref() {
            Some(manager) => Ok(RedisConnection {
                manager: manager.clone(),
            }),
            None => Err(Error::Connection("no connection available".to_string())),
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_connect().await {
                Ok(manager) => {
                    *self.manager.write().await = Some(manager);
                    if attempt > 1 {
                        info!("redis connection successful after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempt > self.settings.conn_retries {
                        return Err(Error::Connection(format!(
                            "failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    warn!(
                        "redis connection error: {}, {} retries remaining...",
                        e,
                        self.settings.conn_retries + 1 - attempt
                    );
                    tokio::time::sleep(self.settings.conn_retry_delay()).await;
                }
            }
        }
    }

    async fn attempt_connect(&self) -> Result<ConnectionManager> {
        let manager = tokio::time::timeout(
            self.settings.conn_timeout(),
            ConnectionManager::new(self.client.as_ref().clone()),
        )
        .await
        .map_err(|_| Error::Connection("connection timed out".to_string()))?
        .map_err(|e| Error::Connection(e.to_string()))?;

        // validate with a PING before handing the manager out
        let mut probe = manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut probe)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        if pong != "PONG" {
            return Err(Error::Connection("redis PING failed".to_string()));
        }
        Ok(manager)
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = conn.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Drop the managed connection.
    pub async fn close(&self) {
        *self.manager.write().await = None;
    }
}

/// A cheap clone of the multiplexed connection, valid for one logical
/// sequence of commands.
pub struct RedisConnection {
    manager: ConnectionManager,
}

impl RedisConnection {
    /// Run a single command.
    pub async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> Result<T> {
        Ok(cmd.query_async(&mut self.manager).await?)
    }

    /// Run a pipeline (atomic when built with `redis::pipe().atomic()`).
    pub async fn query_pipeline<T: FromRedisValue>(&mut self, pipe: &Pipeline) -> Result<T> {
        Ok(pipe.query_async(&mut self.manager).await?)
    }

    /// Run a server-side script.
    pub async fn invoke_script<T: FromRedisValue>(
        &mut self,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T> {
        Ok(invocation.invoke_async(&mut self.manager).await?)
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        let n: i64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(n > 0)
    }

    pub async fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>> {
        self.query(redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    pub async fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<()> {
        let _: i64 = self
            .query(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    pub async fn del(&mut self, key: &str) -> Result<bool> {
        let n: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(n > 0)
    }
}

/// Ask each configured sentinel for the master address; first answer wins.
async fn discover_master(settings: &RedisSettings) -> Result<(String, u16)> {
    if settings.sentinel_hosts.is_empty() {
        return Err(Error::Config(
            "'sentinel' is set but 'sentinel_hosts' is empty".to_string(),
        ));
    }
    for node in &settings.sentinel_hosts {
        let url = format!("redis://{}/", node);
        let client = match RedisClient::open(url.as_str()) {
            Ok(client) => client,
            Err(e) => {
                warn!("invalid sentinel address {}: {}", node, e);
                continue;
            }
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("sentinel {} unreachable: {}", node, e);
                continue;
            }
        };
        let addr: Option<Vec<String>> = redis::cmd("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(&settings.sentinel_master)
            .query_async(&mut conn)
            .await
            .ok();
        if let Some(addr) = addr {
            if addr.len() == 2 {
                if let Ok(port) = addr[1].parse() {
                    info!(
                        "sentinel {} resolved master '{}' to {}:{}",
                        node, settings.sentinel_master, addr[0], port
                    );
                    return Ok((addr[0].clone(), port));
                }
            }
        }
    }
    Err(Error::Connection(format!(
        "no sentinel could resolve master '{}'",
        settings.sentinel_master
    )))
}

/// Log server version, memory usage, client count and key count at startup.
pub async fn log_redis_info(pool: &RedisPool) -> Result<()> {
    let mut conn = pool.get().await?;
    let info: String = conn.query(&redis::cmd("INFO")).await?;
    let key_count: i64 = conn.query(&redis::cmd("DBSIZE")).await?;

    let field = |name: &str| -> String {
        info.lines()
            .find_map(|line| line.strip_prefix(name).and_then(|rest| rest.strip_prefix(':')))
            .unwrap_or("?")
            .trim()
            .to_string()
    };

    info!(
        "redis_version={} mem_usage={} clients_connected={} db_keys={}",
        field("redis_version"),
        field("used_memory_human"),
        field("connected_clients"),
        key_count
    );
    Ok(())
}

fn redact(url: &str) -> String {
    match url.find('@') {
        Some(at) => {
            let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
            format!("{}***{}", &url[..scheme_end], &url[at..])
        }
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_password() {
        assert_eq!(
            redact("redis://:hunter2@localhost:6379/0"),
            "redis://***@localhost:6379/0"
        );
        assert_eq!(redact("redis://localhost:6379/0"), "redis://localhost:6379/0");
    }

    #[tokio::test]
    async fn test_pool_connect_and_ping() {
        // skipped silently when no local redis is available
        let settings = RedisSettings {
            conn_retries: 0,
            ..Default::default()
        };
        if let Ok(pool) = RedisPool::connect(&settings).await {
            pool.ping().await.unwrap();
            pool.close().await;
        }
    }

    #[tokio::test]
    async fn test_sentinel_requires_hosts() {
        let settings = RedisSettings {
            sentinel: true,
            ..Default::default()
        };
        let err = RedisPool::connect(&settings).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
