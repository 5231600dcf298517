//! Redis key namespace layout.
//!
//! Every key the system touches lives under a configurable prefix so that
//! several deployments can share one database without collisions. The queue
//! itself is addressed by its plain name and is deliberately not prefixed:
//! queue names are user-facing identifiers (`"rqueue:queue"` by default).

/// Default queue name used when the caller does not specify one.
pub const DEFAULT_QUEUE_NAME: &str = "rqueue:queue";

/// Default worker name used when the settings do not specify one.
pub const DEFAULT_WORKER_NAME: &str = "rqueue-worker";

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "rqueue";

/// Key builder for the fixed set of namespaces.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Job definition bytes, TTL bounded by the expiry hint.
    pub fn job(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    /// Result record, TTL per keep-result policy (or none).
    pub fn result(&self, job_id: &str) -> String {
        format!("{}:result:{}", self.prefix, job_id)
    }

    /// Existence-only claim marker owned by the executing worker.
    pub fn in_progress(&self, job_id: &str) -> String {
        format!("{}:in-progress:{}", self.prefix, job_id)
    }

    /// Per-job attempt counter.
    pub fn retry(&self, job_id: &str) -> String {
        format!("{}:retry:{}", self.prefix, job_id)
    }

    /// Global sorted set of identities marked for cancellation.
    pub fn abort(&self) -> String {
        format!("{}:abort", self.prefix)
    }

    /// Worker record, refreshed on the heartbeat interval.
    pub fn worker(&self, worker_name: &str) -> String {
        format!("{}:worker:{}", self.prefix, worker_name)
    }

    /// Health counters for one worker.
    pub fn health_check(&self, worker_name: &str) -> String {
        format!("{}:health-check:{}", self.prefix, worker_name)
    }

    /// Function registry blob published by workers.
    pub fn task_registry(&self) -> String {
        format!("{}:task", self.prefix)
    }

    /// SCAN pattern matching every result record.
    pub fn result_pattern(&self) -> String {
        format!("{}:result:*", self.prefix)
    }

    /// Prefix of a result key, used to recover the job id from a scanned key.
    pub fn result_prefix(&self) -> String {
        format!("{}:result:", self.prefix)
    }

    /// SCAN pattern matching every worker record.
    pub fn worker_pattern(&self) -> String {
        format!("{}:worker:*", self.prefix)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = Keys::default();
        assert_eq!(keys.job("abc"), "rqueue:job:abc");
        assert_eq!(keys.result("abc"), "rqueue:result:abc");
        assert_eq!(keys.in_progress("abc"), "rqueue:in-progress:abc");
        assert_eq!(keys.retry("abc"), "rqueue:retry:abc");
        assert_eq!(keys.abort(), "rqueue:abort");
        assert_eq!(keys.worker("w1"), "rqueue:worker:w1");
        assert_eq!(keys.health_check("w1"), "rqueue:health-check:w1");
        assert_eq!(keys.task_registry(), "rqueue:task");
    }

    #[test]
    fn test_custom_prefix() {
        let keys = Keys::new("myapp");
        assert_eq!(keys.job("1"), "myapp:job:1");
        assert_eq!(keys.result_pattern(), "myapp:result:*");
    }

    #[test]
    fn test_result_prefix_strips_back_to_id() {
        let keys = Keys::default();
        let key = keys.result("deadbeef");
        let id = key.strip_prefix(&keys.result_prefix()).unwrap();
        assert_eq!(id, "deadbeef");
    }
}
