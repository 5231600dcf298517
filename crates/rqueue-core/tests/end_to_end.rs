//! End-to-end tests against a local redis.
//!
//! Each test isolates itself under a random key prefix and queue name, and
//! skips silently when no redis server is reachable on localhost.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use rqueue_core::{
    func, Client, Error, JobError, JobOptions, JobStatus, RedisSettings, StopReason, Worker,
    WorkerSettings,
};

fn isolated_settings() -> (WorkerSettings, String) {
    let tag = Uuid::new_v4().simple().to_string();
    let queue = format!("test:{}:queue", &tag[..8]);
    let settings = WorkerSettings {
        redis: RedisSettings {
            key_prefix: format!("test:{}", &tag[..8]),
            conn_retries: 0,
            ..Default::default()
        },
        queue_name: queue.clone(),
        worker_name: format!("test-worker-{}", &tag[..8]),
        poll_delay_ms: 50,
        burst: true,
        ..Default::default()
    };
    (settings, queue)
}

async fn connect(settings: &WorkerSettings) -> Option<Client> {
    match Client::connect(&settings.redis).await {
        Ok(client) => Some(client.with_default_queue(settings.queue_name.clone())),
        Err(_) => None, // no local redis, skip
    }
}

#[tokio::test]
async fn test_duplicate_job_id_is_not_created() {
    let (settings, _) = isolated_settings();
    let Some(client) = connect(&settings).await else { return };

    let first = client
        .enqueue_job(
            "say_hi",
            vec![json!("wutong")],
            HashMap::new(),
            JobOptions::default().job_id("dup1"),
        )
        .await
        .unwrap();
    assert!(first.is_some());

    let second = client
        .enqueue_job(
            "say_hi",
            vec![json!("other")],
            HashMap::new(),
            JobOptions::default().job_id("dup1"),
        )
        .await
        .unwrap();
    assert!(second.is_none());

    // the first definition survives untouched
    let queued = client.queued_jobs(None).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].args, vec![json!("wutong")]);
}

#[tokio::test]
async fn test_status_derivation() {
    let (settings, _) = isolated_settings();
    let Some(client) = connect(&settings).await else { return };

    let deferred = client
        .enqueue_job(
            "say_hi",
            vec![],
            HashMap::new(),
            JobOptions::default().defer_by(Duration::from_secs(3600)),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deferred.status().await.unwrap(), JobStatus::Deferred);

    let ready = client
        .enqueue_job("say_hi", vec![], HashMap::new(), JobOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ready.status().await.unwrap(), JobStatus::Queued);

    let missing = client.job("no-such-job", None);
    assert_eq!(missing.status().await.unwrap(), JobStatus::NotFound);

    let info = ready.info().await.unwrap().unwrap();
    assert_eq!(info.function, "say_hi");
    assert!(info.score.is_some());
}

#[tokio::test]
async fn test_burst_worker_executes_jobs() {
    let (settings, _) = isolated_settings();
    let Some(client) = connect(&settings).await else { return };

    let mut handles = Vec::new();
    for i in 0..3 {
        let job = client
            .enqueue_job("double", vec![json!(i)], HashMap::new(), JobOptions::default())
            .await
            .unwrap()
            .unwrap();
        handles.push(job);
    }

    let mut worker = Worker::new(settings).register(func("double", |ctx| async move {
        let n = ctx.args[0].as_i64().unwrap_or(0);
        Ok(json!(n * 2))
    }));
    assert_eq!(worker.run().await.unwrap(), StopReason::Drained);

    for (i, job) in handles.iter().enumerate() {
        assert_eq!(job.status().await.unwrap(), JobStatus::Complete);
        let value = job.result(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(value, json!(i as i64 * 2));
        let result = job.result_info().await.unwrap().unwrap();
        assert!(result.success);
        assert!(result.finish_time >= result.start_time);
        assert!(result.start_time >= result.enqueue_time);
    }
}

#[tokio::test]
async fn test_failing_job_retries_then_records_failure() {
    let (mut settings, _) = isolated_settings();
    settings.max_tries = 2;
    settings.retry_backoff_ms = 50;
    let Some(client) = connect(&settings).await else { return };

    let job = client
        .enqueue_job("always_fails", vec![], HashMap::new(), JobOptions::default())
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(settings).register(func("always_fails", |_ctx| async {
        Err::<serde_json::Value, _>(JobError::fail("boom"))
    }));
    assert_eq!(worker.run().await.unwrap(), StopReason::Drained);

    let result = job.result_info().await.unwrap().unwrap();
    assert!(!result.success);
    // one invocation per consumed attempt
    assert_eq!(result.job_try, 2);
    match job.result(Some(Duration::from_secs(1))).await {
        Err(Error::Execution(message)) => assert!(message.contains("boom")),
        other => panic!("expected execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_job_timeout_is_terminal() {
    let (mut settings, _) = isolated_settings();
    settings.job_timeout_secs = 1;
    let Some(client) = connect(&settings).await else { return };

    let job = client
        .enqueue_job("sleepy", vec![], HashMap::new(), JobOptions::default())
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(settings).register(func("sleepy", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!(null))
    }));
    assert_eq!(worker.run().await.unwrap(), StopReason::Drained);

    let result = job.result_info().await.unwrap().unwrap();
    assert!(!result.success);
    assert!(result.is_timeout());
    assert!(matches!(
        job.result(Some(Duration::from_secs(1))).await,
        Err(Error::JobTimeout)
    ));
}

#[tokio::test]
async fn test_abort_running_job() {
    let (mut settings, _) = isolated_settings();
    settings.allow_abort_jobs = true;
    settings.burst = false;
    let Some(client) = connect(&settings).await else { return };

    let job = client
        .enqueue_job("long_runner", vec![], HashMap::new(), JobOptions::default())
        .await
        .unwrap()
        .unwrap();

    let mut worker = Worker::new(settings).register(func("long_runner", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!(null))
    }));
    let stop = worker.stop_token();
    let handle = tokio::spawn(async move { worker.run().await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let aborted = job
        .abort(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(aborted);

    let result = job.result_info().await.unwrap().unwrap();
    assert!(!result.success);
    assert!(result.is_cancelled());

    stop.cancel();
    handle.await.unwrap().unwrap();
}
