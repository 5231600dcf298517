//! Built-in task set registered by the CLI worker.
//!
//! The binary cannot import user modules at runtime, so it ships this demo
//! registry; library users embed [`Worker`] directly with their own
//! functions.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::info;

use rqueue_core::{cron, func, JobContext, JobError, Worker, WorkerSettings};

pub fn build_worker(settings: WorkerSettings) -> Worker {
    Worker::new(settings)
        .register(func("say_hello", say_hello))
        .register(func("say_hi", say_hi))
        .register_cron(
            cron("run_regularly", run_regularly)
                .hour([9, 12, 18])
                .minute([12]),
        )
        .on_startup(|_ctx| async {
            info!("starting... done");
            Ok(())
        })
        .on_shutdown(|_ctx| async {
            info!("ending... done");
            Ok(())
        })
}

async fn say_hello(ctx: JobContext) -> Result<Value, JobError> {
    let name = first_arg(&ctx);
    tokio::time::sleep(Duration::from_secs(5)).await;
    info!("Hello {}", name);
    Ok(Value::Null)
}

async fn say_hi(ctx: JobContext) -> Result<Value, JobError> {
    let name = first_arg(&ctx);
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!("Hi {}", name);
    Ok(json!(name))
}

async fn run_regularly(_ctx: JobContext) -> Result<Value, JobError> {
    info!("run foo job at 9.12am, 12.12pm and 6.12pm");
    Ok(Value::Null)
}

fn first_arg(ctx: &JobContext) -> String {
    ctx.args
        .first()
        .and_then(Value::as_str)
        .or_else(|| ctx.kwargs.get("name").and_then(Value::as_str))
        .unwrap_or("world")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_worker_registers_demo_tasks() {
        // constructing the worker must not touch redis
        let _worker = build_worker(WorkerSettings::default());
    }
}
