//! `--watch`: soft-reload the worker when files under a directory change.

use std::path::PathBuf;

use notify::{recommended_watcher, Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::info;

use rqueue_core::{StopReason, WorkerSettings};

pub async fn watch_and_run(dir: PathBuf, settings: WorkerSettings) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<()>(16);
    let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                let _ = tx.blocking_send(());
            }
        }
    })?;
    watcher.watch(&dir, RecursiveMode::Recursive)?;
    info!("watching {} for changes", dir.display());

    loop {
        let mut worker = crate::tasks::build_worker(settings.clone());
        let stop = worker.stop_token();
        let mut run = tokio::spawn(async move { worker.main().await });

        tokio::select! {
            changed = rx.recv() => {
                stop.cancel();
                let _ = (&mut run).await??;
                if changed.is_none() {
                    break;
                }
                println!("\nfiles changed, reloading rqueue worker...");
                // collapse bursts of filesystem events into one reload
                while rx.try_recv().is_ok() {}
            }
            result = &mut run => {
                match result?? {
                    StopReason::Reload => continue,
                    _ => break,
                }
            }
        }
    }
    Ok(())
}
