//! CLI `serve` command: the long-lived process that owns the background worker.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use cairn::config::CairnConfig;
use cairn::shift::ShiftTracker;
use cairn::worker::{ShiftEvent, Worker};

const EVENT_BUFFER: usize = 256;

/// Run the worker until ctrl-c. Shift events are written to stdout as JSON
/// lines.
pub async fn serve(config: CairnConfig) -> Result<()> {
    let tracker = ShiftTracker::new(config.shift.clone()).context("invalid shift settings")?;
    let store = Arc::new(Mutex::new(super::open_store(&config)?));
    let (events_tx, mut events_rx) = mpsc::channel::<ShiftEvent>(EVENT_BUFFER);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Worker::new(Arc::clone(&store), tracker, config.worker.clone()).with_events(events_tx);
    let metrics = worker.metrics();

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to encode shift event"),
            }
        }
    });
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested; finishing current tick");
    // Receiver may already be gone if the worker exited on its own.
    let _ = shutdown_tx.send(true);

    worker_task.await.context("worker task panicked")?;
    // The worker owned the only sender, so the printer drains and exits.
    printer.await.context("event printer panicked")?;

    let snapshot = metrics.snapshot();
    tracing::info!(
        ticks = snapshot.ticks,
        processed = snapshot.processed,
        shifts = snapshot.shifts,
        errors = snapshot.errors,
        "serve stopped"
    );

    match Arc::try_unwrap(store) {
        Ok(store) => match store.into_inner() {
            Ok(store) => store.close(),
            Err(_) => tracing::warn!("store lock poisoned; connection dropped without checkpoint"),
        },
        Err(_) => tracing::warn!("store still shared at shutdown; connection dropped without checkpoint"),
    }
    Ok(())
}
