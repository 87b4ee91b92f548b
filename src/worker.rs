//! Background maintenance loop for the serving process.
//!
//! Each tick pulls bounded batches and returns: embed unvectorized rows, feed
//! new vectors to the shift tracker, checkpoint threshold state for ended
//! sessions, and sweep stale registry entries. Ticks run on a blocking thread
//! so the async runtime keeps serving reads, and the store lock is released
//! while the embedder runs. Shutdown is only observed between ticks; a tick
//! in progress always finishes.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::WorkerConfig;
use crate::db::Store;
use crate::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use crate::error::{Error, Result};
use crate::memory::registry::{self, SweepReport};
use crate::memory::types::{Observation, RegistryEntry};
use crate::memory::{observations, sessions};
use crate::shift::{ShiftDecision, ShiftTracker};

/// Published whenever a new vector is judged a topic shift.
#[derive(Debug, Clone, Serialize)]
pub struct ShiftEvent {
    pub partition_key: String,
    pub observation_id: String,
    pub session_id: Option<String>,
    pub decision: ShiftDecision,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub embedded: usize,
    pub tools_embedded: usize,
    pub shifts: usize,
    pub checkpoints: usize,
    pub sweep: SweepReport,
    /// Unvectorized observations left after the tick.
    pub backlog: u64,
    /// Rows that could not be embedded plus steps that failed and were skipped.
    pub errors: usize,
    pub duration_ms: u64,
}

/// Counters readable while the worker runs.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    ticks: AtomicU64,
    processed: AtomicU64,
    backlog: AtomicU64,
    shifts: AtomicU64,
    errors: AtomicU64,
    last_tick_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub processed: u64,
    pub backlog: u64,
    pub shifts: u64,
    pub errors: u64,
    pub last_tick_ms: u64,
}

impl WorkerMetrics {
    fn record(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.processed
            .fetch_add((report.embedded + report.tools_embedded) as u64, Ordering::Relaxed);
        self.shifts.fetch_add(report.shifts as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.errors as u64, Ordering::Relaxed);
        self.backlog.store(report.backlog, Ordering::Relaxed);
        self.last_tick_ms.store(report.duration_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            backlog: self.backlog.load(Ordering::Relaxed),
            shifts: self.shifts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_tick_ms: self.last_tick_ms.load(Ordering::Relaxed),
        }
    }
}

/// Owns the serving process's store handle for background work.
pub struct Worker {
    store: Arc<Mutex<Store>>,
    tracker: Arc<Mutex<ShiftTracker>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: WorkerConfig,
    metrics: Arc<WorkerMetrics>,
    events: Option<mpsc::Sender<ShiftEvent>>,
}

impl Worker {
    pub fn new(store: Arc<Mutex<Store>>, tracker: ShiftTracker, config: WorkerConfig) -> Self {
        Self {
            store,
            tracker: Arc::new(Mutex::new(tracker)),
            embedder: None,
            config,
            metrics: Arc::new(WorkerMetrics::default()),
            events: None,
        }
    }

    /// Without an embedder the embedding step is skipped every tick.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Publish shift decisions on `sender`. Events are dropped when it is full.
    pub fn with_events(mut self, sender: mpsc::Sender<ShiftEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one tick on a blocking thread.
    ///
    /// The store is locked to fetch the batch, unlocked while the embedder
    /// runs, then locked again with the tracker to write the results.
    pub async fn tick(&self) -> Result<TickReport> {
        let store = Arc::clone(&self.store);
        let tracker = Arc::clone(&self.tracker);
        let embedder = self.embedder.clone();
        let config = self.config.clone();

        let (report, events) = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut report = TickReport::default();
            let pending = if embedder.is_some() {
                collect_batch(&*lock(&store, "store")?, &config, &mut report)
            } else {
                PendingBatch::default()
            };
            let embedded = embed_pending(embedder.as_deref(), pending);

            let store = lock(&store, "store")?;
            let mut tracker = lock(&tracker, "tracker")?;
            let events = apply_batch(&store, &mut tracker, embedded, &config, &mut report);
            Ok::<_, Error>((finish(report, started), events))
        })
        .await
        .map_err(|e| Error::Background(e.to_string()))??;

        if let Some(sender) = &self.events {
            for event in events {
                if let Err(e) = sender.try_send(event) {
                    tracing::debug!(error = %e, "shift event dropped");
                }
            }
        }

        self.metrics.record(&report);
        Ok(report)
    }

    /// Tick every `tick_interval_ms` until `shutdown` turns `true` or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = period.as_millis() as u64, "worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) => {
                    if report.duration_ms > period.as_millis() as u64 {
                        tracing::warn!(
                            duration_ms = report.duration_ms,
                            interval_ms = period.as_millis() as u64,
                            backlog = report.backlog,
                            "tick overran its interval"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "worker tick failed"),
            }
        }

        tracing::info!(ticks = self.metrics.snapshot().ticks, "worker stopped");
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Background(format!("{what} lock poisoned")))
}

/// One synchronous tick on a store the caller already owns. Each step logs
/// and counts its own failure so later steps still run.
pub fn run_tick(
    store: &Store,
    tracker: &mut ShiftTracker,
    embedder: Option<&dyn EmbeddingProvider>,
    config: &WorkerConfig,
) -> (TickReport, Vec<ShiftEvent>) {
    let started = Instant::now();
    let mut report = TickReport::default();
    let pending = match embedder {
        Some(_) => collect_batch(store, config, &mut report),
        None => PendingBatch::default(),
    };
    let embedded = embed_pending(embedder, pending);
    let events = apply_batch(store, tracker, embedded, config, &mut report);
    (finish(report, started), events)
}

fn finish(mut report: TickReport, started: Instant) -> TickReport {
    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::debug!(?report, "tick complete");
    report
}

/// Rows owed a vector, read under the store lock.
#[derive(Debug, Default)]
struct PendingBatch {
    observations: Vec<Observation>,
    tools: Vec<RegistryEntry>,
}

/// A row paired with its vector, or the reason it has none.
type Embedded<T> = (T, std::result::Result<Vec<f32>, String>);

#[derive(Default)]
struct EmbeddedBatch {
    observations: Vec<Embedded<Observation>>,
    tools: Vec<Embedded<RegistryEntry>>,
}

fn collect_batch(store: &Store, config: &WorkerConfig, report: &mut TickReport) -> PendingBatch {
    let mut batch = PendingBatch::default();
    match observations::find_unvectorized(store.conn(), config.embed_batch_size) {
        Ok(rows) => batch.observations = rows,
        Err(e) => {
            tracing::warn!(error = %e, "observation backlog query failed");
            report.errors += 1;
        }
    }
    match registry::find_unvectorized(store.conn(), config.embed_batch_size) {
        Ok(entries) => batch.tools = entries,
        Err(e) => {
            tracing::warn!(error = %e, "tool backlog query failed");
            report.errors += 1;
        }
    }
    batch
}

/// Touches no store; runs with every lock released.
fn embed_pending(embedder: Option<&dyn EmbeddingProvider>, batch: PendingBatch) -> EmbeddedBatch {
    let Some(embedder) = embedder else {
        return EmbeddedBatch::default();
    };

    let texts: Vec<String> = batch
        .observations
        .iter()
        .map(|o| match &o.title {
            Some(title) => format!("{title}\n{}", o.content),
            None => o.content.clone(),
        })
        .collect();
    let observations = batch
        .observations
        .into_iter()
        .zip(embed_texts(embedder, &texts))
        .collect();

    let texts: Vec<String> = batch.tools.iter().map(registry::embedding_text).collect();
    let tools = batch.tools.into_iter().zip(embed_texts(embedder, &texts)).collect();

    EmbeddedBatch { observations, tools }
}

/// One outcome per text. A failed batch call is retried text by text so a
/// single bad input cannot fail its neighbours.
fn embed_texts(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
) -> Vec<std::result::Result<Vec<f32>, String>> {
    if texts.is_empty() {
        return Vec::new();
    }
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let outcomes: Vec<std::result::Result<Vec<f32>, String>> = match embedder.embed_batch(&refs) {
        Ok(vectors) if vectors.len() == refs.len() => vectors.into_iter().map(Ok).collect(),
        Err(e) if refs.len() == 1 => vec![Err(format!("{e:#}"))],
        result => {
            match result {
                Ok(vectors) => tracing::warn!(
                    expected = refs.len(),
                    got = vectors.len(),
                    "embedder returned the wrong number of vectors, retrying one by one"
                ),
                Err(e) => tracing::warn!(
                    error = %e,
                    rows = refs.len(),
                    "batch embedding failed, retrying one by one"
                ),
            }
            refs.iter()
                .map(|text| embedder.embed(text).map_err(|e| format!("{e:#}")))
                .collect()
        }
    };

    outcomes
        .into_iter()
        .map(|outcome| {
            outcome.and_then(|vector| {
                if vector.len() == EMBEDDING_DIM {
                    Ok(vector)
                } else {
                    Err(format!(
                        "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                        vector.len()
                    ))
                }
            })
        })
        .collect()
}

/// Write vectors, feed the tracker, then run the store-side maintenance steps.
fn apply_batch(
    store: &Store,
    tracker: &mut ShiftTracker,
    batch: EmbeddedBatch,
    config: &WorkerConfig,
    report: &mut TickReport,
) -> Vec<ShiftEvent> {
    let mut events = Vec::new();
    for (observation, outcome) in batch.observations {
        if let Some(vector) = store_observation_vector(store, &observation, outcome, report) {
            observe_vector(store, tracker, &observation, &vector, report, &mut events);
        }
    }
    for (entry, outcome) in batch.tools {
        store_tool_vector(store, &entry, outcome, report);
    }
    report.shifts = events.len();

    match checkpoint_ended_sessions(store, tracker, config.checkpoint_batch_size) {
        Ok(n) => report.checkpoints = n,
        Err(e) => {
            tracing::warn!(error = %e, "threshold checkpoint step failed");
            report.errors += 1;
        }
    }

    match registry::sweep_stale(store.conn(), config.stale_after_days, config.demote_after_days) {
        Ok(sweep) => report.sweep = sweep,
        Err(e) => {
            tracing::warn!(error = %e, "registry sweep failed");
            report.errors += 1;
        }
    }

    match observations::count_unvectorized(store.conn()) {
        Ok(backlog) => report.backlog = backlog,
        Err(e) => {
            tracing::warn!(error = %e, "backlog count failed");
            report.errors += 1;
        }
    }
    events
}

/// `Some(vector)` once stored. Failures count against the row unless the
/// store was merely busy.
fn store_observation_vector(
    store: &Store,
    observation: &Observation,
    outcome: std::result::Result<Vec<f32>, String>,
    report: &mut TickReport,
) -> Option<Vec<f32>> {
    let failure = match outcome {
        Ok(vector) => match observations::update_embedding(store, &observation.id, &vector) {
            Ok(true) => {
                report.embedded += 1;
                return Some(vector);
            }
            // deleted while it was being embedded
            Ok(false) => return None,
            Err(e) if e.is_busy() => {
                tracing::debug!(id = %observation.id, "store busy, embedding retried next tick");
                report.errors += 1;
                return None;
            }
            Err(e) => e.to_string(),
        },
        Err(reason) => reason,
    };

    tracing::warn!(id = %observation.id, reason = %failure, "observation not embedded");
    report.errors += 1;
    if let Err(e) = observations::record_embed_failure(store.conn(), &observation.id) {
        tracing::warn!(id = %observation.id, error = %e, "embedding failure not recorded");
    }
    None
}

fn store_tool_vector(
    store: &Store,
    entry: &RegistryEntry,
    outcome: std::result::Result<Vec<f32>, String>,
    report: &mut TickReport,
) {
    let failure = match outcome {
        Ok(vector) => match registry::update_embedding(store, &entry.id, &vector) {
            Ok(true) => {
                report.tools_embedded += 1;
                return;
            }
            Ok(false) => return,
            Err(e) if e.is_busy() => {
                report.errors += 1;
                return;
            }
            Err(e) => e.to_string(),
        },
        Err(reason) => reason,
    };

    tracing::warn!(id = %entry.id, name = %entry.name, reason = %failure, "tool not embedded");
    report.errors += 1;
    if let Err(e) = registry::record_embed_failure(store.conn(), &entry.id) {
        tracing::warn!(id = %entry.id, error = %e, "embedding failure not recorded");
    }
}

fn observe_vector(
    store: &Store,
    tracker: &mut ShiftTracker,
    observation: &Observation,
    vector: &[f32],
    report: &mut TickReport,
    events: &mut Vec<ShiftEvent>,
) {
    let decision = match tracker.observe(
        store.conn(),
        &observation.partition_key,
        observation.session_id.as_deref(),
        vector,
    ) {
        Ok(Some(decision)) if decision.shifted => decision,
        Ok(_) => return,
        Err(e) => {
            tracing::warn!(id = %observation.id, error = %e, "shift tracking failed");
            report.errors += 1;
            return;
        }
    };

    tracing::info!(
        partition = %observation.partition_key,
        id = %observation.id,
        distance = decision.distance,
        threshold = decision.threshold,
        confidence = decision.confidence,
        "topic shift"
    );
    events.push(ShiftEvent {
        partition_key: observation.partition_key.clone(),
        observation_id: observation.id.clone(),
        session_id: observation.session_id.clone(),
        decision,
    });
}

fn checkpoint_ended_sessions(
    store: &Store,
    tracker: &mut ShiftTracker,
    batch_size: usize,
) -> Result<usize> {
    let ended = sessions::ended_without_checkpoint(store.conn(), batch_size)?;
    for session in &ended {
        tracker.checkpoint_session(store.conn(), session)?;
    }
    Ok(ended.len())
}
