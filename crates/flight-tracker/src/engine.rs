//! Background work dispatch
//!
//! Derived-state work (telemetry fan-out, geofence evaluation, statistics
//! recompute) runs on a fixed pool of workers. Every job for a session is
//! routed to the same worker, so jobs for one session run one at a time and
//! in the order they were queued. Failures are logged and counted, never
//! returned to the ingesting caller.

use crate::geofence::GeofenceEngine;
use crate::stats::StatisticsAggregator;
use crate::TrackerConfig;

use flight_core::{Broadcaster, OperatorId, SessionId, TelemetryPoint};
use flight_metrics::MetricsCollector;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Unit of background work, always scoped to one session
#[derive(Debug, Clone)]
pub enum Job {
    /// Push live telemetry to the flight's subscribers
    Broadcast { point: TelemetryPoint },
    /// Evaluate points against danger zones, in the given order
    Geofence {
        operator_id: OperatorId,
        points: Vec<TelemetryPoint>,
    },
    /// Rebuild the session's statistics block
    Recompute,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::Broadcast { .. } => "broadcast",
            Job::Geofence { .. } => "geofence",
            Job::Recompute => "recompute",
        }
    }
}

struct Envelope {
    session_id: SessionId,
    job: Job,
}

/// Engine statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct EngineStats {
    pub workers: usize,
    pub jobs_queued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_dropped: u64,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Everything a worker needs to run jobs
struct JobContext {
    geofence: Arc<GeofenceEngine>,
    stats: Arc<StatisticsAggregator>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Option<Arc<MetricsCollector>>,
    counters: Arc<Counters>,
}

/// Partitioned worker pool for per-session background jobs
pub struct TrackingEngine {
    shards: RwLock<Vec<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    worker_count: usize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl TrackingEngine {
    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn start(
        config: &TrackerConfig,
        geofence: Arc<GeofenceEngine>,
        stats: Arc<StatisticsAggregator>,
        broadcaster: Arc<dyn Broadcaster>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let worker_count = config.engine_workers.max(1);
        let capacity = config.engine_queue_capacity.max(1);
        let counters = Arc::new(Counters::default());
        let context = Arc::new(JobContext {
            geofence,
            stats,
            broadcaster,
            metrics: metrics.clone(),
            counters: counters.clone(),
        });

        let mut shards = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(capacity);
            shards.push(tx);
            workers.push(tokio::spawn(run_worker(index, rx, context.clone())));
        }

        info!(workers = worker_count, capacity, "Tracking engine started");

        Self {
            shards: RwLock::new(shards),
            workers: Mutex::new(workers),
            counters,
            worker_count,
            metrics,
        }
    }

    fn shard_for(session_id: &SessionId, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        session_id.hash(&mut hasher);
        (hasher.finish() % shards as u64) as usize
    }

    /// Queue a job for `session_id`.
    ///
    /// Waits only when that worker's queue is full. Jobs submitted after
    /// shutdown are dropped and counted.
    pub async fn submit(&self, session_id: SessionId, job: Job) {
        let sender = {
            let shards = self.shards.read();
            if shards.is_empty() {
                None
            } else {
                Some(shards[Self::shard_for(&session_id, shards.len())].clone())
            }
        };

        let name = job.name();
        let delivered = match sender {
            Some(tx) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                if tx.send(Envelope { session_id, job }).await.is_ok() {
                    true
                } else {
                    self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                    false
                }
            }
            None => false,
        };

        if !delivered {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_job_dropped();
            }
            warn!(session_id = %session_id, job = name, "Tracking engine stopped, job dropped");
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            workers: self.worker_count,
            jobs_queued: self.counters.queued.load(Ordering::Relaxed),
            jobs_completed: self.counters.completed.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Jobs queued but not yet finished
    pub fn pending(&self) -> u64 {
        let stats = self.stats();
        stats
            .jobs_queued
            .saturating_sub(stats.jobs_completed + stats.jobs_failed)
    }

    /// Wait until every queued job has finished or `timeout` elapses.
    /// Returns whether the engine went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stop accepting jobs, drain the queues and wait for the workers
    pub async fn shutdown(&self) {
        self.shards.write().clear();
        let workers = std::mem::take(&mut *self.workers.lock());

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Tracking engine worker panicked");
            }
        }
        info!("Tracking engine stopped");
    }
}

async fn run_worker(index: usize, mut rx: mpsc::Receiver<Envelope>, context: Arc<JobContext>) {
    debug!(worker = index, "Tracking engine worker started");

    while let Some(Envelope { session_id, job }) = rx.recv().await {
        let name = job.name();
        let started = Instant::now();
        let result = run_job(&context, &session_id, job).await;
        let succeeded = result.is_ok();

        match result {
            Ok(()) => {
                context.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                context.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(session_id = %session_id, job = name, error = %e, "Background job failed");
            }
        }
        if let Some(metrics) = &context.metrics {
            metrics.record_job(name, started.elapsed().as_secs_f64(), succeeded);
        }
    }

    debug!(worker = index, "Tracking engine worker stopped");
}

async fn run_job(context: &JobContext, session_id: &SessionId, job: Job) -> crate::TrackerResult<()> {
    match job {
        Job::Broadcast { point } => {
            let delivered = context.broadcaster.publish_telemetry(session_id, &point);
            debug!(session_id = %session_id, delivered, "Telemetry broadcast");
            Ok(())
        }
        Job::Geofence { operator_id, points } => {
            let total = points.len();
            let mut failed = 0;
            // A failed point must not cost the rest of the batch its evaluation
            for point in points {
                if let Err(e) = context
                    .geofence
                    .check_point(session_id, &operator_id, point.position(), point.timestamp)
                    .await
                {
                    failed += 1;
                    warn!(
                        session_id = %session_id,
                        point_id = %point.id,
                        error = %e,
                        "Geofence check failed for point"
                    );
                }
            }
            if failed > 0 {
                return Err(crate::TrackerError::GeofenceIncomplete { failed, total });
            }
            Ok(())
        }
        Job::Recompute => {
            context.stats.recompute(session_id).await?;
            Ok(())
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
