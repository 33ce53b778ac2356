//! ==============================================================================
//! backend.rs - schedule backend node
//! ==============================================================================
//!
//! purpose:
//!     reacts to soil reports by computing a watering schedule and publishing
//!     it on the schedule topic.
//!
//! flow:
//!
//!     broker loop ──decode──> shard(uuid) ──> worker N ──compute──> publish
//!          │                      │
//!          └─ malformed: drop     └─ queue full: drop
//!
//!     the broker loop only decodes and enqueues, so a slow forecast lookup
//!     never stalls delivery or keep-alives. reports for the same uuid always
//!     land on the same worker, which keeps their relative order.
//!
//! failure policy:
//!     a report whose schedule cannot be computed publishes nothing; the
//!     error is logged with the originating uuid and counted.
//!
//! ==============================================================================

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{publish_with_retry, BrokerError, MessageHandler, Publisher, Session};
use crate::config::SprinklerConfig;
use crate::domain::{Schedule, SoilReport};
use crate::retry::RetryPolicy;
use crate::schedule::{ScheduleComputer, ScheduleError};

#[derive(Debug, Default)]
pub struct BackendStats {
    pub received: AtomicU64,
    pub decode_failures: AtomicU64,
    pub dropped: AtomicU64,
    pub compute_failures: AtomicU64,
    pub publish_failures: AtomicU64,
    pub published: AtomicU64,
}

/// point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub received: u64,
    pub decode_failures: u64,
    pub dropped: u64,
    pub compute_failures: u64,
    pub publish_failures: u64,
    pub published: u64,
}

impl BackendStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            compute_failures: self.compute_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Backend {
    soil_topic: String,
    schedule_topic: String,
    publisher: Arc<dyn Publisher>,
    computer: Arc<dyn ScheduleComputer>,
    publish_retry: RetryPolicy,
    workers: usize,
    queue_depth: usize,
    stats: BackendStats,
}

impl Backend {
    pub fn new(
        config: &SprinklerConfig,
        publisher: Arc<dyn Publisher>,
        computer: Arc<dyn ScheduleComputer>,
    ) -> Self {
        Self {
            soil_topic: config.topics.soil_condition.clone(),
            schedule_topic: config.topics.schedule.clone(),
            publisher,
            computer,
            publish_retry: config.broker.publish_retry(),
            workers: config.backend.workers.max(1),
            queue_depth: config.backend.queue_depth.max(1),
            stats: BackendStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn compute_schedule(
        &self,
        uuid: &str,
        grass_type: &str,
        condition: &str,
    ) -> Result<Schedule, ScheduleError> {
        self.computer
            .compute_schedule(uuid, grass_type, condition)
            .await
    }

    fn decode_report(&self, payload: &[u8]) -> Option<SoilReport> {
        bump(&self.stats.received);
        match SoilReport::decode(payload) {
            Ok(report) => Some(report),
            Err(e) => {
                bump(&self.stats.decode_failures);
                tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping undecodable soil report"
                );
                None
            }
        }
    }

    /// Compute and publish the schedule for one decoded report. Returns the
    /// published schedule, or None when nothing was published.
    pub async fn process_report(&self, report: SoilReport) -> Option<Schedule> {
        let schedule = match self
            .compute_schedule(&report.uuid, &report.grass_type, &report.condition)
            .await
        {
            Ok(schedule) => schedule,
            Err(e) => {
                bump(&self.stats.compute_failures);
                tracing::error!(
                    uuid = %report.uuid,
                    grass_type = %report.grass_type,
                    condition = %report.condition,
                    error = %e,
                    "schedule computation failed, nothing published"
                );
                return None;
            }
        };

        if let Err(e) = self.publish_schedule(&schedule).await {
            bump(&self.stats.publish_failures);
            tracing::error!(uuid = %report.uuid, error = %e, "schedule not published");
            return None;
        }

        bump(&self.stats.published);
        tracing::info!(
            uuid = %report.uuid,
            topic = %self.schedule_topic,
            time_start = %schedule.time_start,
            time_stop = %schedule.time_stop,
            "schedule published"
        );
        Some(schedule)
    }

    async fn publish_schedule(&self, schedule: &Schedule) -> Result<(), BrokerError> {
        let payload = schedule.encode().map_err(|e| BrokerError::Publish {
            topic: self.schedule_topic.clone(),
            reason: e.to_string(),
        })?;
        publish_with_retry(
            self.publisher.as_ref(),
            &self.schedule_topic,
            &payload,
            self.publish_retry,
        )
        .await
    }

    /// Inline path: decode, compute and publish without the worker pool.
    pub async fn on_soil_report_received(&self, payload: &[u8]) -> Option<Schedule> {
        let report = self.decode_report(payload)?;
        self.process_report(report).await
    }

    /// Subscribe to soil reports and service them until `cancel` fires.
    pub async fn start<S: Session>(
        self: Arc<Self>,
        mut session: S,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        session.subscribe(&self.soil_topic).await?;

        let pool = WorkerPool::spawn(self.clone(), self.workers, self.queue_depth);
        let handler = Arc::new(BackendHandler {
            backend: self.clone(),
            pool,
        });

        tracing::info!(
            topic = %self.soil_topic,
            workers = self.workers,
            queue_depth = self.queue_depth,
            "backend servicing soil reports"
        );
        let result = session.run(handler.clone(), cancel).await;

        // closing the queues lets workers finish what is already accepted
        match Arc::try_unwrap(handler) {
            Ok(handler) => handler.pool.shutdown().await,
            Err(_) => tracing::warn!("handler still referenced, workers left running"),
        }
        tracing::info!(stats = ?self.stats(), "backend stopped");
        result
    }
}

/// bridges the broker loop into the worker pool
struct BackendHandler {
    backend: Arc<Backend>,
    pool: WorkerPool,
}

#[async_trait]
impl MessageHandler for BackendHandler {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.backend.soil_topic {
            tracing::debug!(%topic, "ignoring message on unexpected topic");
            return;
        }
        if let Some(report) = self.backend.decode_report(payload) {
            self.pool.dispatch(report, &self.backend.stats);
        }
    }
}

/// fixed set of workers, each fed by its own bounded queue
struct WorkerPool {
    queues: Vec<mpsc::Sender<SoilReport>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(backend: Arc<Backend>, workers: usize, depth: usize) -> Self {
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, mut rx) = mpsc::channel::<SoilReport>(depth);
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                while let Some(report) = rx.recv().await {
                    backend.process_report(report).await;
                }
                tracing::debug!(worker = id, "worker drained");
            }));
            queues.push(tx);
        }
        Self { queues, handles }
    }

    fn shard(&self, uuid: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        uuid.hash(&mut hasher);
        (hasher.finish() % self.queues.len() as u64) as usize
    }

    fn dispatch(&self, report: SoilReport, stats: &BackendStats) {
        let shard = self.shard(&report.uuid);
        match self.queues[shard].try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                bump(&stats.dropped);
                tracing::warn!(uuid = %report.uuid, worker = shard, "worker queue full, soil report dropped");
            }
            Err(mpsc::error::TrySendError::Closed(report)) => {
                bump(&stats.dropped);
                tracing::error!(uuid = %report.uuid, worker = shard, "worker stopped, soil report dropped");
            }
        }
    }

    async fn shutdown(self) {
        drop(self.queues);
        for handle in self.handles {
            handle.await.ok();
        }
    }
}
