//! ==============================================================================
//! controller.rs - field controller node
//! ==============================================================================
//!
//! purpose:
//!     the device-side half of the system.
//!
//! responsibilities:
//!     - sample soil conditions on a fixed interval and publish them on the
//!       soil-condition topic (bounded retry per report)
//!     - apply schedules arriving on the schedule topic to the held state
//!
//! concurrency:
//!     two paths run side by side: the session's inbound loop (writes the
//!     held schedule) and the reporting loop (reads nothing shared). the
//!     status api reads the held schedule concurrently, so it sits behind
//!     an async RwLock, same as the host's shared sensor state.
//!
//! ==============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::broker::{publish_with_retry, BrokerError, MessageHandler, Publisher, Session};
use crate::config::SprinklerConfig;
use crate::domain::{Schedule, SoilReport};
use crate::retry::RetryPolicy;
use crate::sensor::SoilSensor;

/// most recently applied schedule, no history
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleState {
    pub current: Option<Schedule>,
    /// unix timestamp (ms) of the last applied schedule
    pub last_update_ms: u64,
}

pub type SharedSchedule = Arc<RwLock<ScheduleState>>;

pub struct Controller {
    soil_topic: String,
    schedule_topic: String,
    interval: Duration,
    publisher: Arc<dyn Publisher>,
    sensor: Arc<dyn SoilSensor>,
    publish_retry: RetryPolicy,
    schedule: SharedSchedule,
    reports_sent: AtomicU64,
}

impl Controller {
    pub fn new(
        config: &SprinklerConfig,
        publisher: Arc<dyn Publisher>,
        sensor: Arc<dyn SoilSensor>,
    ) -> Self {
        Self {
            soil_topic: config.topics.soil_condition.clone(),
            schedule_topic: config.topics.schedule.clone(),
            interval: Duration::from_secs(config.controller.report_interval_seconds),
            publisher,
            sensor,
            publish_retry: config.broker.publish_retry(),
            schedule: Arc::new(RwLock::new(ScheduleState::default())),
            reports_sent: AtomicU64::new(0),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// handle for readers such as the status api
    pub fn schedule_state(&self) -> SharedSchedule {
        self.schedule.clone()
    }

    pub async fn current_schedule(&self) -> Option<Schedule> {
        self.schedule.read().await.current.clone()
    }

    pub fn reports_sent(&self) -> u64 {
        self.reports_sent.load(Ordering::Relaxed)
    }

    pub fn sample_soil_conditions(&self) -> SoilReport {
        self.sensor.sample()
    }

    /// overwrite the held window
    pub async fn set_schedule(&self, schedule: Schedule) {
        let mut state = self.schedule.write().await;
        tracing::info!(
            previous_start = state.current.as_ref().map(|s| s.time_start.as_str()).unwrap_or("-"),
            time_start = %schedule.time_start,
            time_stop = %schedule.time_stop,
            "sprinklers rescheduled"
        );
        state.current = Some(schedule);
        state.last_update_ms = now_ms();
    }

    /// Decode and apply a schedule payload. Malformed payloads are logged
    /// and dropped. Returns whether the schedule was applied.
    pub async fn on_schedule_received(&self, payload: &[u8]) -> bool {
        match Schedule::decode(payload) {
            Ok(schedule) => {
                self.set_schedule(schedule).await;
                true
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping undecodable schedule"
                );
                false
            }
        }
    }

    /// sample once and publish the report
    pub async fn report_once(&self) -> Result<SoilReport, BrokerError> {
        let report = self.sample_soil_conditions();
        let payload = report.encode().map_err(|e| BrokerError::Publish {
            topic: self.soil_topic.clone(),
            reason: e.to_string(),
        })?;
        publish_with_retry(
            self.publisher.as_ref(),
            &self.soil_topic,
            &payload,
            self.publish_retry,
        )
        .await?;
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    /// Publish a report every interval until cancelled. Failed publishes
    /// are logged and the loop carries on.
    pub async fn reporting_loop(&self, cancel: CancellationToken) {
        tracing::info!(
            topic = %self.soil_topic,
            interval_ms = self.interval.as_millis() as u64,
            "starting soil reporting"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.report_once().await {
                Ok(report) => tracing::info!(
                    topic = %self.soil_topic,
                    uuid = %report.uuid,
                    condition = %report.condition,
                    sent = self.reports_sent(),
                    "soil report sent"
                ),
                Err(e) => tracing::error!(topic = %self.soil_topic, error = %e, "soil report not sent"),
            }
        }
        tracing::info!(sent = self.reports_sent(), "soil reporting stopped");
    }

    /// Subscribe to schedules, service them in the background and report
    /// until `cancel` fires.
    ///
    /// If the inbound loop ends first (refused reconnect, closed bus) the
    /// reporting loop is stopped too and the session's result is returned.
    pub async fn start<S: Session>(
        self: Arc<Self>,
        mut session: S,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        session.subscribe(&self.schedule_topic).await?;

        let node = cancel.child_token();
        let mut inbound = tokio::spawn(session.run(self.clone(), node.clone()));

        let ended_early = tokio::select! {
            _ = self.reporting_loop(node.clone()) => None,
            joined = &mut inbound => Some(joined),
        };

        let joined = match ended_early {
            Some(joined) => {
                node.cancel();
                match &joined {
                    Ok(Err(e)) => tracing::error!(error = %e, "inbound loop failed, controller stopping"),
                    Ok(Ok(())) if !cancel.is_cancelled() => {
                        tracing::warn!("inbound loop ended, controller stopping")
                    }
                    _ => {}
                }
                joined
            }
            None => inbound.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "inbound loop panicked");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for Controller {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        tracing::debug!(%topic, bytes = payload.len(), "message received");
        if topic == self.schedule_topic {
            self.on_schedule_received(payload).await;
        } else {
            tracing::debug!(%topic, "ignoring message on unexpected topic");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
