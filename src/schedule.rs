//! ==============================================================================
//! schedule.rs - watering schedule computation
//! ==============================================================================
//!
//! purpose:
//!     turns (uuid, grass type, soil condition) into the next watering window.
//!
//!     ForecastScheduleComputer runs the full lookup chain
//!         resolve_location(uuid) -> fetch_forecast(lat, lng) -> schedule
//!     and answers with a fixed window. the lookups are real so failures
//!     surface exactly as they would with a real algorithm behind them.
//!
//! relationships:
//!     - used by: backend.rs
//!     - uses: location.rs (LocationStore), weather.rs (ForecastSource)
//!
//! ==============================================================================

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::Schedule;
use crate::http::LookupError;
use crate::location::{LocationError, LocationStore};
use crate::weather::ForecastSource;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("location lookup failed: {0}")]
    Location(#[from] LocationError),
    #[error("forecast lookup failed: {0}")]
    Forecast(#[from] LookupError),
}

#[async_trait]
pub trait ScheduleComputer: Send + Sync {
    async fn compute_schedule(
        &self,
        uuid: &str,
        grass_type: &str,
        condition: &str,
    ) -> Result<Schedule, ScheduleError>;
}

/// answers every request with the same window, no lookups
#[derive(Debug, Clone)]
pub struct FixedScheduleComputer {
    schedule: Schedule,
}

impl FixedScheduleComputer {
    pub fn new(schedule: Schedule) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl ScheduleComputer for FixedScheduleComputer {
    async fn compute_schedule(
        &self,
        _uuid: &str,
        _grass_type: &str,
        _condition: &str,
    ) -> Result<Schedule, ScheduleError> {
        Ok(self.schedule.clone())
    }
}

pub struct ForecastScheduleComputer {
    locations: Arc<dyn LocationStore>,
    forecasts: Arc<dyn ForecastSource>,
    window: Schedule,
}

impl ForecastScheduleComputer {
    pub fn new(locations: Arc<dyn LocationStore>, forecasts: Arc<dyn ForecastSource>) -> Self {
        Self {
            locations,
            forecasts,
            window: Schedule::stub(),
        }
    }
}

#[async_trait]
impl ScheduleComputer for ForecastScheduleComputer {
    async fn compute_schedule(
        &self,
        uuid: &str,
        grass_type: &str,
        condition: &str,
    ) -> Result<Schedule, ScheduleError> {
        let at = self.locations.resolve_location(uuid).await?;
        let periods = self.forecasts.fetch_forecast(&at).await?;

        tracing::debug!(
            %uuid,
            %grass_type,
            %condition,
            periods = periods.len(),
            "forecast ready, deriving schedule"
        );

        // TODO: weigh precipitation probability and grass type once the
        // watering rules are defined; until then every device gets the same window
        Ok(self.window.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LatLng, FIXTURE_DEVICE_UUID};
    use crate::location::InMemoryLocationStore;
    use crate::weather::{fixtures, ForecastPeriod};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingForecast {
        seen: Mutex<Vec<LatLng>>,
        periods: usize,
    }

    #[async_trait]
    impl ForecastSource for RecordingForecast {
        async fn fetch_forecast(&self, at: &LatLng) -> Result<Vec<ForecastPeriod>, LookupError> {
            self.seen.lock().push(at.clone());
            if self.periods == 0 {
                return Err(LookupError::TooFew {
                    what: "forecast",
                    got: 0,
                    min: 2,
                });
            }
            Ok(fixtures::periods(self.periods))
        }
    }

    #[tokio::test]
    async fn forecast_computer_uses_resolved_coordinates() {
        let forecast = Arc::new(RecordingForecast {
            periods: 14,
            ..Default::default()
        });
        let computer = ForecastScheduleComputer::new(
            Arc::new(InMemoryLocationStore::with_fixture(None)),
            forecast.clone(),
        );

        let schedule = computer
            .compute_schedule(FIXTURE_DEVICE_UUID, "bermuda", "very dry")
            .await
            .unwrap();
        assert_eq!(schedule, Schedule::stub());
        assert_eq!(
            forecast.seen.lock().as_slice(),
            &[LatLng::new("34.7444618", "-92.2880157")]
        );
    }

    #[tokio::test]
    async fn unknown_device_fails_before_forecast() {
        let forecast = Arc::new(RecordingForecast {
            periods: 14,
            ..Default::default()
        });
        let computer = ForecastScheduleComputer::new(
            Arc::new(InMemoryLocationStore::with_fixture(None)),
            forecast.clone(),
        );

        let err = computer
            .compute_schedule("stranger", "bermuda", "damp")
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Location(_)));
        assert!(forecast.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn forecast_failure_propagates() {
        let computer = ForecastScheduleComputer::new(
            Arc::new(InMemoryLocationStore::with_fixture(None)),
            Arc::new(RecordingForecast::default()),
        );
        let err = computer
            .compute_schedule(FIXTURE_DEVICE_UUID, "bermuda", "very dry")
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Forecast(LookupError::TooFew { .. })));
    }

    #[tokio::test]
    async fn fixed_computer_ignores_inputs() {
        let computer = FixedScheduleComputer::new(Schedule::new("a", "b"));
        let schedule = computer.compute_schedule("x", "y", "z").await.unwrap();
        assert_eq!(schedule, Schedule::new("a", "b"));
    }
}
