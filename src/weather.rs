//! ==============================================================================
//! weather.rs - forecast lookup against the weather.gov api
//! ==============================================================================
//!
//! purpose:
//!     resolves a coordinate pair to a list of forecast periods using two
//!     chained GETs:
//!
//!         GET {base}/points/{lat},{lng}      -> properties.forecast (url)
//!         GET {properties.forecast}          -> properties.periods  (list)
//!
//! contract:
//!     success means an ordered list with at least MIN_FORECAST_PERIODS
//!     entries. an empty or single-period document is a failure.
//!
//! ==============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::LatLng;
use crate::http::{pointer, HttpLookup, LookupError};

/// fewer periods than this is treated as a broken forecast
pub const MIN_FORECAST_PERIODS: usize = 2;

/// one period of a weather.gov forecast document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForecastPeriod {
    pub number: u32,
    #[serde(default)]
    pub name: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub is_daytime: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub temperature_unit: Option<String>,
    #[serde(default)]
    pub wind_speed: Option<String>,
    #[serde(default)]
    pub short_forecast: String,
    #[serde(default)]
    pub probability_of_precipitation: Option<Measurement>,
}

/// `{ "unitCode": "wmoUnit:percent", "value": 20 }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    #[serde(default)]
    pub unit_code: Option<String>,
    pub value: Option<f64>,
}

/// anything that can produce a forecast for a coordinate pair
#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch_forecast(&self, at: &LatLng) -> Result<Vec<ForecastPeriod>, LookupError>;
}

pub struct WeatherClient {
    lookup: HttpLookup,
    base_url: String,
}

impl WeatherClient {
    pub fn new(lookup: HttpLookup, base_url: impl Into<String>) -> Self {
        Self {
            lookup,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// step 1: point metadata carries the url of the forecast document
    async fn forecast_url(&self, at: &LatLng) -> Result<String, LookupError> {
        let url = format!("{}/points/{},{}", self.base_url, at.lat, at.lng);
        let doc = self.lookup.get_json(&url, &[]).await?;
        pointer(&doc, &url, &["properties", "forecast"])?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LookupError::malformed(&url, "`properties.forecast` is not a string"))
    }
}

#[async_trait]
impl ForecastSource for WeatherClient {
    async fn fetch_forecast(&self, at: &LatLng) -> Result<Vec<ForecastPeriod>, LookupError> {
        let forecast_url = self.forecast_url(at).await?;

        // step 2: the forecast document itself
        let doc = self.lookup.get_json(&forecast_url, &[]).await?;
        let periods = pointer(&doc, &forecast_url, &["properties", "periods"])?.clone();
        let periods: Vec<ForecastPeriod> = serde_json::from_value(periods)
            .map_err(|e| LookupError::malformed(&forecast_url, e.to_string()))?;

        if periods.len() < MIN_FORECAST_PERIODS {
            return Err(LookupError::TooFew {
                what: "forecast",
                got: periods.len(),
                min: MIN_FORECAST_PERIODS,
            });
        }

        tracing::debug!(
            lat = %at.lat,
            lng = %at.lng,
            periods = periods.len(),
            first = %periods[0].short_forecast,
            "forecast fetched"
        );
        Ok(periods)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::ForecastPeriod;
    use serde_json::{json, Value};

    /// weather.gov style periods, alternating day/night, 12h each
    pub fn periods_json(count: usize) -> Value {
        let periods: Vec<Value> = (0..count)
            .map(|i| {
                json!({
                    "number": i + 1,
                    "name": if i % 2 == 0 { "Today" } else { "Tonight" },
                    "startTime": format!("2022-06-{:02}T{}:00:00-05:00", 28 + i / 2, if i % 2 == 0 { "06" } else { "18" }),
                    "endTime": format!("2022-06-{:02}T{}:00:00-05:00", 28 + (i + 1) / 2, if i % 2 == 0 { "18" } else { "06" }),
                    "isDaytime": i % 2 == 0,
                    "temperature": 90 - (i % 2) * 15,
                    "temperatureUnit": "F",
                    "temperatureTrend": null,
                    "probabilityOfPrecipitation": { "unitCode": "wmoUnit:percent", "value": 20 },
                    "windSpeed": "5 mph",
                    "windDirection": "S",
                    "shortForecast": "Sunny",
                    "detailedForecast": "Sunny, with a high near 90."
                })
            })
            .collect();
        Value::Array(periods)
    }

    pub fn periods(count: usize) -> Vec<ForecastPeriod> {
        serde_json::from_value(periods_json(count)).unwrap()
    }
}
