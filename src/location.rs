//! ==============================================================================
//! location.rs - device location store and geocoding
//! ==============================================================================
//!
//! purpose:
//!     answers "where is device <uuid>?" for the schedule computer.
//!
//!     - a device with known coordinates resolves immediately.
//!     - a device with only city/state is geocoded once; the store keeps the
//!       coordinates so later reports skip the lookup.
//!     - records live in process memory only.
//!
//! relationships:
//!     - used by: schedule.rs (ForecastScheduleComputer)
//!     - uses: http.rs (GeocodingClient)
//!
//! ==============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::config::DeviceConfig;
use crate::domain::{LatLng, FIXTURE_DEVICE_UUID};
use crate::http::{pointer, HttpLookup, LookupError};

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("unknown device {0}")]
    UnknownDevice(String),
    #[error("device {0} has no coordinates and no geocoder is configured")]
    Unresolved(String),
    #[error("geocoding failed: {0}")]
    Geocode(#[from] LookupError),
}

/// what the store knows about one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub uuid: String,
    pub city: String,
    pub state: String,
    pub lat_lng: Option<LatLng>,
}

impl DeviceRecord {
    /// Little Rock, Arkansas device used by the shipped stubs
    pub fn fixture() -> Self {
        Self {
            uuid: FIXTURE_DEVICE_UUID.to_string(),
            city: "Little Rock".to_string(),
            state: "Arkansas".to_string(),
            lat_lng: Some(LatLng::new("34.7444618", "-92.2880157")),
        }
    }
}

impl From<&DeviceConfig> for DeviceRecord {
    fn from(device: &DeviceConfig) -> Self {
        let lat_lng = match (&device.lat, &device.lng) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat.as_str(), lng.as_str())),
            _ => None,
        };
        Self {
            uuid: device.uuid.clone(),
            city: device.city.clone(),
            state: device.state.clone(),
            lat_lng,
        }
    }
}

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// last known coordinates of the device, resolving them if needed
    async fn resolve_location(&self, uuid: &str) -> Result<LatLng, LocationError>;
}

/// city/state to coordinates
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, city: &str, state: &str) -> Result<LatLng, LookupError>;
}

#[derive(Default)]
pub struct InMemoryLocationStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    geocoder: Option<Arc<dyn Geocoder>>,
}

impl InMemoryLocationStore {
    pub fn new(geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            geocoder,
        }
    }

    /// store seeded with the fixture device
    pub fn with_fixture(geocoder: Option<Arc<dyn Geocoder>>) -> Self {
        let store = Self::new(geocoder);
        store.upsert(DeviceRecord::fixture());
        store
    }

    /// store seeded with configured devices
    pub fn with_devices<'a>(
        devices: impl IntoIterator<Item = &'a DeviceConfig>,
        geocoder: Option<Arc<dyn Geocoder>>,
    ) -> Self {
        let store = Self::new(geocoder);
        for device in devices {
            store.upsert(DeviceRecord::from(device));
        }
        store
    }

    pub fn upsert(&self, record: DeviceRecord) {
        self.devices.write().insert(record.uuid.clone(), record);
    }

    pub fn get(&self, uuid: &str) -> Option<DeviceRecord> {
        self.devices.read().get(uuid).cloned()
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    async fn resolve_location(&self, uuid: &str) -> Result<LatLng, LocationError> {
        let record = self
            .get(uuid)
            .ok_or_else(|| LocationError::UnknownDevice(uuid.to_string()))?;

        if let Some(lat_lng) = record.lat_lng {
            return Ok(lat_lng);
        }

        let geocoder = self
            .geocoder
            .as_ref()
            .ok_or_else(|| LocationError::Unresolved(uuid.to_string()))?;
        let lat_lng = geocoder.geocode(&record.city, &record.state).await?;

        tracing::info!(
            %uuid,
            city = %record.city,
            state = %record.state,
            lat = %lat_lng.lat,
            lng = %lat_lng.lng,
            "geocoded device location"
        );

        if let Some(stored) = self.devices.write().get_mut(uuid) {
            stored.lat_lng = Some(lat_lng.clone());
        }
        Ok(lat_lng)
    }
}

/// google geocoding api client
pub struct GeocodingClient {
    lookup: HttpLookup,
    endpoint: String,
    api_key: String,
}

impl GeocodingClient {
    pub fn new(lookup: HttpLookup, endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            lookup,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for GeocodingClient {
    async fn geocode(&self, city: &str, state: &str) -> Result<LatLng, LookupError> {
        let address = format!("{}, {}", city, state);
        let doc = self
            .lookup
            .get_json(
                &self.endpoint,
                &[("address", address.as_str()), ("key", self.api_key.as_str())],
            )
            .await?;

        let results = pointer(&doc, &self.endpoint, &["results"])?
            .as_array()
            .ok_or_else(|| LookupError::malformed(&self.endpoint, "`results` is not a list"))?;
        let first = results.first().ok_or(LookupError::TooFew {
            what: "geocoding",
            got: 0,
            min: 1,
        })?;

        let location = pointer(first, &self.endpoint, &["geometry", "location"])?;
        let coord = |key: &str| {
            location
                .get(key)
                .and_then(|v| v.as_f64())
                .map(|v| v.to_string())
                .ok_or_else(|| {
                    LookupError::malformed(&self.endpoint, format!("`{}` is not a number", key))
                })
        };
        Ok(LatLng::new(coord("lat")?, coord("lng")?))
    }
}
