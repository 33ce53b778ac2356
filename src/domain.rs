//! ==============================================================================
//! domain.rs - wire payloads exchanged between controller and backend
//! ==============================================================================
//!
//! purpose:
//!     defines the two flat json messages that cross the broker and the
//!     coordinate type the backend resolves per device.
//!
//! wire shapes:
//!     - soil report (controller -> backend): {"uuid", "grass_type", "condition"}
//!     - schedule    (backend -> controller): {"time_start", "time_stop"}
//!
//! all fields are strings. anything else on the wire is malformed.
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// device id used by the shipped stubs (Little Rock, Arkansas)
pub const FIXTURE_DEVICE_UUID: &str = "90e22294-92c6-4998-976e-816f0585d3f6";

/// watering window returned by the stub schedule computer
pub const STUB_TIME_START: &str = "2022-06-28T06:00:00-04:00";
pub const STUB_TIME_STOP: &str = "2022-06-28T18:00:00-04:00";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} payload has an empty `{field}` field")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// soil conditions sampled by a field controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoilReport {
    /// device identifier, correlates the report with a location
    pub uuid: String,
    /// vegetation type, e.g. "bermuda"
    pub grass_type: String,
    /// coarse moisture qualifier, e.g. "very dry"
    pub condition: String,
}

impl SoilReport {
    pub fn new(
        uuid: impl Into<String>,
        grass_type: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            grass_type: grass_type.into(),
            condition: condition.into(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let report: SoilReport =
            serde_json::from_slice(payload).map_err(|source| CodecError::Malformed {
                kind: "soil report",
                source,
            })?;
        if report.uuid.is_empty() {
            return Err(CodecError::EmptyField {
                kind: "soil report",
                field: "uuid",
            });
        }
        Ok(report)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|source| CodecError::Encode {
            kind: "soil report",
            source,
        })
    }
}

/// next watering window, both ends ISO-8601
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub time_start: String,
    pub time_stop: String,
}

impl Schedule {
    pub fn new(time_start: impl Into<String>, time_stop: impl Into<String>) -> Self {
        Self {
            time_start: time_start.into(),
            time_stop: time_stop.into(),
        }
    }

    /// the fixed window the shipped computer answers with
    pub fn stub() -> Self {
        Self::new(STUB_TIME_START, STUB_TIME_STOP)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let schedule: Schedule =
            serde_json::from_slice(payload).map_err(|source| CodecError::Malformed {
                kind: "schedule",
                source,
            })?;
        if schedule.time_start.is_empty() {
            return Err(CodecError::EmptyField {
                kind: "schedule",
                field: "time_start",
            });
        }
        if schedule.time_stop.is_empty() {
            return Err(CodecError::EmptyField {
                kind: "schedule",
                field: "time_stop",
            });
        }
        Ok(schedule)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|source| CodecError::Encode {
            kind: "schedule",
            source,
        })
    }
}

/// device coordinates as decimal strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: String,
    pub lng: String,
}

impl LatLng {
    pub fn new(lat: impl Into<String>, lng: impl Into<String>) -> Self {
        Self {
            lat: lat.into(),
            lng: lng.into(),
        }
    }
}
