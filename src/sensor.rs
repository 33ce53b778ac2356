//! soil sensing capability.
//!
//! the shipped sensor reports a fixed reading; real hardware drivers plug in
//! behind the same trait.

use crate::config::ControllerConfig;
use crate::domain::SoilReport;

/// Produces a soil report for this device. Must return promptly: the
/// reporting loop calls it on every tick.
pub trait SoilSensor: Send + Sync {
    fn sample(&self) -> SoilReport;
}

/// always reports the configured grass type and condition
#[derive(Debug, Clone)]
pub struct StubSoilSensor {
    report: SoilReport,
}

impl StubSoilSensor {
    pub fn new(report: SoilReport) -> Self {
        Self { report }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(SoilReport::new(
            config.device_uuid.clone(),
            config.grass_type.clone(),
            config.condition.clone(),
        ))
    }
}

impl SoilSensor for StubSoilSensor {
    fn sample(&self) -> SoilReport {
        self.report.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FIXTURE_DEVICE_UUID;

    #[test]
    fn stub_sample_carries_all_wire_keys() {
        let sensor = StubSoilSensor::from_config(&ControllerConfig::default());
        let encoded = sensor.sample().encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        for key in ["uuid", "grass_type", "condition"] {
            assert!(value.get(key).and_then(|v| v.as_str()).is_some(), "missing {}", key);
        }
        assert_eq!(value["uuid"], FIXTURE_DEVICE_UUID);
        assert_eq!(value["condition"], "very dry");
    }
}
