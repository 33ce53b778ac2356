//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `sprinkler.toml`.
//!     loads configuration from file or falls back to defaults.
//!     secrets can be supplied through the environment instead of the file.
//!
//! structure:
//!     - NodeConfig: which role this process plays (controller or backend).
//!     - BrokerConfig: MQTT endpoint, credentials, connect/publish retry.
//!     - TopicsConfig: the two fixed topic names.
//!     - ControllerConfig: device identity and reporting interval.
//!     - BackendConfig: lookup endpoints, timeouts, worker pool sizing.
//!     - StatusConfig: optional controller status API.
//!
//! environment overrides:
//!     SPRINKLER_CONFIG, SPRINKLER_ROLE, SPRINKLER_MQTT_USERNAME,
//!     SPRINKLER_MQTT_PASSWORD, SPRINKLER_MAPS_API_KEY
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::FIXTURE_DEVICE_UUID;
use crate::retry::RetryPolicy;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct SprinklerConfig {
    pub node: NodeConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
    /// where this config was read from, None when defaults are in use
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Controller,
    Backend,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Controller => "controller",
            NodeRole::Backend => "backend",
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(NodeRole::Controller),
            "backend" => Ok(NodeRole::Backend),
            other => Err(anyhow::anyhow!("unknown node role `{}`", other)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// overrides the derived MQTT client id; must stay unique per broker
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicsConfig {
    pub soil_condition: String,
    pub schedule: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    pub device_uuid: String,
    pub grass_type: String,
    /// value the stub sensor reports
    pub condition: String,
    pub report_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub weather_url: String,
    pub geocode_url: String,
    #[serde(default)]
    pub maps_api_key: String,
    pub user_agent: String,
    pub http_timeout_seconds: u64,
    pub http_attempts: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_seconds: u64,
    pub workers: usize,
    pub queue_depth: usize,
    /// devices the location store starts with
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceConfig>,
}

/// one `[[backend.devices]]` entry. without `lat`/`lng` the device is
/// geocoded from city and state on its first report.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub uuid: String,
    pub city: String,
    pub state: String,
    #[serde(default)]
    pub lat: Option<String>,
    #[serde(default)]
    pub lng: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_devices() -> Vec<DeviceConfig> {
    vec![DeviceConfig {
        uuid: FIXTURE_DEVICE_UUID.to_string(),
        city: "Little Rock".to_string(),
        state: "Arkansas".to_string(),
        lat: Some("34.7444618".to_string()),
        lng: Some("-92.2880157".to_string()),
    }]
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            soil_condition: "sprinkler-topic-soil-condition".to_string(),
            schedule: "sprinkler-next-schedule".to_string(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_uuid: FIXTURE_DEVICE_UUID.to_string(),
            grass_type: "bermuda".to_string(),
            condition: "very dry".to_string(),
            report_interval_seconds: 3,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            weather_url: "https://api.weather.gov".to_string(),
            geocode_url: "https://maps.googleapis.com/maps/api/geocode/json".to_string(),
            maps_api_key: String::new(),
            user_agent: concat!("smart-sprinkler/", env!("CARGO_PKG_VERSION")).to_string(),
            http_timeout_seconds: 10,
            http_attempts: 3,
            breaker_threshold: 5,
            breaker_cooldown_seconds: 60,
            workers: 4,
            queue_depth: 32,
            devices: default_devices(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn connect_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn publish_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_attempts,
            Duration::from_millis(self.retry_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl BackendConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn http_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.http_attempts,
            Duration::from_millis(250),
            Duration::from_secs(5),
        )
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_seconds)
    }
}

impl SprinklerConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let mut config: SprinklerConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        config.source = Some(path.as_ref().to_path_buf());

        Ok(config)
    }

    /// Load with default fallback, then apply environment overrides.
    ///
    /// An explicit `SPRINKLER_CONFIG` that fails to load is an error; the
    /// well-known locations are only probed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os("SPRINKLER_CONFIG") {
            Some(path) => Self::load(PathBuf::from(path))?,
            None => Self::probe_default_paths(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn probe_default_paths() -> Self {
        let paths = [
            PathBuf::from("config").join("sprinkler.toml"),
            PathBuf::from("..").join("config").join("sprinkler.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        Self::default()
    }

    /// Reject values that parse but cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.controller.report_interval_seconds == 0 {
            anyhow::bail!("controller.report_interval_seconds must be at least 1");
        }
        if self.backend.workers == 0 {
            anyhow::bail!("backend.workers must be at least 1");
        }
        if self.backend.queue_depth == 0 {
            anyhow::bail!("backend.queue_depth must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.backend.devices {
            if device.uuid.is_empty() {
                anyhow::bail!("backend.devices entry with an empty uuid");
            }
            if !seen.insert(device.uuid.as_str()) {
                anyhow::bail!("backend.devices lists {} twice", device.uuid);
            }
            if device.lat.is_some() != device.lng.is_some() {
                anyhow::bail!("device {} needs both lat and lng, or neither", device.uuid);
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(role) = std::env::var("SPRINKLER_ROLE") {
            self.node.role = role.parse()?;
        }
        if let Ok(username) = std::env::var("SPRINKLER_MQTT_USERNAME") {
            self.broker.username = username;
        }
        if let Ok(password) = std::env::var("SPRINKLER_MQTT_PASSWORD") {
            self.broker.password = password;
        }
        if let Ok(key) = std::env::var("SPRINKLER_MAPS_API_KEY") {
            self.backend.maps_api_key = key;
        }
        Ok(())
    }

    /// MQTT client identity for this node.
    /// controllers embed the device uuid so several can share a broker.
    pub fn client_id(&self) -> String {
        if let Some(id) = &self.node.client_id {
            return id.clone();
        }
        match self.node.role {
            NodeRole::Controller => {
                format!("smart-sprinkler-controller-{}", self.controller.device_uuid)
            }
            NodeRole::Backend => "smart-sprinkler-backend".to_string(),
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let source = self
            .source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "defaults".to_string());
        println!("┌─────────────────────────────────────────┐");
        println!("│        SPRINKLER CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Source: {}", source);
        println!("│ Role: {}", self.node.role.as_str());
        println!("│ Client ID: {}", self.client_id());
        println!("│ Broker: {}:{}", self.broker.host, self.broker.port);
        println!("│ Soil Topic: {}", self.topics.soil_condition);
        println!("│ Schedule Topic: {}", self.topics.schedule);
        match self.node.role {
            NodeRole::Controller => {
                println!("│ Device: {}", self.controller.device_uuid);
                println!("│ Report Interval: {}s", self.controller.report_interval_seconds);
            }
            NodeRole::Backend => {
                println!("│ Weather API: {}", self.backend.weather_url);
                println!("│ Workers: {}", self.backend.workers);
                println!("│ Devices: {}", self.backend.devices.len());
            }
        }
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

impl Default for SprinklerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                role: NodeRole::Controller,
                client_id: None,
            },
            broker: BrokerConfig {
                host: "broker.emqx.io".to_string(),
                port: 1883,
                username: "emqx".to_string(),
                password: "public".to_string(),
                keep_alive_seconds: default_keep_alive(),
                connect_attempts: default_connect_attempts(),
                retry_backoff_ms: default_backoff_ms(),
                max_backoff_ms: default_max_backoff_ms(),
                publish_attempts: default_publish_attempts(),
            },
            topics: TopicsConfig::default(),
            controller: ControllerConfig::default(),
            backend: BackendConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            status: StatusConfig::default(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [node]
        role = "backend"

        [broker]
        host = "localhost"
        port = 1884
        username = "u"
        password = "p"

        [logging]
        level = "debug"
    "#;

    #[test]
    fn minimal_file_fills_sections_with_defaults() {
        let config: SprinklerConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.node.role, NodeRole::Backend);
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.broker.publish_attempts, 3);
        assert_eq!(config.topics.soil_condition, "sprinkler-topic-soil-condition");
        assert_eq!(config.topics.schedule, "sprinkler-next-schedule");
        assert_eq!(config.controller.device_uuid, FIXTURE_DEVICE_UUID);
        assert!(!config.status.enabled);
    }

    #[test]
    fn client_id_depends_on_role() {
        let mut config = SprinklerConfig::default();
        assert_eq!(
            config.client_id(),
            format!("smart-sprinkler-controller-{}", FIXTURE_DEVICE_UUID)
        );

        config.node.role = NodeRole::Backend;
        assert_eq!(config.client_id(), "smart-sprinkler-backend");

        config.node.client_id = Some("custom".into());
        assert_eq!(config.client_id(), "custom");
    }

    #[test]
    fn unknown_role_is_rejected() {
        let broken = MINIMAL.replace("\"backend\"", "\"hub\"");
        assert!(toml::from_str::<SprinklerConfig>(&broken).is_err());
        assert!("hub".parse::<NodeRole>().is_err());
        assert_eq!(" Controller ".parse::<NodeRole>().unwrap(), NodeRole::Controller);
    }

    #[test]
    fn load_records_source_path() {
        let dir = std::env::temp_dir().join(format!("sprinkler-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sprinkler.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = SprinklerConfig::load(&path).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        assert_eq!(config.logging.level, "debug");

        std::fs::remove_dir_all(&dir).ok();
    }

    fn backend_section(extra: &str) -> String {
        format!(
            r#"{MINIMAL}
            [backend]
            weather_url = "http://localhost:9000"
            geocode_url = "http://localhost:9001/geocode/json"
            user_agent = "sprinkler-tests"
            http_timeout_seconds = 2
            http_attempts = 1
            breaker_threshold = 3
            breaker_cooldown_seconds = 5
            workers = 2
            queue_depth = 8
            {extra}
            "#
        )
    }

    #[test]
    fn devices_default_to_fixture() {
        let config: SprinklerConfig = toml::from_str(&backend_section("")).unwrap();
        assert_eq!(config.backend.devices.len(), 1);
        let device = &config.backend.devices[0];
        assert_eq!(device.uuid, FIXTURE_DEVICE_UUID);
        assert_eq!(device.lat.as_deref(), Some("34.7444618"));
        assert_eq!(device.lng.as_deref(), Some("-92.2880157"));
        assert_eq!(SprinklerConfig::default().backend.devices, config.backend.devices);
    }

    #[test]
    fn devices_table_replaces_fixture() {
        let config: SprinklerConfig = toml::from_str(&backend_section(
            r#"
            [[backend.devices]]
            uuid = "d1"
            city = "Austin"
            state = "Texas"

            [[backend.devices]]
            uuid = "d2"
            city = "Little Rock"
            state = "Arkansas"
            lat = "34.7444618"
            lng = "-92.2880157"
            "#,
        ))
        .unwrap();
        config.validate().unwrap();

        let devices = &config.backend.devices;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uuid, "d1");
        assert_eq!(devices[0].city, "Austin");
        assert!(devices[0].lat.is_none() && devices[0].lng.is_none());
        assert_eq!(devices[1].lat.as_deref(), Some("34.7444618"));
    }

    #[test]
    fn validate_rejects_unrunnable_values() {
        let mut config = SprinklerConfig::default();
        config.validate().unwrap();

        config.controller.report_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = SprinklerConfig::default();
        config.backend.workers = 0;
        assert!(config.validate().is_err());

        let mut config = SprinklerConfig::default();
        config.backend.queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = SprinklerConfig::default();
        config.backend.devices[0].lng = None;
        assert!(config.validate().is_err());

        let mut config = SprinklerConfig::default();
        let twin = config.backend.devices[0].clone();
        config.backend.devices.push(twin);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_rejects_zero_interval() {
        let dir = std::env::temp_dir().join(format!("sprinkler-config-zero-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sprinkler.toml");
        std::fs::write(
            &path,
            format!(
                "{MINIMAL}\n[controller]\ndevice_uuid = \"d\"\ngrass_type = \"g\"\ncondition = \"c\"\nreport_interval_seconds = 0\n"
            ),
        )
        .unwrap();

        let err = SprinklerConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("report_interval_seconds"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn retry_policies_follow_broker_settings() {
        let config = SprinklerConfig::default();
        let connect = config.broker.connect_retry();
        assert_eq!(connect.attempts, 5);
        assert_eq!(connect.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.broker.publish_retry().attempts, 3);
    }
}
