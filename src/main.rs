//! ==============================================================================
//! main.rs - smart sprinkler entry point
//! ==============================================================================
//!
//! purpose:
//!     one binary, two roles. `node.role` (or SPRINKLER_ROLE) picks which
//!     half of the system this process runs.
//!
//! architecture:
//!
//!     ┌──────────────────┐  sprinkler-topic-soil-condition  ┌──────────────────┐
//!     │    controller    │ ───────────────────────────────> │     backend      │
//!     │  (field device)  │                                  │  location +      │
//!     │  report loop     │ <─────────────────────────────── │  weather lookup  │
//!     │  status api      │      sprinkler-next-schedule     │  worker pool     │
//!     └──────────────────┘                                  └──────────────────┘
//!                         both sides talk only to the mqtt broker
//!
//! responsibilities:
//!     - load configuration, initialize logging
//!     - connect to the broker (fatal after bounded retries)
//!     - wire the node's capabilities and run it until Ctrl-C
//!
//! ==============================================================================

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sprinkler::backend::Backend;
use sprinkler::broker::{MqttSession, Session, SessionParams};
use sprinkler::config::{NodeRole, SprinklerConfig};
use sprinkler::controller::Controller;
use sprinkler::http::HttpLookup;
use sprinkler::location::{Geocoder, GeocodingClient, InMemoryLocationStore};
use sprinkler::retry::CircuitBreaker;
use sprinkler::schedule::ForecastScheduleComputer;
use sprinkler::sensor::StubSoilSensor;
use sprinkler::status;
use sprinkler::weather::WeatherClient;

#[tokio::main]
async fn main() -> Result<()> {
    println!("===========================================================");
    println!("  Smart Sprinkler");
    println!("  soil reports up, watering schedules down");
    println!("===========================================================");

    // step 1: load configuration
    let config = SprinklerConfig::load_or_default().context("loading configuration")?;
    init_tracing(&config.logging.level);
    config.print_summary();
    if config.source.is_none() {
        tracing::warn!("no config file found, using defaults");
    }

    // step 2: Ctrl-C cancels every loop
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            on_signal.cancel();
        }
    });

    // step 3: connect, then hand the session to the node
    let params = SessionParams::from_config(&config);
    let session = tokio::select! {
        session = MqttSession::connect(params) => session.context("connecting to mqtt broker")?,
        _ = cancel.cancelled() => return Ok(()),
    };

    match config.node.role {
        NodeRole::Controller => run_controller(&config, session, cancel).await,
        NodeRole::Backend => run_backend(&config, session, cancel).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_controller(
    config: &SprinklerConfig,
    session: MqttSession,
    cancel: CancellationToken,
) -> Result<()> {
    let sensor = Arc::new(StubSoilSensor::from_config(&config.controller));
    let controller = Arc::new(Controller::new(config, session.publisher(), sensor));

    if config.status.enabled {
        let bind = config.status.bind.clone();
        let schedule = controller.schedule_state();
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(&bind, schedule, token).await {
                tracing::error!(error = %e, "status api failed");
            }
        });
    }

    controller
        .start(session, cancel)
        .await
        .context("controller stopped with an error")
}

async fn run_backend(
    config: &SprinklerConfig,
    session: MqttSession,
    cancel: CancellationToken,
) -> Result<()> {
    let backend_cfg = &config.backend;
    let lookup = |name: &'static str| {
        HttpLookup::new(
            name,
            backend_cfg.http_timeout(),
            &backend_cfg.user_agent,
            backend_cfg.http_retry(),
            CircuitBreaker::new(backend_cfg.breaker_threshold, backend_cfg.breaker_cooldown()),
        )
        .with_context(|| format!("building {} http client", name))
    };

    let geocoder = if backend_cfg.maps_api_key.is_empty() {
        tracing::warn!("no maps api key configured, devices without coordinates will not resolve");
        None
    } else {
        let client = GeocodingClient::new(
            lookup("geocoding")?,
            backend_cfg.geocode_url.clone(),
            backend_cfg.maps_api_key.clone(),
        );
        Some(Arc::new(client) as Arc<dyn Geocoder>)
    };

    let locations = Arc::new(InMemoryLocationStore::with_devices(&backend_cfg.devices, geocoder));
    tracing::info!(devices = backend_cfg.devices.len(), "location store seeded");
    let forecasts = Arc::new(WeatherClient::new(lookup("weather")?, backend_cfg.weather_url.clone()));
    let computer = Arc::new(ForecastScheduleComputer::new(locations, forecasts));
    let backend = Arc::new(Backend::new(config, session.publisher(), computer));

    backend
        .start(session, cancel)
        .await
        .context("backend stopped with an error")
}
