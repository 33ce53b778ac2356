//! Both nodes running in one process over the in-memory broker.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use sprinkler::backend::Backend;
use sprinkler::broker::{LocalBroker, Publisher, Session};
use sprinkler::config::{DeviceConfig, SprinklerConfig};
use sprinkler::controller::Controller;
use sprinkler::domain::{LatLng, Schedule, SoilReport, FIXTURE_DEVICE_UUID};
use sprinkler::http::LookupError;
use sprinkler::location::InMemoryLocationStore;
use sprinkler::schedule::ForecastScheduleComputer;
use sprinkler::sensor::StubSoilSensor;
use sprinkler::weather::{ForecastPeriod, ForecastSource};

const SOIL_TOPIC: &str = "sprinkler-topic-soil-condition";
const SCHEDULE_TOPIC: &str = "sprinkler-next-schedule";

/// two 12h periods per day for a week
struct SunnyWeek;

#[async_trait]
impl ForecastSource for SunnyWeek {
    async fn fetch_forecast(&self, _at: &LatLng) -> Result<Vec<ForecastPeriod>, LookupError> {
        Ok((1..=14)
            .map(|n| ForecastPeriod {
                number: n,
                name: format!("Period {}", n),
                start_time: "2022-06-28T06:00:00-05:00".into(),
                end_time: "2022-06-28T18:00:00-05:00".into(),
                is_daytime: n % 2 == 1,
                temperature: Some(91.0),
                temperature_unit: Some("F".into()),
                wind_speed: Some("5 mph".into()),
                short_forecast: "Sunny".into(),
                probability_of_precipitation: None,
            })
            .collect())
    }
}

fn spawn_backend(
    broker: &Arc<LocalBroker>,
    config: &SprinklerConfig,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let computer = Arc::new(ForecastScheduleComputer::new(
        Arc::new(InMemoryLocationStore::with_devices(&config.backend.devices, None)),
        Arc::new(SunnyWeek),
    ));
    let session = broker.session();
    let backend = Arc::new(Backend::new(config, session.publisher(), computer));
    let cancel = cancel.clone();
    tokio::spawn(async move {
        backend.start(session, cancel).await.unwrap();
    })
}

#[tokio::test]
async fn soil_report_yields_exactly_one_schedule() {
    let broker = LocalBroker::new();
    let config = SprinklerConfig::default();
    let cancel = CancellationToken::new();
    let mut schedules = broker.subscribe(SCHEDULE_TOPIC);

    let backend = spawn_backend(&broker, &config, &cancel);
    // let the backend subscribe before publishing
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = SoilReport::new(FIXTURE_DEVICE_UUID, "bermuda", "very dry");
    broker
        .publish(SOIL_TOPIC, report.encode().unwrap())
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), schedules.recv())
        .await
        .expect("schedule within bound")
        .unwrap();
    let schedule = Schedule::decode(&msg.payload).unwrap();
    assert!(!schedule.time_start.is_empty());
    assert!(!schedule.time_stop.is_empty());

    // nothing else shows up
    assert!(
        tokio::time::timeout(Duration::from_millis(200), schedules.recv())
            .await
            .is_err()
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), backend)
        .await
        .expect("backend stops")
        .unwrap();
}

#[tokio::test]
async fn unknown_device_gets_no_schedule() {
    let broker = LocalBroker::new();
    let config = SprinklerConfig::default();
    let cancel = CancellationToken::new();
    let mut schedules = broker.subscribe(SCHEDULE_TOPIC);

    let backend = spawn_backend(&broker, &config, &cancel);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = SoilReport::new("not-a-registered-device", "bermuda", "damp");
    broker
        .publish(SOIL_TOPIC, report.encode().unwrap())
        .await
        .unwrap();
    broker
        .publish(SOIL_TOPIC, b"{\"broken\": true}".to_vec())
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(300), schedules.recv())
            .await
            .is_err()
    );

    cancel.cancel();
    backend.await.unwrap();
}

#[tokio::test]
async fn controller_applies_schedule_computed_by_backend() {
    let broker = LocalBroker::new();
    let config = SprinklerConfig::default();
    let cancel = CancellationToken::new();

    let backend = spawn_backend(&broker, &config, &cancel);

    let session = broker.session();
    let controller = Arc::new(
        Controller::new(
            &config,
            session.publisher(),
            Arc::new(StubSoilSensor::from_config(&config.controller)),
        )
        .with_interval(Duration::from_millis(20)),
    );
    let node = controller.clone();
    let token = cancel.clone();
    let running = tokio::spawn(async move { node.start(session, token).await });

    tokio::time::timeout(Duration::from_secs(3), async {
        while controller.current_schedule().await.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("controller received a schedule");

    assert_eq!(controller.current_schedule().await, Some(Schedule::stub()));
    assert!(controller.reports_sent() >= 1);

    cancel.cancel();
    running.await.unwrap().unwrap();
    backend.await.unwrap();
}

#[tokio::test]
async fn configured_device_is_scheduled() {
    let broker = LocalBroker::new();
    let mut config = SprinklerConfig::default();
    config.backend.devices = vec![DeviceConfig {
        uuid: "field-7".into(),
        city: "Austin".into(),
        state: "Texas".into(),
        lat: Some("30.2672".into()),
        lng: Some("-97.7431".into()),
    }];
    let cancel = CancellationToken::new();
    let mut schedules = broker.subscribe(SCHEDULE_TOPIC);

    let backend = spawn_backend(&broker, &config, &cancel);
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker
        .publish(SOIL_TOPIC, SoilReport::new("field-7", "zoysia", "damp").encode().unwrap())
        .await
        .unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), schedules.recv())
        .await
        .expect("schedule within bound")
        .unwrap();
    assert_eq!(Schedule::decode(&msg.payload).unwrap(), Schedule::stub());

    // the fixture is replaced, not merged
    broker
        .publish(SOIL_TOPIC, SoilReport::new(FIXTURE_DEVICE_UUID, "bermuda", "very dry").encode().unwrap())
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), schedules.recv())
            .await
            .is_err()
    );

    cancel.cancel();
    backend.await.unwrap();
}
