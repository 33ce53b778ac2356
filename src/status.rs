//! ==============================================================================
//! status.rs - controller status api
//! ==============================================================================
//!
//! purpose:
//!     read-only view of the controller for local tooling and dashboards.
//!
//! routes:
//!     GET /api/schedule  -> held schedule + last update (json)
//!     GET /api/health    -> {"status": "ok"}
//!
//! ==============================================================================

use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::controller::{ScheduleState, SharedSchedule};

pub fn router(schedule: SharedSchedule) -> Router {
    Router::new()
        .route("/api/schedule", get(schedule_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(schedule)
}

/// Serve the status api on `bind` until cancelled.
pub async fn serve(bind: &str, schedule: SharedSchedule, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "status api listening");
    axum::serve(listener, router(schedule))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn schedule_handler(State(schedule): State<SharedSchedule>) -> Json<ScheduleState> {
    let state = schedule.read().await;
    Json(state.clone())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Schedule;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn schedule_endpoint_reflects_held_state() {
        let schedule: SharedSchedule = Arc::new(RwLock::new(ScheduleState::default()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(schedule.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let url = format!("http://{}/api/schedule", addr);
        let empty: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert!(empty["current"].is_null());

        {
            let mut state = schedule.write().await;
            state.current = Some(Schedule::stub());
            state.last_update_ms = 42;
        }
        let held: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(held["current"]["time_start"], "2022-06-28T06:00:00-04:00");
        assert_eq!(held["current"]["time_stop"], "2022-06-28T18:00:00-04:00");
        assert_eq!(held["last_update_ms"], 42);
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let schedule: SharedSchedule = Arc::new(RwLock::new(ScheduleState::default()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve("127.0.0.1:0", schedule, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("server exits")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let body = health_handler().await;
        assert_eq!(body.0["status"], "ok");
    }
}
