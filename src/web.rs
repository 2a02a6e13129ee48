//! ==============================================================================
//! web.rs - read-only json api over the shared state
//! ==============================================================================
//!
//! purpose:
//!     the dashboard lives elsewhere; it polls these endpoints.
//!
//!     GET /api/data     full snapshot ("Sensor data" + "Service data")
//!     GET /api/status     service namespace only
//!     GET /api/timestamp  newest status timestamp (unix seconds, null if none)
//!     GET /api/health     200 when sensor data exists and every worker has
//!                         reported within its own window, 503 otherwise
//!
//!     sensor workers report every few seconds, delivery tasks only once per
//!     cycle, so each worker can carry its own staleness limit (Liveness).
//!
//!     nothing here writes to the store.
//!
//! ==============================================================================

use crate::domain::{now_secs, ServiceStatus, SharedState};
use crate::store::SharedStore;
use crate::worker::{Shutdown, WorkerError};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct ApiState {
    store: SharedStore,
    liveness: Liveness,
}

/// how long each worker may stay silent before it counts as down
#[derive(Debug, Clone, PartialEq)]
pub struct Liveness {
    default: Duration,
    per_worker: BTreeMap<String, Duration>,
}

impl Liveness {
    pub fn new(default: Duration) -> Self {
        Self { default, per_worker: BTreeMap::new() }
    }

    /// a worker that reports less often than the default allows; never shorter than the default
    pub fn with_worker(mut self, name: impl Into<String>, limit: Duration) -> Self {
        self.per_worker.insert(name.into(), limit.max(self.default));
        self
    }

    pub fn limit_for(&self, name: &str) -> Duration {
        self.per_worker.get(name).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerHealth {
    pub message: String,
    pub age_seconds: f64,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub has_sensor_data: bool,
    pub workers: BTreeMap<String, WorkerHealth>,
}

/// liveness derived from status-entry age: older than the worker's limit means down
pub fn health_report(state: &SharedState, now: f64, liveness: &Liveness) -> HealthReport {
    let workers: BTreeMap<_, _> = state
        .services
        .iter()
        .map(|(name, entry)| {
            let max_age = liveness.limit_for(name).as_secs_f64();
            let health = WorkerHealth {
                message: entry.message.clone(),
                age_seconds: entry.age(now),
                alive: !entry.is_stale(now, max_age),
            };
            (name.clone(), health)
        })
        .collect();
    let has_sensor_data = !state.sensors.is_empty();
    HealthReport {
        healthy: has_sensor_data && workers.values().all(|w| w.alive),
        has_sensor_data,
        workers,
    }
}

/// newest timestamp across the service namespace
pub fn latest_timestamp(state: &SharedState) -> Option<f64> {
    state.services.values().map(|entry| entry.timestamp).reduce(f64::max)
}

pub fn router(store: SharedStore, liveness: Liveness) -> Router {
    Router::new()
        .route("/api/data", get(data_handler))
        .route("/api/status", get(status_handler))
        .route("/api/timestamp", get(timestamp_handler))
        .route("/api/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(ApiState { store, liveness })
}

/// serve until shutdown is requested
pub async fn serve(listener: TcpListener, app: Router, mut shutdown: Shutdown) -> Result<(), WorkerError> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("JSON api live at http://{}/api/data", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    tracing::info!("web server stopped");
    Ok(())
}

async fn data_handler(State(api): State<ApiState>) -> Json<SharedState> {
    Json(api.store.snapshot())
}

async fn status_handler(State(api): State<ApiState>) -> Json<ServiceStatus> {
    Json(api.store.snapshot().services)
}

async fn timestamp_handler(State(api): State<ApiState>) -> Json<Option<f64>> {
    Json(latest_timestamp(&api.store.snapshot()))
}

async fn health_handler(State(api): State<ApiState>) -> (StatusCode, Json<HealthReport>) {
    let report = health_report(&api.store.snapshot(), now_secs(), &api.liveness);
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}
