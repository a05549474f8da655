use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;

use tenantry_core::{lock::default_lease, system_clock, Clock, TenantLockManager};
use tenantry_storage::Database;

use crate::provision::{self, ProvisioningService};
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    locks: TenantLockManager,
    provisioner: ProvisioningService,
}

impl AppState {
    pub fn new(metrics: PrometheusHandle, storage: Database) -> Self {
        Self::with_clock(metrics, storage, system_clock())
    }

    pub fn with_clock(metrics: PrometheusHandle, storage: Database, clock: Clock) -> Self {
        let locks = TenantLockManager::with_clock(default_lease(), clock.clone());
        let provisioner = ProvisioningService::new(storage.clone(), locks.clone(), clock);
        Self {
            metrics,
            storage,
            locks,
            provisioner,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn locks(&self) -> &TenantLockManager {
        &self.locks
    }

    pub fn provisioner(&self) -> &ProvisioningService {
        &self.provisioner
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/tenant/status", get(provision::status))
        .route("/tenant/provision", post(provision::provision))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
