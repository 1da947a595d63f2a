use axum::{
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::TextEncoder;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::{
    error::AdmissionError,
    limiter::{AdmissionController, Decision},
    metrics::Metrics,
};

/// Set on responses whose verdict came from a failure policy
pub const FALLBACK_HEADER: &str = "x-admission-fallback";

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AdmissionController>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(controller: Arc<AdmissionController>, metrics: Arc<Metrics>) -> Self {
        Self { controller, metrics }
    }
}

#[derive(Debug, Deserialize)]
pub struct AcquireParams {
    pub key: String,
}

/// Routes: `/acquire/:limiter?key=K`, `/healthcheck`, `/metrics`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/acquire/:limiter", get(acquire_handler))
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn acquire_handler(
    State(state): State<AppState>,
    Path(limiter): Path<String>,
    Query(params): Query<AcquireParams>,
) -> Response {
    match state.controller.decide(&limiter, &params.key).await {
        Ok(decision) => decision_response(decision),
        Err(AdmissionError::UnknownLimiter(name)) => {
            (StatusCode::NOT_FOUND, format!("unknown limiter: {}", name)).into_response()
        }
        Err(e) => {
            error!(limiter = %limiter, "Admission request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn decision_response(decision: Decision) -> Response {
    let admitted = decision.is_admitted();
    let status = if admitted {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, admitted.to_string()).into_response();
    if decision.is_fallback() {
        response.headers_mut().insert(
            HeaderName::from_static(FALLBACK_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    response
}

async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.controller.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "limiters": state.controller.limiter_names().len(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            error!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
