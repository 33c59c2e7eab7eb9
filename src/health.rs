//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller has started, and `/metrics` serves the Prometheus registry.
//! Metrics are labelled by outcome only; the pool holds too many accounts to
//! label by name.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const HEALTH_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
    8080,
);

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub result: String,
}

impl OutcomeLabels {
    fn new(result: &str) -> Self {
        Self {
            result: result.to_string(),
        }
    }
}

pub struct Metrics {
    /// Reconcile passes by result (`ok` or `error`)
    pub reconciles: Family<OutcomeLabels, Counter>,
    pub reconcile_duration_seconds: Histogram,
    /// Region workers by outcome
    pub region_inits: Family<OutcomeLabels, Counter>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("account_operator");

        let reconciles = Family::<OutcomeLabels, Counter>::default();
        registry.register("reconciles", "Account reconcile passes", reconciles.clone());

        let reconcile_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "reconcile_duration_seconds",
            "Duration of successful account reconcile passes",
            reconcile_duration_seconds.clone(),
        );

        let region_inits = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "region_inits",
            "Region initialization outcomes",
            region_inits.clone(),
        );

        Self {
            reconciles,
            reconcile_duration_seconds,
            region_inits,
            registry,
        }
    }

    pub fn record_reconcile(&self, duration_secs: f64) {
        self.reconciles.get_or_create(&OutcomeLabels::new("ok")).inc();
        self.reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn record_error(&self) {
        self.reconciles.get_or_create(&OutcomeLabels::new("error")).inc();
    }

    pub fn record_region_init(&self, result: &str) {
        self.region_inits.get_or_create(&OutcomeLabels::new(result)).inc();
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Readiness flag and metrics shared with the controller
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    info!("Health server listening on {}", HEALTH_ADDR);
    axum::serve(listener, create_router(state)).await
}
