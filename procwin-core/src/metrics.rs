//! Prometheus metrics for the windowing runtime, exposed by the metrics server on `/metrics`.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Error, Result};

const PARTITION_LABEL: &str = "partition";

// Note: We do not add a suffix to the metric name, as the suffix is inferred through the metric type
// by the prometheus client library
const ELEMENTS_TOTAL: &str = "elements";
const DROPPED_TOTAL: &str = "dropped";
const LATE_REASSIGNED_TOTAL: &str = "late_reassigned";
const WINDOWS_FIRED_TOTAL: &str = "windows_fired";
const PANES_EVICTED_TOTAL: &str = "panes_evicted";
const PENDING_WINDOWS: &str = "pending_windows";
const TIMER_LAG: &str = "timer_lag_ms";

const REGISTRY_PREFIX: &str = "procwin";

/// The global registry, every metric of the process is registered here.
struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix(REGISTRY_PREFIX)),
        }
    }
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

pub(crate) type Labels = Vec<(String, String)>;

/// Metrics of the window operators, labelled by partition.
pub(crate) struct WindowMetrics {
    pub(crate) elements_total: Family<Labels, Counter>,
    pub(crate) dropped_total: Family<Labels, Counter>,
    pub(crate) late_reassigned_total: Family<Labels, Counter>,
    pub(crate) windows_fired_total: Family<Labels, Counter>,
    pub(crate) panes_evicted_total: Family<Labels, Counter>,
    pub(crate) pending_windows: Family<Labels, Gauge>,
    pub(crate) timer_lag: Family<Labels, Histogram>,
}

impl WindowMetrics {
    fn new() -> Self {
        let metrics = Self {
            elements_total: Family::<Labels, Counter>::default(),
            dropped_total: Family::<Labels, Counter>::default(),
            late_reassigned_total: Family::<Labels, Counter>::default(),
            windows_fired_total: Family::<Labels, Counter>::default(),
            panes_evicted_total: Family::<Labels, Counter>::default(),
            pending_windows: Family::<Labels, Gauge>::default(),
            timer_lag: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(1.0, 2.0, 16))
            }),
        };

        let mut registry = global_registry().registry.lock();
        let window_registry = registry.sub_registry_with_prefix("window");
        window_registry.register(
            ELEMENTS_TOTAL,
            "Total number of elements folded into panes",
            metrics.elements_total.clone(),
        );
        window_registry.register(
            DROPPED_TOTAL,
            "Total number of elements dropped because they were stamped before the epoch",
            metrics.dropped_total.clone(),
        );
        window_registry.register(
            LATE_REASSIGNED_TOTAL,
            "Total number of elements stamped before the last deadline and moved to the open pane",
            metrics.late_reassigned_total.clone(),
        );
        window_registry.register(
            WINDOWS_FIRED_TOTAL,
            "Total number of windows fired",
            metrics.windows_fired_total.clone(),
        );
        window_registry.register(
            PANES_EVICTED_TOTAL,
            "Total number of panes evicted",
            metrics.panes_evicted_total.clone(),
        );
        window_registry.register(
            PENDING_WINDOWS,
            "Number of windows registered and not yet fired",
            metrics.pending_windows.clone(),
        );
        window_registry.register(
            TIMER_LAG,
            "Delay between a timer deadline and its delivery in milliseconds",
            metrics.timer_lag.clone(),
        );
        metrics
    }
}

static WINDOW_METRICS: OnceLock<WindowMetrics> = OnceLock::new();

pub(crate) fn window_metrics() -> &'static WindowMetrics {
    WINDOW_METRICS.get_or_init(WindowMetrics::new)
}

pub(crate) fn partition_labels(partition: u16) -> Labels {
    vec![(PARTITION_LABEL.to_string(), partition.to_string())]
}

/// Encodes every registered metric in the OpenMetrics text format.
pub fn encode_metrics() -> Result<String> {
    // make sure the window metrics are registered even before the first element
    window_metrics();
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    encode(&mut buffer, &registry).map_err(|e| Error::Metrics(format!("encoding metrics: {e}")))?;
    Ok(buffer)
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serves `/metrics` on the given address until the server fails.
pub async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    info!(?addr, "Starting metrics server");

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Failed to bind to {addr}: {e}")))?;

    axum::serve(listener, metrics_router())
        .await
        .map_err(|e| Error::Metrics(format!("Metrics server error: {e}")))?;

    Ok(())
}
