//! Process-wide tracing subscriber and Prometheus recorder.

use std::{env, net::SocketAddr, sync::Arc};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

const DEFAULT_LOG_FILTER: &str = "info";

const COUNTERS: &[(&str, &str)] = &[
    ("api_auth_requests_total", "Register and login calls by outcome"),
    (
        "api_account_requests_total",
        "Balance, key rotation and 2FA calls by endpoint and outcome",
    ),
    ("api_address_requests_total", "Payment address requests by outcome"),
    ("api_convert_requests_total", "Conversion calls by outcome"),
    (
        "billing_usage_applied_total",
        "Successful usage charges written to user records",
    ),
    (
        "store_conflicts_total",
        "Conditional writes that lost to a concurrent writer",
    ),
];

static TRACING_READY: OnceCell<()> = OnceCell::new();
static RECORDER: OnceCell<Arc<PrometheusHandle>> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    log_filter: String,
    metrics_address: Option<String>,
}

impl TelemetryConfig {
    pub fn new(log_filter: impl Into<String>, metrics_address: Option<String>) -> Self {
        Self {
            log_filter: log_filter.into(),
            metrics_address,
        }
    }

    /// Reads `<PREFIX>_LOG_FILTER` and `<PREFIX>_METRICS_ADDRESS`. Both are
    /// optional; blank values count as unset.
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let prefix = prefix.trim().to_ascii_uppercase();

        Self::new(
            non_blank_var(&format!("{prefix}_LOG_FILTER"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            non_blank_var(&format!("{prefix}_METRICS_ADDRESS")),
        )
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }
}

fn non_blank_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Handle to the installed recorder; cloned into every worker.
#[derive(Clone)]
pub struct TelemetryGuard {
    recorder: Arc<PrometheusHandle>,
}

impl TelemetryGuard {
    /// Prometheus text exposition of every registered metric.
    pub fn render_metrics(&self) -> String {
        self.recorder.render()
    }
}

/// Installs tracing and metrics once per process. Repeated calls return a
/// guard over the recorder installed by the first call.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    install_tracing(config.log_filter())?;
    let recorder = RECORDER
        .get_or_try_init(|| install_recorder(config.metrics_address()))?
        .clone();
    Ok(TelemetryGuard { recorder })
}

fn install_tracing(filter: &str) -> Result<(), TelemetryError> {
    if TRACING_READY.get().is_some() {
        return Ok(());
    }
    let filter =
        EnvFilter::try_new(filter).map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;

    if TRACING_READY.set(()).is_ok() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    }
    Ok(())
}

fn install_recorder(listen: Option<&str>) -> Result<Arc<PrometheusHandle>, TelemetryError> {
    let mut builder = PrometheusBuilder::new();
    if let Some(raw) = listen {
        let socket: SocketAddr = raw.parse().map_err(|err: std::net::AddrParseError| {
            TelemetryError::InvalidMetricsAddress(raw.to_string(), err.to_string())
        })?;
        builder = builder.with_http_listener(socket);
    }

    let handle = builder
        .install_recorder()
        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
    describe_metrics();
    Ok(Arc::new(handle))
}

fn describe_metrics() {
    for (name, help) in COUNTERS {
        describe_counter!(*name, *help);
    }
    describe_histogram!("billing_cost", "Cost billed per conversion");
    describe_gauge!("address_pool_remaining", "Unassigned addresses left per network");
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
