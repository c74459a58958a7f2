//! HORNET: Prometheus Metrics
//!
//! Installs the recorder behind the `metrics` facade and renders the
//! exposition text at `GET /metrics`.

use axum::extract::State;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state::AppState;

/// Install the process-wide recorder. Returns `None` when a recorder is
/// already installed (tests install at most one per process).
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder not installed");
            None
        }
    }
}

/// `GET /metrics`
pub async fn render(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
