//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Inbound frames that decoded successfully (counter).
pub const WS_FRAMES_RECEIVED_TOTAL: &str = "ws_frames_received_total";
/// Inbound frames that failed to decode (counter).
pub const WS_FRAMES_REJECTED_TOTAL: &str = "ws_frames_rejected_total";
/// Inbound frames dropped on a full dispatch queue (counter).
pub const WS_INBOUND_DROPS_TOTAL: &str = "ws_inbound_drops_total";
/// Outbound frames dropped on a full or closed queue (counter).
pub const WS_SEND_DROPS_TOTAL: &str = "ws_send_drops_total";
/// Chain runs that ended without reaching the end (counter).
pub const MIDDLEWARE_HALTS_TOTAL: &str = "middleware_halts_total";
/// Chain runs ended by an error or panic (counter).
pub const MIDDLEWARE_FAILURES_TOTAL: &str = "middleware_failures_total";
/// Rooms currently registered (gauge).
pub const ROOMS_ACTIVE: &str = "rooms_active";
