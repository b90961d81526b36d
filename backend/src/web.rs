use crate::error::RejectReason;
use crate::state::AppState;
use crate::stats::StatsAggregator;
use crate::telemetry_task::get_current_timestamp_ms;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use basestation_shared::{
    BatteryMsg, Button, ButtonEvent, DeviceCommand, LinkStatusMsg, PodState, PositionMsg,
    StateMsg, TOTAL_COURSE_DISTANCE_M, TelemetryStats,
};
use std::sync::Arc;
use tracing::warn;

/// Public router constructor
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/command", post(send_command))
        .route("/api/button", post(press_button))
        .route("/api/state", get(get_state))
        .route("/api/battery", get(get_battery))
        .route("/api/position", get(get_position))
        .route("/api/stats", get(get_stats))
        .route("/api/link", get(get_link))
        .with_state(state)
}

impl IntoResponse for RejectReason {
    fn into_response(self) -> Response {
        let status = match self {
            RejectReason::InvalidOpcode(_) | RejectReason::OutOfRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            RejectReason::InvalidTransition { .. } => StatusCode::CONFLICT,
            RejectReason::QueueOverflow { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        warn!(%self, "command rejected");
        (status, self.to_string()).into_response()
    }
}

async fn send_command(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<DeviceCommand>,
) -> Result<StatusCode, RejectReason> {
    state.submit_command(cmd.command, cmd.value)?;
    Ok(StatusCode::OK)
}

async fn press_button(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ButtonEvent>,
) -> Result<StatusCode, RejectReason> {
    state.press_button(Button::from_name(&event.button))?;
    Ok(StatusCode::OK)
}

// `null` until the pod has reported anything.

async fn get_state(State(state): State<Arc<AppState>>) -> Json<Option<StateMsg>> {
    let reading = state.store.latest_state(get_current_timestamp_ms());
    Json(reading.map(|r| StateMsg {
        parsed: PodState::parse(&r.frame.state),
        state: r.frame.state.to_string(),
        errors: r
            .frame
            .error_flags
            .names()
            .into_iter()
            .map(String::from)
            .collect(),
        timestamp_ms: r.frame.timestamp_ms,
        stale: r.stale,
    }))
}

async fn get_battery(State(state): State<Arc<AppState>>) -> Json<Option<BatteryMsg>> {
    let reading = state.store.latest_battery(get_current_timestamp_ms());
    Json(reading.map(|r| BatteryMsg {
        value: r.frame.pack_soc,
        voltage: r.frame.pack_voltage,
        current: r.frame.pack_current,
        timestamp_ms: r.frame.timestamp_ms,
        stale: r.stale,
    }))
}

async fn get_position(State(state): State<Arc<AppState>>) -> Json<Option<PositionMsg>> {
    let reading = state.store.latest_position(get_current_timestamp_ms());
    Json(reading.map(|r| PositionMsg {
        current_distance: r.frame.position,
        total_distance: TOTAL_COURSE_DISTANCE_M,
        velocity: r.frame.velocity,
        timestamp_ms: r.frame.timestamp_ms,
        stale: r.stale,
    }))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<TelemetryStats> {
    Json(StatsAggregator::from_store(&state.store))
}

async fn get_link(State(state): State<Arc<AppState>>) -> Json<LinkStatusMsg> {
    Json(state.link_status_msg())
}
