// HTTP request handlers
use crate::application::controller::{DeviceConfig, StartTest, StatusReport};
use crate::application::cycle_executor::CycleStatus;
use crate::application::error::ControllerError;
use crate::domain::cycle::TestCycleDefinition;
use crate::domain::telemetry::LoggedDataPoint;
use crate::infrastructure::http_response::success;
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

type ApiResult<T> = Result<Json<T>, ControllerError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub current: f64,
    pub cutoff: f64,
    #[serde(default)]
    pub max_time: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataResponse {
    pub data_points: Vec<LoggedDataPoint>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub path: Option<PathBuf>,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.controller.status().await)
}

pub async fn start_test(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Value> {
    state
        .controller
        .start_test(StartTest {
            current: request.current,
            cutoff_voltage: request.cutoff,
            max_time: request.max_time,
        })
        .await?;
    Ok(success("Test started"))
}

pub async fn stop_test(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    state.controller.stop_test().await?;
    Ok(success("Test stopped"))
}

pub async fn get_data(State(state): State<Arc<AppState>>) -> Json<DataResponse> {
    let data_points = state.controller.data_points().await;
    Json(DataResponse {
        count: data_points.len(),
        data_points,
    })
}

pub async fn reset_counters(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    state.controller.reset_counters().await?;
    Ok(success("Counters reset"))
}

pub async fn heartbeat(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.controller.heartbeat().await;
    success("Heartbeat received")
}

pub async fn reconnect(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    state.controller.reconnect().await?;
    Ok(success("Reconnected"))
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> ApiResult<DeviceConfig> {
    Ok(Json(state.controller.device_config().await?))
}

pub async fn list_cycles(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "cycles": state.controller.list_cycles() }))
}

pub async fn cycle_info(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<TestCycleDefinition> {
    Ok(Json(state.controller.cycle_info(&name)?))
}

pub async fn run_cycle(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Value> {
    state.controller.spawn_cycle(&name).await?;
    Ok(success(format!("Started test cycle: {}", name)))
}

pub async fn abort_cycle(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    state.controller.abort_cycle().await?;
    Ok(success("Test cycle aborted"))
}

pub async fn cycle_status(State(state): State<Arc<AppState>>) -> Json<CycleStatus> {
    Json(state.controller.cycle_status().await)
}

pub async fn export_cycle_data(
    State(state): State<Arc<AppState>>,
    request: Option<Json<ExportRequest>>,
) -> ApiResult<Value> {
    let target = request.and_then(|Json(body)| body.path);
    let path = state.controller.export_cycle_data(target).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Data exported",
        "path": path.display().to_string(),
    })))
}
