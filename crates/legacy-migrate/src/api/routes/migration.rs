//! Migration control endpoints.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, AppState};
use crate::auth_removal::RollbackResult;
use crate::config::MigrationOptions;
use crate::history::{HistoryStatistics, MigrationRun, RunStatus};
use crate::orchestrator::ProgressView;
use crate::report::{LogLevelFilter, ReportFormat};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const DEFAULT_STATISTICS_DAYS: u32 = 30;

/// Migration routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/migration/start", post(start))
        .route("/api/migration/status", get(current_status))
        .route("/api/migration/progress", get(progress))
        .route("/api/migration/history", get(history))
        .route("/api/migration/statistics", get(statistics))
        .route("/api/migration/rollback/:backup_id", post(rollback))
        .route("/api/migration/:id", get(status))
        .route("/api/migration/:id/pause", post(pause))
        .route("/api/migration/:id/resume", post(resume))
        .route("/api/migration/:id/cancel", post(cancel))
        .route("/api/migration/:id/report", get(report))
        .route("/api/migration/:id/logs", get(logs))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub migration_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub migration_id: String,
    pub status: RunStatus,
    pub message: String,
}

/// The active run, or an idle marker.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum CurrentStatus {
    Active(Box<MigrationRun>),
    Idle { status: RunStatus },
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    pub format: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
}

/// Start a run. An empty body uses the configured default options.
async fn start(State(state): State<AppState>, body: Bytes) -> Result<Json<StartResponse>, ApiError> {
    let options: MigrationOptions = if body.iter().all(u8::is_ascii_whitespace) {
        state.orchestrator.default_options()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::bad_request(format!("invalid options: {}", e)))?
    };
    let migration_id = state.orchestrator.start(options).await?;
    Ok(Json(StartResponse { migration_id }))
}

async fn current_status(State(state): State<AppState>) -> Json<CurrentStatus> {
    Json(match state.orchestrator.current() {
        Some(run) => CurrentStatus::Active(Box::new(run)),
        None => CurrentStatus::Idle {
            status: RunStatus::NotStarted,
        },
    })
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MigrationRun>, ApiError> {
    Ok(Json(state.orchestrator.status(&id).await?))
}

async fn progress(State(state): State<AppState>) -> Result<Json<ProgressView>, ApiError> {
    state
        .orchestrator
        .progress()
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", "no active migration"))
}

async fn control_response(state: &AppState, id: String, message: &str) -> Result<Json<ControlResponse>, ApiError> {
    let run = state.orchestrator.status(&id).await?;
    Ok(Json(ControlResponse {
        migration_id: id,
        status: run.status,
        message: message.to_string(),
    }))
}

async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ControlResponse>, ApiError> {
    state.orchestrator.pause(&id).await?;
    control_response(&state, id, "pause requested").await
}

async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ControlResponse>, ApiError> {
    state.orchestrator.resume(&id).await?;
    control_response(&state, id, "resumed").await
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ControlResponse>, ApiError> {
    state.orchestrator.cancel(&id).await?;
    control_response(&state, id, "cancellation requested").await
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MigrationRun>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.orchestrator.history(limit).await?))
}

async fn statistics(
    State(state): State<AppState>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<HistoryStatistics>, ApiError> {
    let days = query.days.unwrap_or(DEFAULT_STATISTICS_DAYS);
    Ok(Json(state.orchestrator.statistics(days).await?))
}

async fn report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Response, ApiError> {
    let format: ReportFormat = query.format.as_deref().unwrap_or("json").parse()?;
    let report = state.orchestrator.report(&id, format).await?;
    let headers = [
        (header::CONTENT_TYPE, report.content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", report.file_name),
        ),
    ];
    Ok((headers, report.body).into_response())
}

async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let filter: LogLevelFilter = query.level.as_deref().unwrap_or("all").parse()?;
    let text = state.orchestrator.logs(&id, filter).await?;
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"migration-logs-{}.txt\"", id),
        ),
    ];
    Ok((headers, text).into_response())
}

/// Restore an auth removal backup. A backup that fails verification is
/// left untouched and answered with 409.
async fn rollback(
    State(state): State<AppState>,
    Path(backup_id): Path<String>,
) -> Result<(StatusCode, Json<RollbackResult>), ApiError> {
    let result = state.orchestrator.rollback(&backup_id).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(result)))
}
