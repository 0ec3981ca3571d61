use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::db::CycleRun;
use crate::domain::{CycleId, CycleReport, SettlementRecord};
use crate::error::AppError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleDetail {
    pub cycle_id: CycleId,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<CycleRun>,
    pub records: Vec<SettlementRecord>,
}

fn parse_cycle_id(raw: &str) -> Result<CycleId, AppError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|_| CycleId::new(raw))
        .map_err(|_| AppError::BadRequest(format!("cycle id must be YYYY-MM-DD, got {}", raw)))
}

pub async fn run_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CycleReport>, AppError> {
    let cycle = parse_cycle_id(&cycle_id)?;
    // Detached from the request: a client that disconnects does not abort the run
    // half way and leave it marked RUNNING.
    let orchestrator = state.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.run_cycle(&cycle).await });
    let report = run
        .await
        .map_err(|e| AppError::Internal(format!("cycle run task failed: {}", e)))??;
    Ok(Json(report))
}

pub async fn get_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CycleDetail>, AppError> {
    let cycle = parse_cycle_id(&cycle_id)?;
    let run = state.repo.get_cycle_run(&cycle).await?;
    let records = state.repo.query_settlement_records(&cycle).await?;
    let running = state.orchestrator.is_running(&cycle);

    if run.is_none() && records.is_empty() && !running {
        return Err(AppError::NotFound(format!("cycle {}", cycle)));
    }

    Ok(Json(CycleDetail {
        cycle_id: cycle,
        running,
        run,
        records,
    }))
}

pub async fn cancel_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let cycle = parse_cycle_id(&cycle_id)?;
    state.orchestrator.cancel(&cycle)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"cycleId": cycle, "status": "cancelling"})),
    ))
}
