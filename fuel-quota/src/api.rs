use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use fuel_plans::{LimitValue, Plan, PlanId, ResourceKey};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::engine::{LimitCheck, QuotaEngine};
use crate::error::QuotaError;
use crate::keys::{MonthBucket, StationId};
use crate::stations::StationDirectory;

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    pub engine: QuotaEngine,
    pub stations: Arc<dyn StationDirectory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResponse {
    pub station_id: StationId,
    pub resource: ResourceKey,
    pub month: MonthBucket,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureResponse {
    pub station_id: StationId,
    pub resource: ResourceKey,
    pub plan: PlanId,
    pub limit: LimitValue,
    pub unlocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub month: MonthBucket,
    pub count: u64,
}

/// Optional overrides accepted by the read endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageQuery {
    /// Historical month, `YYYY-MM`
    month: Option<String>,
    /// Plan to evaluate against instead of the station's assignment
    plan: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/plans", get(list_plans))
        .route("/stations/:station_id/usage", get(usage_snapshot))
        .route("/stations/:station_id/usage/:resource", post(record_usage).get(check_limit))
        .route("/stations/:station_id/usage/:resource/history", get(usage_history))
        .route("/stations/:station_id/features/:resource", get(feature_unlocked))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Usage quota API listening on {}", listener.local_addr()?);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: option_env!("CARGO_PKG_VERSION").map(String::from),
    })
}

async fn list_plans(State(state): State<AppState>) -> Json<Vec<Plan>> {
    Json(state.engine.registry().plans().cloned().collect())
}

async fn record_usage(
    State(state): State<AppState>,
    Path((station_id, resource)): Path<(String, String)>,
) -> Result<Json<RecordResponse>, QuotaError> {
    let station = station_id.parse::<StationId>()?;
    let resource = resource.parse::<ResourceKey>()?;

    let (month, count) = state.engine.record_usage_stamped(station, &resource).await?;

    Ok(Json(RecordResponse {
        station_id: station,
        resource,
        month,
        count,
    }))
}

async fn check_limit(
    State(state): State<AppState>,
    Path((station_id, resource)): Path<(String, String)>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<LimitCheck>, QuotaError> {
    let station = station_id.parse::<StationId>()?;
    let resource = resource.parse::<ResourceKey>()?;
    let month = parse_month(query.month.as_deref())?;
    let plan = resolve_plan(&state, station, query.plan.as_deref())?;

    Ok(Json(state.engine.check_limit(station, &resource, &plan, month).await?))
}

async fn usage_snapshot(
    State(state): State<AppState>,
    Path(station_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Vec<LimitCheck>>, QuotaError> {
    let station = station_id.parse::<StationId>()?;
    let month = parse_month(query.month.as_deref())?;
    let plan = resolve_plan(&state, station, query.plan.as_deref())?;

    Ok(Json(state.engine.usage_snapshot(station, &plan, month).await?))
}

async fn usage_history(
    State(state): State<AppState>,
    Path((station_id, resource)): Path<(String, String)>,
) -> Result<Json<Vec<HistoryEntry>>, QuotaError> {
    let station = station_id.parse::<StationId>()?;
    let resource = resource.parse::<ResourceKey>()?;

    let history = state.engine.usage_history(station, &resource).await?;
    Ok(Json(
        history
            .into_iter()
            .map(|(month, count)| HistoryEntry { month, count })
            .collect(),
    ))
}

async fn feature_unlocked(
    State(state): State<AppState>,
    Path((station_id, resource)): Path<(String, String)>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<FeatureResponse>, QuotaError> {
    let station = station_id.parse::<StationId>()?;
    let resource = resource.parse::<ResourceKey>()?;
    let plan = resolve_plan(&state, station, query.plan.as_deref())?;

    let unlocked = state.engine.is_feature_unlocked(station, &plan, &resource)?;
    let limit = state.engine.registry().resolve_limit(&plan, &resource)?;

    Ok(Json(FeatureResponse {
        station_id: station,
        resource,
        plan,
        limit,
        unlocked,
    }))
}

fn parse_month(raw: Option<&str>) -> Result<Option<MonthBucket>, QuotaError> {
    raw.map(str::parse::<MonthBucket>).transpose()
}

fn resolve_plan(state: &AppState, station: StationId, explicit: Option<&str>) -> Result<PlanId, QuotaError> {
    match explicit {
        Some(raw) => Ok(raw.parse::<PlanId>()?),
        None => state.stations.plan_for(station),
    }
}
