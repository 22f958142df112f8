use axum::{
    Json, Router,
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiError, ApiResult, data};
use crate::handlers::Paged;
use crate::services::stat_service::ChartGroup;

#[derive(Debug, Deserialize)]
pub struct StatUserQuery {
    pub user_id: i64,
    #[serde(default = "first_page")]
    pub current: i64,
    #[serde(default = "page_size")]
    pub page_size: i64,
}

fn first_page() -> i64 {
    1
}

fn page_size() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ColumnQuery {
    #[serde(rename = "type")]
    pub group: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/getOverride", get(overview))
        .route("/getOrder", get(order))
        .route("/getServerLastRank", get(server_last_rank))
        .route("/getStatUser", get(stat_user))
        .route("/getOnlinePresence", get(online_presence))
        .route("/getNodalFlow", get(nodal_flow))
        .route("/getFinances", get(finances))
        .route("/getColumnChart", get(column_chart))
}

async fn overview(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.stat_service.overview().await?))
}

async fn order(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.stat_service.order_series().await?))
}

async fn server_last_rank(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.stat_service.server_last_rank().await?))
}

async fn stat_user(State(state): State<AppState>, Query(query): Query<StatUserQuery>) -> ApiResult<impl IntoResponse> {
    let (rows, total) = state
        .stat_service
        .stat_user(query.user_id, query.current, query.page_size)
        .await?;
    Ok(Json(Paged { data: rows, total }))
}

async fn online_presence(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.stat_service.online_presence().await?))
}

async fn nodal_flow(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.stat_service.nodal_flow().await?))
}

async fn finances(State(state): State<AppState>, Query(range): Query<RangeQuery>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.stat_service.finances(range.start, range.end).await?))
}

async fn column_chart(State(state): State<AppState>, Query(query): Query<ColumnQuery>) -> ApiResult<impl IntoResponse> {
    let group: ChartGroup = query.group.parse()?;
    if query.end < query.start {
        return Err(ApiError::BadRequest("End date is before start date".into()));
    }
    Ok(data(state.stat_service.column_chart(group, query.start, query.end).await?))
}
