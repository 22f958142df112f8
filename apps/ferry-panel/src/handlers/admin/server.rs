use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use ferry_db::models::server::{ServerInput, ServerRuleInput};
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiResult, data};
use crate::handlers::{IdBody, IdsBody};

#[derive(Debug, Deserialize)]
pub struct ShowBody {
    pub id: i64,
    pub show: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/save", post(save))
        .route("/drop", post(drop_server))
        .route("/show", post(show))
        .route("/rule/fetch", get(rules))
        .route("/rule/save", post(save_rule))
        .route("/rule/drop", post(drop_rule))
        .route("/rule/sort", post(sort_rules))
}

// ==================== NODES ====================

async fn fetch(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let servers = state.server_service.list().await?;
    Ok(data(state.traffic_service.with_status(servers).await?))
}

async fn save(State(state): State<AppState>, Json(input): Json<ServerInput>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.server_service.save(&input).await?))
}

async fn drop_server(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.server_service.delete(body.id).await?;
    Ok(data(true))
}

async fn show(State(state): State<AppState>, Json(body): Json<ShowBody>) -> ApiResult<impl IntoResponse> {
    state.server_service.set_show(body.id, body.show).await?;
    Ok(data(true))
}

// ==================== RULES ====================

async fn rules(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.server_service.rules().await?))
}

async fn save_rule(State(state): State<AppState>, Json(input): Json<ServerRuleInput>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.server_service.save_rule(&input).await?))
}

async fn drop_rule(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.server_service.drop_rule(body.id).await?;
    Ok(data(true))
}

async fn sort_rules(State(state): State<AppState>, Json(body): Json<IdsBody>) -> ApiResult<impl IntoResponse> {
    state.server_service.sort_rules(&body.ids).await?;
    Ok(data(true))
}
