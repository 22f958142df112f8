use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use ferry_db::repositories::plan_repo::{PlanFlag, PlanInput};
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiResult, data};
use crate::handlers::{IdBody, IdsBody};

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub id: i64,
    pub field: PlanFlag,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/save", post(save))
        .route("/drop", post(drop_plan))
        .route("/update", post(update))
        .route("/sort", post(sort))
}

async fn fetch(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.plan_service.list().await?))
}

async fn save(State(state): State<AppState>, Json(input): Json<PlanInput>) -> ApiResult<impl IntoResponse> {
    state.plan_service.save(&input).await?;
    Ok(data(true))
}

async fn drop_plan(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.plan_service.delete(body.id).await?;
    Ok(data(true))
}

async fn update(State(state): State<AppState>, Json(body): Json<ToggleBody>) -> ApiResult<impl IntoResponse> {
    state.plan_service.toggle(body.id, body.field).await?;
    Ok(data(true))
}

async fn sort(State(state): State<AppState>, Json(body): Json<IdsBody>) -> ApiResult<impl IntoResponse> {
    state.plan_service.sort(&body.ids).await?;
    Ok(data(true))
}
