use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{get, post},
};
use ferry_db::models::coupon::CouponInput;
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiResult, data};
use crate::handlers::IdBody;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub id: Option<i64>,
    #[serde(flatten)]
    pub coupon: CouponInput,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/generate", post(generate))
        .route("/drop", post(drop_coupon))
        .route("/show", post(show))
}

async fn fetch(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.coupon_service.list().await?))
}

async fn generate(State(state): State<AppState>, Json(body): Json<GenerateBody>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.coupon_service.generate(body.id, &body.coupon).await?))
}

async fn drop_coupon(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.coupon_service.delete(body.id).await?;
    Ok(data(true))
}

async fn show(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.coupon_service.toggle_show(body.id).await?;
    Ok(data(true))
}
