use axum::{
    Json, Router,
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use ferry_db::repositories::payment_repo::PaymentInput;
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiError, ApiResult, data};
use crate::handlers::{IdBody, IdsBody};
use crate::services::payment::{self, DRIVERS};

#[derive(Debug, Deserialize)]
pub struct FormQuery {
    pub payment: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/save", post(save))
        .route("/drop", post(drop_payment))
        .route("/show", post(show))
        .route("/sort", post(sort))
        .route("/getPaymentMethods", get(drivers))
        .route("/getPaymentForm", get(form))
}

async fn fetch(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.payment_service.list().await?))
}

async fn save(State(state): State<AppState>, Json(input): Json<PaymentInput>) -> ApiResult<impl IntoResponse> {
    state.payment_service.save(&input).await?;
    Ok(data(true))
}

async fn drop_payment(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.payment_service.delete(body.id).await?;
    Ok(data(true))
}

async fn show(State(state): State<AppState>, Json(body): Json<IdBody>) -> ApiResult<impl IntoResponse> {
    state.payment_service.toggle(body.id).await?;
    Ok(data(true))
}

async fn sort(State(state): State<AppState>, Json(body): Json<IdsBody>) -> ApiResult<impl IntoResponse> {
    state.payment_service.sort(&body.ids).await?;
    Ok(data(true))
}

async fn drivers() -> impl IntoResponse {
    data(DRIVERS)
}

async fn form(Query(query): Query<FormQuery>) -> ApiResult<impl IntoResponse> {
    let fields = payment::form_for(&query.payment)
        .ok_or_else(|| ApiError::BadRequest("Gateway does not exist".into()))?;
    Ok(data(fields))
}
