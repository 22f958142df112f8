use axum::{
    Json, Router,
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use ferry_db::models::user::AdminUserUpdate;
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiResult, data};
use crate::handlers::Paged;

#[derive(Debug, Deserialize)]
pub struct UserFilter {
    pub email: Option<String>,
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
pub struct UpdateBody {
    pub id: i64,
    #[serde(flatten)]
    pub update: AdminUserUpdate,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/update", post(update))
}

async fn fetch(State(state): State<AppState>, Query(filter): Query<UserFilter>) -> ApiResult<impl IntoResponse> {
    let (users, total) = state
        .user_service
        .fetch_page(
            filter.email.as_deref().filter(|e| !e.is_empty()),
            filter.current,
            filter.page_size,
        )
        .await?;
    Ok(Json(Paged { data: users, total }))
}

async fn update(State(state): State<AppState>, Json(body): Json<UpdateBody>) -> ApiResult<impl IntoResponse> {
    state.user_service.admin_update(body.id, &body.update).await?;
    Ok(data(true))
}
