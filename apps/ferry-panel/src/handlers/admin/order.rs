use axum::{
    Json, Router,
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use ferry_db::models::order::OrderStatus;
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiResult, data};
use crate::handlers::Paged;

#[derive(Debug, Deserialize)]
pub struct OrderFilter {
    pub user_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub trade_no: Option<String>,
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
pub struct TradeNoBody {
    pub trade_no: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/fetch", get(fetch))
        .route("/paid", post(paid))
        .route("/cancel", post(cancel))
}

async fn fetch(State(state): State<AppState>, Query(filter): Query<OrderFilter>) -> ApiResult<impl IntoResponse> {
    let (orders, total) = state
        .order_service
        .fetch_page(
            filter.user_id,
            filter.status,
            filter.trade_no.as_deref().filter(|t| !t.is_empty()),
            filter.current,
            filter.page_size,
        )
        .await?;
    Ok(Json(Paged { data: orders, total }))
}

async fn paid(State(state): State<AppState>, Json(body): Json<TradeNoBody>) -> ApiResult<impl IntoResponse> {
    state.order_service.admin_paid(&body.trade_no).await?;
    Ok(data(true))
}

async fn cancel(State(state): State<AppState>, Json(body): Json<TradeNoBody>) -> ApiResult<impl IntoResponse> {
    state.order_service.admin_cancel(&body.trade_no).await?;
    Ok(data(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_status_and_paging() {
        let f: OrderFilter = serde_urlencoded::from_str("status=pending&current=3&user_id=7").unwrap();
        assert_eq!(f.status, Some(OrderStatus::Pending));
        assert_eq!((f.current, f.page_size, f.user_id), (3, 10, Some(7)));
        assert!(f.trade_no.is_none());
    }
}
