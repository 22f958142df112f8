use axum::{
    Router,
    extract::{Path, RawQuery, State},
    response::IntoResponse,
    routing::get,
};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::AppState;
use crate::error::{ApiError, ApiResult, data};
use crate::services::payment;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/comm/config", get(config))
        .route("/plan/fetch", get(plans))
        .route("/payment/notify/{method}/{uuid}", get(notify).post(notify))
}

async fn config(State(state): State<AppState>) -> impl IntoResponse {
    data(state.passport_service.guest_config())
}

async fn plans(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.plan_service.fetch_visible().await?))
}

/// Query parameters merged with a form-encoded body; body values win.
pub fn notify_params(query: Option<&str>, body: &str) -> HashMap<String, String> {
    let mut params: HashMap<String, String> = query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let trimmed = body.trim_start();
    if !trimmed.is_empty() && !trimmed.starts_with('{') {
        params.extend(url::form_urlencoded::parse(body.as_bytes()).into_owned());
    }
    params
}

async fn notify(
    State(state): State<AppState>,
    Path((method, uuid)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let gateway = state.payment_service.get_for_notify(&method, &uuid).await?;
    let adapter = payment::adapter_for(&gateway)?;
    let params = notify_params(query.as_deref(), &body);

    let Some(notice) = adapter.notify(&body, &params)? else {
        warn!("Rejected {} callback for payment {}", adapter.name(), gateway.id);
        return Err(ApiError::BadRequest("verify error".into()));
    };
    info!("{} callback for order {}", adapter.name(), notice.trade_no);
    state
        .order_service
        .payment_received(&notice.trade_no, &notice.callback_no)
        .await?;
    Ok(notice.custom_result.unwrap_or_else(|| "success".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_body_overrides_query() {
        let params = notify_params(Some("trade_no=1&sign=a"), "sign=b&money=1.00");
        assert_eq!(params["trade_no"], "1");
        assert_eq!(params["sign"], "b");
        assert_eq!(params["money"], "1.00");
    }

    #[test]
    fn json_body_is_left_to_the_driver() {
        let params = notify_params(None, r#"{"order_id":"1"}"#);
        assert!(params.is_empty());
    }
}
