use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::config::SiteConfig;
use crate::error::{ApiError, ApiResult, data};
use crate::handlers::user_agent;
use crate::services::subscription::{SubscribeParams, subscribe_path, userinfo_header};

#[derive(Debug, Deserialize)]
pub struct UuidQuery {
    pub email: String,
    pub uuid: String,
}

/// Full-path routes; a configured `subscribe_path` replaces the default subscribe URL.
pub fn routes(site: &SiteConfig) -> Router<AppState> {
    Router::new()
        .route(&subscribe_path(site), get(subscribe))
        .route("/api/v1/client/getuuidSubscribe", get(uuid_subscribe))
}

pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SubscribeParams>,
) -> ApiResult<Response> {
    let token = params
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Token is required".into()))?;
    let user = state.user_service.get_by_token(token).await?;

    let ua = user_agent(&headers).unwrap_or_default();
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let rendered = state
        .subscription_service
        .subscribe(&user, &params, &ua, &host)
        .await?;

    let mut response = rendered.body.into_response();
    let out = response.headers_mut();
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static(rendered.content_type));
    if let Ok(info) = HeaderValue::from_str(&userinfo_header(&user)) {
        out.insert("subscription-userinfo", info);
    }
    if let Ok(disposition) = HeaderValue::from_str(&format!("attachment; filename={}", rendered.filename)) {
        out.insert(header::CONTENT_DISPOSITION, disposition);
    }
    out.insert("profile-update-interval", HeaderValue::from_static("24"));
    Ok(response)
}

async fn uuid_subscribe(State(state): State<AppState>, Query(query): Query<UuidQuery>) -> ApiResult<impl IntoResponse> {
    Ok(data(
        state
            .user_service
            .subscribe_by_uuid(&query.email, &query.uuid)
            .await?,
    ))
}
