use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::AppState;
use crate::auth::node_auth;
use crate::error::ApiResult;
use crate::services::traffic_service::TrafficReport;

#[derive(Debug, Deserialize)]
pub struct NodeQuery {
    pub node_id: i64,
    pub node_type: String,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/user", get(users))
        .route("/push", post(push))
        .layer(middleware::from_fn_with_state(state, node_auth))
}

/// Users of the node. Honours `If-None-Match` so idle nodes get a 304.
async fn users(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<NodeQuery>) -> ApiResult<Response> {
    let server = state.traffic_service.node(query.node_id, &query.node_type).await?;
    let users = state.traffic_service.users_for(&server).await?;
    let body = serde_json::to_string(&serde_json::json!({ "users": users }))
        .map_err(anyhow::Error::from)?;
    let etag = format!("\"{}\"", hex::encode(md5::compute(&body).0));

    let unchanged = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag);
    let mut response = if unchanged {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        ([(header::CONTENT_TYPE, "application/json")], body).into_response()
    };
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

async fn push(
    State(state): State<AppState>,
    Query(query): Query<NodeQuery>,
    Json(report): Json<TrafficReport>,
) -> ApiResult<impl IntoResponse> {
    let server = state.traffic_service.node(query.node_id, &query.node_type).await?;
    state.traffic_service.push(&server, &report).await?;
    Ok(Json(serde_json::json!({ "data": true })))
}
