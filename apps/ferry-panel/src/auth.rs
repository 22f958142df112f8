use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use ferry_db::models::user::User;
use serde::Deserialize;

use crate::AppState;
use crate::error::{ApiError, ServiceError};

/// The signed-in user, inserted by [`user_auth`] and [`admin_auth`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

/// Accepts `Authorization: Bearer <jwt>`, a bare `Authorization: <jwt>`,
/// or an `auth_data` query parameter.
pub fn bearer_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "auth_data")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// A session whose user row is gone counts as signed out.
fn session_user(result: anyhow::Result<User>) -> Result<User, ApiError> {
    match result {
        Ok(user) => Ok(user),
        Err(e) if matches!(e.downcast_ref::<ServiceError>(), Some(ServiceError::NotFound(_))) => {
            Err(ServiceError::Unauthorized.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn resolve_user(state: &AppState, token: Option<String>) -> Result<User, ApiError> {
    let token = token.ok_or(ServiceError::Unauthorized)?;
    let claims = state
        .auth_service
        .verify(&token)
        .await?
        .ok_or(ServiceError::Unauthorized)?;
    let user = session_user(state.user_service.get(claims.id).await)?;
    if user.banned {
        return Err(ServiceError::Forbidden("Your account has been suspended".into()).into());
    }
    Ok(user)
}

pub async fn user_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = bearer_token(req.headers(), req.uri().query());
    match resolve_user(&state, token).await {
        Ok(user) => {
            req.extensions_mut().insert(CurrentUser(user));
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

pub async fn admin_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = bearer_token(req.headers(), req.uri().query());
    match resolve_user(&state, token).await {
        Ok(user) if user.is_admin => {
            req.extensions_mut().insert(CurrentUser(user));
            next.run(req).await
        }
        Ok(_) => ApiError::from(ServiceError::Forbidden("Administrator access required".into())).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct NodeQuery {
    token: Option<String>,
}

/// Guards the UniProxy API with the shared node token.
pub async fn node_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let token = req
        .uri()
        .query()
        .and_then(|q| serde_urlencoded::from_str::<NodeQuery>(q).ok())
        .and_then(|q| q.token)
        .unwrap_or_default();
    if !state.traffic_service.verify_token(&token) {
        tracing::warn!("Rejected node request with an invalid token");
        return ApiError::from(ServiceError::Forbidden("Token is error".into())).into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn is_send<T: Send>(_: &T) {}

    #[allow(dead_code)]
    fn middleware_futures_are_send(state: AppState, a: Request, b: Request, next_a: Next, next_b: Next) {
        is_send(&user_auth(State(state.clone()), a, next_a));
        is_send(&admin_auth(State(state), b, next_b));
    }

    #[test]
    fn token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers, Some("auth_data=abc&x=1")), Some("abc".into()));
        assert_eq!(bearer_token(&headers, Some("x=1")), None);
        assert_eq!(bearer_token(&headers, None), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer jwt.value"));
        assert_eq!(bearer_token(&headers, Some("auth_data=abc")), Some("jwt.value".into()));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("raw.jwt"));
        assert_eq!(bearer_token(&headers, None), Some("raw.jwt".into()));
    }

    #[test]
    fn missing_user_is_unauthorized_but_db_errors_are_not() {
        let err = session_user(Err(crate::error::not_found("The user does not exist"))).unwrap_err();
        assert!(matches!(
            &err,
            ApiError::Internal(e) if matches!(e.downcast_ref::<ServiceError>(), Some(ServiceError::Unauthorized))
        ));

        let err = session_user(Err(anyhow::anyhow!("pool timed out"))).unwrap_err();
        assert!(matches!(&err, ApiError::Internal(e) if e.downcast_ref::<ServiceError>().is_none()));
    }
}
