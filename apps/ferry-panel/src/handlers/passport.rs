use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::net::SocketAddr;

use crate::AppState;
use crate::error::{ApiResult, data};
use crate::handlers::client_info;
use crate::services::passport_service::{RegisterInput, TokenLogin};

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailBody {
    pub email: String,
    pub redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForgetBody {
    pub email: String,
    pub email_code: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
    pub verify: Option<String>,
    pub redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InviteVisit {
    pub invite_code: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/token2Login", get(token_to_login))
        .route("/auth/forget", post(forget))
        .route("/auth/loginWithMailLink", post(login_with_mail_link))
        .route("/comm/sendEmailVerify", post(send_email_verify))
        .route("/comm/pv", post(invite_visit))
}

async fn register(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterInput>,
) -> ApiResult<impl IntoResponse> {
    let auth = state
        .passport_service
        .register(&body, client_info(&headers, peer))
        .await?;
    Ok(data(auth))
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<LoginBody>,
) -> ApiResult<impl IntoResponse> {
    let auth = state
        .passport_service
        .login(&body.email, &body.password, client_info(&headers, peer))
        .await?;
    Ok(data(auth))
}

async fn token_to_login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Response> {
    let result = state
        .passport_service
        .token_to_login(
            query.token.as_deref(),
            query.verify.as_deref(),
            query.redirect.as_deref(),
            client_info(&headers, peer),
        )
        .await?;
    Ok(match result {
        TokenLogin::Redirect(url) => Redirect::to(&url).into_response(),
        TokenLogin::Auth(auth) => data(auth).into_response(),
    })
}

async fn forget(State(state): State<AppState>, Json(body): Json<ForgetBody>) -> ApiResult<impl IntoResponse> {
    state
        .passport_service
        .forget(&body.email, &body.email_code, &body.password)
        .await?;
    Ok(data(true))
}

async fn login_with_mail_link(
    State(state): State<AppState>,
    Json(body): Json<EmailBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .passport_service
        .login_with_mail_link(&body.email, body.redirect.as_deref())
        .await?;
    Ok(data(true))
}

async fn send_email_verify(
    State(state): State<AppState>,
    Json(body): Json<EmailBody>,
) -> ApiResult<impl IntoResponse> {
    state.passport_service.send_email_verify(&body.email).await?;
    Ok(data(true))
}

async fn invite_visit(State(state): State<AppState>, Json(body): Json<InviteVisit>) -> ApiResult<impl IntoResponse> {
    state.passport_service.record_invite_visit(&body.invite_code).await?;
    Ok(data(true))
}
