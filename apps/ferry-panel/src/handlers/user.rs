use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use ferry_db::models::order::OrderStatus;
use ferry_db::models::plan::Period;
use serde::Deserialize;

use crate::AppState;
use crate::auth::{CurrentUser, user_auth};
use crate::error::{ApiError, ApiResult, data};
use crate::handlers::{PageQuery, Paged};

#[derive(Debug, Deserialize)]
pub struct SessionBody {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordBody {
    pub old_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ReminderBody {
    pub remind_expire: Option<bool>,
    pub remind_traffic: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    pub transfer_amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
    pub redeem_code: String,
}

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    pub redirect: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderQuery {
    pub status: Option<OrderStatus>,
}

#[derive(Debug, Deserialize)]
pub struct TradeNoQuery {
    pub trade_no: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveOrderBody {
    pub plan_id: i64,
    pub period: String,
    pub coupon_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutBody {
    pub trade_no: String,
    pub method: i64,
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CouponCheckBody {
    pub code: String,
    pub plan_id: i64,
    pub period: Option<String>,
}

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/info", get(info))
        .route("/getStat", get(stat))
        .route("/getSubscribe", get(subscribe))
        .route("/checkLogin", get(check_login))
        .route("/getActiveSession", get(sessions))
        .route("/removeActiveSession", post(remove_session))
        .route("/changePassword", post(change_password))
        .route("/resetSecurity", get(reset_security))
        .route("/update", post(update))
        .route("/transfer", post(transfer))
        .route("/redeemplan", post(redeem_plan))
        .route("/getQuickLoginUrl", post(quick_login_url))
        .route("/order/fetch", get(order_fetch))
        .route("/order/detail", get(order_detail))
        .route("/order/check", get(order_check))
        .route("/order/getPaymentMethod", get(payment_methods))
        .route("/order/save", post(order_save))
        .route("/order/checkout", post(order_checkout))
        .route("/order/cancel", post(order_cancel))
        .route("/plan/fetch", get(plan_fetch))
        .route("/invite/save", get(invite_save))
        .route("/invite/fetch", get(invite_fetch))
        .route("/invite/details", get(invite_details))
        .route("/coupon/check", post(coupon_check))
        .route("/server/fetch", get(server_fetch))
        .layer(middleware::from_fn_with_state(state, user_auth))
}

// ==================== ACCOUNT ====================

async fn info(State(state): State<AppState>, Extension(CurrentUser(user)): Extension<CurrentUser>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.info(user.id).await?))
}

async fn stat(State(state): State<AppState>, Extension(CurrentUser(user)): Extension<CurrentUser>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.stat(user.id).await?))
}

async fn subscribe(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.subscribe(user.id).await?))
}

async fn check_login(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.check_login(user.id).await?))
}

async fn sessions(State(state): State<AppState>, Extension(CurrentUser(user)): Extension<CurrentUser>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.sessions(user.id).await?))
}

async fn remove_session(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<SessionBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.remove_session(user.id, &body.session_id).await?))
}

async fn change_password(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<ChangePasswordBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .user_service
        .change_password(user.id, &body.old_password, &body.new_password)
        .await?;
    Ok(data(true))
}

async fn reset_security(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.reset_security(user.id).await?))
}

async fn update(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<ReminderBody>,
) -> ApiResult<impl IntoResponse> {
    state
        .user_service
        .update_reminders(user.id, body.remind_expire, body.remind_traffic)
        .await?;
    Ok(data(true))
}

async fn transfer(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<TransferBody>,
) -> ApiResult<impl IntoResponse> {
    state.user_service.transfer(user.id, body.transfer_amount).await?;
    Ok(data(true))
}

async fn redeem_plan(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<RedeemBody>,
) -> ApiResult<impl IntoResponse> {
    let order = state.order_service.redeem(user.id, body.redeem_code.trim()).await?;
    Ok(data(order.trade_no))
}

async fn quick_login_url(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<RedirectQuery>,
) -> ApiResult<impl IntoResponse> {
    let url = state
        .passport_service
        .quick_login_url(user.id, body.redirect.as_deref())
        .await?;
    Ok(data(url))
}

// ==================== ORDER ====================

async fn order_fetch(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<OrderQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.order_service.fetch(user.id, query.status).await?))
}

async fn order_detail(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<TradeNoQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.order_service.detail(user.id, &query.trade_no).await?))
}

async fn order_check(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<TradeNoQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.order_service.check(user.id, &query.trade_no).await?))
}

async fn payment_methods(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(data(state.payment_service.methods().await?))
}

async fn order_save(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<SaveOrderBody>,
) -> ApiResult<impl IntoResponse> {
    let order = state
        .order_service
        .save(user.id, body.plan_id, &body.period, body.coupon_code.as_deref().filter(|c| !c.is_empty()))
        .await?;
    Ok(data(order.trade_no))
}

async fn order_checkout(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<CheckoutBody>,
) -> ApiResult<impl IntoResponse> {
    let result = state
        .order_service
        .checkout(user.id, &body.trade_no, body.method)
        .await?;
    Ok(Json(serde_json::json!({ "type": result.kind, "data": result.data })))
}

async fn order_cancel(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<TradeNoQuery>,
) -> ApiResult<impl IntoResponse> {
    state.order_service.cancel(user.id, &body.trade_no).await?;
    Ok(data(true))
}

// ==================== CATALOG ====================

async fn plan_fetch(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(match query.id {
        Some(id) => data(state.plan_service.fetch_for_user(id, &user).await?),
        None => data(state.plan_service.fetch_visible().await?),
    })
}

async fn coupon_check(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(body): Json<CouponCheckBody>,
) -> ApiResult<impl IntoResponse> {
    let period = body
        .period
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<Period>())
        .transpose()
        .map_err(|_| ApiError::BadRequest("Wrong plan period".into()))?;
    let coupon = state
        .coupon_service
        .check(body.code.trim(), body.plan_id, period, user.id)
        .await?;
    Ok(data(coupon))
}

async fn server_fetch(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    if !user.is_available_at(Utc::now()) {
        return Ok(data(Vec::<()>::new()));
    }
    let servers = state.server_service.available_for(&user).await?;
    Ok(data(state.traffic_service.with_status(servers).await?))
}

// ==================== INVITE ====================

async fn invite_save(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    state.user_service.invite_save(user.id).await?;
    Ok(data(true))
}

async fn invite_fetch(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<impl IntoResponse> {
    Ok(data(state.user_service.invite_fetch(user.id).await?))
}

async fn invite_details(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let (logs, total) = state
        .user_service
        .invite_details(user.id, page.current, page.page_size)
        .await?;
    Ok(Json(Paged { data: logs, total }))
}
