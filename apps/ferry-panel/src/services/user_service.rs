use anyhow::Result;
use chrono::{DateTime, Utc};
use ferry_db::models::invite::{CommissionLog, InviteCode};
use ferry_db::models::plan::Plan;
use ferry_db::models::user::{AdminUserUpdate, User};
use ferry_db::repositories::invite_repo::InviteRepository;
use ferry_db::repositories::order_repo::OrderRepository;
use ferry_db::repositories::plan_repo::PlanRepository;
use ferry_db::repositories::stat_repo::StatRepository;
use ferry_db::repositories::user_repo::UserRepository;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

use crate::config::{CommissionConfig, RegisterConfig};
use crate::error::{ServiceError, not_found, rejected};
use crate::services::auth_service::{self, AuthService, SessionInfo};
use crate::services::subscription::SubscriptionService;
use crate::utils;

const MIN_PASSWORD_LEN: usize = 4;
const INVITE_CODE_LEN: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub email: String,
    pub transfer_enable: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub banned: bool,
    pub remind_expire: bool,
    pub remind_traffic: bool,
    pub expired_at: Option<DateTime<Utc>>,
    pub balance: i64,
    pub commission_balance: i64,
    pub plan_id: Option<i64>,
    pub discount: Option<i32>,
    pub commission_rate: Option<i32>,
    pub telegram_id: Option<i64>,
    pub uuid: String,
    pub avatar_url: String,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        Self {
            email: user.email.clone(),
            transfer_enable: user.transfer_enable,
            last_login_at: user.last_login_at,
            created_at: user.created_at,
            banned: user.banned,
            remind_expire: user.remind_expire,
            remind_traffic: user.remind_traffic,
            expired_at: user.expired_at,
            balance: user.balance,
            commission_balance: user.commission_balance,
            plan_id: user.plan_id,
            discount: user.discount,
            commission_rate: user.commission_rate,
            telegram_id: user.telegram_id,
            uuid: user.uuid.clone(),
            avatar_url: utils::gravatar_url(&user.email),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeInfo {
    pub plan_id: Option<i64>,
    pub token: String,
    pub expired_at: Option<DateTime<Utc>>,
    pub u: i64,
    pub d: i64,
    pub transfer_enable: i64,
    pub email: String,
    pub uuid: String,
    pub plan: Option<Plan>,
    pub subscribe_url: String,
    pub reset_day: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginState {
    pub is_login: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_admin: bool,
}

/// `[registered users, valid commission, pending commission, rate, available balance]`
pub type InviteStat = [i64; 5];

#[derive(Debug, Clone, Serialize)]
pub struct InviteOverview {
    pub codes: Vec<InviteCode>,
    pub stat: InviteStat,
}

#[derive(Clone)]
pub struct UserService {
    users: UserRepository,
    invites: InviteRepository,
    orders: OrderRepository,
    plans: PlanRepository,
    stats: StatRepository,
    auth: AuthService,
    subscription: SubscriptionService,
    register: RegisterConfig,
    commission: CommissionConfig,
}

impl UserService {
    pub fn new(
        pool: PgPool,
        auth: AuthService,
        subscription: SubscriptionService,
        register: RegisterConfig,
        commission: CommissionConfig,
    ) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            invites: InviteRepository::new(pool.clone()),
            orders: OrderRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            stats: StatRepository::new(pool),
            auth,
            subscription,
            register,
            commission,
        }
    }

    pub async fn get(&self, user_id: i64) -> Result<User> {
        self.users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| not_found("The user does not exist"))
    }

    /// Subscription token lookup.
    pub async fn get_by_token(&self, token: &str) -> Result<User> {
        match self.users.get_by_token(token).await? {
            Some(user) if !user.banned => Ok(user),
            _ => Err(ServiceError::Forbidden("Token is error".into()).into()),
        }
    }

    // ==================== SESSIONS ====================

    pub async fn sessions(&self, user_id: i64) -> Result<HashMap<String, SessionInfo>> {
        self.auth.sessions(user_id).await
    }

    pub async fn remove_session(&self, user_id: i64, session_id: &str) -> Result<bool> {
        self.auth.remove_session(user_id, session_id).await
    }

    pub async fn check_login(&self, user_id: i64) -> Result<LoginState> {
        let user = self.users.get_by_id(user_id).await?;
        Ok(LoginState {
            is_login: user.is_some(),
            is_admin: user.is_some_and(|u| u.is_admin),
        })
    }

    // ==================== PROFILE ====================

    pub async fn change_password(&self, user_id: i64, old_password: &str, new_password: &str) -> Result<()> {
        let user = self.get(user_id).await?;
        if !auth_service::verify_password(
            user.password_algo.as_deref(),
            user.password_salt.as_deref(),
            old_password,
            &user.password_hash,
        ) {
            return Err(rejected("The old password is wrong"));
        }
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(rejected("Password must be at least 4 characters"));
        }
        self.users
            .update_password(user.id, &auth_service::hash_password(new_password)?)
            .await?;
        info!("User {} changed their password", user.id);
        Ok(())
    }

    pub async fn info(&self, user_id: i64) -> Result<UserInfo> {
        Ok(UserInfo::from(&self.get(user_id).await?))
    }

    /// `[pending orders, open tickets, invited users]`
    pub async fn stat(&self, user_id: i64) -> Result<[i64; 3]> {
        Ok([
            self.stats.count_pending_orders(user_id).await?,
            self.stats.count_open_tickets(Some(user_id)).await?,
            self.users.count_invited(user_id).await?,
        ])
    }

    pub async fn subscribe(&self, user_id: i64) -> Result<SubscribeInfo> {
        let user = self.get(user_id).await?;
        self.subscribe_info(user).await
    }

    /// Public lookup by email and uuid.
    pub async fn subscribe_by_uuid(&self, email: &str, uuid: &str) -> Result<SubscribeInfo> {
        let user = self
            .users
            .get_by_email_and_uuid(email.trim(), uuid.trim())
            .await?
            .ok_or_else(|| not_found("The user does not exist"))?;
        self.subscribe_info(user).await
    }

    async fn subscribe_info(&self, user: User) -> Result<SubscribeInfo> {
        let plan = match user.plan_id {
            Some(id) => Some(
                self.plans
                    .get_by_id(id)
                    .await?
                    .ok_or_else(|| not_found("Subscription plan does not exist"))?,
            ),
            None => None,
        };
        let reset_day = self.subscription.reset_day(&user).await?;
        Ok(SubscribeInfo {
            plan_id: user.plan_id,
            subscribe_url: self.subscription.subscribe_url(&user.token),
            token: user.token,
            expired_at: user.expired_at,
            u: user.u,
            d: user.d,
            transfer_enable: user.transfer_enable,
            email: user.email,
            uuid: user.uuid,
            plan,
            reset_day,
        })
    }

    /// New uuid and token. Returns the new subscription link.
    pub async fn reset_security(&self, user_id: i64) -> Result<String> {
        let user = self.get(user_id).await?;
        let token = utils::guid();
        self.users
            .reset_security(user.id, &uuid::Uuid::new_v4().to_string(), &token)
            .await?;
        info!("User {} reset their subscription credentials", user.id);
        Ok(self.subscription.subscribe_url(&token))
    }

    pub async fn update_reminders(
        &self,
        user_id: i64,
        remind_expire: Option<bool>,
        remind_traffic: Option<bool>,
    ) -> Result<()> {
        self.get(user_id).await?;
        self.users
            .update_reminders(user_id, remind_expire, remind_traffic)
            .await
    }

    /// Moves commission into the spendable balance.
    pub async fn transfer(&self, user_id: i64, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(rejected("Transfer amount must be positive"));
        }
        self.get(user_id).await?;
        if !self.users.transfer_commission(user_id, amount).await? {
            return Err(rejected("Insufficient commission balance"));
        }
        info!("User {} transferred {} commission to balance", user_id, utils::format_cents(amount));
        Ok(())
    }

    // ==================== INVITE ====================

    pub async fn invite_save(&self, user_id: i64) -> Result<InviteCode> {
        let unused = self.invites.count_unused(user_id).await?;
        if unused >= self.register.invite_gen_limit {
            return Err(rejected("The maximum number of creations has been reached"));
        }
        self.invites
            .create_code(user_id, &utils::random_string(INVITE_CODE_LEN))
            .await
    }

    pub async fn invite_fetch(&self, user_id: i64) -> Result<InviteOverview> {
        let user = self.get(user_id).await?;
        let stat = [
            self.users.count_invited(user.id).await?,
            self.invites.total_earned(user.id).await?,
            self.orders.pending_commission_total(user.id).await?,
            invite_rate(&user, &self.commission),
            user.commission_balance,
        ];
        Ok(InviteOverview {
            codes: self.invites.list_codes(user.id).await?,
            stat,
        })
    }

    pub async fn invite_details(&self, user_id: i64, page: i64, page_size: i64) -> Result<(Vec<CommissionLog>, i64)> {
        self.invites
            .list_logs(user_id, page, page_size.clamp(10, 100))
            .await
    }

    // ==================== ADMIN ====================

    pub async fn fetch_page(&self, email: Option<&str>, page: i64, page_size: i64) -> Result<(Vec<User>, i64)> {
        self.users
            .fetch_page(email.filter(|e| !e.is_empty()), page, page_size.clamp(10, 100))
            .await
    }

    pub async fn admin_update(&self, id: i64, input: &AdminUserUpdate) -> Result<()> {
        let user = self.get(id).await?;
        if let Some(email) = &input.email
            && email != &user.email
            && self.users.email_exists(email).await?
        {
            return Err(rejected("Email is already in use"));
        }
        if let Some(plan_id) = input.plan_id
            && self.plans.get_by_id(plan_id).await?.is_none()
        {
            return Err(not_found("Subscription plan does not exist"));
        }
        if input.invite_user_id == Some(id) {
            return Err(rejected("A user cannot invite themselves"));
        }
        if !self.users.admin_update(id, input).await? {
            return Err(not_found("The user does not exist"));
        }
        if input.banned == Some(true) {
            self.auth.remove_all_sessions(id).await?;
        }
        info!("Admin updated user {}", id);
        Ok(())
    }
}

/// Percentage the user earns from invitees.
pub fn invite_rate(user: &User, config: &CommissionConfig) -> i64 {
    user.commission_rate
        .map(i64::from)
        .unwrap_or(config.invite_commission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_flag_is_omitted_for_regular_users() {
        let state = serde_json::to_value(LoginState { is_login: true, is_admin: false }).unwrap();
        assert_eq!(state, serde_json::json!({ "is_login": true }));

        let state = serde_json::to_value(LoginState { is_login: true, is_admin: true }).unwrap();
        assert_eq!(state["is_admin"], true);
    }

    #[test]
    fn invite_rate_prefers_personal_rate() {
        let config = CommissionConfig::default();
        let now = Utc::now();
        let mut user: User = serde_json::from_value(serde_json::json!({
            "id": 1, "email": "a@example.com", "password_hash": "", "password_algo": null,
            "password_salt": null, "uuid": "u", "token": "t", "invite_user_id": null,
            "telegram_id": null, "balance": 0, "commission_balance": 0, "commission_type": 0,
            "commission_rate": null, "discount": null, "plan_id": null, "group_id": null,
            "transfer_enable": 0, "u": 0, "d": 0, "speed_limit": null, "expired_at": null,
            "banned": false, "is_admin": false, "remind_expire": true, "remind_traffic": true,
            "has_triggered_invite_reward": false, "last_login_at": null,
            "traffic_updated_at": null, "created_at": now, "updated_at": now
        }))
        .unwrap();
        assert_eq!(invite_rate(&user, &config), 10);

        user.commission_rate = Some(25);
        assert_eq!(invite_rate(&user, &config), 25);
    }
}
