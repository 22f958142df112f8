use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use ferry_db::models::invite::InviteCode;
use ferry_db::models::user::{NewUser, User};
use ferry_db::repositories::invite_repo::InviteRepository;
use ferry_db::repositories::plan_repo::PlanRepository;
use ferry_db::repositories::user_repo::UserRepository;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use crate::config::{RegisterConfig, SiteConfig};
use crate::error::{ServiceError, not_found, rejected, throttled};
use crate::services::auth_service::{self, AuthData, AuthService};
use crate::services::cache_service::{CacheService, keys};
use crate::services::mail_service::{Mail, MailService};
use crate::services::order_service::OrderService;
use crate::utils;

const MIN_PASSWORD_LEN: usize = 4;
const VERIFY_CODE_TTL: u64 = 300;
const VERIFY_RESEND_SECS: u64 = 60;
const MAIL_LINK_TTL: u64 = 300;
const QUICK_LOGIN_TTL: u64 = 60;
const FORGET_LIMIT: i64 = 3;
const FORGET_WINDOW: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub invite_code: Option<String>,
    pub email_code: Option<String>,
    pub redeem_code: Option<String>,
}

/// Where the client came from, recorded on the session.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub ua: Option<String>,
}

/// Register policy shown to guests.
#[derive(Debug, Clone, Serialize)]
pub struct GuestConfig {
    pub app_name: String,
    pub app_url: String,
    pub is_email_verify: bool,
    pub is_invite_force: bool,
    pub email_whitelist_suffix: Option<Vec<String>>,
    pub is_login_with_mail_link: bool,
    pub stop_register: bool,
}

#[derive(Debug)]
pub enum TokenLogin {
    Redirect(String),
    Auth(AuthData),
}

#[derive(Clone)]
pub struct PassportService {
    pool: PgPool,
    users: UserRepository,
    invites: InviteRepository,
    plans: PlanRepository,
    cache: CacheService,
    auth: AuthService,
    mail: MailService,
    orders: OrderService,
    register: RegisterConfig,
    site: SiteConfig,
}

impl PassportService {
    pub fn new(
        pool: PgPool,
        cache: CacheService,
        auth: AuthService,
        mail: MailService,
        orders: OrderService,
        register: RegisterConfig,
        site: SiteConfig,
    ) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            invites: InviteRepository::new(pool.clone()),
            plans: PlanRepository::new(pool.clone()),
            pool,
            cache,
            auth,
            mail,
            orders,
            register,
            site,
        }
    }

    pub fn guest_config(&self) -> GuestConfig {
        GuestConfig {
            app_name: self.site.app_name.clone(),
            app_url: self.site.app_url.clone(),
            is_email_verify: self.register.email_verify,
            is_invite_force: self.register.invite_force,
            email_whitelist_suffix: self
                .register
                .email_whitelist_enable
                .then(|| self.register.email_whitelist_suffix.clone()),
            is_login_with_mail_link: self.register.login_with_mail_link_enable,
            stop_register: self.register.stop_register,
        }
    }

    pub async fn register(&self, input: &RegisterInput, client: ClientInfo) -> Result<AuthData> {
        let email = input.email.trim();
        check_registration(email, &input.password, &self.register)?;
        if self.register.invite_force && input.invite_code.as_deref().is_none_or(str::is_empty) {
            return Err(rejected("You must use the invitation code to register"));
        }
        if self.register.email_verify {
            let Some(code) = input.email_code.as_deref().filter(|c| !c.is_empty()) else {
                return Err(rejected("Email verification code cannot be empty"));
            };
            let cached = self.cache.get(&keys::email_verify_code(email)).await?;
            if cached.as_deref() != Some(code) {
                return Err(rejected("Incorrect email verification code"));
            }
        }
        if self.users.email_exists(email).await? {
            return Err(rejected("Email already exists"));
        }

        let mut new_user = NewUser {
            email: email.to_string(),
            password_hash: auth_service::hash_password(&input.password)?,
            uuid: uuid::Uuid::new_v4().to_string(),
            token: utils::guid(),
            ..NewUser::default()
        };

        let invite_code = input.invite_code.as_deref().filter(|c| !c.is_empty());
        let invite = match invite_code {
            Some(code) => accept_invite(self.invites.get_unused_code(code).await?)?,
            None => None,
        };
        new_user.invite_user_id = invite.as_ref().map(|i| i.user_id);

        if let Some(plan_id) = self.register.try_out_plan_id
            && let Some(plan) = self.plans.get_by_id(plan_id).await?
        {
            new_user.plan_id = Some(plan.id);
            new_user.group_id = Some(plan.group_id);
            new_user.transfer_enable = plan.transfer_bytes();
            new_user.speed_limit = plan.speed_limit;
            new_user.expired_at = Some(Utc::now() + Duration::hours(self.register.try_out_hour));
        }

        // Dropping `tx` on any error below rolls the whole registration back.
        let mut tx = self.pool.begin().await?;
        let user = UserRepository::insert(&mut tx, &new_user).await?;
        if let Some(invite) = &invite
            && !self.register.invite_never_expire
            && !InviteRepository::mark_used(&mut tx, invite.id).await?
        {
            return Err(rejected("Invalid invitation code"));
        }
        let redeemed = match input.redeem_code.as_deref().filter(|c| !c.is_empty()) {
            Some(code) => Some(self.orders.redeem_in(&mut tx, &user, code).await?),
            None => None,
        };
        tx.commit().await.context("Failed to commit registration")?;
        info!("Registered user {} ({})", user.id, user.email);

        if self.register.email_verify {
            self.cache.del(&keys::email_verify_code(email)).await?;
        }
        if let Some(order) = &redeemed {
            self.orders.settle_redemption(order).await?;
        }

        self.users.touch_last_login(user.id).await?;
        self.auth
            .issue(user.id, &user.token, user.is_admin, client.ip, client.ua)
            .await
    }

    pub async fn login(&self, email: &str, password: &str, client: ClientInfo) -> Result<AuthData> {
        let email = email.trim();
        let limit_key = keys::password_error_limit(email);
        if self.register.password_limit_enable {
            let failures: i64 = self
                .cache
                .get(&limit_key)
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if failures >= self.register.password_limit_count {
                return Err(throttled(format!(
                    "There are too many password errors, please try again after {} minutes.",
                    self.register.password_limit_expire
                )));
            }
        }

        let Some(user) = self.users.get_by_email(email).await? else {
            return Err(rejected("Incorrect email or password"));
        };
        if !auth_service::verify_password(
            user.password_algo.as_deref(),
            user.password_salt.as_deref(),
            password,
            &user.password_hash,
        ) {
            if self.register.password_limit_enable {
                let window = (self.register.password_limit_expire.max(1) * 60) as u64;
                self.cache.incr_with_expiry(&limit_key, window).await?;
            }
            return Err(rejected("Incorrect email or password"));
        }
        self.issue_for(&user, client).await
    }

    async fn issue_for(&self, user: &User, client: ClientInfo) -> Result<AuthData> {
        if user.banned {
            return Err(ServiceError::Forbidden("Your account has been suspended".into()).into());
        }
        self.users.touch_last_login(user.id).await?;
        self.auth
            .issue(user.id, &user.token, user.is_admin, client.ip, client.ua)
            .await
    }

    pub async fn send_email_verify(&self, email: &str) -> Result<()> {
        let email = email.trim();
        let resend_key = keys::last_send_email_verify_timestamp(email);
        if self.cache.get(&resend_key).await?.is_some() {
            return Err(throttled(
                "Email verification code has been sent, please request again later",
            ));
        }
        let code = utils::random_digits(6);
        self.cache
            .set(&keys::email_verify_code(email), &code, VERIFY_CODE_TTL)
            .await?;
        self.cache
            .set(&resend_key, &Utc::now().timestamp().to_string(), VERIFY_RESEND_SECS)
            .await?;
        self.mail
            .send(&Mail::verify_code(&self.site.app_name, email, &code))
            .await
    }

    /// Mails a one-time login link. Unknown addresses get the same answer.
    pub async fn login_with_mail_link(&self, email: &str, redirect: Option<&str>) -> Result<()> {
        if !self.register.login_with_mail_link_enable {
            return Err(rejected("Login by mail link is not enabled"));
        }
        let email = email.trim();
        let throttle_key = keys::last_send_login_with_mail_link_timestamp(email);
        if self.cache.get(&throttle_key).await?.is_some() {
            return Err(throttled("Sending frequently, please try again later"));
        }
        let Some(user) = self.users.get_by_email(email).await? else {
            return Ok(());
        };

        let link = self.login_link(user.id, redirect, MAIL_LINK_TTL).await?;
        self.mail
            .send(&Mail::login_link(&self.site.app_name, email, &link))
            .await?;
        self.cache
            .set(&throttle_key, &Utc::now().timestamp().to_string(), VERIFY_RESEND_SECS)
            .await
    }

    pub async fn token_to_login(
        &self,
        token: Option<&str>,
        verify: Option<&str>,
        redirect: Option<&str>,
        client: ClientInfo,
    ) -> Result<TokenLogin> {
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            return Ok(TokenLogin::Redirect(login_url(
                &self.site.app_url,
                token,
                redirect,
            )));
        }
        let Some(code) = verify.filter(|v| !v.is_empty()) else {
            return Err(rejected("Token error"));
        };
        let user_id: i64 = self
            .cache
            .take(&keys::temp_token(code))
            .await?
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| rejected("Token error"))?;
        let user = self
            .users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| not_found("The user does not exist"))?;
        Ok(TokenLogin::Auth(self.issue_for(&user, client).await?))
    }

    /// Short-lived link that logs `user_id` in without a password.
    pub async fn quick_login_url(&self, user_id: i64, redirect: Option<&str>) -> Result<String> {
        self.login_link(user_id, redirect, QUICK_LOGIN_TTL).await
    }

    async fn login_link(&self, user_id: i64, redirect: Option<&str>, ttl: u64) -> Result<String> {
        let code = utils::guid();
        self.cache
            .set(&keys::temp_token(&code), &user_id.to_string(), ttl)
            .await?;
        Ok(login_url(&self.site.app_url, &code, redirect))
    }

    pub async fn forget(&self, email: &str, email_code: &str, password: &str) -> Result<()> {
        let email = email.trim();
        if !self
            .cache
            .check_rate_limit(&keys::forget_request_limit(email), FORGET_LIMIT, FORGET_WINDOW)
            .await?
        {
            return Err(throttled("Reset failed, please try again later"));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(rejected("Password must be at least 4 characters"));
        }
        let code_key = keys::email_verify_code(email);
        if self.cache.get(&code_key).await?.as_deref() != Some(email_code) {
            return Err(rejected("Incorrect email verification code"));
        }
        let user = self
            .users
            .get_by_email(email)
            .await?
            .ok_or_else(|| not_found("This email is not registered in the system"))?;

        self.users
            .update_password(user.id, &auth_service::hash_password(password)?)
            .await?;
        self.auth.remove_all_sessions(user.id).await?;
        self.cache.del(&code_key).await?;
        info!("User {} reset their password", user.id);
        Ok(())
    }

    pub async fn record_invite_visit(&self, code: &str) -> Result<()> {
        self.invites.increment_pv(code).await
    }
}

fn login_url(app_url: &str, verify: &str, redirect: Option<&str>) -> String {
    format!(
        "{}/#/login?verify={}&redirect={}",
        app_url.trim_end_matches('/'),
        urlencoding::encode(verify),
        urlencoding::encode(redirect.filter(|r| !r.is_empty()).unwrap_or("dashboard"))
    )
}

/// A supplied invite code must name an unused code, whatever the invite policy.
pub fn accept_invite(found: Option<InviteCode>) -> Result<Option<InviteCode>> {
    match found {
        Some(invite) => Ok(Some(invite)),
        None => Err(rejected("Invalid invitation code")),
    }
}

/// Checks that only depend on the submitted email, password and policy.
pub fn check_registration(email: &str, password: &str, config: &RegisterConfig) -> Result<()> {
    if config.stop_register {
        return Err(rejected("Registration has closed"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(rejected("Password must be at least 4 characters"));
    }
    let Some((local, domain)) = email.rsplit_once('@') else {
        return Err(rejected("Email format is incorrect"));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(rejected("Email format is incorrect"));
    }
    let domain = domain.to_ascii_lowercase();
    if config.email_whitelist_enable
        && !config
            .email_whitelist_suffix
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&domain))
    {
        return Err(rejected("Email suffix is not in the Whitelist"));
    }
    if config.email_gmail_limit_enable && local.contains(['.', '+']) {
        return Err(rejected("Email alias is not supported"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_and_alias_rules() {
        let mut config = RegisterConfig::default();
        assert!(check_registration("a@anything.dev", "secret", &config).is_ok());

        config.email_whitelist_enable = true;
        assert!(check_registration("a@anything.dev", "secret", &config).is_err());
        assert!(check_registration("a@Gmail.com", "secret", &config).is_ok());

        config.email_gmail_limit_enable = true;
        assert!(check_registration("a.b@gmail.com", "secret", &config).is_err());
        assert!(check_registration("a+x@gmail.com", "secret", &config).is_err());
        assert!(check_registration("ab@gmail.com", "secret", &config).is_ok());

        config.email_whitelist_enable = false;
        assert!(check_registration("a.b@outlook.com", "secret", &config).is_err());
        assert!(check_registration("a+shop@proton.me", "secret", &config).is_err());
        assert!(check_registration("plain@outlook.com", "secret", &config).is_ok());
    }

    fn invite(id: i64) -> InviteCode {
        let now = Utc::now();
        InviteCode {
            id,
            user_id: 9,
            code: "AbCd1234".into(),
            status: 0,
            pv: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn supplied_invite_code_must_exist() {
        let err = accept_invite(None).unwrap_err();
        assert!(matches!(err.downcast_ref::<ServiceError>(), Some(ServiceError::Rejected(m)) if m == "Invalid invitation code"));
        assert_eq!(accept_invite(Some(invite(3))).unwrap().map(|i| i.id), Some(3));
    }

    #[test]
    fn password_and_format_rules() {
        let mut config = RegisterConfig::default();
        assert!(check_registration("a@b.c", "abc", &config).is_err());
        assert!(check_registration("a@b.c", "abcd", &config).is_ok());
        assert!(check_registration("not-an-email", "abcd", &config).is_err());

        config.stop_register = true;
        assert!(check_registration("a@b.c", "abcd", &config).is_err());
    }

    #[test]
    fn login_url_defaults_redirect() {
        assert_eq!(
            login_url("https://panel.example/", "abc", None),
            "https://panel.example/#/login?verify=abc&redirect=dashboard"
        );
        assert!(login_url("https://p", "abc", Some("plan/2")).ends_with("redirect=plan%2F2"));
    }
}
