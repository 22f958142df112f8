use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(skip_serializing)]
    pub password_algo: Option<String>,
    #[serde(skip_serializing)]
    pub password_salt: Option<String>,
    pub uuid: String,
    pub token: String,
    pub invite_user_id: Option<i64>,
    pub telegram_id: Option<i64>,
    pub balance: i64,
    pub commission_balance: i64,
    pub commission_type: i16,
    pub commission_rate: Option<i32>,
    pub discount: Option<i32>,
    pub plan_id: Option<i64>,
    pub group_id: Option<i64>,
    pub transfer_enable: i64,
    pub u: i64,
    pub d: i64,
    pub speed_limit: Option<i32>,
    pub expired_at: Option<DateTime<Utc>>,
    pub banned: bool,
    pub is_admin: bool,
    pub remind_expire: bool,
    pub remind_traffic: bool,
    pub has_triggered_invite_reward: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub traffic_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn used_traffic(&self) -> i64 {
        self.u + self.d
    }

    pub fn remaining_traffic(&self) -> i64 {
        (self.transfer_enable - self.used_traffic()).max(0)
    }

    /// A NULL expiry means the plan never expires (onetime plans).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expired_at, Some(at) if at <= now)
    }

    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        !self.banned && self.transfer_enable > 0 && !self.is_expired_at(now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub uuid: String,
    pub token: String,
    pub invite_user_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub group_id: Option<i64>,
    pub transfer_enable: i64,
    pub speed_limit: Option<i32>,
    pub expired_at: Option<DateTime<Utc>>,
    pub is_admin: bool,
}

/// Fields an administrator may change on a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdminUserUpdate {
    pub email: Option<String>,
    pub balance: Option<i64>,
    pub commission_balance: Option<i64>,
    pub commission_type: Option<i16>,
    pub commission_rate: Option<i32>,
    pub discount: Option<i32>,
    pub plan_id: Option<i64>,
    pub group_id: Option<i64>,
    pub transfer_enable: Option<i64>,
    pub u: Option<i64>,
    pub d: Option<i64>,
    pub speed_limit: Option<i32>,
    pub expired_at: Option<DateTime<Utc>>,
    pub banned: Option<bool>,
    pub is_admin: Option<bool>,
    pub invite_user_id: Option<i64>,
}

/// Commission eligibility policy stored in `users.commission_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommissionType {
    /// Follow the site-wide first-order-only switch.
    System,
    Always,
    FirstOrderOnly,
}

impl From<i16> for CommissionType {
    fn from(value: i16) -> Self {
        match value {
            1 => CommissionType::Always,
            2 => CommissionType::FirstOrderOnly,
            _ => CommissionType::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> User {
        let now = Utc::now();
        User {
            id: 1,
            email: "a@example.com".into(),
            password_hash: String::new(),
            password_algo: None,
            password_salt: None,
            uuid: "uuid".into(),
            token: "token".into(),
            invite_user_id: None,
            telegram_id: None,
            balance: 0,
            commission_balance: 0,
            commission_type: 0,
            commission_rate: None,
            discount: None,
            plan_id: Some(1),
            group_id: Some(1),
            transfer_enable: 100,
            u: 30,
            d: 20,
            speed_limit: None,
            expired_at: Some(now + Duration::days(1)),
            banned: false,
            is_admin: false,
            remind_expire: true,
            remind_traffic: true,
            has_triggered_invite_reward: false,
            last_login_at: None,
            traffic_updated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn availability_requires_traffic_and_unexpired_plan() {
        let now = Utc::now();
        let mut u = user();
        assert!(u.is_available_at(now));
        assert_eq!(u.remaining_traffic(), 50);

        u.expired_at = None;
        assert!(u.is_available_at(now));

        u.expired_at = Some(now - Duration::seconds(1));
        assert!(!u.is_available_at(now));

        u.expired_at = None;
        u.transfer_enable = 0;
        assert!(!u.is_available_at(now));
    }

    #[test]
    fn banned_user_is_unavailable() {
        let mut u = user();
        u.banned = true;
        assert!(!u.is_available_at(Utc::now()));
    }
}
