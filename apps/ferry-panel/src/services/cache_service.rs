use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::info;

/// Short-lived keys (verify codes, temp tokens, counters) and per-user session hashes.
#[derive(Clone)]
pub struct CacheService {
    conn: ConnectionManager,
}

pub mod keys {
    pub fn email_verify_code(email: &str) -> String {
        format!("EMAIL_VERIFY_CODE:{}", email)
    }

    pub fn last_send_email_verify_timestamp(email: &str) -> String {
        format!("LAST_SEND_EMAIL_VERIFY_TIMESTAMP:{}", email)
    }

    pub fn password_error_limit(email: &str) -> String {
        format!("PASSWORD_ERROR_LIMIT:{}", email)
    }

    pub fn temp_token(code: &str) -> String {
        format!("TEMP_TOKEN:{}", code)
    }

    pub fn last_send_login_with_mail_link_timestamp(email: &str) -> String {
        format!("LAST_SEND_LOGIN_WITH_MAIL_LINK_TIMESTAMP:{}", email)
    }

    pub fn forget_request_limit(email: &str) -> String {
        format!("FORGET_REQUEST_LIMIT:{}", email)
    }

    pub fn user_sessions(user_id: i64) -> String {
        format!("USER_SESSIONS:{}", user_id)
    }

    pub fn server_last_push_at(server_id: i64) -> String {
        format!("SERVER_LAST_PUSH_AT:{}", server_id)
    }
}

impl CacheService {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Redis connected");
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Redis GET failed")
    }

    pub async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async(&mut conn)
            .await
            .context("Redis SETEX failed")?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Redis DEL failed")?;
        Ok(())
    }

    /// Atomically reads and removes a key.
    pub async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Redis GETDEL failed")
    }

    /// Fixed window counter. The window starts at the first increment.
    pub async fn incr_with_expiry(&self, key: &str, window_secs: u64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Redis INCR failed")?;

        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(window_secs)
                .query_async(&mut conn)
                .await
                .context("Redis EXPIRE failed")?;
        }

        Ok(count)
    }

    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_secs: u64) -> Result<bool> {
        Ok(self.incr_with_expiry(key, window_secs).await? <= limit)
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .context("Redis HSET failed")?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .context("Redis HGET failed")
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await
            .context("Redis HDEL failed")?;
        Ok(removed > 0)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Redis HGETALL failed")
    }
}

#[cfg(test)]
mod tests {
    use super::keys;

    #[test]
    fn keys_follow_name_colon_id() {
        assert_eq!(
            keys::email_verify_code("alice@example.com"),
            "EMAIL_VERIFY_CODE:alice@example.com"
        );
        assert_eq!(keys::user_sessions(42), "USER_SESSIONS:42");
        assert_eq!(keys::temp_token("abc"), "TEMP_TOKEN:abc");
    }
}
