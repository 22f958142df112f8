use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;

use crate::services::cache_service::{CacheService, keys};
use crate::utils;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub session: String,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub ip: Option<String>,
    pub login_at: i64,
    pub ua: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthData {
    pub token: String,
    pub is_admin: bool,
    pub auth_data: String,
}

#[derive(Clone)]
pub struct AuthService {
    cache: CacheService,
    secret: String,
    ttl_days: i64,
}

impl AuthService {
    pub fn new(cache: CacheService, secret: String, ttl_days: i64) -> Self {
        Self {
            cache,
            secret,
            ttl_days,
        }
    }

    /// Opens a session and signs a token for it.
    pub async fn issue(
        &self,
        user_id: i64,
        user_token: &str,
        is_admin: bool,
        ip: Option<String>,
        ua: Option<String>,
    ) -> Result<AuthData> {
        let session = utils::guid();
        let info = SessionInfo {
            ip,
            login_at: Utc::now().timestamp(),
            ua,
        };
        self.cache
            .hset(
                &keys::user_sessions(user_id),
                &session,
                &serde_json::to_string(&info)?,
            )
            .await?;

        let auth_data = self.sign(user_id, &session)?;
        Ok(AuthData {
            token: user_token.to_string(),
            is_admin,
            auth_data,
        })
    }

    fn sign(&self, user_id: i64, session: &str) -> Result<String> {
        let claims = Claims {
            id: user_id,
            session: session.to_string(),
            exp: (Utc::now() + Duration::days(self.ttl_days)).timestamp() as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to sign token")
    }

    /// Claims of a valid token whose session is still open.
    pub async fn verify(&self, token: &str) -> Result<Option<Claims>> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let claims = match decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        ) {
            Ok(data) => data.claims,
            Err(e) => {
                warn!("Rejected token: {}", e);
                return Ok(None);
            }
        };

        let open = self
            .cache
            .hget(&keys::user_sessions(claims.id), &claims.session)
            .await?
            .is_some();
        Ok(open.then_some(claims))
    }

    pub async fn sessions(&self, user_id: i64) -> Result<HashMap<String, SessionInfo>> {
        let raw = self.cache.hgetall(&keys::user_sessions(user_id)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(id, json)| serde_json::from_str(&json).ok().map(|info| (id, info)))
            .collect())
    }

    pub async fn remove_session(&self, user_id: i64, session: &str) -> Result<bool> {
        self.cache
            .hdel(&keys::user_sessions(user_id), session)
            .await
    }

    pub async fn remove_all_sessions(&self, user_id: i64) -> Result<()> {
        self.cache.del(&keys::user_sessions(user_id)).await
    }
}

/// Checks a password against the stored hash, including legacy algorithms.
pub fn verify_password(
    algo: Option<&str>,
    salt: Option<&str>,
    password: &str,
    hash: &str,
) -> bool {
    match algo.map(str::to_ascii_lowercase).as_deref() {
        Some("md5") => hex::encode(md5::compute(password).0) == hash,
        Some("sha256") => hex::encode(Sha256::digest(password.as_bytes())) == hash,
        Some("md5salt") => {
            let salted = format!("{}{}", password, salt.unwrap_or_default());
            hex::encode(md5::compute(salted).0) == hash
        }
        _ => bcrypt::verify(password, hash).unwrap_or(false),
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("Failed to hash password")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_hashes_verify() {
        let md5_hash = hex::encode(md5::compute("secret").0);
        assert!(verify_password(Some("md5"), None, "secret", &md5_hash));
        assert!(!verify_password(Some("md5"), None, "wrong", &md5_hash));

        let sha = hex::encode(Sha256::digest(b"secret"));
        assert!(verify_password(Some("sha256"), None, "secret", &sha));

        let salted = hex::encode(md5::compute("secretpepper").0);
        assert!(verify_password(Some("md5salt"), Some("pepper"), "secret", &salted));
    }

    #[test]
    fn bcrypt_is_the_default() {
        let hash = bcrypt::hash("secret", 4).unwrap();
        assert!(verify_password(None, None, "secret", &hash));
        assert!(!verify_password(None, None, "nope", &hash));
    }
}
