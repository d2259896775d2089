//! Auth token management
//!
//! Keeps a valid Supabase access token per user: sign-in against the
//! identity API, an in-memory cache, proactive background refresh ahead of
//! expiry, and HS256 validation for incoming bearer tokens.
//!
//! Only `sign_in` surfaces errors; `get_token` and `refresh_token` absorb
//! failures into `None` so callers see a missing token rather than a thrown
//! error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long before expiry `get_token` refreshes inline.
const EXPIRY_BUFFER_SECS: i64 = 5 * 60;
/// How long before expiry the background task refreshes.
const PROACTIVE_REFRESH_SECS: i64 = 10 * 60;

/// Auth errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Sign in failed: {0}")]
    SignIn(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("Token has no usable expiry")]
    BadExpiry,
}

pub type AuthResult<T> = Result<T, AuthError>;

/// A cached authentication token for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
    pub user_email: String,
}

/// Claims extracted from an access token.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    detail: Option<String>,
}

struct AuthInner {
    api_base_url: String,
    supabase_url: String,
    supabase_key: String,
    jwt_secret: String,
    http: reqwest::Client,
    tokens: RwLock<HashMap<String, AuthToken>>,
    refresh_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// Manages authentication tokens for MCP servers.
///
/// Cheap to clone; all clones share the same cache and task set.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<AuthInner>,
}

impl AuthManager {
    pub fn new(
        api_base_url: impl Into<String>,
        supabase_url: impl Into<String>,
        supabase_key: impl Into<String>,
        jwt_secret: impl Into<String>,
    ) -> Self {
        let api_base_url = api_base_url.into().trim_end_matches('/').to_string();
        let supabase_url = supabase_url.into().trim_end_matches('/').to_string();

        Self {
            inner: Arc::new(AuthInner {
                api_base_url,
                supabase_url,
                supabase_key: supabase_key.into(),
                jwt_secret: jwt_secret.into(),
                http: reqwest::Client::new(),
                tokens: RwLock::new(HashMap::new()),
                refresh_tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Sign in a user and cache the resulting token.
    ///
    /// Spawns the per-user proactive refresh task, replacing any previous
    /// one for the same user.
    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<AuthToken> {
        let response = self
            .inner
            .http
            .post(format!("{}/auth/signin", self.inner.api_base_url))
            .json(&serde_json::json!({"email": email, "password": password}))
            .send()
            .await?;

        if !response.status().is_success() {
            let detail = response
                .json::<ErrorResponse>()
                .await
                .ok()
                .and_then(|e| e.detail)
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(AuthError::SignIn(detail));
        }

        let data: TokenResponse = response.json().await?;
        let claims = decode_unverified(&data.access_token)?;

        let token = AuthToken {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: timestamp_to_utc(claims.exp)?,
            user_id: claims.sub,
            user_email: email.to_string(),
        };

        let user_id = token.user_id.clone();
        self.inner
            .tokens
            .write()
            .await
            .insert(user_id.clone(), token.clone());
        self.start_refresh_task(&user_id).await;

        info!("User signed in: {} ({})", email, user_id);
        Ok(token)
    }

    /// Exchange the stored refresh token for a new access token.
    ///
    /// Returns `None` (and logs) on any failure. The provider may omit a new
    /// refresh token, in which case the previous one is kept; the cached
    /// email is carried over.
    pub async fn refresh_token(&self, user_id: &str) -> Option<AuthToken> {
        let current = self.inner.tokens.read().await.get(user_id).cloned();
        let Some(current) = current else {
            warn!("No refresh token available for user {}", user_id);
            return None;
        };
        let Some(refresh_token) = current.refresh_token.clone() else {
            warn!("No refresh token available for user {}", user_id);
            return None;
        };

        let response = self
            .inner
            .http
            .post(format!(
                "{}/auth/v1/token?grant_type=refresh_token",
                self.inner.supabase_url
            ))
            .header("apikey", &self.inner.supabase_key)
            .json(&serde_json::json!({"refresh_token": refresh_token}))
            .send()
            .await;

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let body = response.text().await.unwrap_or_default();
                error!("Token refresh failed: {}", body);
                return None;
            }
            Err(e) => {
                error!("Failed to refresh token: {}", e);
                return None;
            }
        };

        let data: TokenResponse = match response.json().await {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to refresh token: {}", e);
                return None;
            }
        };

        let claims = match decode_unverified(&data.access_token) {
            Ok(claims) => claims,
            Err(e) => {
                error!("Failed to decode refreshed token: {}", e);
                return None;
            }
        };
        let expires_at = match timestamp_to_utc(claims.exp) {
            Ok(expires_at) => expires_at,
            Err(e) => {
                error!("Failed to decode refreshed token: {}", e);
                return None;
            }
        };

        let new_token = AuthToken {
            access_token: data.access_token,
            refresh_token: data.refresh_token.or(Some(refresh_token)),
            expires_at,
            user_id: claims.sub,
            user_email: current.user_email,
        };

        self.inner
            .tokens
            .write()
            .await
            .insert(user_id.to_string(), new_token.clone());

        info!("Token refreshed for user {}", user_id);
        Some(new_token)
    }

    /// Get a valid access token for a user, refreshing inline when the
    /// cached one is within five minutes of expiry.
    pub async fn get_token(&self, user_id: &str) -> Option<String> {
        let token = self.inner.tokens.read().await.get(user_id).cloned()?;

        if needs_refresh(token.expires_at, Utc::now()) {
            info!("Token expired for user {}, refreshing...", user_id);
            return self
                .refresh_token(user_id)
                .await
                .map(|token| token.access_token);
        }

        Some(token.access_token)
    }

    /// Verify an access token's signature (HS256) and expiry.
    ///
    /// Returns the claims on success, `None` on any failure.
    pub fn validate_token(&self, access_token: &str) -> Option<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        match decode::<TokenClaims>(
            access_token,
            &DecodingKey::from_secret(self.inner.jwt_secret.as_bytes()),
            &validation,
        ) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                warn!("Invalid token: {}", e);
                None
            }
        }
    }

    /// Sign out a user: cancel the refresh task and evict the cached token.
    pub async fn sign_out(&self, user_id: &str) {
        if let Some(task) = self.inner.refresh_tasks.lock().await.remove(user_id) {
            task.abort();
        }
        self.inner.tokens.write().await.remove(user_id);

        info!("User signed out: {}", user_id);
    }

    /// Cancel every refresh task and wait for them to wind down.
    pub async fn close(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> =
            self.inner.refresh_tasks.lock().await.drain().collect();

        for (user_id, task) in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Refresh task for {} ended abnormally: {}", user_id, e);
                }
            }
        }

        self.inner.tokens.write().await.clear();
    }

    /// Spawn the proactive refresh loop for a user, cancelling any previous
    /// one. At most one refresh task per user exists at a time.
    async fn start_refresh_task(&self, user_id: &str) {
        let manager = self.clone();
        let task_user = user_id.to_string();
        let task = tokio::spawn(async move {
            manager.refresh_loop(&task_user).await;
        });

        if let Some(old) = self
            .inner
            .refresh_tasks
            .lock()
            .await
            .insert(user_id.to_string(), task)
        {
            old.abort();
        }
    }

    /// Sleep until ten minutes before expiry, refresh, repeat. Ends when the
    /// token is evicted or a refresh fails.
    async fn refresh_loop(&self, user_id: &str) {
        loop {
            let token = self.inner.tokens.read().await.get(user_id).cloned();
            let Some(token) = token else {
                return;
            };

            let wait = refresh_wait_seconds(token.expires_at, Utc::now());
            if wait > 0 {
                info!(
                    "Scheduling token refresh for user {} in {} seconds",
                    user_id, wait
                );
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
            }

            if self.refresh_token(user_id).await.is_none() {
                error!("Failed to refresh token for user {}", user_id);
                return;
            }
        }
    }
}

/// Whether a token is close enough to expiry that `get_token` should
/// refresh before handing it out.
fn needs_refresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= expires_at - chrono::Duration::seconds(EXPIRY_BUFFER_SECS)
}

/// Seconds until the proactive refresh should fire (zero when overdue).
fn refresh_wait_seconds(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let refresh_at = expires_at - chrono::Duration::seconds(PROACTIVE_REFRESH_SECS);
    (refresh_at - now).num_seconds().max(0) as u64
}

/// Decode a JWT's claims without verifying the signature.
///
/// Used on tokens freshly handed to us by the identity provider, where only
/// `sub` and `exp` are needed; incoming bearer tokens go through
/// [`AuthManager::validate_token`] instead.
fn decode_unverified(access_token: &str) -> AuthResult<TokenClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = decode::<TokenClaims>(access_token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims)
}

fn timestamp_to_utc(exp: i64) -> AuthResult<DateTime<Utc>> {
    Utc.timestamp_opt(exp, 0).single().ok_or(AuthError::BadExpiry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
        email: String,
    }

    fn make_token(secret: &[u8], exp: i64) -> String {
        let claims = TestClaims {
            sub: "user-1".to_string(),
            exp,
            email: "user@example.com".to_string(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn manager_with_secret(secret: &str) -> AuthManager {
        AuthManager::new(
            "http://localhost:8080",
            "http://localhost:54321",
            "anon-key",
            secret,
        )
    }

    #[test]
    fn test_decode_unverified_extracts_claims() {
        let exp = Utc::now().timestamp() + 900;
        let token = make_token(b"any-secret", exp);

        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.exp, exp);
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_validate_token_checks_signature_and_expiry() {
        let manager = manager_with_secret("top-secret");
        let exp = Utc::now().timestamp() + 900;

        let good = make_token(b"top-secret", exp);
        assert!(manager.validate_token(&good).is_some());

        let wrong_secret = make_token(b"other-secret", exp);
        assert!(manager.validate_token(&wrong_secret).is_none());

        let expired = make_token(b"top-secret", Utc::now().timestamp() - 900);
        assert!(manager.validate_token(&expired).is_none());
    }

    #[test]
    fn test_needs_refresh_buffer() {
        let now = Utc::now();
        assert!(!needs_refresh(now + chrono::Duration::minutes(6), now));
        assert!(needs_refresh(now + chrono::Duration::minutes(4), now));
        assert!(needs_refresh(now - chrono::Duration::minutes(1), now));
    }

    #[test]
    fn test_refresh_wait_seconds() {
        let now = Utc::now();
        // Expires in 15 minutes: the task should sleep ~5 minutes.
        let wait = refresh_wait_seconds(now + chrono::Duration::minutes(15), now);
        assert!((299..=300).contains(&wait));
        // Already inside the window: fire immediately.
        assert_eq!(
            refresh_wait_seconds(now + chrono::Duration::minutes(5), now),
            0
        );
    }

    #[tokio::test]
    async fn test_get_token_without_sign_in() {
        let manager = manager_with_secret("secret");
        assert!(manager.get_token("missing-user").await.is_none());
    }

    #[tokio::test]
    async fn test_sign_out_and_close_are_idempotent() {
        let manager = manager_with_secret("secret");
        manager.sign_out("nobody").await;
        manager.close().await;
        manager.close().await;
    }
}
