//! OAuth credential bundles and refreshing credential handles
//!
//! A stored credential bundle (client id/secret + refresh token) is turned
//! into a [`CredentialHandle`]: a capability that yields a current access
//! token and refreshes it transparently. Raw secrets never leave this module
//! in structured form.

use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Seconds shaved off a token's lifetime so it is refreshed before expiry
const CACHE_SKEW_SECONDS: i64 = 60;
/// Maximum characters of a token endpoint error body echoed into errors
const REDACTED_BODY_MAX_LEN: usize = 200;
/// Longest `expires_in` honored from a token response (one day)
const MAX_TOKEN_LIFETIME_SECONDS: i64 = 86_400;

/// Long-lived credential for one identity
#[derive(Debug)]
pub struct CredentialBundle {
    /// OAuth client id the refresh token was issued to
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: SecretString,
    /// Long-lived refresh token
    pub refresh_token: SecretString,
}

/// On-disk credential file (Google `authorized_user` layout)
#[derive(Debug, Serialize, Deserialize)]
struct CredentialDocument {
    #[serde(rename = "type", default = "authorized_user")]
    kind: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

fn authorized_user() -> String {
    "authorized_user".to_owned()
}

impl CredentialBundle {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into().into()),
            refresh_token: SecretString::new(refresh_token.into().into()),
        }
    }

    /// Serialize to the credential file format
    pub fn to_json(&self) -> AppResult<String> {
        let doc = CredentialDocument {
            kind: authorized_user(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.expose_secret().to_owned(),
            refresh_token: self.refresh_token.expose_secret().to_owned(),
        };
        serde_json::to_string_pretty(&doc)
            .map_err(|e| AppError::Internal(format!("failed to serialize credential: {e}")))
    }

    /// Parse the credential file format
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the document is malformed or any field is
    /// blank. Callers loading stored credentials map this to `AuthFailed`.
    pub fn from_json(raw: &str) -> AppResult<Self> {
        let doc: CredentialDocument = serde_json::from_str(raw)
            .map_err(|e| AppError::invalid(format!("malformed credential document: {e}")))?;
        for (field, value) in [
            ("client_id", &doc.client_id),
            ("client_secret", &doc.client_secret),
            ("refresh_token", &doc.refresh_token),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::invalid(format!(
                    "credential document has empty {field}"
                )));
            }
        }
        Ok(Self::new(doc.client_id, doc.client_secret, doc.refresh_token))
    }
}

/// Short-lived access token with its expiry
#[derive(Debug)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Exchanges a refresh token for an access token
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, bundle: &CredentialBundle) -> AppResult<AccessToken>;
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Token endpoint speaking the OAuth2 `refresh_token` grant over HTTPS
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    client: Client,
    token_url: String,
}

impl HttpTokenEndpoint {
    /// # Errors
    ///
    /// Returns `Internal` if the HTTP client cannot be built.
    pub fn new(token_url: impl Into<String>, timeout_ms: u64) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_millis(timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            token_url: token_url.into(),
        })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, bundle: &CredentialBundle) -> AppResult<AccessToken> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", bundle.client_id.as_str()),
                ("client_secret", bundle.client_secret.expose_secret()),
                ("refresh_token", bundle.refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(format!("token refresh at {}", self.token_url))
                } else {
                    AppError::AuthFailed(format!("token refresh request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::AuthFailed(format!("failed to read token response: {e}")))?;
        if !status.is_success() {
            return Err(AppError::AuthFailed(format!(
                "token refresh rejected (status={status}): {}; re-authenticate this account",
                redact_response_body(&body)
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::AuthFailed(format!("malformed token response: {e}")))?;
        Ok(AccessToken {
            token: SecretString::new(payload.access_token.into()),
            expires_at: token_expiry(Utc::now(), payload.expires_in),
        })
    }
}

/// Cache deadline for a token issued at `now` with the given `expires_in`
fn token_expiry(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    let lifetime = i64::try_from(expires_in)
        .unwrap_or(i64::MAX)
        .min(MAX_TOKEN_LIFETIME_SECONDS)
        .saturating_sub(CACHE_SKEW_SECONDS);
    now + Duration::seconds(lifetime)
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(REDACTED_BODY_MAX_LEN) {
        None => trimmed.to_owned(),
        Some((cut, _)) => format!("{}…[truncated]", &trimmed[..cut]),
    }
}

/// Capability yielding access tokens for one identity
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token, refreshed first if missing or expired
    async fn access_token(&self) -> AppResult<SecretString>;
    /// Refresh unconditionally and return the new token
    async fn force_refresh(&self) -> AppResult<SecretString>;
}

/// Token source backed by a stored bundle and a token endpoint
pub struct RefreshingCredential {
    account_id: String,
    bundle: CredentialBundle,
    endpoint: Arc<dyn TokenEndpoint>,
    cached: Mutex<Option<AccessToken>>,
}

impl RefreshingCredential {
    pub fn new(
        account_id: impl Into<String>,
        bundle: CredentialBundle,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            bundle,
            endpoint,
            cached: Mutex::new(None),
        }
    }

    async fn refresh_locked(&self, slot: &mut Option<AccessToken>) -> AppResult<SecretString> {
        debug!(account_id = %self.account_id, "refreshing access token");
        let fresh = self.endpoint.refresh(&self.bundle).await.map_err(|e| match e {
            AppError::AuthFailed(msg) => AppError::AuthFailed(format!(
                "account '{}' must re-authenticate: {msg}",
                self.account_id
            )),
            other => other,
        })?;
        let token = copy_secret(&fresh.token);
        *slot = Some(fresh);
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for RefreshingCredential {
    async fn access_token(&self) -> AppResult<SecretString> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && !token.is_expired()
        {
            return Ok(copy_secret(&token.token));
        }
        self.refresh_locked(&mut cached).await
    }

    async fn force_refresh(&self) -> AppResult<SecretString> {
        let mut cached = self.cached.lock().await;
        self.refresh_locked(&mut cached).await
    }
}

fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::new(secret.expose_secret().into())
}

/// Authenticated handle for one identity
///
/// Cheap to clone; all clones share the same token cache.
#[derive(Clone)]
pub struct CredentialHandle {
    account_id: String,
    source: Arc<dyn TokenSource>,
}

impl CredentialHandle {
    pub fn new(account_id: impl Into<String>, source: Arc<dyn TokenSource>) -> Self {
        Self {
            account_id: account_id.into(),
            source,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub async fn access_token(&self) -> AppResult<SecretString> {
        self.source.access_token().await
    }

    pub async fn force_refresh(&self) -> AppResult<SecretString> {
        self.source.force_refresh().await
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use secrecy::{ExposeSecret, SecretString};

    use super::{
        AccessToken, CredentialBundle, CredentialHandle, MAX_TOKEN_LIFETIME_SECONDS,
        RefreshingCredential, TokenEndpoint, redact_response_body, token_expiry,
    };
    use crate::errors::{AppError, AppResult};

    /// Issues `token-N` tokens that expire after `lifetime_secs`
    struct CountingEndpoint {
        calls: AtomicUsize,
        lifetime_secs: i64,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn refresh(&self, _bundle: &CredentialBundle) -> AppResult<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken {
                token: SecretString::new(format!("token-{n}").into()),
                expires_at: Utc::now() + Duration::seconds(self.lifetime_secs),
            })
        }
    }

    struct RejectingEndpoint;

    #[async_trait]
    impl TokenEndpoint for RejectingEndpoint {
        async fn refresh(&self, _bundle: &CredentialBundle) -> AppResult<AccessToken> {
            Err(AppError::AuthFailed("invalid_grant".to_owned()))
        }
    }

    fn handle(endpoint: Arc<dyn TokenEndpoint>) -> CredentialHandle {
        let bundle = CredentialBundle::new("client", "secret", "refresh");
        CredentialHandle::new(
            "a@x.com",
            Arc::new(RefreshingCredential::new("a@x.com", bundle, endpoint)),
        )
    }

    #[tokio::test]
    async fn caches_token_until_expiry_and_force_refresh_bypasses_cache() {
        let endpoint = Arc::new(CountingEndpoint {
            calls: AtomicUsize::new(0),
            lifetime_secs: 3600,
        });
        let handle = handle(endpoint.clone());

        let first = handle.access_token().await.expect("token");
        let cached = handle.access_token().await.expect("token");
        assert_eq!(first.expose_secret(), "token-1");
        assert_eq!(cached.expose_secret(), "token-1");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);

        let forced = handle.force_refresh().await.expect("token");
        let after = handle.access_token().await.expect("token");
        assert_eq!(forced.expose_secret(), "token-2");
        assert_eq!(after.expose_secret(), "token-2");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let endpoint = Arc::new(CountingEndpoint {
            calls: AtomicUsize::new(0),
            lifetime_secs: -1,
        });
        let handle = handle(endpoint.clone());
        handle.access_token().await.expect("token");
        handle.access_token().await.expect("token");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_refresh_asks_for_reauthentication() {
        let err = handle(Arc::new(RejectingEndpoint))
            .access_token()
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::AuthFailed(_)));
        assert!(err.to_string().contains("must re-authenticate"));
    }

    #[test]
    fn credential_document_round_trips_and_rejects_blank_fields() {
        let bundle = CredentialBundle::new("client", "secret", "refresh");
        let parsed = CredentialBundle::from_json(&bundle.to_json().expect("serializes"))
            .expect("parses");
        assert_eq!(parsed.client_id, "client");
        assert_eq!(parsed.refresh_token.expose_secret(), "refresh");

        let err = CredentialBundle::from_json(
            r#"{"client_id":"c","client_secret":"s","refresh_token":"  "}"#,
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("refresh_token"));
        assert!(CredentialBundle::from_json("{not json").is_err());
    }

    #[test]
    fn debug_output_never_contains_secrets() {
        let bundle = CredentialBundle::new("client", "top-secret", "refresh-secret");
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("top-secret"));
        assert!(!rendered.contains("refresh-secret"));
    }

    #[test]
    fn redacts_long_error_bodies() {
        let body = "x".repeat(500);
        let out = redact_response_body(&body);
        assert!(out.ends_with("[truncated]"));
        assert!(out.len() < 300);
        assert_eq!(redact_response_body(" short "), "short");
    }

    #[test]
    fn token_expiry_is_clamped_and_skewed() {
        let now = Utc::now();
        assert_eq!(token_expiry(now, 3600), now + Duration::seconds(3540));
        assert_eq!(token_expiry(now, 0), now - Duration::seconds(60));

        let capped = now + Duration::seconds(MAX_TOKEN_LIFETIME_SECONDS - 60);
        assert_eq!(token_expiry(now, u64::MAX), capped);
        assert_eq!(token_expiry(now, i64::MAX as u64 + 1), capped);
        assert_eq!(token_expiry(now, 10_000_000), capped);
    }
}
