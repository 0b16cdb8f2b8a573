//! Consent-flow collaborator boundary
//!
//! Adding or re-authenticating an identity requires a grant from the account
//! owner. The grant itself happens outside this crate; [`ConsentFlow`] is the
//! narrow interface the credential store calls. [`TokenFileConsent`] is the
//! non-interactive implementation used by the CLI, which accepts a refresh
//! token obtained out of band.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::errors::{AppError, AppResult};
use crate::oauth::CredentialBundle;

/// Capabilities requested for every identity
pub const MAILBOX_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.settings.basic",
];

/// OAuth client registration (the `gcp-oauth.keys.json` document)
#[derive(Debug)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: SecretString,
}

#[derive(Debug, Deserialize)]
struct RegistrationDocument {
    installed: Option<RegistrationSection>,
    web: Option<RegistrationSection>,
}

#[derive(Debug, Deserialize)]
struct RegistrationSection {
    client_id: String,
    client_secret: String,
}

impl ClientRegistration {
    /// Parse a registration document with an `installed` or `web` section
    pub fn from_json(raw: &str) -> AppResult<Self> {
        let doc: RegistrationDocument = serde_json::from_str(raw)
            .map_err(|e| AppError::invalid(format!("malformed OAuth client keys: {e}")))?;
        let section = doc.installed.or(doc.web).ok_or_else(|| {
            AppError::invalid(
                "OAuth client keys must contain an 'installed' or 'web' section",
            )
        })?;
        if section.client_id.trim().is_empty() || section.client_secret.trim().is_empty() {
            return Err(AppError::invalid(
                "OAuth client keys must include client_id and client_secret",
            ));
        }
        Ok(Self {
            client_id: section.client_id,
            client_secret: SecretString::new(section.client_secret.into()),
        })
    }

    /// Load the registration document from disk
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the file is missing or malformed.
    pub async fn load(path: &Path) -> AppResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::invalid(format!(
                "OAuth client keys not readable at {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }
}

/// What the consent flow is asked to grant
#[derive(Debug)]
pub struct ConsentRequest<'a> {
    pub account_id: &'a str,
    pub client: &'a ClientRegistration,
    pub scopes: &'a [&'a str],
}

/// Performs an owner grant and returns a long-lived credential bundle
#[async_trait]
pub trait ConsentFlow: Send + Sync {
    async fn authorize(&self, request: ConsentRequest<'_>) -> AppResult<CredentialBundle>;
}

/// Consent satisfied by a JSON file holding a pre-issued refresh token
///
/// The file is `{"refresh_token": "..."}`; it may also carry its own
/// `client_id`/`client_secret` when the token was issued to a different
/// client than the configured registration.
#[derive(Debug, Clone)]
pub struct TokenFileConsent {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    refresh_token: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl TokenFileConsent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConsentFlow for TokenFileConsent {
    async fn authorize(&self, request: ConsentRequest<'_>) -> AppResult<CredentialBundle> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AppError::invalid(format!(
                "token file not readable at {}: {e}",
                self.path.display()
            ))
        })?;
        let file: TokenFile = serde_json::from_str(&raw)
            .map_err(|e| AppError::invalid(format!("malformed token file: {e}")))?;
        if file.refresh_token.trim().is_empty() {
            return Err(AppError::invalid("token file has an empty refresh_token"));
        }

        let client_id = file
            .client_id
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| request.client.client_id.clone());
        let client_secret = file
            .client_secret
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| request.client.client_secret.expose_secret().to_owned());
        Ok(CredentialBundle::new(
            client_id,
            client_secret,
            file.refresh_token.trim(),
        ))
    }
}
