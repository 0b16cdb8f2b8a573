//! Credential store for multiple identities
//!
//! Persists a registry document (`accounts.json`: account id → metadata plus
//! the default account) and, per identity, one credential file under its own
//! namespace directory. Secrets never appear in the registry document.
//!
//! Every read-modify-write of the registry runs under an in-process mutex so
//! concurrent callers cannot lose each other's updates. Credential files of
//! distinct identities are independent and are read without that lock.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compose::is_valid_address;
use crate::config::AgentConfig;
use crate::consent::{ClientRegistration, ConsentFlow, ConsentRequest, MAILBOX_SCOPES};
use crate::errors::{AppError, AppResult};
use crate::oauth::{CredentialBundle, CredentialHandle, RefreshingCredential, TokenEndpoint};

/// Registry document file name inside the home directory
const REGISTRY_FILE: &str = "accounts.json";
/// Directory holding one namespace per identity
const CREDENTIALS_DIR: &str = "credentials";
/// Credential file name inside an identity namespace
const CREDENTIAL_FILE: &str = "credentials.json";

/// Public view of a registered identity (no secrets)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub account_id: String,
    pub added_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityRecord {
    added_at: DateTime<Utc>,
    #[serde(default)]
    last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    accounts: BTreeMap<String, IdentityRecord>,
    #[serde(default)]
    default_account: Option<String>,
}

impl Registry {
    /// Deterministic fallback default: lexicographically smallest account id
    fn first_account(&self) -> Option<String> {
        self.accounts.keys().next().cloned()
    }

    fn identity(&self, account_id: &str, record: &IdentityRecord) -> Identity {
        Identity {
            account_id: account_id.to_owned(),
            added_at: record.added_at,
            last_used_at: record.last_used_at,
            is_default: self.default_account.as_deref() == Some(account_id),
        }
    }
}

/// Multi-identity credential store rooted at the agent home directory
pub struct CredentialStore {
    home: PathBuf,
    oauth_keys_path: PathBuf,
    endpoint: Arc<dyn TokenEndpoint>,
    registry_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(config: &AgentConfig, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            home: config.home.clone(),
            oauth_keys_path: config.oauth_keys_path.clone(),
            endpoint,
            registry_lock: Mutex::new(()),
        }
    }

    /// Root of all persisted state; the path guard blocks everything below it
    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join(REGISTRY_FILE)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.home.join(CREDENTIALS_DIR)
    }

    fn namespace_dir(&self, account_id: &str) -> PathBuf {
        self.credentials_dir().join(account_id)
    }

    fn credential_path(&self, account_id: &str) -> PathBuf {
        self.namespace_dir(account_id).join(CREDENTIAL_FILE)
    }

    /// Register a new identity
    ///
    /// Runs the consent flow, persists the resulting bundle under a fresh
    /// namespace and registers the identity. The first identity ever added
    /// becomes the default.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the account id is not an email address
    /// - `AlreadyExists` if the account id is registered
    /// - whatever the consent flow returns
    pub async fn add_identity(
        &self,
        account_id: &str,
        consent: &dyn ConsentFlow,
    ) -> AppResult<Identity> {
        validate_account_id(account_id)?;
        {
            let _guard = self.registry_lock.lock().await;
            if self.load_registry().await?.accounts.contains_key(account_id) {
                return Err(already_exists(account_id));
            }
        }

        let bundle = self.run_consent(account_id, consent).await?;

        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        if registry.accounts.contains_key(account_id) {
            return Err(already_exists(account_id));
        }

        let namespace = self.namespace_dir(account_id);
        if let Err(e) = self.write_credential(account_id, &bundle).await {
            let _ = tokio::fs::remove_dir_all(&namespace).await;
            return Err(e);
        }

        let record = IdentityRecord {
            added_at: Utc::now(),
            last_used_at: None,
        };
        registry
            .accounts
            .insert(account_id.to_owned(), record.clone());
        if registry.default_account.is_none() {
            registry.default_account = Some(account_id.to_owned());
        }
        if let Err(e) = self.save_registry(&registry).await {
            let _ = tokio::fs::remove_dir_all(&namespace).await;
            return Err(e);
        }

        info!(account_id, "identity added");
        Ok(registry.identity(account_id, &record))
    }

    /// Replace the credential of an existing identity with a fresh grant
    ///
    /// `added_at` and the default designation are preserved.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identity is not registered, including when
    /// it is removed while the consent flow runs; nothing is written then.
    pub async fn reauthenticate(
        &self,
        account_id: &str,
        consent: &dyn ConsentFlow,
    ) -> AppResult<()> {
        validate_account_id(account_id)?;
        {
            let _guard = self.registry_lock.lock().await;
            self.require_registered(account_id).await?;
        }
        let bundle = self.run_consent(account_id, consent).await?;

        let _guard = self.registry_lock.lock().await;
        self.require_registered(account_id).await?;
        self.write_credential(account_id, &bundle).await?;
        info!(account_id, "identity re-authenticated");
        Ok(())
    }

    /// Remove an identity and its credential namespace
    ///
    /// When the removed identity was the default, the default moves to the
    /// lexicographically smallest remaining account id, or is cleared when
    /// none remain. Returns the default after removal.
    pub async fn remove_identity(&self, account_id: &str) -> AppResult<Option<String>> {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        if !registry.accounts.contains_key(account_id) {
            return Err(not_registered(account_id));
        }

        match tokio::fs::remove_dir_all(self.namespace_dir(account_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "failed to delete credentials for '{account_id}': {e}"
                )));
            }
        }

        registry.accounts.remove(account_id);
        if registry.default_account.as_deref() == Some(account_id) {
            registry.default_account = registry.first_account();
        }
        self.save_registry(&registry).await?;

        info!(
            account_id,
            new_default = registry.default_account.as_deref().unwrap_or("<none>"),
            "identity removed"
        );
        Ok(registry.default_account)
    }

    /// Load a usable credential handle for an identity
    ///
    /// Updates `last_used_at` on success.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the identity is not registered
    /// - `AuthFailed` if its credential file is missing or cannot be parsed
    pub async fn get_credential(&self, account_id: &str) -> AppResult<CredentialHandle> {
        let bundle = {
            let _guard = self.registry_lock.lock().await;
            let mut registry = self.load_registry().await?;
            let record = registry
                .accounts
                .get_mut(account_id)
                .ok_or_else(|| not_registered(account_id))?;
            let bundle = self.read_credential(account_id).await?;
            record.last_used_at = Some(Utc::now());
            self.save_registry(&registry).await?;
            bundle
        };

        debug!(account_id, "credential resolved");
        let source = RefreshingCredential::new(account_id, bundle, Arc::clone(&self.endpoint));
        Ok(CredentialHandle::new(account_id, Arc::new(source)))
    }

    /// All registered identities in registry order (sorted by account id)
    pub async fn list_identities(&self) -> AppResult<Vec<Identity>> {
        let _guard = self.registry_lock.lock().await;
        let registry = self.load_registry().await?;
        Ok(registry
            .accounts
            .iter()
            .map(|(id, record)| registry.identity(id, record))
            .collect())
    }

    pub async fn get_default(&self) -> AppResult<Option<String>> {
        let _guard = self.registry_lock.lock().await;
        Ok(self.load_registry().await?.default_account)
    }

    /// # Errors
    ///
    /// Returns `NotFound` if the identity is not registered.
    pub async fn set_default(&self, account_id: &str) -> AppResult<()> {
        let _guard = self.registry_lock.lock().await;
        let mut registry = self.load_registry().await?;
        if !registry.accounts.contains_key(account_id) {
            return Err(not_registered(account_id));
        }
        registry.default_account = Some(account_id.to_owned());
        self.save_registry(&registry).await?;
        info!(account_id, "default identity set");
        Ok(())
    }

    async fn run_consent(
        &self,
        account_id: &str,
        consent: &dyn ConsentFlow,
    ) -> AppResult<CredentialBundle> {
        let client = ClientRegistration::load(&self.oauth_keys_path).await?;
        consent
            .authorize(ConsentRequest {
                account_id,
                client: &client,
                scopes: MAILBOX_SCOPES,
            })
            .await
    }

    /// Caller must hold the registry lock
    async fn require_registered(&self, account_id: &str) -> AppResult<()> {
        if self.load_registry().await?.accounts.contains_key(account_id) {
            Ok(())
        } else {
            Err(not_registered(account_id))
        }
    }

    /// Caller must hold the registry lock
    async fn load_registry(&self) -> AppResult<Registry> {
        let path = self.registry_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Registry::default()),
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "failed to read account registry: {e}"
                )));
            }
        };
        let mut registry: Registry = serde_json::from_str(&raw)
            .map_err(|e| AppError::Internal(format!("account registry is corrupt: {e}")))?;

        if let Some(default) = registry.default_account.as_deref()
            && !registry.accounts.contains_key(default)
        {
            warn!(
                dangling_default = default,
                "registry default points at a missing identity; reassigning"
            );
            registry.default_account = registry.first_account();
        }
        Ok(registry)
    }

    /// Caller must hold the registry lock
    async fn save_registry(&self, registry: &Registry) -> AppResult<()> {
        let raw = serde_json::to_string_pretty(registry)
            .map_err(|e| AppError::Internal(format!("failed to serialize registry: {e}")))?;
        write_private(&self.registry_path(), raw.as_bytes()).await
    }

    async fn write_credential(&self, account_id: &str, bundle: &CredentialBundle) -> AppResult<()> {
        let namespace = self.namespace_dir(account_id);
        tokio::fs::create_dir_all(&namespace).await.map_err(|e| {
            AppError::Internal(format!(
                "failed to create credential namespace for '{account_id}': {e}"
            ))
        })?;
        let contents = bundle.to_json()?;
        write_private(&self.credential_path(account_id), contents.as_bytes()).await
    }

    async fn read_credential(&self, account_id: &str) -> AppResult<CredentialBundle> {
        let raw = tokio::fs::read_to_string(self.credential_path(account_id))
            .await
            .map_err(|e| {
                AppError::AuthFailed(format!(
                    "credential for '{account_id}' cannot be loaded ({e}); \
                     re-authenticate this account"
                ))
            })?;
        CredentialBundle::from_json(&raw).map_err(|e| {
            AppError::AuthFailed(format!(
                "credential for '{account_id}' is corrupt ({e}); re-authenticate this account"
            ))
        })
    }
}

/// Validate that an account id is an email address usable as a directory name
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if !is_valid_address(account_id) {
        return Err(AppError::InvalidInput(format!(
            "account id '{}' must be an email address",
            account_id.escape_debug()
        )));
    }
    Ok(())
}

fn already_exists(account_id: &str) -> AppError {
    AppError::AlreadyExists(format!("account '{account_id}' is already registered"))
}

fn not_registered(account_id: &str) -> AppError {
    AppError::NotFound(format!("account '{account_id}' is not registered"))
}

/// Write a file readable only by the owner, replacing it atomically
async fn write_private(path: &Path, contents: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            AppError::Internal(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    if let Err(e) = replace_with(&tmp, path, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(AppError::Internal(format!(
            "failed to write {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

async fn replace_with(tmp: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(tmp, contents).await?;
    set_owner_only(tmp).await?;
    tokio::fs::rename(tmp, path).await
}

#[cfg(unix)]
async fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn set_owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
