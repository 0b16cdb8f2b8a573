//! Optional identity hint to credential handle

use std::sync::Arc;

use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::oauth::CredentialHandle;
use crate::store::CredentialStore;

/// Resolves the identity every operation runs as
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<CredentialStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Explicit account if given, otherwise the registry default
    ///
    /// # Errors
    ///
    /// - Errors from [`CredentialStore::get_credential`], unchanged
    /// - `NoDefaultIdentity` when no hint is given and no default is set
    pub async fn resolve(&self, account_id: Option<&str>) -> AppResult<CredentialHandle> {
        let account_id = match account_id {
            Some(explicit) => explicit.to_owned(),
            None => self
                .store
                .get_default()
                .await?
                .ok_or(AppError::NoDefaultIdentity)?,
        };
        debug!(account = %account_id, "resolving identity");
        self.store.get_credential(&account_id).await
    }
}
