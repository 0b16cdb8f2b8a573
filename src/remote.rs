//! Remote mailbox collaborator boundary
//!
//! The wire protocol of the hosted mailbox lives outside this crate. Every
//! call takes a resolved [`CredentialHandle`] and fails with
//! [`AppError::Remote`](crate::errors::AppError::Remote) carrying the
//! service's status code and message.

use async_trait::async_trait;
use serde::Serialize;

use crate::compose::BuiltMessage;
use crate::errors::AppResult;
use crate::oauth::CredentialHandle;

/// Identifiers of a message accepted by the remote mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub id: String,
    pub thread_id: Option<String>,
}

/// Per-item mailbox operations
///
/// The transport is responsible for base64url-encoding built messages.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn send(
        &self,
        credential: &CredentialHandle,
        message: BuiltMessage,
        thread_id: Option<&str>,
    ) -> AppResult<SentMessage>;

    async fn create_draft(
        &self,
        credential: &CredentialHandle,
        message: BuiltMessage,
        thread_id: Option<&str>,
    ) -> AppResult<SentMessage>;

    /// Raw RFC 5322 bytes of one message
    async fn get_raw(&self, credential: &CredentialHandle, message_id: &str) -> AppResult<Vec<u8>>;

    async fn modify_labels(
        &self,
        credential: &CredentialHandle,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> AppResult<()>;

    /// Permanent delete, bypassing trash
    async fn delete(&self, credential: &CredentialHandle, message_id: &str) -> AppResult<()>;
}
