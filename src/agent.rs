//! Mailbox operations on behalf of managed identities
//!
//! Every operation accepts an optional identity hint, resolves it through
//! [`IdentityResolver`], validates its inputs, and then talks to the remote
//! [`MailboxApi`]. Outbound messages go through the secure message builder;
//! bulk operations go through the [`BatchExecutor`].

use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::batch::{BatchExecutor, BatchResult};
use crate::compose::{self, SecureMessageRequest};
use crate::config::AgentConfig;
use crate::errors::{AppError, AppResult};
use crate::mime::{self, ParsedMessage};
use crate::path_guard::{PathGuard, file_name_of};
use crate::remote::{MailboxApi, SentMessage};
use crate::resolver::IdentityResolver;
use crate::store::CredentialStore;

/// Upper bound on body characters returned by [`MailAgent::read_message`]
pub const MAX_BODY_CHARS: usize = 100_000;
/// Longest accepted message or label id
const MAX_ID_LEN: usize = 256;

/// Where a downloaded attachment was written
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedAttachment {
    pub account_id: String,
    pub message_id: String,
    pub part_id: String,
    pub path: PathBuf,
    pub content_type: String,
    pub size_bytes: usize,
}

/// Agent façade over the credential store, path guard and remote mailbox
pub struct MailAgent {
    resolver: IdentityResolver,
    guard: PathGuard,
    remote: Arc<dyn MailboxApi>,
    batch: BatchExecutor,
    chunk_size: usize,
}

impl MailAgent {
    /// # Errors
    ///
    /// Returns `Internal` if the path guard cannot be built for the store's
    /// home directory.
    pub fn new(
        config: &AgentConfig,
        store: Arc<CredentialStore>,
        remote: Arc<dyn MailboxApi>,
    ) -> AppResult<Self> {
        let guard = PathGuard::new(store.home())?;
        Ok(Self {
            resolver: IdentityResolver::new(store),
            guard,
            remote,
            batch: BatchExecutor::from_config(config),
            chunk_size: config.batch_chunk_size,
        })
    }

    /// Build and send a message
    pub async fn send_message(
        &self,
        account_id: Option<&str>,
        request: &SecureMessageRequest,
        thread_id: Option<&str>,
    ) -> AppResult<SentMessage> {
        let thread_id = thread_id.map(|t| validate_id(t, "thread_id")).transpose()?;
        let credential = self.resolver.resolve(account_id).await?;
        let request = with_sender(request, credential.account_id());
        let message = compose::build(&request, &self.guard).await?;
        let sent = self.remote.send(&credential, message, thread_id).await?;
        info!(account = credential.account_id(), id = %sent.id, "message sent");
        Ok(sent)
    }

    /// Build a message and store it as a draft
    pub async fn create_draft(
        &self,
        account_id: Option<&str>,
        request: &SecureMessageRequest,
        thread_id: Option<&str>,
    ) -> AppResult<SentMessage> {
        let thread_id = thread_id.map(|t| validate_id(t, "thread_id")).transpose()?;
        let credential = self.resolver.resolve(account_id).await?;
        let request = with_sender(request, credential.account_id());
        let message = compose::build(&request, &self.guard).await?;
        let draft = self
            .remote
            .create_draft(&credential, message, thread_id)
            .await?;
        info!(account = credential.account_id(), id = %draft.id, "draft created");
        Ok(draft)
    }

    /// Fetch and parse one message
    pub async fn read_message(
        &self,
        account_id: Option<&str>,
        message_id: &str,
        body_max_chars: usize,
    ) -> AppResult<ParsedMessage> {
        let message_id = validate_id(message_id, "message_id")?;
        if !(1..=MAX_BODY_CHARS).contains(&body_max_chars) {
            return Err(AppError::invalid(format!(
                "body_max_chars must be in range 1..{MAX_BODY_CHARS}"
            )));
        }
        let credential = self.resolver.resolve(account_id).await?;
        let raw = self
            .remote
            .get_raw(&credential, message_id)
            .await
            .map_err(missing_message(message_id))?;
        mime::parse_message(&raw, body_max_chars)
    }

    /// Add and/or remove labels on one message
    pub async fn modify_labels(
        &self,
        account_id: Option<&str>,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> AppResult<()> {
        let message_id = validate_id(message_id, "message_id")?;
        validate_label_change(add, remove)?;
        let credential = self.resolver.resolve(account_id).await?;
        self.remote
            .modify_labels(&credential, message_id, add, remove)
            .await
            .map_err(missing_message(message_id))
    }

    /// Permanently delete one message
    pub async fn delete_message(
        &self,
        account_id: Option<&str>,
        message_id: &str,
    ) -> AppResult<()> {
        let message_id = validate_id(message_id, "message_id")?;
        let credential = self.resolver.resolve(account_id).await?;
        self.remote
            .delete(&credential, message_id)
            .await
            .map_err(missing_message(message_id))?;
        let account = credential.account_id();
        info!(account, message_id, "message deleted");
        Ok(())
    }

    /// Apply one label change to many messages
    ///
    /// `chunk_size` overrides the configured chunk size.
    pub async fn batch_modify_labels(
        &self,
        account_id: Option<&str>,
        message_ids: &[String],
        add: &[String],
        remove: &[String],
        chunk_size: Option<usize>,
    ) -> AppResult<BatchResult<String>> {
        validate_targets(message_ids)?;
        validate_label_change(add, remove)?;
        let credential = self.resolver.resolve(account_id).await?;
        let remote = &self.remote;
        let credential = &credential;

        let result = self
            .batch
            .run(
                message_ids,
                chunk_size.unwrap_or(self.chunk_size),
                |id: String| async move {
                    remote
                        .modify_labels(credential, &id, add, remove)
                        .await
                        .map_err(missing_message(&id))
                },
            )
            .await?;
        log_batch("batch_modify_labels", credential.account_id(), &result);
        Ok(result)
    }

    /// Permanently delete many messages
    pub async fn batch_delete(
        &self,
        account_id: Option<&str>,
        message_ids: &[String],
        chunk_size: Option<usize>,
    ) -> AppResult<BatchResult<String>> {
        validate_targets(message_ids)?;
        let credential = self.resolver.resolve(account_id).await?;
        let remote = &self.remote;
        let credential = &credential;

        let result = self
            .batch
            .run(
                message_ids,
                chunk_size.unwrap_or(self.chunk_size),
                |id: String| async move {
                    remote
                        .delete(credential, &id)
                        .await
                        .map_err(missing_message(&id))
                },
            )
            .await?;
        log_batch("batch_delete", credential.account_id(), &result);
        Ok(result)
    }

    /// Save one attachment into `dest_dir`
    ///
    /// The file name defaults to the attachment's own name. The destination
    /// must pass the path guard and must not exist yet.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a bad file name or a missing destination directory
    /// - `SecurityBlocked` if the destination is vetoed
    /// - `AlreadyExists` if the destination file exists
    /// - `NotFound` if the message or attachment part does not exist
    pub async fn download_attachment(
        &self,
        account_id: Option<&str>,
        message_id: &str,
        part_id: &str,
        dest_dir: &Path,
        file_name: Option<&str>,
    ) -> AppResult<DownloadedAttachment> {
        let message_id = validate_id(message_id, "message_id")?;
        let part_id = validate_id(part_id, "part_id")?;
        if let Some(name) = file_name {
            self.guard.resolve_download_path(dest_dir, name)?;
        }

        let credential = self.resolver.resolve(account_id).await?;
        let raw = self
            .remote
            .get_raw(&credential, message_id)
            .await
            .map_err(missing_message(message_id))?;
        let attachment = mime::extract_attachment(&raw, part_id)?;

        let name = match file_name {
            Some(name) => name.to_owned(),
            None => attachment
                .info
                .filename
                .as_deref()
                .and_then(|n| file_name_of(Path::new(n)))
                .unwrap_or_else(|| format!("attachment-{part_id}")),
        };
        let path = self.guard.resolve_download_path(dest_dir, &name)?;
        write_new_file(&path, &attachment.data).await?;

        info!(
            account = credential.account_id(),
            message_id,
            part_id,
            path = %path.display(),
            "attachment saved"
        );
        Ok(DownloadedAttachment {
            account_id: credential.account_id().to_owned(),
            message_id: message_id.to_owned(),
            part_id: part_id.to_owned(),
            path,
            content_type: attachment.info.content_type,
            size_bytes: attachment.data.len(),
        })
    }
}

/// Map a remote 404 on a message to `NotFound` naming the message
fn missing_message(message_id: &str) -> impl FnOnce(AppError) -> AppError + '_ {
    move |e| {
        if e.is_not_found() {
            AppError::NotFound(format!("message '{message_id}'"))
        } else {
            e
        }
    }
}

/// Validate an opaque remote identifier
fn validate_id<'a>(value: &'a str, field: &str) -> AppResult<&'a str> {
    if value.is_empty() || value.len() > MAX_ID_LEN {
        return Err(AppError::invalid(format!(
            "{field} must be 1..{MAX_ID_LEN} characters"
        )));
    }
    if value
        .chars()
        .any(|ch| ch.is_control() || ch.is_whitespace() || ch == '/')
    {
        return Err(AppError::invalid(format!(
            "{field} must not contain whitespace, control characters, or '/'"
        )));
    }
    Ok(value)
}

fn validate_targets(message_ids: &[String]) -> AppResult<()> {
    for id in message_ids {
        validate_id(id, "message_ids")?;
    }
    Ok(())
}

fn validate_label_change(add: &[String], remove: &[String]) -> AppResult<()> {
    if add.is_empty() && remove.is_empty() {
        return Err(AppError::invalid(
            "at least one of add_labels/remove_labels is required",
        ));
    }
    for label in add {
        validate_label(label, "add_labels")?;
    }
    for label in remove {
        validate_label(label, "remove_labels")?;
    }
    if let Some(both) = add.iter().find(|l| remove.contains(l)) {
        return Err(AppError::invalid(format!(
            "label '{both}' cannot be both added and removed"
        )));
    }
    Ok(())
}

/// Label ids may contain spaces (user labels) but never control characters
fn validate_label(label: &str, field: &str) -> AppResult<()> {
    if label.trim().is_empty() || label.len() > MAX_ID_LEN {
        return Err(AppError::invalid(format!(
            "{field} entries must be 1..{MAX_ID_LEN} characters"
        )));
    }
    if label.chars().any(char::is_control) {
        return Err(AppError::invalid(format!(
            "{field} contains invalid label '{}'",
            label.escape_debug()
        )));
    }
    Ok(())
}

/// Create `path` exclusively and write `data`, removing it on failure
async fn write_new_file(path: &Path, data: &[u8]) -> AppResult<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => {
                AppError::AlreadyExists(format!("{} already exists", path.display()))
            }
            ErrorKind::NotFound => AppError::invalid(format!(
                "destination directory for {} does not exist",
                path.display()
            )),
            _ => AppError::Internal(format!("cannot create {}: {e}", path.display())),
        })?;

    let written = match file.write_all(data).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        drop(file);
        let _ = tokio::fs::remove_file(path).await;
        return Err(AppError::Internal(format!(
            "failed writing {}: {e}",
            path.display()
        )));
    }
    Ok(())
}

/// Send as the resolved identity unless the request names a sender
fn with_sender<'a>(
    request: &'a SecureMessageRequest,
    account_id: &str,
) -> Cow<'a, SecureMessageRequest> {
    if request.from.is_some() {
        return Cow::Borrowed(request);
    }
    let mut owned = request.clone();
    owned.from = Some(account_id.to_owned());
    Cow::Owned(owned)
}

fn log_batch(operation: &str, account: &str, result: &BatchResult<String>) {
    if result.failure_count > 0 {
        warn!(
            operation,
            account,
            succeeded = result.success_count,
            failed = result.failure_count,
            "batch finished with failures"
        );
    } else {
        info!(
            operation,
            account,
            succeeded = result.success_count,
            "batch finished"
        );
    }
}
