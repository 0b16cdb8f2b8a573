//! Configuration for the agent core
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_AGENT_<KEY>`. Persisted state lives under a single home
//! directory which defaults to the directory of the running executable, not
//! the working directory, since the hosting process may be launched from
//! anywhere.

use std::env;
use std::env::VarError;
use std::path::PathBuf;

use crate::errors::{AppError, AppResult};

/// Default Google OAuth token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// File name of the client registration document inside the home directory
const OAUTH_KEYS_FILE: &str = "gcp-oauth.keys.json";
/// Default number of targets per batch chunk
const DEFAULT_BATCH_CHUNK_SIZE: usize = 50;
/// Default per-item timeout inside a batch
const DEFAULT_BATCH_ITEM_TIMEOUT_MS: u64 = 60_000;
/// Default HTTP timeout for token refresh requests
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Agent-wide configuration
///
/// Cloned into the credential store and agent façade at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root of all persisted state (registry + credential namespaces)
    pub home: PathBuf,
    /// OAuth client registration document used by the consent flow
    pub oauth_keys_path: PathBuf,
    /// OAuth token endpoint used for refresh
    pub token_url: String,
    /// Default chunk size for batch operations (always >= 1)
    pub batch_chunk_size: usize,
    /// Per-item timeout inside a batch in milliseconds (0 disables)
    pub batch_item_timeout_ms: u64,
    /// HTTP timeout for token refresh in milliseconds
    pub http_timeout_ms: u64,
}

impl AgentConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a variable is malformed, and `Internal` if
    /// no home directory is configured and the executable location cannot be
    /// determined.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_AGENT_HOME=/opt/mail-agent
    /// MAIL_AGENT_OAUTH_KEYS=/opt/mail-agent/gcp-oauth.keys.json
    /// MAIL_AGENT_BATCH_CHUNK_SIZE=50
    /// MAIL_AGENT_BATCH_ITEM_TIMEOUT_MS=60000
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let home = match optional_env("MAIL_AGENT_HOME")? {
            Some(v) => PathBuf::from(v),
            None => install_dir()?,
        };
        let oauth_keys_path = optional_env("MAIL_AGENT_OAUTH_KEYS")?
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(OAUTH_KEYS_FILE));

        let batch_chunk_size =
            parse_usize_env("MAIL_AGENT_BATCH_CHUNK_SIZE", DEFAULT_BATCH_CHUNK_SIZE)?;
        if batch_chunk_size == 0 {
            return Err(AppError::invalid(
                "MAIL_AGENT_BATCH_CHUNK_SIZE must be at least 1",
            ));
        }

        Ok(Self {
            home,
            oauth_keys_path,
            token_url: optional_env("MAIL_AGENT_TOKEN_URL")?
                .unwrap_or_else(|| DEFAULT_TOKEN_URL.to_owned()),
            batch_chunk_size,
            batch_item_timeout_ms: parse_u64_env(
                "MAIL_AGENT_BATCH_ITEM_TIMEOUT_MS",
                DEFAULT_BATCH_ITEM_TIMEOUT_MS,
            )?,
            http_timeout_ms: parse_u64_env("MAIL_AGENT_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS)?,
        })
    }

    /// Build a configuration rooted at `home` with default settings
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            oauth_keys_path: home.join(OAUTH_KEYS_FILE),
            home,
            token_url: DEFAULT_TOKEN_URL.to_owned(),
            batch_chunk_size: DEFAULT_BATCH_CHUNK_SIZE,
            batch_item_timeout_ms: DEFAULT_BATCH_ITEM_TIMEOUT_MS,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

const NO_INSTALL_DIR: &str = "executable has no parent directory; set MAIL_AGENT_HOME";

/// Directory containing the running executable
fn install_dir() -> AppResult<PathBuf> {
    let exe = env::current_exe()
        .map_err(|e| AppError::Internal(format!("cannot locate executable: {e}")))?;
    exe.parent()
        .map(PathBuf::from)
        .ok_or_else(|| AppError::Internal(NO_INSTALL_DIR.to_owned()))
}

/// Read an optional environment variable, treating blank values as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v.trim().to_owned())),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match optional_env(key)? {
        Some(v) => parse_number(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a `usize` environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but not a valid `usize`.
fn parse_usize_env(key: &str, default: usize) -> AppResult<usize> {
    match optional_env(key)? {
        Some(v) => parse_number(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid usize environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

/// Parse a decimal number, allowing `_` digit separators
fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.replace('_', "").parse::<T>().ok()
}
