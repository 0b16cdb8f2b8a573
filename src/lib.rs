//! mail-agent-rs: multi-identity mailbox agent core
//!
//! Manages several remote mailbox accounts side by side, each with its own
//! isolated OAuth credential, and exposes mailbox operations that accept an
//! optional identity hint with uniform fallback to a default identity.
//! Outbound messages are assembled with header sanitization and every local
//! file access is vetted by a path guard.
//!
//! # Architecture
//!
//! - [`config`]: Environment-driven configuration and persisted-state home
//! - [`errors`]: Application error model with stable error codes
//! - [`path_guard`]: Sensitive-location and credential-root path veto
//! - [`oauth`]: Credential bundles, token refresh and refreshing handles
//! - [`consent`]: Consent-flow boundary and client registration document
//! - [`store`]: Identity registry and per-identity credential namespaces
//! - [`resolver`]: Optional identity hint to credential handle
//! - [`compose`]: Secure outbound message builder
//! - [`mime`]: Remote message parsing and attachment extraction
//! - [`batch`]: Chunked batch execution with per-item outcomes
//! - [`remote`]: Remote mailbox collaborator boundary
//! - [`agent`]: Mailbox operations façade

pub mod agent;
pub mod batch;
pub mod compose;
pub mod config;
pub mod consent;
pub mod errors;
pub mod mime;
pub mod oauth;
pub mod path_guard;
pub mod remote;
pub mod resolver;
pub mod store;

pub use agent::MailAgent;
pub use config::AgentConfig;
pub use errors::{AppError, AppResult};
