//! `mail-agent`: manage the identities of the mailbox agent
//!
//! Thin command-line surface over the credential store and identity
//! resolver. Results are printed as JSON on stdout; diagnostics go to
//! stderr so the output can be piped.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mail_agent::consent::TokenFileConsent;
use mail_agent::oauth::HttpTokenEndpoint;
use mail_agent::resolver::IdentityResolver;
use mail_agent::store::CredentialStore;
use mail_agent::{AgentConfig, AppError, AppResult};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mail-agent", version, about = "Manage mailbox agent identities")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered accounts and the default
    List,
    /// Register an account from a pre-issued refresh token
    Add {
        account: String,
        /// JSON file with `refresh_token` (and optionally client credentials)
        #[arg(long)]
        token_file: PathBuf,
    },
    /// Remove an account and delete its stored credential
    Remove { account: String },
    /// Make an account the default
    SetDefault { account: String },
    /// Replace the stored credential of an account
    Reauth {
        account: String,
        #[arg(long)]
        token_file: PathBuf,
    },
    /// Resolve which account an operation would run as
    Resolve {
        #[arg(long)]
        account: Option<String>,
    },
    /// Show where state is stored
    Path,
}

/// Application entry point
///
/// # Environment Variables
///
/// See [`AgentConfig::load_from_env`] for configuration options. Log
/// verbosity follows `RUST_LOG`.
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error[{}]: {e}", e.code());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> AppResult<String> {
    let config = AgentConfig::load_from_env()?;
    let endpoint = HttpTokenEndpoint::new(config.token_url.clone(), config.http_timeout_ms)?;
    let store = Arc::new(CredentialStore::new(&config, Arc::new(endpoint)));

    let value = match command {
        Command::List => json!({
            "accounts": store.list_identities().await?,
            "default_account": store.get_default().await?,
        }),
        Command::Add {
            account,
            token_file,
        } => {
            let identity = store
                .add_identity(&account, &TokenFileConsent::new(token_file))
                .await?;
            json!({ "added": identity })
        }
        Command::Remove { account } => {
            let new_default = store.remove_identity(&account).await?;
            json!({ "removed": account, "default_account": new_default })
        }
        Command::SetDefault { account } => {
            store.set_default(&account).await?;
            json!({ "default_account": account })
        }
        Command::Reauth {
            account,
            token_file,
        } => {
            store
                .reauthenticate(&account, &TokenFileConsent::new(token_file))
                .await?;
            json!({ "reauthenticated": account })
        }
        Command::Resolve { account } => {
            let handle = IdentityResolver::new(Arc::clone(&store))
                .resolve(account.as_deref())
                .await?;
            json!({ "account_id": handle.account_id() })
        }
        Command::Path => json!({
            "home": store.home(),
            "registry": store.registry_path(),
            "credentials": store.credentials_dir(),
            "oauth_keys": config.oauth_keys_path,
        }),
    };

    serde_json::to_string_pretty(&value)
        .map_err(|e| AppError::Internal(format!("failed to serialize output: {e}")))
}
