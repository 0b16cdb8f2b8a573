//! Filesystem path classification
//!
//! Every attachment source path is classified before it is opened, and every
//! download destination is classified before it is written. Classification
//! runs on the fully resolved absolute path, so `..` segments and `~` cannot
//! be used to reach a blocked location. Resolution is lexical and does not
//! follow symlinks.

use std::path::{Component, Path, PathBuf};

use regex::Regex;

use crate::errors::{AppError, AppResult};

/// Directory names that hold keys, cloud credentials or VCS metadata
const SENSITIVE_DIRS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    ".git",
    ".password-store",
];

/// File name patterns for shell/env files and generic credential stores
const SENSITIVE_NAME_PATTERNS: &[&str] = &[
    r"(?i)^\.env(\..+)?$",
    r"(?i)^\.(bashrc|bash_profile|bash_login|bash_history|zshrc|zprofile|zsh_history|profile|netrc|npmrc|pypirc|pgpass|git-credentials)$",
    r"(?i)^id_(rsa|dsa|ecdsa|ed25519)(\.pub)?$",
    r"(?i)^(credentials|tokens?|secrets?|client_secrets?)(\.[a-z0-9]+)?$",
    r"(?i)^client_secret.*\.json$",
    r"(?i)\.keys\.json$",
    r"(?i)\.(pem|p12|pfx|jks|keystore)$",
];

/// Root-level system locations that are never read or written
const SYSTEM_PREFIXES: &[&str] = &[
    "/etc",
    "/proc",
    "/sys",
    "/boot",
    "/dev",
    "/run/secrets",
    "/var/run/secrets",
];

/// Result of classifying a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    /// The path may be read or written
    Allowed,
    /// The path is vetoed; the reason names the offending path only
    Blocked(String),
}

impl PathVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Path guard bound to the active credential-storage root
#[derive(Debug, Clone)]
pub struct PathGuard {
    credential_root: PathBuf,
    sensitive_names: Vec<Regex>,
}

impl PathGuard {
    /// Create a guard that additionally blocks everything under `credential_root`
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the root cannot be resolved or a built-in
    /// pattern fails to compile.
    pub fn new(credential_root: impl AsRef<Path>) -> AppResult<Self> {
        let sensitive_names = SENSITIVE_NAME_PATTERNS
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| AppError::Internal(format!("invalid path pattern {p}: {e}")))
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            credential_root: resolve_path(credential_root.as_ref())?,
            sensitive_names,
        })
    }

    /// Resolved credential-storage root this guard protects
    pub fn credential_root(&self) -> &Path {
        &self.credential_root
    }

    /// Classify a path as allowed or blocked
    ///
    /// Pure function of the resolved absolute path. A path that cannot be
    /// resolved at all is blocked.
    pub fn classify(&self, path: &Path) -> PathVerdict {
        let resolved = match resolve_path(path) {
            Ok(p) => p,
            Err(_) => return PathVerdict::Blocked(format!("cannot resolve {}", path.display())),
        };
        self.classify_resolved(&resolved)
    }

    fn classify_resolved(&self, resolved: &Path) -> PathVerdict {
        let blocked =
            || PathVerdict::Blocked(format!("{} is a protected location", resolved.display()));

        if resolved.starts_with(&self.credential_root) {
            return PathVerdict::Blocked(format!(
                "{} is inside the credential storage directory",
                resolved.display()
            ));
        }
        if SYSTEM_PREFIXES.iter().any(|p| resolved.starts_with(p)) {
            return blocked();
        }

        let names: Vec<&str> = resolved
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        for (idx, name) in names.iter().enumerate() {
            let lower = name.to_ascii_lowercase();
            if SENSITIVE_DIRS.contains(&lower.as_str()) {
                return blocked();
            }
            if lower == "gcloud" && idx > 0 && names[idx - 1].eq_ignore_ascii_case(".config") {
                return blocked();
            }
            if self.sensitive_names.iter().any(|re| re.is_match(name)) {
                return blocked();
            }
        }
        PathVerdict::Allowed
    }

    /// Classify and convert a veto into a hard `SecurityBlocked` error
    ///
    /// Returns the resolved absolute path on success so callers open exactly
    /// what was classified.
    pub fn ensure_allowed(&self, path: &Path) -> AppResult<PathBuf> {
        let resolved = resolve_path(path)?;
        match self.classify_resolved(&resolved) {
            PathVerdict::Allowed => Ok(resolved),
            PathVerdict::Blocked(reason) => Err(AppError::SecurityBlocked(reason)),
        }
    }

    /// Resolve a download destination from a directory and a file name
    ///
    /// The file name must be a single path segment. The joined destination is
    /// classified before being returned.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the file name is empty, contains separators or
    ///   control characters, or is `.`/`..`
    /// - `SecurityBlocked` if the destination is vetoed
    pub fn resolve_download_path(&self, dir: &Path, file_name: &str) -> AppResult<PathBuf> {
        let name = file_name.trim();
        if name.is_empty() || name == "." || name == ".." {
            return Err(AppError::invalid("download file name is empty or invalid"));
        }
        if name.contains(['/', '\\']) || name.chars().any(|c| c.is_control()) {
            return Err(AppError::invalid(format!(
                "download file name '{}' must not contain path separators or control characters",
                name.escape_debug()
            )));
        }
        self.ensure_allowed(&dir.join(name))
    }
}

/// Resolve a path to an absolute, lexically normalized form
///
/// Expands a leading `~` to `$HOME`, anchors relative paths at the current
/// directory and folds `.`/`..` segments without touching the filesystem.
pub fn resolve_path(path: &Path) -> AppResult<PathBuf> {
    let expanded = expand_home(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|e| AppError::Internal(format!("cannot read current directory: {e}")))?
            .join(expanded)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(s) => out.push(s),
        }
    }
    Ok(out)
}

fn expand_home(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            match std::env::var_os("HOME").filter(|h| !h.is_empty()) {
                Some(home) => PathBuf::from(home).join(components.as_path()),
                None => path.to_path_buf(),
            }
        }
        _ => path.to_path_buf(),
    }
}

/// Display-friendly file name of a path, if any
pub fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().and_then(|s| s.to_str()).map(str::to_owned)
}
