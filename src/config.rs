//! Application configuration.
//!
//! Settings are layered, highest priority first:
//! 1. Explicit CLI arguments (applied by the binary)
//! 2. Environment variables (`OUTLOOK_*`, see [`Config::apply_env`])
//! 3. A TOML file at `$GRAPHMAIL_CONFIG` or
//!    `~/.config/graphmail/config.toml` (Linux/macOS),
//!    `%APPDATA%\graphmail\config.toml` (Windows)
//! 4. Built-in defaults
//!
//! The resolved [`Config`] is built once at startup and passed by
//! reference; nothing below `main` reads the environment directly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraphMailError, Result};

/// Scopes requested when none are configured.
pub const DEFAULT_SCOPES: &[&str] = &["User.Read", "Mail.ReadWrite", "Mail.Send"];

/// OIDC scopes the identity service adds on its own; never requested explicitly.
const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Identity service settings.
    pub auth: AuthConfig,
    /// Mailbox API transport settings.
    pub graph: GraphConfig,
    /// Local directories for state, tokens, downloads and logs.
    pub storage: StorageConfig,
    /// Defaults for the attachment sync commands.
    pub sync: SyncConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Profile name; isolates tokens and sync streams.
    pub profile: String,
    /// Output format: "json" or "text".
    pub format: String,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Identity service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Application (client) id of the app registration.
    pub client_id: Option<String>,
    /// Tenant id, or "common" for multi-tenant and personal accounts.
    pub tenant_id: String,
    /// Redirect URI registered for the public client.
    pub redirect_uri: String,
    /// Delegated scopes to request.
    pub scopes: Vec<String>,
    /// Identity service host.
    pub authority_host: String,
}

/// Mailbox API transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Base URL of the Graph API.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Extra attempts for transient statuses (429, 5xx).
    pub max_retries: u32,
    /// Largest attachment body accepted, in bytes.
    pub max_download_bytes: u64,
}

/// Local directories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Override the sync state directory.
    pub state_dir: Option<PathBuf>,
    /// Override the token cache directory.
    pub token_dir: Option<PathBuf>,
    /// Default download directory.
    pub output_dir: Option<PathBuf>,
    /// Override the cache directory used for logs.
    pub cache_dir: Option<PathBuf>,
}

/// Defaults for the attachment sync commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Hours subtracted from the cursor on incremental runs.
    pub overlap_hours: i64,
    /// Page cap for incremental scans.
    pub max_pages: usize,
    /// Message cap for incremental scans.
    pub max_messages: usize,
    /// Messages considered by `download-recent`.
    pub recent_top: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            format: "json".to_string(),
            log_level: "warn".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            tenant_id: "common".to_string(),
            redirect_uri: "http://localhost:8765".to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            authority_host: "https://login.microsoftonline.com".to_string(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com/v1.0".to_string(),
            timeout_secs: 30,
            max_retries: 2,
            max_download_bytes: 150 * 1024 * 1024, // 150 MB
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            overlap_hours: 48,
            max_pages: 20,
            max_messages: 1000,
            recent_top: 10,
        }
    }
}

// ── Layering ────────────────────────────────────────────────────

impl Config {
    /// Apply `OUTLOOK_*` environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides from an arbitrary lookup.
    ///
    /// Blank values are ignored so an exported-but-empty variable does not
    /// wipe a configured value.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("OUTLOOK_PROFILE") {
            self.general.profile = v;
        }
        if let Some(v) = get("OUTLOOK_CLIENT_ID") {
            self.auth.client_id = Some(v);
        }
        if let Some(v) = get("OUTLOOK_TENANT_ID") {
            self.auth.tenant_id = v;
        }
        if let Some(v) = get("OUTLOOK_REDIRECT_URI") {
            self.auth.redirect_uri = v;
        }
        if let Some(v) = get("OUTLOOK_SCOPES") {
            self.auth.scopes = normalize_scopes(Some(&v));
        }
        if let Some(v) = get("OUTLOOK_STATE_DIR") {
            self.storage.state_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("OUTLOOK_OUTPUT_DIR") {
            self.storage.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("OUTLOOK_TOKEN_CACHE_DIR") {
            self.storage.token_dir = Some(PathBuf::from(v));
        }
    }

    /// Reject invalid settings before any network call.
    ///
    /// Also normalizes the profile and scope list in place.
    pub fn validate(&mut self) -> Result<()> {
        self.general.format = self.general.format.trim().to_lowercase();
        if !matches!(self.general.format.as_str(), "json" | "text") {
            return Err(GraphMailError::Config(
                "--format must be one of: json, text".to_string(),
            ));
        }

        let profile = self.general.profile.trim();
        self.general.profile = if profile.is_empty() {
            "default".to_string()
        } else {
            profile.to_string()
        };

        if self.auth.tenant_id.trim().is_empty() {
            self.auth.tenant_id = "common".to_string();
        }
        let joined = self.auth.scopes.join(" ");
        self.auth.scopes = normalize_scopes(Some(&joined));

        if self.graph.base_url.trim().is_empty() {
            return Err(GraphMailError::Config(
                "graph.base_url cannot be empty".to_string(),
            ));
        }
        if self.sync.max_pages == 0 || self.sync.max_messages == 0 || self.sync.recent_top == 0 {
            return Err(GraphMailError::Config(
                "sync.max_pages, sync.max_messages and sync.recent_top must be greater than 0"
                    .to_string(),
            ));
        }
        if !(0..=crate::sync::MAX_OVERLAP_HOURS).contains(&self.sync.overlap_hours) {
            return Err(GraphMailError::Config(format!(
                "sync.overlap_hours must be between 0 and {}",
                crate::sync::MAX_OVERLAP_HOURS
            )));
        }
        Ok(())
    }

    /// Client id, or a configuration error naming the variable to set.
    pub fn require_client_id(&self) -> Result<&str> {
        self.auth
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GraphMailError::Config("OUTLOOK_CLIENT_ID is required".to_string()))
    }
}

/// Split a comma/space separated scope list, dropping reserved OIDC scopes
/// and case-insensitive duplicates. Falls back to [`DEFAULT_SCOPES`].
pub fn normalize_scopes(raw: Option<&str>) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for chunk in raw.unwrap_or_default().replace(',', " ").split_whitespace() {
        let lowered = chunk.to_lowercase();
        if RESERVED_SCOPES.contains(&lowered.as_str()) || seen.contains(&lowered) {
            continue;
        }
        seen.push(lowered);
        scopes.push(chunk.to_string());
    }

    if scopes.is_empty() {
        DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
    } else {
        scopes
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config(explicit: Option<&Path>) -> Config {
    let path = explicit.map(Path::to_path_buf).or_else(config_file_path);
    if let Some(path) = path {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("GRAPHMAIL_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("graphmail").join("config.toml"))
}

/// Directory holding one subdirectory per sync stream.
pub fn state_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.storage.state_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("graphmail")
        .join("state")
}

/// Directory holding per-profile token caches.
pub fn token_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.storage.token_dir {
        return dir.clone();
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("graphmail")
        .join("tokens")
}

/// Download directory: explicit argument, then config/env, then `./outlook_downloads`.
pub fn output_dir(config: &Config, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| config.storage.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("./outlook_downloads"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.storage.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("graphmail")
}
