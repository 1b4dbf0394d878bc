//! Delegated sign-in and token management.
//!
//! [`AuthManager`] owns the per-profile token cache and implements
//! [`TokenProvider`], the seam the mailbox client pulls bearer tokens from.

pub mod flow;
pub mod store;

use std::path::Path;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use flow::IdentityEndpoint;
pub use store::{StoredToken, TokenStore};

use crate::config::Config;
use crate::error::{GraphMailError, Result};

/// Tokens with less than this many seconds left are refreshed.
const REFRESH_MARGIN_SECS: i64 = 300;

/// Identity of the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Stable `<oid>.<tid>` identifier; part of every sync stream key.
    pub home_account_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Source of bearer tokens for the mailbox API.
pub trait TokenProvider {
    /// A valid access token, refreshed silently if needed.
    fn access_token(&self) -> Result<String>;

    /// The cached account for the active profile.
    fn account(&self) -> Result<AccountInfo>;
}

/// Interactive sign-in method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LoginMethod {
    /// Authorization code with PKCE through a loopback redirect.
    #[default]
    Browser,
    /// Device-code grant; works without a local browser.
    Device,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Device => "device",
        }
    }
}

/// Report produced by `auth status`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub profile: String,
    pub configured: bool,
    pub tenant_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub token_store_backend: String,
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Result of a successful `auth login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub profile: String,
    pub method: String,
    pub account: AccountInfo,
    pub expires_on: String,
    pub scopes: Vec<String>,
    pub token_store_backend: String,
}

/// Token lifecycle for one profile.
pub struct AuthManager {
    profile: String,
    client_id: Option<String>,
    tenant_id: String,
    redirect_uri: String,
    scopes: Vec<String>,
    authority_host: String,
    store: TokenStore,
}

impl AuthManager {
    /// Manager for the profile named in `config`, caching tokens under `token_dir`.
    pub fn new(config: &Config, token_dir: &Path) -> Self {
        Self {
            profile: config.general.profile.clone(),
            client_id: config.require_client_id().ok().map(str::to_string),
            tenant_id: config.auth.tenant_id.clone(),
            redirect_uri: config.auth.redirect_uri.clone(),
            scopes: config.auth.scopes.clone(),
            authority_host: config.auth.authority_host.clone(),
            store: TokenStore::new(token_dir, &config.general.profile),
        }
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    fn endpoint(&self) -> Result<IdentityEndpoint> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| GraphMailError::Config("OUTLOOK_CLIENT_ID is required".to_string()))?;
        Ok(IdentityEndpoint::new(
            &self.authority_host,
            &self.tenant_id,
            client_id,
            &self.scopes,
        ))
    }

    /// Cached token, refreshed if it expires within the margin.
    fn fresh_token(&self) -> Result<StoredToken> {
        let cached = self.store.load()?.ok_or_else(|| {
            GraphMailError::Auth(format!(
                "No cached account for profile '{}'. Run auth login first.",
                self.profile
            ))
        })?;

        if cached.expires_at - Utc::now().timestamp() > REFRESH_MARGIN_SECS {
            return Ok(cached);
        }

        let silent_failure = || {
            GraphMailError::Auth(
                "Could not acquire access token silently. Run auth login to refresh consent."
                    .to_string(),
            )
        };
        let refresh_token = cached.refresh_token.as_deref().ok_or_else(silent_failure)?;
        let grant = self.endpoint()?.refresh(refresh_token).map_err(|e| {
            warn!(profile = %self.profile, error = %e, "Silent token refresh failed");
            silent_failure()
        })?;

        let refreshed = StoredToken {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: Utc::now().timestamp() + grant.expires_in,
            scope: if grant.scope.is_empty() {
                cached.scope
            } else {
                grant.scope
            },
            account: cached.account,
        };
        self.store.save(&refreshed)?;
        info!(profile = %self.profile, "Access token refreshed");
        Ok(refreshed)
    }

    /// Sign in interactively and cache the resulting tokens.
    ///
    /// `notify` receives the instructions the user must follow.
    pub fn login(&self, method: LoginMethod, notify: &dyn Fn(&str)) -> Result<LoginResult> {
        let endpoint = self.endpoint()?;
        let grant = match method {
            LoginMethod::Device => endpoint.device_code_login(notify)?.0,
            LoginMethod::Browser => endpoint.browser_login(&self.redirect_uri, notify)?,
        };

        let claims = grant
            .id_token
            .as_deref()
            .and_then(flow::decode_id_token_claims)
            .ok_or_else(|| GraphMailError::Auth("Sign-in returned no usable ID token".into()))?;
        let account = flow::account_from_claims(&claims)?;

        let token = StoredToken {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: Utc::now().timestamp() + grant.expires_in,
            scope: grant.scope,
            account: account.clone(),
        };
        self.store.save(&token)?;
        info!(profile = %self.profile, method = method.as_str(), "Signed in");

        Ok(LoginResult {
            profile: self.profile.clone(),
            method: method.as_str().to_string(),
            account,
            expires_on: epoch_to_iso(token.expires_at),
            scopes: self.scopes.clone(),
            token_store_backend: self.store.backend_name().to_string(),
        })
    }

    /// Report configuration and sign-in state. Never fails on a missing login.
    pub fn status(&self) -> AuthStatus {
        let mut status = AuthStatus {
            profile: self.profile.clone(),
            configured: self.client_id.is_some(),
            tenant_id: self.tenant_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
            token_store_backend: self.store.backend_name().to_string(),
            authenticated: false,
            account: None,
            expires_on: None,
            message: None,
        };

        if !status.configured {
            status.message = Some("OUTLOOK_CLIENT_ID is not set".to_string());
            return status;
        }

        let cached = match self.store.load() {
            Ok(Some(token)) => token,
            Ok(None) => {
                status.message = Some("No cached account for this profile".to_string());
                return status;
            }
            Err(e) => {
                status.message = Some(e.to_string());
                return status;
            }
        };
        status.account = Some(cached.account);

        match self.fresh_token() {
            Ok(token) => {
                status.authenticated = true;
                status.expires_on = Some(epoch_to_iso(token.expires_at));
            }
            Err(_) => {
                status.message =
                    Some("Cached account exists but token refresh failed; run auth login".into());
            }
        }
        status
    }

    /// Remove the cached tokens for this profile.
    pub fn logout(&self) -> Result<serde_json::Value> {
        let removed = self.store.delete()?;
        info!(profile = %self.profile, removed, "Logged out");
        Ok(serde_json::json!({
            "profile": self.profile,
            "logged_out": true,
            "removed_accounts": usize::from(removed),
            "token_store_backend": self.store.backend_name(),
        }))
    }
}

impl TokenProvider for AuthManager {
    fn access_token(&self) -> Result<String> {
        Ok(self.fresh_token()?.access_token)
    }

    fn account(&self) -> Result<AccountInfo> {
        self.store
            .load()?
            .map(|token| token.account)
            .ok_or_else(|| {
                GraphMailError::Auth(
                    "No authenticated account found for this profile. Run auth login first."
                        .to_string(),
                )
            })
    }
}

fn epoch_to_iso(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

// ── Onboarding ──────────────────────────────────────────────────

/// Deterministic setup steps for a first-time user.
#[derive(Debug, Clone, Serialize)]
pub struct OnboardingPlan {
    pub profile: String,
    pub config: OnboardingConfig,
    pub questions_for_user: Vec<String>,
    pub required_user_actions: Vec<String>,
    pub agent_next_steps: Vec<String>,
    pub login_command: String,
    pub status_command: String,
    pub first_mail_command: String,
    pub ready_for_login: bool,
    pub already_authenticated: bool,
    pub status: Option<AuthStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingConfig {
    pub client_id_configured: bool,
    pub tenant_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

/// Build the onboarding plan for `config`.
///
/// `tenant_chosen` is false when the tenant is still the implicit default,
/// which adds a question for the user.
pub fn onboarding_plan(
    config: &Config,
    token_dir: &Path,
    method: LoginMethod,
    tenant_chosen: bool,
) -> OnboardingPlan {
    let profile = config.general.profile.clone();
    let client_id = config.require_client_id().ok().map(str::to_string);
    let tenant_id = config.auth.tenant_id.clone();
    let redirect_uri = config.auth.redirect_uri.clone();
    let scopes = config.auth.scopes.clone();

    let mut questions = Vec::new();
    if client_id.is_none() {
        questions.push(
            "Please share your Microsoft Entra Application (client) ID for the Outlook app registration."
                .to_string(),
        );
    }
    if !tenant_chosen {
        questions.push(
            "Should we use tenant mode 'common' (multi-tenant/personal) or a specific tenant ID?"
                .to_string(),
        );
    }

    let mut actions = vec![
        "In Entra App Registration > Authentication, add platform 'Mobile and desktop applications'.".to_string(),
        format!("Set redirect URI to {redirect_uri}."),
        "Enable 'Allow public client flows'.".to_string(),
        format!(
            "In API permissions, grant delegated permissions: {}.",
            scopes.join(", ")
        ),
        "Run login command and complete browser sign-in/consent once.".to_string(),
    ];
    if tenant_id == "common" {
        actions.insert(
            0,
            "Ensure app account type supports multi-tenant/personal access when using tenant_id=common.".to_string(),
        );
    }

    let env_prefix = format!(
        "OUTLOOK_CLIENT_ID=\"{}\" OUTLOOK_TENANT_ID=\"{tenant_id}\" OUTLOOK_REDIRECT_URI=\"{redirect_uri}\" OUTLOOK_SCOPES=\"{}\" ",
        client_id.as_deref().unwrap_or("<CLIENT_ID>"),
        scopes.join(" "),
    );

    let status = client_id
        .as_ref()
        .map(|_| AuthManager::new(config, token_dir).status());
    let already_authenticated = status.as_ref().is_some_and(|s| s.authenticated);

    OnboardingPlan {
        config: OnboardingConfig {
            client_id_configured: client_id.is_some(),
            tenant_id,
            redirect_uri,
            scopes,
        },
        questions_for_user: questions,
        required_user_actions: actions,
        agent_next_steps: vec![
            "Collect any missing fields from questions_for_user.".to_string(),
            "Share required_user_actions with the user in concise bullets.".to_string(),
            "Run login_command and wait for user to complete browser/device consent.".to_string(),
            "Run status_command and confirm authenticated=true before any mail operations."
                .to_string(),
        ],
        login_command: format!(
            "{env_prefix}graphmail auth login --method {} --profile {profile}",
            method.as_str()
        ),
        status_command: format!("{env_prefix}graphmail auth status --profile {profile}"),
        first_mail_command: format!(
            "{env_prefix}graphmail mail list --folder inbox --unread-only --top 10 --profile {profile}"
        ),
        ready_for_login: client_id.is_some(),
        already_authenticated,
        status,
        profile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_client() -> Config {
        let mut cfg = Config::default();
        cfg.auth.client_id = Some("client-1".into());
        cfg
    }

    fn cached(expires_at: i64) -> StoredToken {
        StoredToken {
            access_token: "cached-token".into(),
            refresh_token: None,
            expires_at,
            scope: String::new(),
            account: AccountInfo {
                home_account_id: "oid.tid".into(),
                username: Some("me@example.com".into()),
                name: None,
            },
        }
    }

    #[test]
    fn test_access_token_requires_login() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AuthManager::new(&config_with_client(), tmp.path());
        let err = manager.access_token().unwrap_err();
        assert_eq!(err.kind(), "AuthError");
        assert!(err.to_string().contains("Run auth login first"));
    }

    #[test]
    fn test_valid_cached_token_is_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AuthManager::new(&config_with_client(), tmp.path());
        manager
            .store()
            .save(&cached(Utc::now().timestamp() + 3600))
            .unwrap();

        assert_eq!(manager.access_token().unwrap(), "cached-token");
        assert_eq!(manager.account().unwrap().home_account_id, "oid.tid");
        let status = manager.status();
        assert!(status.authenticated);
        assert!(status.expires_on.is_some());
    }

    #[test]
    fn test_expiring_token_without_refresh_token_fails_silently() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AuthManager::new(&config_with_client(), tmp.path());
        manager
            .store()
            .save(&cached(Utc::now().timestamp() + 60))
            .unwrap();

        let err = manager.access_token().unwrap_err();
        assert!(err.to_string().contains("Could not acquire access token silently"));

        let status = manager.status();
        assert!(!status.authenticated);
        assert!(status.account.is_some());
    }

    #[test]
    fn test_status_without_client_id() {
        let tmp = tempfile::tempdir().unwrap();
        let status = AuthManager::new(&Config::default(), tmp.path()).status();
        assert!(!status.configured);
        assert!(!status.authenticated);
        assert_eq!(status.message.as_deref(), Some("OUTLOOK_CLIENT_ID is not set"));
    }

    #[test]
    fn test_logout_removes_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = AuthManager::new(&config_with_client(), tmp.path());
        manager.store().save(&cached(0)).unwrap();
        assert_eq!(manager.logout().unwrap()["removed_accounts"], 1);
        assert_eq!(manager.logout().unwrap()["removed_accounts"], 0);
    }

    #[test]
    fn test_onboarding_plan_asks_for_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = onboarding_plan(&Config::default(), tmp.path(), LoginMethod::Browser, false);
        assert!(!plan.ready_for_login);
        assert_eq!(plan.questions_for_user.len(), 2);
        assert!(plan.login_command.contains("<CLIENT_ID>"));
        assert!(plan.required_user_actions[0].contains("multi-tenant"));
        assert!(plan.status.is_none());

        let plan = onboarding_plan(&config_with_client(), tmp.path(), LoginMethod::Device, true);
        assert!(plan.ready_for_login);
        assert!(plan.questions_for_user.is_empty());
        assert!(plan.login_command.contains("--method device"));
        assert!(!plan.already_authenticated);
    }
}
