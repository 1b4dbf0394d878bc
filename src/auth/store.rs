//! Per-profile token cache on disk.
//!
//! One JSON file per profile under the token directory. Writes go to a
//! temporary file that is renamed over the target, with owner-only
//! permissions on Unix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::AccountInfo;
use crate::error::{GraphMailError, Result};

/// Cached tokens for one signed-in account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry as a Unix timestamp (seconds).
    pub expires_at: i64,
    /// Space-separated granted scopes.
    #[serde(default)]
    pub scope: String,
    pub account: AccountInfo,
}

/// File-backed token cache for a single profile.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Token store for `profile` inside `base_dir`.
    pub fn new(base_dir: &Path, profile: &str) -> Self {
        Self {
            path: base_dir.join(format!("{}.json", sanitize_profile(profile))),
        }
    }

    /// Location of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name of the storage backend, reported by `auth status`.
    pub fn backend_name(&self) -> &'static str {
        "file"
    }

    /// Load the cached token. A corrupt cache is treated as absent.
    pub fn load(&self) -> Result<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| GraphMailError::io(&self.path, e))?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<StoredToken>(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt token cache");
                Ok(None)
            }
        }
    }

    /// Persist the token atomically.
    pub fn save(&self, token: &StoredToken) -> Result<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|e| GraphMailError::io(dir, e))?;
        restrict_permissions(dir, 0o700);

        let content = serde_json::to_string(token)
            .map_err(|e| GraphMailError::Auth(format!("Failed to serialize token cache: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| GraphMailError::io(&tmp, e))?;
            restrict_permissions(&tmp, 0o600);
            file.write_all(content.as_bytes())
                .map_err(|e| GraphMailError::io(&tmp, e))?;
            file.sync_all().map_err(|e| GraphMailError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| GraphMailError::io(&self.path, e))?;
        debug!(path = %self.path.display(), "Token cache saved");
        Ok(())
    }

    /// Remove the cache file. Returns `true` if one existed.
    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GraphMailError::io(&self.path, e)),
        }
    }
}

/// Restrict a profile name to `[A-Za-z0-9._-]`; blank becomes `default`.
pub fn sanitize_profile(profile: &str) -> String {
    let safe: String = profile
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let safe = safe.trim_matches(|c| c == '.' || c == '_');
    if safe.is_empty() {
        "default".to_string()
    } else {
        safe.to_string()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        debug!(path = %path.display(), error = %e, "Could not tighten permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredToken {
        StoredToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: 1_700_000_000,
            scope: "Mail.Read".into(),
            account: AccountInfo {
                home_account_id: "oid.tid".into(),
                username: Some("me@example.com".into()),
                name: None,
            },
        }
    }

    #[test]
    fn test_sanitize_profile() {
        assert_eq!(sanitize_profile("work"), "work");
        assert_eq!(sanitize_profile("my profile/1"), "my_profile_1");
        assert_eq!(sanitize_profile("  "), "default");
        assert_eq!(sanitize_profile("..__"), "default");
    }

    #[test]
    fn test_save_load_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&tmp.path().join("tokens"), "work");
        assert!(store.load().unwrap().is_none());

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        assert!(!store.path().with_extension("tmp").exists());

        assert!(store.delete().unwrap());
        assert!(!store.delete().unwrap());
    }

    #[test]
    fn test_corrupt_cache_is_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::new(tmp.path(), "p");
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let store = TokenStore::new(tmp.path(), "p");
        store.save(&sample()).unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
}
