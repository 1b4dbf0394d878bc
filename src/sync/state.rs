//! Versioned per-stream state document.
//!
//! Loading merges the stored object onto defaults, so documents written by
//! older versions (or missing fields) load cleanly. Unknown fields are kept
//! and written back. Saving replaces the whole file via rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::stream::StreamIdentity;
use super::{iso_utc, parse_utc, STATE_VERSION};
use crate::error::{GraphMailError, Result};

/// A failed attachment fetch carried across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingFailure {
    pub message_id: String,
    pub attachment_id: String,
    /// Number of failed attempts so far.
    pub attempts: u32,
    pub last_error: String,
    pub last_attempt_utc: Option<String>,
}

/// Contents of `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamState {
    pub version: u32,
    pub profile: String,
    pub account_home_id: String,
    pub folder_id: String,
    pub folder_path: Option<String>,
    /// Gates the first-run backfill window.
    pub first_run_completed: bool,
    /// Latest observed receive time, ISO-8601 UTC.
    pub cursor_received_utc: Option<String>,
    pub last_run_started_utc: Option<String>,
    pub last_run_completed_utc: Option<String>,
    /// Keyed by dedupe key.
    #[serde(deserialize_with = "lenient_pending")]
    pub pending_failures: BTreeMap<String, PendingFailure>,
    pub downloaded_total: u64,
    pub skipped_total: u64,
    pub failed_total: u64,
    /// Fields written by other versions, preserved on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            profile: String::new(),
            account_home_id: String::new(),
            folder_id: String::new(),
            folder_path: None,
            first_run_completed: false,
            cursor_received_utc: None,
            last_run_started_utc: None,
            last_run_completed_utc: None,
            pending_failures: BTreeMap::new(),
            downloaded_total: 0,
            skipped_total: 0,
            failed_total: 0,
            extra: Map::new(),
        }
    }
}

impl StreamState {
    /// Fresh state for a stream that has never run.
    pub fn new(identity: &StreamIdentity) -> Self {
        let mut state = Self::default();
        state.apply_identity(identity);
        state
    }

    /// Overwrite the denormalized identity fields.
    ///
    /// A known folder path replaces the stored one; an unknown path keeps it.
    pub fn apply_identity(&mut self, identity: &StreamIdentity) {
        self.version = STATE_VERSION;
        self.profile = identity.profile.clone();
        self.account_home_id = identity.account_home_id.clone();
        self.folder_id = identity.folder_id.clone();
        if identity.folder_path.is_some() {
            self.folder_path = identity.folder_path.clone();
        }
    }

    /// Parsed cursor; an unparseable value counts as absent.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        parse_utc(self.cursor_received_utc.as_deref())
    }

    /// Register a failure, incrementing the attempt count of an existing entry.
    pub fn record_failure(
        &mut self,
        dedupe_key: &str,
        message_id: &str,
        attachment_id: &str,
        error: &str,
        attempted_at: DateTime<Utc>,
    ) {
        let attempts = self
            .pending_failures
            .get(dedupe_key)
            .map_or(0, |p| p.attempts)
            + 1;
        self.pending_failures.insert(
            dedupe_key.to_string(),
            PendingFailure {
                message_id: message_id.to_string(),
                attachment_id: attachment_id.to_string(),
                attempts,
                last_error: error.to_string(),
                last_attempt_utc: Some(iso_utc(attempted_at)),
            },
        );
    }

    /// Drop the pending entry for `dedupe_key`, if any.
    pub fn clear_failure(&mut self, dedupe_key: &str) {
        self.pending_failures.remove(dedupe_key);
    }
}

/// Accept any shape for `pending_failures`: non-objects become empty and
/// malformed entries are dropped.
fn lenient_pending<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, PendingFailure>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    let Value::Object(entries) = raw else {
        return Ok(BTreeMap::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|(key, value)| {
            serde_json::from_value::<PendingFailure>(value)
                .ok()
                .map(|pending| (key, pending))
        })
        .collect())
}

/// Load the state at `path`, or defaults if the file does not exist.
///
/// Malformed JSON is an error: the cursor decides the scan window.
pub fn load_state(path: &Path, identity: &StreamIdentity) -> Result<StreamState> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StreamState::new(identity));
        }
        Err(e) => return Err(GraphMailError::io(path, e)),
    };

    let invalid = |reason: String| GraphMailError::InvalidState {
        path: path.to_path_buf(),
        reason,
    };
    let value: Value = serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))?;
    let mut state = if value.is_object() {
        serde_json::from_value::<StreamState>(value).map_err(|e| invalid(e.to_string()))?
    } else {
        warn!(path = %path.display(), "State file is not a JSON object, using defaults");
        StreamState::default()
    };

    state.apply_identity(identity);
    Ok(state)
}

/// Write `state` to `path` atomically: pretty JSON, sorted keys.
pub fn save_state(path: &Path, state: &StreamState) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(|e| GraphMailError::io(dir, e))?;

    let value = serde_json::to_value(state).map_err(|e| GraphMailError::InvalidState {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let content = serde_json::to_string_pretty(&value).map_err(|e| GraphMailError::InvalidState {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|e| GraphMailError::io(&tmp, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| GraphMailError::io(&tmp, e))?;
        file.sync_all().map_err(|e| GraphMailError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| GraphMailError::io(path, e))?;
    debug!(path = %path.display(), "State saved");
    Ok(())
}
