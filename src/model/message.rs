//! Message records as returned by the mail listing endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields requested by default when listing messages.
pub const DEFAULT_SELECT_FIELDS: &[&str] = &[
    "id",
    "subject",
    "from",
    "receivedDateTime",
    "isRead",
    "hasAttachments",
    "bodyPreview",
    "webLink",
];

/// A message record. Only the fields the sync engine relies on are typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Immutable message id. Empty when the API omitted it.
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// ISO-8601 receive timestamp, as sent by the API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_date_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_attachments: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,

    /// Any other selected field (`from`, `bodyPreview`, `webLink`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Parsed receive time, if present and well-formed.
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        crate::sync::parse_utc(self.received_date_time.as_deref())
    }
}

/// Split a comma-separated `--select` list; empty input yields the defaults.
pub fn parse_select_fields(raw: &str) -> Vec<String> {
    let fields: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    if fields.is_empty() {
        DEFAULT_SELECT_FIELDS.iter().map(|f| f.to_string()).collect()
    } else {
        fields
    }
}
