//! Attachment metadata.
//!
//! The payload is NOT part of this record for the sync engine; bytes are
//! fetched separately through the raw `$value` endpoint at save time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata about a message attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// API-assigned attachment id. Missing on malformed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Declared filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Declared MIME content type (e.g. `"application/pdf"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Declared size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// `true` if the attachment is embedded in the HTML body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_inline: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Attachment {
    /// Trimmed id, `None` when absent or blank.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }
}
