//! Mail folder metadata.

use serde::{Deserialize, Serialize};

/// Fields requested for every folder lookup.
pub const FOLDER_SELECT_FIELDS: &str =
    "id,displayName,parentFolderId,childFolderCount,totalItemCount,unreadItemCount,isHidden";

/// A mail folder record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailFolder {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub parent_folder_id: Option<String>,
    #[serde(default)]
    pub child_folder_count: Option<u64>,
    #[serde(default)]
    pub total_item_count: Option<u64>,
    #[serde(default)]
    pub unread_item_count: Option<u64>,
    #[serde(default)]
    pub is_hidden: Option<bool>,
}

impl MailFolder {
    /// Trimmed display name, `None` when blank.
    pub fn name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}
