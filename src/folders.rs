//! Folder selection and folder tree discovery.
//!
//! A folder can be selected three ways, checked in this order:
//! 1. `--folder-id`: an opaque id, looked up for reporting only
//! 2. `--folder-path`: `/`-delimited display names walked from the Inbox
//! 3. `--folder`: a well-known token such as `inbox` or `archive`

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{GraphMailError, Result};
use crate::graph::MailboxApi;
use crate::model::MailFolder;

/// Token used when no selector is given.
pub const DEFAULT_FOLDER_ROOT: &str = "inbox";

/// Sibling names listed in a "not found" error.
const MAX_SUGGESTIONS: usize = 20;

/// Folder selector flags as given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderSelector {
    pub folder: Option<String>,
    pub folder_id: Option<String>,
    pub folder_path: Option<String>,
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderMode {
    Id,
    Path,
    Token,
}

/// A resolved folder selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderResolution {
    #[serde(rename = "folder_mode")]
    pub mode: FolderMode,
    /// The selector value as given.
    #[serde(rename = "folder_input")]
    pub input: String,
    /// What to pass to listing endpoints.
    #[serde(skip)]
    pub token: String,
    /// Canonical id; also the stream key.
    #[serde(rename = "resolved_folder_id")]
    pub resolved_id: String,
    #[serde(rename = "resolved_folder_path")]
    pub resolved_path: Option<String>,
}

/// Resolve a selector to a folder.
///
/// Id and token lookups degrade to the raw value when the metadata request
/// fails with an API error. Path resolution fails on a missing or ambiguous
/// segment.
pub fn resolve_folder(api: &dyn MailboxApi, selector: &FolderSelector) -> Result<FolderResolution> {
    if let Some(raw) = selector.folder_id.as_deref() {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GraphMailError::InvalidArgument(
                "--folder-id cannot be empty".to_string(),
            ));
        }
        let (resolved_id, resolved_path) = describe(api, raw)?;
        return Ok(FolderResolution {
            mode: FolderMode::Id,
            input: raw.to_string(),
            token: resolved_id.clone(),
            resolved_id,
            resolved_path,
        });
    }

    if let Some(raw) = selector.folder_path.as_deref().filter(|p| !p.is_empty()) {
        return resolve_path(api, raw, selector.include_hidden);
    }

    let token = selector
        .folder
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_FOLDER_ROOT)
        .to_string();
    let (resolved_id, resolved_path) = describe(api, &token)?;
    Ok(FolderResolution {
        mode: FolderMode::Token,
        input: token.clone(),
        token,
        resolved_id,
        resolved_path,
    })
}

/// Best-effort lookup: canonical id and `/<display name>`.
fn describe(api: &dyn MailboxApi, token: &str) -> Result<(String, Option<String>)> {
    match api.get_mail_folder(token) {
        Ok(folder) => {
            let id = match folder.id.trim() {
                "" => token.to_string(),
                id => id.to_string(),
            };
            Ok((id, folder.name().map(|n| format!("/{n}"))))
        }
        Err(e @ GraphMailError::Api { .. }) => {
            warn!(folder = token, error = %e, "Folder lookup failed, using the raw value");
            Ok((token.to_string(), None))
        }
        Err(e) => Err(e),
    }
}

/// Split a folder path into segments, dropping empty pieces and a leading `Inbox`.
pub fn normalize_folder_path(raw: &str) -> Vec<String> {
    let mut pieces: Vec<String> = raw
        .split('/')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if pieces
        .first()
        .is_some_and(|first| first.to_lowercase() == DEFAULT_FOLDER_ROOT)
    {
        pieces.remove(0);
    }
    pieces
}

fn resolve_path(api: &dyn MailboxApi, raw: &str, include_hidden: bool) -> Result<FolderResolution> {
    let root = api.get_mail_folder(DEFAULT_FOLDER_ROOT)?;
    let mut current_id = root.id.trim().to_string();
    if current_id.is_empty() {
        return Err(GraphMailError::Folder(
            "Could not resolve Inbox root folder id".to_string(),
        ));
    }
    let mut current_path = format!("/{}", root.name().unwrap_or("Inbox"));

    for segment in normalize_folder_path(raw) {
        // Simple lowercasing, not full case folding: `ß` does not match `SS`
        let wanted = segment.to_lowercase();
        let children = api.list_child_folders(&current_id, include_hidden)?;
        let matches: Vec<&MailFolder> = children
            .iter()
            .filter(|child| child.name().map(str::to_lowercase).as_deref() == Some(wanted.as_str()))
            .collect();

        let selected = match matches.as_slice() {
            [only] => *only,
            [] => {
                let mut available: Vec<&str> = children.iter().filter_map(MailFolder::name).collect();
                available.sort_unstable();
                available.dedup();
                let preview = if available.is_empty() {
                    "<none>".to_string()
                } else {
                    available
                        .iter()
                        .take(MAX_SUGGESTIONS)
                        .copied()
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                return Err(GraphMailError::Folder(format!(
                    "Folder path segment '{segment}' not found under '{current_path}'. Available children: {preview}"
                )));
            }
            several => {
                let ids: Vec<&str> = several.iter().map(|f| f.id.as_str()).collect();
                return Err(GraphMailError::Folder(format!(
                    "Folder path segment '{segment}' is ambiguous under '{current_path}'. Matching folder ids: {ids:?}"
                )));
            }
        };

        current_id = selected.id.trim().to_string();
        if current_id.is_empty() {
            return Err(GraphMailError::Folder(format!(
                "Resolved folder segment '{segment}' has no id"
            )));
        }
        current_path = format!("{current_path}/{}", selected.name().unwrap_or(&segment));
        debug!(path = %current_path, id = %current_id, "Resolved folder segment");
    }

    Ok(FolderResolution {
        mode: FolderMode::Path,
        input: raw.to_string(),
        token: current_id.clone(),
        resolved_id: current_id,
        resolved_path: Some(current_path),
    })
}

// ── Folder tree ─────────────────────────────────────────────────

/// One row of the flat folder index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderIndexRow {
    pub id: String,
    pub display_name: Option<String>,
    pub parent_id: Option<String>,
    pub child_folder_count: u64,
    pub total_item_count: u64,
    pub unread_item_count: u64,
    pub is_hidden: bool,
    pub path: String,
}

impl FolderIndexRow {
    fn new(folder: &MailFolder, path: String) -> Self {
        Self {
            id: folder.id.clone(),
            display_name: folder.display_name.clone(),
            parent_id: folder.parent_folder_id.clone(),
            child_folder_count: folder.child_folder_count.unwrap_or(0),
            total_item_count: folder.total_item_count.unwrap_or(0),
            unread_item_count: folder.unread_item_count.unwrap_or(0),
            is_hidden: folder.is_hidden.unwrap_or(false),
            path,
        }
    }
}

/// A folder with its subtree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderNode {
    #[serde(flatten)]
    pub folder: FolderIndexRow,
    pub children: Vec<FolderNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FolderTree {
    pub tree: FolderNode,
    /// Depth-first listing of every node.
    pub index: Vec<FolderIndexRow>,
}

/// Walk the folder hierarchy under `root_token` depth-first.
///
/// Children are ordered by case-insensitive display name, then id. Visiting
/// more than `max_nodes` folders is an error.
pub fn build_folder_tree(
    api: &dyn MailboxApi,
    root_token: &str,
    include_hidden: bool,
    max_nodes: usize,
) -> Result<FolderTree> {
    let root = api.get_mail_folder(root_token)?;
    let root_path = format!("/{}", root.name().unwrap_or("Inbox"));

    let mut walker = TreeWalker {
        api,
        include_hidden,
        max_nodes,
        visited: 0,
        index: Vec::new(),
    };
    let tree = walker.walk(&root, root_path)?;
    Ok(FolderTree {
        tree,
        index: walker.index,
    })
}

struct TreeWalker<'a> {
    api: &'a dyn MailboxApi,
    include_hidden: bool,
    max_nodes: usize,
    visited: usize,
    index: Vec<FolderIndexRow>,
}

impl TreeWalker<'_> {
    fn walk(&mut self, folder: &MailFolder, path: String) -> Result<FolderNode> {
        self.visited += 1;
        if self.visited > self.max_nodes {
            return Err(GraphMailError::InvalidArgument(format!(
                "Folder traversal exceeded max nodes ({}). Rerun with a higher --max-nodes value.",
                self.max_nodes
            )));
        }

        let row = FolderIndexRow::new(folder, path.clone());
        self.index.push(row.clone());
        let mut node = FolderNode {
            folder: row,
            children: Vec::new(),
        };
        if folder.child_folder_count.unwrap_or(0) == 0 {
            return Ok(node);
        }

        let mut children = self.api.list_child_folders(&folder.id, self.include_hidden)?;
        children.sort_by_cached_key(|child| {
            (
                child.display_name.as_deref().unwrap_or_default().to_lowercase(),
                child.id.clone(),
            )
        });

        for child in &children {
            let name = child
                .name()
                .or(Some(child.id.as_str()).filter(|id| !id.is_empty()))
                .unwrap_or("unknown");
            let child_path = format!("{path}/{name}");
            node.children.push(self.walk(child, child_path)?);
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folder_path() {
        assert_eq!(normalize_folder_path("/Inbox/Clients/Acme/"), vec!["Clients", "Acme"]);
        assert_eq!(normalize_folder_path("inbox"), Vec::<String>::new());
        assert_eq!(normalize_folder_path(" Projects // 2024 "), vec!["Projects", "2024"]);
        assert!(normalize_folder_path("///").is_empty());
    }

    #[test]
    fn test_resolution_serializes_without_token() {
        let resolution = FolderResolution {
            mode: FolderMode::Token,
            input: "inbox".into(),
            token: "inbox".into(),
            resolved_id: "AQMk".into(),
            resolved_path: Some("/Inbox".into()),
        };
        let value = serde_json::to_value(&resolution).unwrap();
        assert_eq!(value["folder_mode"], "token");
        assert_eq!(value["resolved_folder_id"], "AQMk");
        assert!(value.get("token").is_none());
    }
}
