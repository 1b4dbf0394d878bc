//! Save attachments to disk.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::filename::{sanitize_filename, unique_path};
use crate::error::{GraphMailError, Result};
use crate::graph::MailboxApi;
use crate::model::Attachment;

/// One attachment written to disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedAttachment {
    pub attachment_id: String,
    /// Declared name, before sanitizing.
    pub name: Option<String>,
    pub saved_path: PathBuf,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub is_inline: bool,
}

/// Download one attachment into `target_dir` under a fresh filename.
///
/// The declared name is sanitized; an existing file is never overwritten.
pub fn download_attachment(
    api: &dyn MailboxApi,
    message_id: &str,
    attachment_id: &str,
    target_dir: &Path,
    metadata: &Attachment,
) -> Result<SavedAttachment> {
    let (data, served_type) = api.download_attachment_bytes(message_id, attachment_id)?;

    let declared = metadata
        .name
        .clone()
        .unwrap_or_else(|| format!("{attachment_id}.bin"));
    let path = unique_path(&target_dir.join(sanitize_filename(&declared)))?;

    // create_new: a file appearing between the probe and the write is an error, not a clobber
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| GraphMailError::io(&path, e))?;
    file.write_all(&data)
        .map_err(|e| GraphMailError::io(&path, e))?;
    debug!(path = %path.display(), bytes = data.len(), "Saved attachment");

    let content_type = metadata
        .content_type
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| Some(served_type).filter(|t| !t.is_empty()));

    Ok(SavedAttachment {
        attachment_id: attachment_id.to_string(),
        name: metadata.name.clone(),
        saved_path: path,
        size_bytes: data.len() as u64,
        content_type,
        is_inline: metadata.is_inline.unwrap_or(false),
    })
}

/// An attachment `download_all` could not save.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedAttachment {
    pub attachment_id: Option<String>,
    pub name: Option<String>,
    pub error: String,
}

/// Outcome of saving every attachment of one message.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadAllReport {
    pub message_id: String,
    pub output_dir: PathBuf,
    pub downloaded_count: usize,
    pub failed_count: usize,
    pub downloaded: Vec<SavedAttachment>,
    pub failed: Vec<FailedAttachment>,
}

/// Save every attachment of `message_id` into `output_dir`.
///
/// Per-attachment failures are collected in the report, not returned.
pub fn download_all(
    api: &dyn MailboxApi,
    message_id: &str,
    output_dir: &Path,
    progress: &dyn Fn(usize, usize),
) -> Result<DownloadAllReport> {
    std::fs::create_dir_all(output_dir).map_err(|e| GraphMailError::io(output_dir, e))?;
    let attachments = api.list_attachments(message_id)?;
    let total = attachments.len();

    let mut downloaded = Vec::new();
    let mut failed = Vec::new();

    for (i, attachment) in attachments.iter().enumerate() {
        progress(i, total);

        let Some(attachment_id) = attachment.id() else {
            failed.push(FailedAttachment {
                attachment_id: None,
                name: attachment.name.clone(),
                error: "missing id".to_string(),
            });
            continue;
        };

        match download_attachment(api, message_id, attachment_id, output_dir, attachment) {
            Ok(saved) => downloaded.push(saved),
            Err(e) => {
                warn!(
                    attachment_id,
                    error = %e,
                    "Failed to download attachment"
                );
                failed.push(FailedAttachment {
                    attachment_id: Some(attachment_id.to_string()),
                    name: attachment.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    progress(total, total);

    Ok(DownloadAllReport {
        message_id: message_id.to_string(),
        output_dir: output_dir.to_path_buf(),
        downloaded_count: downloaded.len(),
        failed_count: failed.len(),
        downloaded,
        failed,
    })
}
