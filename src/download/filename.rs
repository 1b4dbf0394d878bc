//! Filesystem-safe names for saved attachments and their directories.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::{GraphMailError, Result};

/// Longest filename produced by [`sanitize_filename`], in characters.
const MAX_FILENAME_LEN: usize = 180;

/// Extensions longer than this are not treated as extensions when truncating.
const MAX_EXTENSION_LEN: usize = 32;

/// Highest numeric suffix tried by [`unique_path`].
const MAX_SUFFIX: usize = 999;

/// Replace every character outside `[A-Za-z0-9._ -]` with `_`.
///
/// Leading/trailing spaces and dots are stripped, an empty result becomes
/// `attachment.bin`, and long names are cut to 180 characters keeping the
/// extension.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ' ' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = replaced.trim_matches(|c| c == ' ' || c == '.');
    if cleaned.is_empty() {
        return "attachment.bin".to_string();
    }
    if cleaned.len() <= MAX_FILENAME_LEN {
        return cleaned.to_string();
    }

    // Only ASCII remains, so byte offsets are char offsets.
    let extension = match cleaned.rfind('.') {
        Some(dot) if dot > 0 && cleaned.len() - dot <= MAX_EXTENSION_LEN => &cleaned[dot..],
        _ => "",
    };
    format!(
        "{}{}",
        &cleaned[..MAX_FILENAME_LEN - extension.len()],
        extension
    )
}

/// If `path` already exists, append `_1`, `_2`, ... to the stem until free.
///
/// Fails after 999 candidates; an existing file is never returned.
pub fn unique_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    for i in 1..=MAX_SUFFIX {
        let candidate = if ext.is_empty() {
            parent.join(format!("{stem}_{i}"))
        } else {
            parent.join(format!("{stem}_{i}.{ext}"))
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(GraphMailError::io(
        path,
        std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "could not find a free filename",
        ),
    ))
}

/// Directory name for one message's attachments:
/// `msg_<received>_<subject>_<id prefix>`.
pub fn message_folder_name(
    message_id: &str,
    subject: Option<&str>,
    received: Option<DateTime<Utc>>,
) -> String {
    let received = received
        .map(|dt| dt.format("%Y%m%dT%H%M%SZ").to_string())
        .unwrap_or_else(|| "unknown_time".to_string());

    let subject = sanitize_filename(subject.unwrap_or("no_subject"));
    let subject: String = subject.chars().take(80).collect();
    let subject = match subject.trim_matches(|c| c == ' ' || c == '_') {
        "" => "no_subject",
        s => s,
    };

    let id: String = sanitize_filename(message_id).chars().take(16).collect();
    let id = if id.is_empty() { "message".to_string() } else { id };

    format!("msg_{received}_{subject}_{id}")
}

/// Create `<parent>/<mode>_<YYYYMMDDTHHMMSSZ>` for one run's downloads.
pub fn create_batch_dir(parent: &Path, mode: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let dir = parent.join(format!("{mode}_{}", now.format("%Y%m%dT%H%M%SZ")));
    std::fs::create_dir_all(&dir).map_err(|e| GraphMailError::io(&dir, e))?;
    Ok(dir)
}
