//! Argument helpers for the plain mail commands.

use std::path::Path;

use crate::error::{GraphMailError, Result};

/// Parse `--read`: `1/true/yes/y` or `0/false/no/n`, case-insensitive.
pub fn parse_boolean(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(true),
        "0" | "false" | "no" | "n" => Ok(false),
        _ => Err(GraphMailError::InvalidArgument(
            "--read must be one of: true, false".to_string(),
        )),
    }
}

/// Split recipient arguments on `,` and `;`. At least one is required.
pub fn parse_recipients(raw_values: &[String]) -> Result<Vec<String>> {
    let recipients: Vec<String> = raw_values
        .iter()
        .flat_map(|raw| raw.split([',', ';']))
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect();
    if recipients.is_empty() {
        return Err(GraphMailError::InvalidArgument(
            "At least one recipient is required".to_string(),
        ));
    }
    Ok(recipients)
}

/// Draft body: the file's contents when given, else the inline text.
pub fn read_body(body_file: Option<&Path>, inline: &str) -> Result<String> {
    match body_file {
        Some(path) => std::fs::read_to_string(path).map_err(|e| GraphMailError::io(path, e)),
        None => Ok(inline.to_string()),
    }
}

/// Reject `send-draft` without explicit confirmation.
pub fn require_send_confirmation(confirmed: bool) -> Result<()> {
    if confirmed {
        return Ok(());
    }
    Err(GraphMailError::InvalidArgument(
        "send-draft requires --confirm-send. Guardrail: create drafts first and require explicit confirmation to send."
            .to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boolean() {
        assert!(parse_boolean(" YES ").unwrap());
        assert!(parse_boolean("1").unwrap());
        assert!(!parse_boolean("n").unwrap());
        assert!(!parse_boolean("False").unwrap());
        assert_eq!(parse_boolean("maybe").unwrap_err().kind(), "ValueError");
    }

    #[test]
    fn test_parse_recipients() {
        let raw = vec!["a@x.com, b@x.com".to_string(), "c@x.com;;".to_string()];
        assert_eq!(
            parse_recipients(&raw).unwrap(),
            vec!["a@x.com", "b@x.com", "c@x.com"]
        );
        assert!(parse_recipients(&[" ; ".to_string()]).is_err());
    }

    #[test]
    fn test_read_body_prefers_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("body.txt");
        std::fs::write(&path, "from file").unwrap();
        assert_eq!(read_body(Some(&path), "inline").unwrap(), "from file");
        assert_eq!(read_body(None, "inline").unwrap(), "inline");
        assert!(read_body(Some(&tmp.path().join("missing")), "").is_err());
    }

    #[test]
    fn test_send_requires_confirmation() {
        assert!(require_send_confirmation(true).is_ok());
        let err = require_send_confirmation(false).unwrap_err();
        assert!(err.to_string().contains("--confirm-send"));
    }
}
