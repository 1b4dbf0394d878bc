//! Mailbox API integration.
//!
//! This module provides:
//! - [`MailboxApi`], the capability the sync engine and folder resolver consume
//! - [`GraphClient`], its implementation over the Microsoft Graph REST API
//! - Retry policy for transient statuses

mod client;
pub mod retry;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Attachment, MailFolder, Message};

pub use client::{DraftRequest, GraphClient};

/// Hard upper bound on messages returned by one listing.
pub const MAX_LIST_LIMIT: usize = 5000;

/// Parameters of a message listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageQuery {
    /// Folder token or id to list.
    pub folder: String,
    /// Only unread messages.
    pub unread_only: bool,
    /// Maximum number of messages (clamped to `1..=MAX_LIST_LIMIT`).
    pub top: usize,
    /// Fields to select; empty selects the API default set.
    pub select: Vec<String>,
    /// Only messages that carry attachments.
    pub has_attachments_only: bool,
    /// Lower bound on the receive time (inclusive).
    pub received_since: Option<DateTime<Utc>>,
    /// Stop after this many pages.
    pub max_pages: Option<usize>,
}

impl MessageQuery {
    /// Build the `$filter` expression, `None` when no filter applies.
    pub fn filter(&self) -> Option<String> {
        let mut filters: Vec<String> = Vec::new();
        if self.unread_only {
            filters.push("isRead eq false".to_string());
        }
        if self.has_attachments_only {
            filters.push("hasAttachments eq true".to_string());
        }
        if let Some(since) = self.received_since {
            filters.push(format!(
                "receivedDateTime ge {}",
                crate::sync::iso_utc(since)
            ));
        }
        if filters.is_empty() {
            None
        } else {
            Some(filters.join(" and "))
        }
    }

    /// Effective item limit.
    pub fn limit(&self) -> usize {
        self.top.clamp(1, MAX_LIST_LIMIT)
    }
}

/// The mailbox operations the sync engine depends on.
///
/// All methods may fail with [`crate::error::GraphMailError::Api`]; transient
/// statuses are retried inside the implementation before surfacing.
pub trait MailboxApi {
    /// List messages in newest-first order.
    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>>;

    /// List a message's attachments.
    fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>>;

    /// Fetch one attachment's metadata.
    fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Attachment>;

    /// Fetch raw attachment bytes and the served content type.
    fn download_attachment_bytes(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<(Vec<u8>, String)>;

    /// Look up a folder by well-known name or id.
    fn get_mail_folder(&self, token: &str) -> Result<MailFolder>;

    /// List a folder's direct children.
    fn list_child_folders(&self, folder_id: &str, include_hidden: bool)
        -> Result<Vec<MailFolder>>;
}
