//! In-memory mailbox used by the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use graphmail::error::{GraphMailError, Result};
use graphmail::folders::{FolderMode, FolderResolution};
use graphmail::graph::{MailboxApi, MessageQuery};
use graphmail::model::{Attachment, MailFolder, Message};
use graphmail::sync::StreamTarget;

pub const ACCOUNT: &str = "oid-1.tid-1";
pub const INBOX_ID: &str = "inbox-id";

/// Mailbox double with switchable failures.
#[derive(Default)]
pub struct FakeMailbox {
    messages: RefCell<Vec<Message>>,
    attachments: RefCell<HashMap<String, Vec<Attachment>>>,
    content: RefCell<HashMap<(String, String), Vec<u8>>>,
    failing_downloads: RefCell<HashSet<String>>,
    failing_listings: RefCell<HashSet<String>>,
    folders: RefCell<HashMap<String, MailFolder>>,
    children: RefCell<HashMap<String, Vec<MailFolder>>>,
    pub download_calls: Cell<usize>,
}

impl FakeMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with `(attachment id, name, bytes)` attachments.
    pub fn add_message(&self, id: &str, subject: &str, received: &str, files: &[(&str, &str, &[u8])]) {
        self.messages.borrow_mut().push(Message {
            id: id.to_string(),
            subject: Some(subject.to_string()),
            received_date_time: Some(received.to_string()),
            has_attachments: Some(!files.is_empty()),
            is_read: Some(false),
            ..Default::default()
        });
        let mut list = Vec::new();
        for (att_id, name, bytes) in files {
            list.push(Attachment {
                id: Some(att_id.to_string()),
                name: Some(name.to_string()),
                content_type: Some("application/octet-stream".to_string()),
                size: Some(bytes.len() as u64),
                is_inline: Some(false),
                ..Default::default()
            });
            self.content
                .borrow_mut()
                .insert((id.to_string(), att_id.to_string()), bytes.to_vec());
        }
        self.attachments.borrow_mut().insert(id.to_string(), list);
    }

    /// Drop messages from listings; their attachments stay fetchable.
    pub fn hide_messages(&self) {
        self.messages.borrow_mut().clear();
    }

    pub fn fail_download(&self, attachment_id: &str, failing: bool) {
        let mut set = self.failing_downloads.borrow_mut();
        if failing {
            set.insert(attachment_id.to_string());
        } else {
            set.remove(attachment_id);
        }
    }

    /// Serve an attachment without its id, as some listings do.
    pub fn clear_attachment_id(&self, message_id: &str, attachment_id: &str) {
        if let Some(list) = self.attachments.borrow_mut().get_mut(message_id) {
            for attachment in list.iter_mut() {
                if attachment.id() == Some(attachment_id) {
                    attachment.id = None;
                }
            }
        }
    }

    pub fn fail_listing(&self, message_id: &str) {
        self.failing_listings
            .borrow_mut()
            .insert(message_id.to_string());
    }

    /// Register a folder under its id and any extra lookup tokens.
    pub fn add_folder(&self, folder: MailFolder, tokens: &[&str]) {
        let mut folders = self.folders.borrow_mut();
        for token in tokens {
            folders.insert(token.to_lowercase(), folder.clone());
        }
        if let Some(parent) = folder.parent_folder_id.clone() {
            self.children
                .borrow_mut()
                .entry(parent)
                .or_default()
                .push(folder.clone());
        }
        folders.insert(folder.id.clone(), folder);
    }
}

impl MailboxApi for FakeMailbox {
    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<Message>> {
        let mut found: Vec<Message> = self
            .messages
            .borrow()
            .iter()
            .filter(|m| !query.has_attachments_only || m.has_attachments == Some(true))
            .filter(|m| !query.unread_only || m.is_read != Some(true))
            .filter(|m| match (query.received_since, m.received_at()) {
                (Some(since), Some(at)) => at >= since,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.received_at().cmp(&a.received_at()));
        found.truncate(query.top.max(1));
        Ok(found)
    }

    fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>> {
        if self.failing_listings.borrow().contains(message_id) {
            return Err(GraphMailError::api(Some(500), "listing unavailable"));
        }
        Ok(self
            .attachments
            .borrow()
            .get(message_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_attachment(&self, message_id: &str, attachment_id: &str) -> Result<Attachment> {
        self.attachments
            .borrow()
            .get(message_id)
            .and_then(|list| list.iter().find(|a| a.id() == Some(attachment_id)).cloned())
            .ok_or_else(|| GraphMailError::api(Some(404), "attachment not found"))
    }

    fn download_attachment_bytes(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<(Vec<u8>, String)> {
        self.download_calls.set(self.download_calls.get() + 1);
        if self.failing_downloads.borrow().contains(attachment_id) {
            return Err(GraphMailError::api(Some(503), "service unavailable"));
        }
        self.content
            .borrow()
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .map(|bytes| (bytes, "application/octet-stream".to_string()))
            .ok_or_else(|| GraphMailError::api(Some(404), "content not found"))
    }

    fn get_mail_folder(&self, token: &str) -> Result<MailFolder> {
        let folders = self.folders.borrow();
        folders
            .get(token)
            .or_else(|| folders.get(&token.to_lowercase()))
            .cloned()
            .ok_or_else(|| GraphMailError::api(Some(404), format!("folder {token} not found")))
    }

    fn list_child_folders(&self, folder_id: &str, include_hidden: bool) -> Result<Vec<MailFolder>> {
        Ok(self
            .children
            .borrow()
            .get(folder_id)
            .map(|list| {
                list.iter()
                    .filter(|f| include_hidden || f.is_hidden != Some(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

pub fn folder(id: &str, name: &str, parent: Option<&str>, child_count: u64) -> MailFolder {
    MailFolder {
        id: id.to_string(),
        display_name: Some(name.to_string()),
        parent_folder_id: parent.map(str::to_string),
        child_folder_count: Some(child_count),
        total_item_count: Some(0),
        unread_item_count: Some(0),
        is_hidden: Some(false),
    }
}

/// Inbox stream target rooted at `state_dir`.
pub fn inbox_target(state_dir: &Path) -> StreamTarget {
    StreamTarget {
        profile: "default".to_string(),
        account_home_id: ACCOUNT.to_string(),
        folder: FolderResolution {
            mode: FolderMode::Token,
            input: "inbox".to_string(),
            token: "inbox".to_string(),
            resolved_id: INBOX_ID.to_string(),
            resolved_path: Some("/Inbox".to_string()),
        },
        state_dir: state_dir.to_path_buf(),
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}

pub fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn no_progress(_done: usize, _total: usize) {}
