//! Per-message attachment processing.
//!
//! For each attachment of a message: skip it if its dedupe key is already in
//! the completed set, otherwise download it. Every outcome is recorded in
//! the ledger and the pending-failure table. No error escapes a single
//! attachment; a message whose attachments cannot be listed is reported as
//! one failed item.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::dedup::dedupe_key;
use super::ledger::{Ledger, LedgerEvent, LedgerEventKind};
use super::now_utc;
use super::state::StreamState;
use crate::download::{download_attachment, message_folder_name, SavedAttachment};
use crate::error::{GraphMailError, Result};
use crate::graph::MailboxApi;
use crate::model::{Attachment, Message};

/// A saved attachment with its dedupe key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadedItem {
    pub dedupe_key: String,
    #[serde(flatten)]
    pub saved: SavedAttachment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedItem {
    pub dedupe_key: String,
    pub attachment_id: Option<String>,
    pub name: Option<String>,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub attachment_id: Option<String>,
    pub name: Option<String>,
    pub error: String,
}

/// Result of processing one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageOutcome {
    pub message_id: String,
    pub subject: Option<String>,
    pub received_date_time: Option<String>,
    pub attachments_total: usize,
    pub downloaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub downloaded: Vec<DownloadedItem>,
    pub skipped: Vec<SkippedItem>,
    pub failed: Vec<FailedItem>,
}

impl MessageOutcome {
    fn for_message(message: &Message, message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            subject: message.subject.clone(),
            received_date_time: message.received_date_time.clone(),
            ..Default::default()
        }
    }

    fn fail(&mut self, item: FailedItem) {
        self.failed_count += 1;
        self.failed.push(item);
    }
}

/// Mutable context of one run, shared by every message it processes.
pub struct AttachmentProcessor<'a> {
    api: &'a dyn MailboxApi,
    ledger: &'a Ledger,
    run_id: &'a str,
    batch_dir: PathBuf,
    completed: HashSet<String>,
    state: StreamState,
}

impl<'a> AttachmentProcessor<'a> {
    /// `completed` is the ledger's downloaded set; `state` is updated in place
    /// and handed back by [`into_state`](Self::into_state).
    pub fn new(
        api: &'a dyn MailboxApi,
        ledger: &'a Ledger,
        run_id: &'a str,
        batch_dir: &Path,
        completed: HashSet<String>,
        state: StreamState,
    ) -> Self {
        Self {
            api,
            ledger,
            run_id,
            batch_dir: batch_dir.to_path_buf(),
            completed,
            state,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    pub fn into_state(self) -> StreamState {
        self.state
    }

    /// Append an event whose loss does not affect correctness.
    fn record(&self, event: LedgerEvent) {
        if let Err(e) = self.ledger.append(&event) {
            warn!(error = %e, event = ?event.kind, "Failed to append ledger event");
        }
    }

    /// Process every attachment of `message`.
    ///
    /// `preloaded` replaces the attachment listing (used when retrying
    /// pending failures).
    ///
    /// The message directory is created on the first attachment actually
    /// saved, not up front; a message whose attachments are all skipped or
    /// failed leaves no directory behind.
    pub fn process_message(
        &mut self,
        message: &Message,
        force_redownload: bool,
        preloaded: Option<Vec<Attachment>>,
    ) -> MessageOutcome {
        let message_id = message.id.trim().to_string();
        let mut outcome = MessageOutcome::for_message(message, &message_id);

        if message_id.is_empty() {
            outcome.fail(FailedItem {
                dedupe_key: None,
                attachment_id: None,
                name: None,
                error: "missing message id".to_string(),
            });
            return outcome;
        }

        let attachments = match preloaded {
            Some(list) => list,
            None => match self.api.list_attachments(&message_id) {
                Ok(list) => list,
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Could not list attachments");
                    self.record(
                        LedgerEvent::new(LedgerEventKind::Failed, self.run_id)
                            .with("message_id", &message_id)
                            .with("error", e.to_string())
                            .with("phase", "list_attachments"),
                    );
                    outcome.fail(FailedItem {
                        dedupe_key: None,
                        attachment_id: None,
                        name: None,
                        error: e.to_string(),
                    });
                    return outcome;
                }
            },
        };

        outcome.attachments_total = attachments.len();
        if attachments.is_empty() {
            return outcome;
        }

        let message_dir = self.batch_dir.join(message_folder_name(
            &message_id,
            message.subject.as_deref(),
            message.received_at(),
        ));

        for attachment in &attachments {
            self.process_attachment(
                message,
                &message_id,
                &message_dir,
                attachment,
                force_redownload,
                &mut outcome,
            );
        }

        debug!(
            message_id = %message_id,
            downloaded = outcome.downloaded_count,
            skipped = outcome.skipped_count,
            failed = outcome.failed_count,
            "Processed message"
        );
        outcome
    }

    fn process_attachment(
        &mut self,
        message: &Message,
        message_id: &str,
        message_dir: &Path,
        attachment: &Attachment,
        force_redownload: bool,
        outcome: &mut MessageOutcome,
    ) {
        let key = dedupe_key(message_id, attachment);
        let attachment_id = attachment.id();

        if !force_redownload && self.completed.contains(&key) {
            self.state.clear_failure(&key);
            self.record(
                LedgerEvent::new(LedgerEventKind::SkippedAlreadyDownloaded, self.run_id)
                    .with("dedupe_key", &key)
                    .with("message_id", message_id)
                    .with("attachment_id", attachment_id)
                    .with("name", &attachment.name),
            );
            outcome.skipped_count += 1;
            outcome.skipped.push(SkippedItem {
                dedupe_key: key,
                attachment_id: attachment_id.map(str::to_string),
                name: attachment.name.clone(),
                reason: "already_downloaded",
            });
            return;
        }

        let result = match attachment_id {
            None => Err(GraphMailError::InvalidArgument(
                "attachment id missing".to_string(),
            )),
            Some(id) => self.save(message, message_id, message_dir, id, attachment, &key),
        };

        match result {
            Ok(saved) => {
                self.completed.insert(key.clone());
                self.state.clear_failure(&key);
                outcome.downloaded_count += 1;
                outcome.downloaded.push(DownloadedItem {
                    dedupe_key: key,
                    saved,
                });
            }
            Err(e) => {
                let error = e.to_string();
                warn!(dedupe_key = %key, error = %error, "Attachment failed");
                self.state.record_failure(
                    &key,
                    message_id,
                    attachment_id.unwrap_or_default(),
                    &error,
                    now_utc(),
                );
                self.record(
                    LedgerEvent::new(LedgerEventKind::Failed, self.run_id)
                        .with("dedupe_key", &key)
                        .with("message_id", message_id)
                        .with("attachment_id", attachment_id)
                        .with("name", &attachment.name)
                        .with("error", &error),
                );
                outcome.fail(FailedItem {
                    dedupe_key: Some(key),
                    attachment_id: attachment_id.map(str::to_string),
                    name: attachment.name.clone(),
                    error,
                });
            }
        }
    }

    /// Download and record one attachment. It only counts as downloaded once
    /// the ledger append succeeds.
    fn save(
        &self,
        message: &Message,
        message_id: &str,
        message_dir: &Path,
        attachment_id: &str,
        attachment: &Attachment,
        key: &str,
    ) -> Result<SavedAttachment> {
        std::fs::create_dir_all(message_dir).map_err(|e| GraphMailError::io(message_dir, e))?;
        let saved =
            download_attachment(self.api, message_id, attachment_id, message_dir, attachment)?;
        self.ledger.append(
            &LedgerEvent::new(LedgerEventKind::Downloaded, self.run_id)
                .with("dedupe_key", key)
                .with("message_id", message_id)
                .with("attachment_id", attachment_id)
                .with("name", &attachment.name)
                .with("saved_path", &saved.saved_path)
                .with("received_date_time", &message.received_date_time),
        )?;
        Ok(saved)
    }
}
