//! Sync runs over one stream.
//!
//! - [`run_recent`]: the N most recent attachment-bearing messages
//! - [`run_new`]: everything received since the stored cursor (minus an
//!   overlap), after retrying pending failures from earlier runs
//!
//! Both bracket their work with `run_started` / `run_completed` ledger
//! events and save the stream state once at the end.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::ledger::{LedgerEvent, LedgerEventKind};
use super::processor::{AttachmentProcessor, MessageOutcome};
use super::state::StreamState;
use super::stream::{StreamIdentity, StreamStore};
use super::{iso_utc, now_utc, FIRST_RUN_BACKFILL_DAYS, MAX_OVERLAP_HOURS};
use crate::download::create_batch_dir;
use crate::error::{GraphMailError, Result};
use crate::folders::FolderResolution;
use crate::graph::{MailboxApi, MessageQuery};
use crate::model::message::DEFAULT_SELECT_FIELDS;
use crate::model::Message;

/// Which stream a run operates on.
#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub profile: String,
    pub account_home_id: String,
    pub folder: FolderResolution,
    /// Base directory holding all stream directories.
    pub state_dir: PathBuf,
}

impl StreamTarget {
    pub fn identity(&self) -> StreamIdentity {
        StreamIdentity {
            profile: self.profile.clone(),
            account_home_id: self.account_home_id.clone(),
            folder_id: self.folder.resolved_id.clone(),
            folder_path: self.folder.resolved_path.clone(),
        }
    }

    pub fn store(&self) -> StreamStore {
        StreamStore::open(&self.state_dir, &self.identity())
    }
}

/// Options of `download-recent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentOptions {
    pub top: usize,
    pub unread_only: bool,
    pub force_redownload: bool,
}

impl RecentOptions {
    pub fn validate(&self) -> Result<()> {
        if self.top == 0 {
            return Err(GraphMailError::InvalidArgument(
                "--top must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options of `download-new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOptions {
    pub overlap_hours: i64,
    pub max_pages: usize,
    pub max_messages: usize,
}

impl NewOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_OVERLAP_HOURS).contains(&self.overlap_hours) {
            return Err(GraphMailError::InvalidArgument(format!(
                "--overlap-hours must be between 0 and {MAX_OVERLAP_HOURS}"
            )));
        }
        if self.max_pages == 0 {
            return Err(GraphMailError::InvalidArgument(
                "--max-pages must be greater than 0".to_string(),
            ));
        }
        if self.max_messages == 0 {
            return Err(GraphMailError::InvalidArgument(
                "--max-messages must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lower bound of an incremental scan and why it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWindow {
    pub since: DateTime<Utc>,
    pub since_source: String,
    pub first_run: bool,
}

/// First run (or no usable cursor): run start minus the backfill window.
/// Otherwise: cursor minus `overlap_hours`, saturating at the earliest
/// representable time.
pub fn compute_scan_window(
    state: &StreamState,
    run_started: DateTime<Utc>,
    overlap_hours: i64,
) -> ScanWindow {
    let first_run = !state.first_run_completed;
    match state.cursor().filter(|_| !first_run) {
        Some(cursor) => ScanWindow {
            since: Duration::try_hours(overlap_hours)
                .and_then(|overlap| cursor.checked_sub_signed(overlap))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            since_source: format!("cursor_overlap_{overlap_hours}h"),
            first_run,
        },
        None => ScanWindow {
            since: run_started - Duration::days(FIRST_RUN_BACKFILL_DAYS),
            since_source: format!("first_run_backfill_{FIRST_RUN_BACKFILL_DAYS}d"),
            first_run,
        },
    }
}

/// Fields reported only by `download-recent`.
#[derive(Debug, Clone, Serialize)]
pub struct RecentDetails {
    pub top: usize,
    pub unread_only: bool,
    pub force_redownload: bool,
}

/// Fields reported only by `download-new`.
#[derive(Debug, Clone, Serialize)]
pub struct IncrementalDetails {
    pub first_run_backfill_days: i64,
    pub since: String,
    pub since_source: String,
    pub cursor_before: Option<String>,
    pub cursor_after: Option<String>,
    pub max_pages: usize,
    pub max_messages: usize,
    pub retried_pending: usize,
    pub retried_success: usize,
    pub retried_failed: usize,
    pub retry_downloaded_count: usize,
    pub retry_skipped_count: usize,
    pub retry_failed_count: usize,
}

/// Result of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub mode: &'static str,
    #[serde(flatten)]
    pub folder: FolderResolution,
    /// Batch directory of this run.
    pub output_dir: PathBuf,
    #[serde(flatten)]
    pub recent: Option<RecentDetails>,
    #[serde(flatten)]
    pub incremental: Option<IncrementalDetails>,
    pub messages_scanned: usize,
    pub downloaded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub messages: Vec<MessageOutcome>,
    pub stream_id: String,
    pub state_file: PathBuf,
    pub ledger_file: PathBuf,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    downloaded: usize,
    skipped: usize,
    failed: usize,
}

impl Totals {
    fn add(&mut self, outcome: &MessageOutcome) {
        self.downloaded += outcome.downloaded_count;
        self.skipped += outcome.skipped_count;
        self.failed += outcome.failed_count;
    }

    fn merge(self, other: Totals) -> Totals {
        Totals {
            downloaded: self.downloaded + other.downloaded,
            skipped: self.skipped + other.skipped,
            failed: self.failed + other.failed,
        }
    }
}

fn default_select() -> Vec<String> {
    DEFAULT_SELECT_FIELDS.iter().map(|f| f.to_string()).collect()
}

fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Add this run's counts and timestamps to the state.
fn commit_counters(
    state: &mut StreamState,
    totals: Totals,
    started: DateTime<Utc>,
    completed: DateTime<Utc>,
) {
    state.last_run_started_utc = Some(iso_utc(started));
    state.last_run_completed_utc = Some(iso_utc(completed));
    state.downloaded_total += totals.downloaded as u64;
    state.skipped_total += totals.skipped as u64;
    state.failed_total += totals.failed as u64;
}

/// Process every message, reporting `(done, total)` to `progress`.
fn process_all(
    processor: &mut AttachmentProcessor<'_>,
    messages: &[Message],
    force_redownload: bool,
    progress: &dyn Fn(usize, usize),
) -> (Vec<MessageOutcome>, Totals) {
    let total = messages.len();
    let mut totals = Totals::default();
    let mut outcomes = Vec::with_capacity(total);
    for (i, message) in messages.iter().enumerate() {
        progress(i, total);
        let outcome = processor.process_message(message, force_redownload, None);
        totals.add(&outcome);
        outcomes.push(outcome);
    }
    progress(total, total);
    (outcomes, totals)
}

/// Download attachments of the `top` most recent attachment-bearing messages.
pub fn run_recent(
    api: &dyn MailboxApi,
    target: &StreamTarget,
    output_dir: &Path,
    options: &RecentOptions,
    progress: &dyn Fn(usize, usize),
) -> Result<RunSummary> {
    options.validate()?;

    let identity = target.identity();
    let store = StreamStore::open(&target.state_dir, &identity);
    let state = store.load_state(&identity)?;
    let completed = store.ledger().load_completed_keys()?;

    let messages = api.list_messages(&MessageQuery {
        folder: target.folder.token.clone(),
        unread_only: options.unread_only,
        top: options.top,
        select: default_select(),
        has_attachments_only: true,
        received_since: None,
        max_pages: None,
    })?;

    let run_id = new_run_id();
    let started = now_utc();
    let batch_dir = create_batch_dir(output_dir, "recent", started)?;

    store.ledger().append(
        &LedgerEvent::new(LedgerEventKind::RunStarted, &run_id)
            .with("mode", "download_recent")
            .with("folder_id", &target.folder.resolved_id)
            .with("folder_path", &target.folder.resolved_path)
            .with("top", options.top)
            .with("force_redownload", options.force_redownload)
            .with("started_at", iso_utc(started)),
    )?;
    info!(run_id = %run_id, messages = messages.len(), "Started download-recent run");

    let mut processor =
        AttachmentProcessor::new(api, store.ledger(), &run_id, &batch_dir, completed, state);
    let (outcomes, totals) =
        process_all(&mut processor, &messages, options.force_redownload, progress);
    let mut state = processor.into_state();

    let finished = now_utc();
    state.apply_identity(&identity);
    commit_counters(&mut state, totals, started, finished);
    store.save_state(&state)?;

    append_completion(
        &store,
        LedgerEvent::new(LedgerEventKind::RunCompleted, &run_id)
            .with("mode", "download_recent")
            .with("started_at", iso_utc(started))
            .with("completed_at", iso_utc(finished))
            .with("messages_scanned", messages.len())
            .with("downloaded_count", totals.downloaded)
            .with("skipped_count", totals.skipped)
            .with("failed_count", totals.failed),
    );
    info!(
        run_id = %run_id,
        downloaded = totals.downloaded,
        skipped = totals.skipped,
        failed = totals.failed,
        "Completed download-recent run"
    );

    Ok(RunSummary {
        run_id,
        mode: "download_recent",
        folder: target.folder.clone(),
        output_dir: batch_dir,
        recent: Some(RecentDetails {
            top: options.top,
            unread_only: options.unread_only,
            force_redownload: options.force_redownload,
        }),
        incremental: None,
        messages_scanned: messages.len(),
        downloaded_count: totals.downloaded,
        skipped_count: totals.skipped,
        failed_count: totals.failed,
        messages: outcomes,
        stream_id: store.id().to_string(),
        state_file: store.state_path().to_path_buf(),
        ledger_file: store.ledger_path().to_path_buf(),
    })
}

/// The state is already saved when `run_completed` is written; losing the
/// event only costs audit detail.
fn append_completion(store: &StreamStore, event: LedgerEvent) {
    if let Err(e) = store.ledger().append(&event) {
        warn!(error = %e, "Failed to append run_completed event");
    }
}

#[derive(Debug, Default)]
struct RetryStats {
    retried: usize,
    succeeded: usize,
    failed: usize,
    totals: Totals,
}

/// Retry every pending failure present at run start, once.
fn retry_pending(
    api: &dyn MailboxApi,
    processor: &mut AttachmentProcessor<'_>,
    store: &StreamStore,
    run_id: &str,
) -> RetryStats {
    let mut stats = RetryStats::default();
    let snapshot = processor.state().pending_failures.clone();

    for (key, pending) in snapshot {
        let message_id = pending.message_id.trim();
        let attachment_id = pending.attachment_id.trim();
        if message_id.is_empty() || attachment_id.is_empty() {
            continue;
        }
        stats.retried += 1;

        match api.get_attachment(message_id, attachment_id) {
            Ok(metadata) => {
                let message = Message {
                    id: message_id.to_string(),
                    subject: Some("retry_pending".to_string()),
                    received_date_time: pending.last_attempt_utc.clone(),
                    has_attachments: Some(true),
                    ..Default::default()
                };
                let outcome = processor.process_message(&message, false, Some(vec![metadata]));
                stats.totals.add(&outcome);
                if outcome.failed_count > 0 {
                    stats.failed += 1;
                } else {
                    stats.succeeded += 1;
                }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(dedupe_key = %key, error = %error, "Pending attachment still unavailable");
                stats.failed += 1;
                stats.totals.failed += 1;
                processor.state_mut().record_failure(
                    &key,
                    message_id,
                    attachment_id,
                    &error,
                    now_utc(),
                );
                let event = LedgerEvent::new(LedgerEventKind::Failed, run_id)
                    .with("dedupe_key", &key)
                    .with("message_id", message_id)
                    .with("attachment_id", attachment_id)
                    .with("error", &error)
                    .with("phase", "pending_retry");
                if let Err(e) = store.ledger().append(&event) {
                    warn!(error = %e, "Failed to append ledger event");
                }
            }
        }
    }
    stats
}

/// Download attachments of messages received since the cursor.
///
/// Pending failures are retried first. The cursor only moves forward.
pub fn run_new(
    api: &dyn MailboxApi,
    target: &StreamTarget,
    output_dir: &Path,
    options: &NewOptions,
    progress: &dyn Fn(usize, usize),
) -> Result<RunSummary> {
    options.validate()?;

    let identity = target.identity();
    let store = StreamStore::open(&target.state_dir, &identity);
    let state = store.load_state(&identity)?;
    let completed = store.ledger().load_completed_keys()?;

    let run_id = new_run_id();
    let started = now_utc();

    let cursor_before = state.cursor_received_utc.clone();
    let cursor_before_dt = state.cursor();
    let window = compute_scan_window(&state, started, options.overlap_hours);
    let since = iso_utc(window.since);

    let batch_dir = create_batch_dir(output_dir, "new", started)?;

    store.ledger().append(
        &LedgerEvent::new(LedgerEventKind::RunStarted, &run_id)
            .with("mode", "download_new")
            .with("folder_id", &target.folder.resolved_id)
            .with("folder_path", &target.folder.resolved_path)
            .with("started_at", iso_utc(started))
            .with("since", &since)
            .with("since_source", &window.since_source)
            .with("max_pages", options.max_pages)
            .with("max_messages", options.max_messages),
    )?;
    info!(run_id = %run_id, since = %since, source = %window.since_source, "Started download-new run");

    let mut processor =
        AttachmentProcessor::new(api, store.ledger(), &run_id, &batch_dir, completed, state);
    let retry = retry_pending(api, &mut processor, &store, &run_id);

    let messages = api.list_messages(&MessageQuery {
        folder: target.folder.token.clone(),
        unread_only: false,
        top: options.max_messages,
        select: default_select(),
        has_attachments_only: true,
        received_since: Some(window.since),
        max_pages: Some(options.max_pages),
    })?;

    let (outcomes, scan_totals) = process_all(&mut processor, &messages, false, progress);
    let mut state = processor.into_state();

    let finished = now_utc();
    let max_observed = messages
        .iter()
        .filter_map(Message::received_at)
        .max()
        .unwrap_or(started);
    let cursor_after = match cursor_before_dt {
        Some(before) if before > max_observed => before,
        _ => max_observed,
    };

    let totals = retry.totals.merge(scan_totals);
    state.apply_identity(&identity);
    state.first_run_completed = true;
    state.cursor_received_utc = Some(iso_utc(cursor_after));
    commit_counters(&mut state, totals, started, finished);
    store.save_state(&state)?;

    append_completion(
        &store,
        LedgerEvent::new(LedgerEventKind::RunCompleted, &run_id)
            .with("mode", "download_new")
            .with("started_at", iso_utc(started))
            .with("completed_at", iso_utc(finished))
            .with("since", &since)
            .with("since_source", &window.since_source)
            .with("messages_scanned", messages.len())
            .with("retried_pending", retry.retried)
            .with("retried_success", retry.succeeded)
            .with("retried_failed", retry.failed)
            .with("downloaded_count", totals.downloaded)
            .with("skipped_count", totals.skipped)
            .with("failed_count", totals.failed)
            .with("cursor_before", &cursor_before)
            .with("cursor_after", &state.cursor_received_utc),
    );
    info!(
        run_id = %run_id,
        downloaded = totals.downloaded,
        skipped = totals.skipped,
        failed = totals.failed,
        cursor = ?state.cursor_received_utc,
        "Completed download-new run"
    );

    Ok(RunSummary {
        run_id,
        mode: "download_new",
        folder: target.folder.clone(),
        output_dir: batch_dir,
        recent: None,
        incremental: Some(IncrementalDetails {
            first_run_backfill_days: if window.first_run {
                FIRST_RUN_BACKFILL_DAYS
            } else {
                0
            },
            since,
            since_source: window.since_source,
            cursor_before,
            cursor_after: state.cursor_received_utc.clone(),
            max_pages: options.max_pages,
            max_messages: options.max_messages,
            retried_pending: retry.retried,
            retried_success: retry.succeeded,
            retried_failed: retry.failed,
            retry_downloaded_count: retry.totals.downloaded,
            retry_skipped_count: retry.totals.skipped,
            retry_failed_count: retry.totals.failed,
        }),
        messages_scanned: messages.len(),
        downloaded_count: totals.downloaded,
        skipped_count: totals.skipped,
        failed_count: totals.failed,
        messages: outcomes,
        stream_id: store.id().to_string(),
        state_file: store.state_path().to_path_buf(),
        ledger_file: store.ledger_path().to_path_buf(),
    })
}

// ── Inspection ──────────────────────────────────────────────────

/// Read-only view of a stream, reported by `attachments state status`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub exists: bool,
    pub stream_id: String,
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub ledger_file: PathBuf,
    #[serde(flatten)]
    pub folder: FolderResolution,
    pub state: StreamState,
    pub pending_failures_count: usize,
    pub completed_keys_count: usize,
    pub ledger_entries: usize,
}

/// Describe a stream without modifying anything on disk.
pub fn stream_status(target: &StreamTarget) -> Result<StreamStatus> {
    let identity = target.identity();
    let store = StreamStore::open(&target.state_dir, &identity);
    let state = store.load_state(&identity)?;
    let completed = store.ledger().load_completed_keys()?;

    Ok(StreamStatus {
        exists: store.exists(),
        stream_id: store.id().to_string(),
        state_dir: store.dir().to_path_buf(),
        state_file: store.state_path().to_path_buf(),
        ledger_file: store.ledger_path().to_path_buf(),
        folder: target.folder.clone(),
        pending_failures_count: state.pending_failures.len(),
        completed_keys_count: completed.len(),
        ledger_entries: store.ledger().count_entries()?,
        state,
    })
}

/// Report of `attachments state reset`.
#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub removed: bool,
    pub stream_id: String,
    pub state_dir: PathBuf,
    #[serde(flatten)]
    pub folder: FolderResolution,
}

/// Delete a stream's state and ledger. Requires `confirmed`.
pub fn reset_stream(target: &StreamTarget, confirmed: bool) -> Result<ResetReport> {
    if !confirmed {
        return Err(GraphMailError::InvalidArgument(
            "state reset requires --confirm-reset".to_string(),
        ));
    }
    let store = target.store();
    let removed = store.reset()?;
    Ok(ResetReport {
        removed,
        stream_id: store.id().to_string(),
        state_dir: store.dir().to_path_buf(),
        folder: target.folder.clone(),
    })
}
