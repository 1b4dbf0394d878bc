//! Incremental attachment sync.
//!
//! A *stream* is the sync unit for one (profile, account, folder) triple.
//! Each stream owns a directory holding:
//! - `state.json`: cursor, pending failures and lifetime counters, replaced atomically
//! - `ledger.jsonl`: append-only event log; its `downloaded` events are the
//!   authoritative "already saved" set
//!
//! The [`runner`] drives two modes over the shared [`processor`]:
//! bounded `download-recent` and cursor-based `download-new`.

pub mod dedup;
pub mod ledger;
pub mod processor;
pub mod runner;
pub mod state;
pub mod stream;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};

pub use dedup::dedupe_key;
pub use ledger::{Ledger, LedgerEvent, LedgerEventKind};
pub use processor::{AttachmentProcessor, MessageOutcome};
pub use runner::{
    compute_scan_window, reset_stream, run_new, run_recent, stream_status, NewOptions,
    RecentOptions, RunSummary, ScanWindow, StreamTarget,
};
pub use state::{PendingFailure, StreamState};
pub use stream::{stream_id, StreamIdentity, StreamStore};

/// Lookback used on a stream's first incremental run.
pub const FIRST_RUN_BACKFILL_DAYS: i64 = 15;

/// Schema version written to `state.json`.
pub const STATE_VERSION: u32 = 1;

/// Upper bound for `--overlap-hours` (one year).
pub const MAX_OVERLAP_HOURS: i64 = 24 * 366;

/// Current time truncated to whole seconds.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Format as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn iso_utc(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Parse an API or state timestamp. Blank or malformed input yields `None`.
///
/// Offsets are normalized to UTC; timestamps without an offset are taken as UTC.
pub fn parse_utc(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
