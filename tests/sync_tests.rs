//! Integration tests for the incremental attachment sync.

mod common;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use common::{hours_ago, inbox_target, iso, no_progress, FakeMailbox};
use graphmail::sync::{
    reset_stream, run_new, run_recent, stream_status, NewOptions, RecentOptions, StreamState,
};

fn new_options() -> NewOptions {
    NewOptions {
        overlap_hours: 48,
        max_pages: 20,
        max_messages: 1000,
    }
}

fn recent_options(force_redownload: bool) -> RecentOptions {
    RecentOptions {
        top: 10,
        unread_only: false,
        force_redownload,
    }
}

// ─── Deduplication ──────────────────────────────────────────────────

#[test]
fn test_download_new_twice_downloads_once() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Invoice", &iso(hours_ago(24)), &[("a1", "invoice.pdf", b"%PDF")]);
    let target = inbox_target(tmp.child("state").path());

    let first = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_eq!(first.downloaded_count, 1);
    let saved = &first.messages[0].downloaded[0].saved.saved_path;
    assert!(predicate::path::is_file().eval(saved));
    assert_eq!(std::fs::read(saved).unwrap(), b"%PDF");

    let second = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let details = second.incremental.as_ref().unwrap();
    assert_eq!(details.since_source, "cursor_overlap_48h");
    assert_eq!(second.messages_scanned, 1);
    assert_eq!(second.downloaded_count, 0);
    assert_eq!(second.skipped_count, 1);
    assert_eq!(second.messages[0].skipped[0].reason, "already_downloaded");
    assert_eq!(mailbox.download_calls.get(), 1);
}

#[test]
fn test_download_recent_respects_ledger_unless_forced() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Scan", &iso(hours_ago(3)), &[("a1", "scan.png", b"png")]);
    let target = inbox_target(tmp.child("state").path());
    let out = tmp.child("out");

    let first = run_recent(&mailbox, &target, out.path(), &recent_options(false), &no_progress).unwrap();
    assert_eq!(first.downloaded_count, 1);
    assert_eq!(first.mode, "download_recent");

    let second = run_recent(&mailbox, &target, out.path(), &recent_options(false), &no_progress).unwrap();
    assert_eq!(second.downloaded_count, 0);
    assert_eq!(second.skipped_count, 1);

    let forced = run_recent(&mailbox, &target, out.path(), &recent_options(true), &no_progress).unwrap();
    assert_eq!(forced.downloaded_count, 1);
    assert_eq!(mailbox.download_calls.get(), 2);
}

#[test]
fn test_download_recent_does_not_move_cursor() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Scan", &iso(hours_ago(3)), &[("a1", "scan.png", b"png")]);
    let target = inbox_target(tmp.child("state").path());

    run_recent(&mailbox, &target, tmp.child("out").path(), &recent_options(false), &no_progress).unwrap();
    let status = stream_status(&target).unwrap();
    assert!(status.exists);
    assert!(!status.state.first_run_completed);
    assert_eq!(status.state.cursor_received_utc, None);
    assert_eq!(status.state.downloaded_total, 1);
    assert_eq!(status.completed_keys_count, 1);
}

// ─── Scan window and cursor ─────────────────────────────────────────

#[test]
fn test_first_run_backfills_fifteen_days() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("old", "Old", &iso(hours_ago(20 * 24)), &[("a1", "old.txt", b"old")]);
    let new_at = iso(hours_ago(2 * 24));
    mailbox.add_message("new", "New", &new_at, &[("a2", "new.txt", b"new")]);
    let target = inbox_target(tmp.child("state").path());

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let details = summary.incremental.as_ref().unwrap();
    assert_eq!(details.since_source, "first_run_backfill_15d");
    assert_eq!(details.first_run_backfill_days, 15);
    assert_eq!(details.cursor_before, None);
    assert_eq!(summary.messages_scanned, 1);
    assert_eq!(summary.messages[0].message_id, "new");

    let state = stream_status(&target).unwrap().state;
    assert!(state.first_run_completed);
    assert_eq!(state.cursor_received_utc.as_deref(), Some(new_at.as_str()));
}

#[test]
fn test_cursor_never_moves_backwards() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    let target = inbox_target(tmp.child("state").path());
    let store = target.store();

    let cursor = iso(hours_ago(2));
    let mut state = StreamState::new(&target.identity());
    state.first_run_completed = true;
    state.cursor_received_utc = Some(cursor.clone());
    store.save_state(&state).unwrap();

    // Older than the cursor but inside the overlap window
    mailbox.add_message("m0", "Late", &iso(hours_ago(12)), &[("a1", "late.txt", b"x")]);

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let details = summary.incremental.as_ref().unwrap();
    assert_eq!(summary.downloaded_count, 1);
    assert_eq!(details.cursor_before.as_deref(), Some(cursor.as_str()));
    assert_eq!(details.cursor_after.as_deref(), Some(cursor.as_str()));
}

#[test]
fn test_empty_run_advances_cursor_to_run_start() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    let target = inbox_target(tmp.child("state").path());
    let before = iso(hours_ago(0));

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_eq!(summary.messages_scanned, 0);
    let after = summary.incremental.unwrap().cursor_after.unwrap();
    assert!(after >= before);
}

// ─── Failures ───────────────────────────────────────────────────────

#[test]
fn test_pending_failure_heals_on_next_run() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Flaky", &iso(hours_ago(5)), &[("a1", "flaky.zip", b"zip")]);
    mailbox.fail_download("a1", true);
    let target = inbox_target(tmp.child("state").path());

    let first = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_eq!(first.failed_count, 1);
    let state = stream_status(&target).unwrap().state;
    let pending = state.pending_failures.get("m1:a1").unwrap();
    assert_eq!(pending.attempts, 1);
    assert!(pending.last_error.contains("service unavailable"));

    // The message no longer shows up in listings; only the retry can fetch it.
    mailbox.fail_download("a1", false);
    mailbox.hide_messages();

    let second = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let details = second.incremental.as_ref().unwrap();
    assert_eq!(details.retried_pending, 1);
    assert_eq!(details.retried_success, 1);
    assert_eq!(details.retry_downloaded_count, 1);
    assert_eq!(second.downloaded_count, 1);

    let status = stream_status(&target).unwrap();
    assert_eq!(status.pending_failures_count, 0);
    assert_eq!(status.completed_keys_count, 1);
    assert_eq!(status.state.failed_total, 1);
    assert_eq!(status.state.downloaded_total, 1);
}

#[test]
fn test_repeated_failure_increments_attempts() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Flaky", &iso(hours_ago(5)), &[("a1", "flaky.zip", b"zip")]);
    mailbox.fail_download("a1", true);
    let target = inbox_target(tmp.child("state").path());

    run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let second = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_eq!(second.incremental.as_ref().unwrap().retried_failed, 1);

    let state = stream_status(&target).unwrap().state;
    assert!(state.pending_failures["m1:a1"].attempts >= 2);
}

#[test]
fn test_listing_failure_is_isolated_to_its_message() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("bad", "Broken", &iso(hours_ago(4)), &[("a1", "x.txt", b"x")]);
    mailbox.add_message("good", "Fine", &iso(hours_ago(3)), &[("a2", "y.txt", b"y")]);
    mailbox.fail_listing("bad");
    let target = inbox_target(tmp.child("state").path());

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_eq!(summary.messages_scanned, 2);
    assert_eq!(summary.downloaded_count, 1);
    assert_eq!(summary.failed_count, 1);

    let bad = summary.messages.iter().find(|m| m.message_id == "bad").unwrap();
    assert!(bad.failed[0].dedupe_key.is_none());
    assert_eq!(stream_status(&target).unwrap().pending_failures_count, 0);

    tmp.child("state")
        .child(&summary.stream_id)
        .child("ledger.jsonl")
        .assert(predicate::str::contains("\"phase\":\"list_attachments\""));
}

#[test]
fn test_attachment_failures_do_not_affect_siblings() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message(
        "m1",
        "Mixed",
        &iso(hours_ago(2)),
        &[
            ("a1", "good.txt", &b"ok"[..]),
            ("a2", "x.txt", &b"1"[..]),
            ("a3", "broken.bin", &b"zz"[..]),
        ],
    );
    mailbox.clear_attachment_id("m1", "a2");
    mailbox.fail_download("a3", true);
    let target = inbox_target(tmp.child("state").path());

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let outcome = &summary.messages[0];
    assert_eq!(outcome.attachments_total, 3);
    assert_eq!(outcome.downloaded_count, 1);
    assert_eq!(outcome.failed_count, 2);
    assert_eq!(outcome.downloaded[0].saved.attachment_id, "a1");
    assert!(predicate::path::is_file().eval(&outcome.downloaded[0].saved.saved_path));

    let idless = outcome
        .failed
        .iter()
        .find(|f| f.attachment_id.is_none())
        .unwrap();
    assert_eq!(idless.dedupe_key.as_deref(), Some("m1:x.txt:1"));
    assert_eq!(idless.error, "attachment id missing");

    let state = stream_status(&target).unwrap().state;
    let pending: Vec<&str> = state.pending_failures.keys().map(String::as_str).collect();
    assert_eq!(pending, vec!["m1:a3", "m1:x.txt:1"]);
    assert_eq!(state.pending_failures["m1:x.txt:1"].attachment_id, "");

    tmp.child("state")
        .child(&summary.stream_id)
        .child("ledger.jsonl")
        .assert(
            predicate::str::contains("\"dedupe_key\":\"m1:x.txt:1\"")
                .and(predicate::str::contains("\"error\":\"attachment id missing\""))
                .and(predicate::str::contains("\"event\":\"failed\"")),
        );
}

#[test]
fn test_skip_clears_stale_pending_entry() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Done", &iso(hours_ago(2)), &[("a1", "done.txt", b"done")]);
    let target = inbox_target(tmp.child("state").path());
    let out = tmp.child("out");

    run_recent(&mailbox, &target, out.path(), &recent_options(false), &no_progress).unwrap();

    // A pending entry left behind for a key the ledger already has
    let store = target.store();
    let mut state = store.load_state(&target.identity()).unwrap();
    state.record_failure("m1:a1", "m1", "a1", "interrupted", chrono::Utc::now());
    store.save_state(&state).unwrap();
    assert_eq!(stream_status(&target).unwrap().pending_failures_count, 1);

    let summary = run_recent(&mailbox, &target, out.path(), &recent_options(false), &no_progress).unwrap();
    assert_eq!(summary.skipped_count, 1);
    assert_eq!(summary.downloaded_count, 0);
    assert_eq!(stream_status(&target).unwrap().pending_failures_count, 0);
    assert_eq!(mailbox.download_calls.get(), 1);
}

// ─── Files ──────────────────────────────────────────────────────────

#[test]
fn test_same_name_attachments_get_suffixes() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message(
        "m1",
        "Reports",
        &iso(hours_ago(1)),
        &[("a1", "report.pdf", b"one"), ("a2", "report.pdf", b"two")],
    );
    let target = inbox_target(tmp.child("state").path());

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let names: Vec<String> = summary.messages[0]
        .downloaded
        .iter()
        .map(|d| d.saved.saved_path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["report.pdf", "report_1.pdf"]);
    assert!(summary.output_dir.starts_with(tmp.child("out").path()));
    assert!(summary
        .output_dir
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("new_"));
}

#[test]
fn test_message_directory_created_only_on_save() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "Broken", &iso(hours_ago(1)), &[("a1", "a.txt", b"a")]);
    mailbox.fail_download("a1", true);
    let target = inbox_target(tmp.child("state").path());

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_eq!(summary.failed_count, 1);
    assert!(predicate::path::is_dir().eval(&summary.output_dir));
    assert!(std::fs::read_dir(&summary.output_dir).unwrap().next().is_none());
}

#[test]
fn test_ledger_records_run_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "One", &iso(hours_ago(1)), &[("a1", "a.txt", b"a")]);
    let target = inbox_target(tmp.child("state").path());

    let summary = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let ledger = tmp.child("state").child(&summary.stream_id).child("ledger.jsonl");
    ledger.assert(
        predicate::str::contains("\"event\":\"run_started\"")
            .and(predicate::str::contains("\"event\":\"downloaded\""))
            .and(predicate::str::contains("\"event\":\"run_completed\""))
            .and(predicate::str::contains(&summary.run_id)),
    );
    assert_eq!(stream_status(&target).unwrap().ledger_entries, 3);
}

// ─── Reset ──────────────────────────────────────────────────────────

#[test]
fn test_reset_requires_confirmation() {
    let tmp = TempDir::new().unwrap();
    let target = inbox_target(tmp.child("state").path());
    let err = reset_stream(&target, false).unwrap_err();
    assert_eq!(err.kind(), "ValueError");
    assert!(!reset_stream(&target, true).unwrap().removed);
}

#[test]
fn test_reset_makes_next_run_a_first_run() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "One", &iso(hours_ago(1)), &[("a1", "a.txt", b"a")]);
    let target = inbox_target(tmp.child("state").path());

    let first = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let saved = first.messages[0].downloaded[0].saved.saved_path.clone();

    let report = reset_stream(&target, true).unwrap();
    assert!(report.removed);
    assert!(!stream_status(&target).unwrap().exists);
    // Downloaded files are not part of the stream state.
    assert!(predicate::path::exists().eval(&saved));

    let again = run_new(&mailbox, &target, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let details = again.incremental.as_ref().unwrap();
    assert_eq!(details.since_source, "first_run_backfill_15d");
    assert_eq!(again.downloaded_count, 1);
}

#[test]
fn test_streams_are_isolated_by_folder() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    mailbox.add_message("m1", "One", &iso(hours_ago(1)), &[("a1", "a.txt", b"a")]);
    let inbox = inbox_target(tmp.child("state").path());
    let mut other = inbox.clone();
    other.folder.resolved_id = "archive-id".to_string();

    let a = run_new(&mailbox, &inbox, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    let b = run_new(&mailbox, &other, tmp.child("out").path(), &new_options(), &no_progress).unwrap();
    assert_ne!(a.stream_id, b.stream_id);
    assert_eq!(b.downloaded_count, 1);
}

#[test]
fn test_invalid_options_fail_before_side_effects() {
    let tmp = TempDir::new().unwrap();
    let mailbox = FakeMailbox::new();
    let target = inbox_target(tmp.child("state").path());
    let options = NewOptions {
        overlap_hours: -1,
        ..new_options()
    };

    let err = run_new(&mailbox, &target, tmp.child("out").path(), &options, &no_progress).unwrap_err();
    assert_eq!(err.kind(), "ValueError");
    tmp.child("state").assert(predicate::path::missing());
    tmp.child("out").assert(predicate::path::missing());
}
