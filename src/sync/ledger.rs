//! Append-only event log of a stream.
//!
//! One compact JSON object per line, keys sorted. Lines are only ever
//! appended; the file is removed only by a stream reset. Replay tolerates
//! unparseable lines so a torn trailing write never blocks the next run.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{iso_utc, now_utc};
use crate::error::{GraphMailError, Result};

/// Kind of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    RunStarted,
    RunCompleted,
    Downloaded,
    SkippedAlreadyDownloaded,
    Failed,
}

/// One ledger record: kind, run id and free-form fields.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub run_id: String,
    pub fields: Map<String, Value>,
}

impl LedgerEvent {
    pub fn new(kind: LedgerEventKind, run_id: &str) -> Self {
        Self {
            kind,
            run_id: run_id.to_string(),
            fields: Map::new(),
        }
    }

    /// Add a field. Values that fail to serialize are stored as `null`.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.fields.insert(
            key.to_string(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }

    /// The JSON object written to disk. `ts` defaults to now.
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = self.fields.clone();
        record.insert(
            "event".to_string(),
            serde_json::to_value(self.kind).unwrap_or(Value::Null),
        );
        record.insert("run_id".to_string(), Value::from(self.run_id.as_str()));
        record
            .entry("ts")
            .or_insert_with(|| Value::from(iso_utc(now_utc())));
        record
    }
}

/// Handle to a stream's `ledger.jsonl`.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line, creating the file on first write.
    pub fn append(&self, event: &LedgerEvent) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| GraphMailError::io(dir, e))?;
        }

        // serde_json's Map is ordered, so keys come out sorted
        let mut line = Value::Object(event.to_record()).to_string();
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| GraphMailError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| GraphMailError::io(&self.path, e))?;
        Ok(())
    }

    /// Dedupe keys with at least one `downloaded` event.
    pub fn load_completed_keys(&self) -> Result<HashSet<String>> {
        let mut completed = HashSet::new();
        let Some(reader) = self.open_reader()? else {
            return Ok(completed);
        };

        let mut skipped = 0usize;
        for line in reader.split(b'\n') {
            let line = line.map_err(|e| GraphMailError::io(&self.path, e))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let Ok(record) = serde_json::from_slice::<Value>(&line) else {
                skipped += 1;
                continue;
            };
            if record.get("event").and_then(Value::as_str) != Some("downloaded") {
                continue;
            }
            if let Some(key) = record
                .get("dedupe_key")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|k| !k.is_empty())
            {
                completed.insert(key.to_string());
            }
        }

        if skipped > 0 {
            debug!(path = %self.path.display(), skipped, "Ignored unparseable ledger lines");
        }
        Ok(completed)
    }

    /// Number of lines in the ledger, for diagnostics.
    pub fn count_entries(&self) -> Result<usize> {
        let Some(reader) = self.open_reader()? else {
            return Ok(0);
        };
        let mut count = 0;
        for line in reader.split(b'\n') {
            line.map_err(|e| GraphMailError::io(&self.path, e))?;
            count += 1;
        }
        Ok(count)
    }

    fn open_reader(&self) -> Result<Option<BufReader<File>>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GraphMailError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downloaded(run: &str, key: &str) -> LedgerEvent {
        LedgerEvent::new(LedgerEventKind::Downloaded, run).with("dedupe_key", key)
    }

    #[test]
    fn test_append_writes_sorted_compact_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path().join("s1").join("ledger.jsonl"));
        ledger
            .append(&downloaded("r1", "m1:a1").with("name", "x.pdf"))
            .unwrap();

        let content = std::fs::read_to_string(ledger.path()).unwrap();
        let line = content.lines().next().unwrap();
        assert!(line.starts_with(r#"{"dedupe_key":"m1:a1","event":"downloaded","name":"x.pdf","run_id":"r1","ts":""#));
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_explicit_ts_is_kept() {
        let record = downloaded("r1", "k")
            .with("ts", "2024-01-01T00:00:00Z")
            .to_record();
        assert_eq!(record["ts"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn test_completed_keys_only_from_downloaded_events() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path().join("ledger.jsonl"));
        ledger.append(&downloaded("r1", "m1:a1")).unwrap();
        ledger
            .append(&LedgerEvent::new(LedgerEventKind::Failed, "r1").with("dedupe_key", "m1:a2"))
            .unwrap();
        ledger
            .append(
                &LedgerEvent::new(LedgerEventKind::SkippedAlreadyDownloaded, "r2")
                    .with("dedupe_key", "m1:a1"),
            )
            .unwrap();

        let keys = ledger.load_completed_keys().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("m1:a1"));
        assert_eq!(ledger.count_entries().unwrap(), 3);
    }

    #[test]
    fn test_replay_skips_torn_and_garbage_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ledger.jsonl");
        std::fs::write(
            &path,
            b"{\"event\":\"downloaded\",\"dedupe_key\":\"m1:a1\"}\n\
              not json\n\
              \xff\xfe\n\
              \n\
              {\"event\":\"downloaded\",\"dedupe_key\":\"  \"}\n\
              {\"event\":\"downloaded\",\"dedupe_key\":\"m2:a",
        )
        .unwrap();

        let ledger = Ledger::new(&path);
        let keys = ledger.load_completed_keys().unwrap();
        assert_eq!(keys, HashSet::from(["m1:a1".to_string()]));
        assert_eq!(ledger.count_entries().unwrap(), 6);
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(tmp.path().join("absent.jsonl"));
        assert!(ledger.load_completed_keys().unwrap().is_empty());
        assert_eq!(ledger.count_entries().unwrap(), 0);
    }
}
