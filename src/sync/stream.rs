//! Stream identity and on-disk layout.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use super::ledger::Ledger;
use super::state::{load_state, save_state, StreamState};
use crate::error::{GraphMailError, Result};

/// Hex characters kept from the identity hash.
const STREAM_ID_LEN: usize = 24;

/// Inputs that identify a stream, plus the display path stored alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    pub profile: String,
    pub account_home_id: String,
    pub folder_id: String,
    pub folder_path: Option<String>,
}

impl StreamIdentity {
    pub fn stream_id(&self) -> String {
        stream_id(&self.profile, &self.account_home_id, &self.folder_id)
    }
}

/// First 24 hex chars of `sha256("{profile}|{account}|{folder}")`.
pub fn stream_id(profile: &str, account_home_id: &str, folder_id: &str) -> String {
    let digest = Sha256::digest(format!("{profile}|{account_home_id}|{folder_id}").as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(STREAM_ID_LEN);
    hex
}

/// Files of one stream: `<base>/<stream id>/{state.json,ledger.jsonl}`.
#[derive(Debug, Clone)]
pub struct StreamStore {
    id: String,
    dir: PathBuf,
    state_file: PathBuf,
    ledger: Ledger,
}

impl StreamStore {
    pub fn open(base_dir: &Path, identity: &StreamIdentity) -> Self {
        let id = identity.stream_id();
        let dir = base_dir.join(&id);
        Self {
            state_file: dir.join("state.json"),
            ledger: Ledger::new(dir.join("ledger.jsonl")),
            id,
            dir,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_file
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// True if either the state or the ledger file exists.
    pub fn exists(&self) -> bool {
        self.state_file.exists() || self.ledger.path().exists()
    }

    pub fn load_state(&self, identity: &StreamIdentity) -> Result<StreamState> {
        load_state(&self.state_file, identity)
    }

    pub fn save_state(&self, state: &StreamState) -> Result<()> {
        save_state(&self.state_file, state)
    }

    /// Delete the stream directory with its state and ledger.
    ///
    /// Returns `false` if there was nothing to delete.
    pub fn reset(&self) -> Result<bool> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!(stream_id = %self.id, "Stream state reset");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GraphMailError::io(&self.dir, e)),
        }
    }
}
