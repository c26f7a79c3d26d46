//! Append-only JSONL run journal at `<run_dir>/events.jsonl`.

use super::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        deployment: String,
        dry_run: bool,
        parallel: bool,
    },
    StageStarted {
        run_id: String,
        stage: String,
        /// BLAKE3 of the rendered main script
        script_hash: String,
    },
    StageDone {
        run_id: String,
        stage: String,
        duration_seconds: f64,
        outputs: usize,
    },
    StageInterrupted {
        run_id: String,
        stage: String,
        reason: String,
    },
    RunCompleted {
        run_id: String,
        succeeded: bool,
        stages_done: usize,
        duration_seconds: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Derive the journal path for a run directory.
pub fn event_log_path(run_dir: &Path) -> PathBuf {
    run_dir.join("events.jsonl")
}

/// `blake3:<hex>` digest of a script.
pub fn hash_script(script: &str) -> String {
    format!("blake3:{}", blake3::hash(script.as_bytes()).to_hex())
}

/// Journal shared by every family of a run.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: event_log_path(run_dir),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event; a write failure is logged and otherwise ignored.
    pub fn record(&self, event: RunEvent) {
        if let Err(e) = self.append(event) {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot append run event");
        }
    }

    pub fn append(&self, event: RunEvent) -> Result<()> {
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let te = TimestampedEvent {
            ts: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&te)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<TimestampedEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}
