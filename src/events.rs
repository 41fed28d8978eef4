//! Append-only interaction log.
//!
//! One JSON object per line, written with a single `O_APPEND` write per
//! record so independent sessions can log concurrently without coordination.
//! Records are immutable once written and outlive the in-memory session.
//! Logging is best-effort telemetry: a write failure is warned about and
//! swallowed, never surfaced to the participant.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StudyError;
use crate::session::{now_ms, Session};

/// Default logical namespace for the log file.
pub const DEFAULT_EVENTS_PATH: &str = "experiment_data/events.json";

const SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AssistantResponse,
    LinkClick,
    ProceedClicked,
    ReturnFromFigma,
}

/// One immutable, timestamped occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: u8,
    pub participant_id: String,
    pub condition: String,
    pub card_version: String,
    pub timestamp_ms: u64,
    pub event_type: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    pub fn new(session: &Session, event_type: EventKind, payload: serde_json::Value) -> Self {
        EventRecord {
            schema_version: SCHEMA_VERSION,
            participant_id: session.participant_id.clone(),
            condition: session.condition_label(),
            card_version: session.card_version_label(),
            timestamp_ms: now_ms(),
            event_type,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

pub struct EventLogger {
    path: PathBuf,
}

impl EventLogger {
    /// Create a logger for `path`, eagerly creating parent directories. A
    /// directory that cannot be created is only warned about here; the
    /// append path reports its own failures.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!(path = %parent.display(), error = %e, "event log directory unavailable");
                }
            }
        }
        EventLogger { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.
    pub fn log(&self, record: &EventRecord) -> Result<(), StudyError> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| StudyError::EventLog(std::io::Error::other(e)))?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Append with the best-effort policy: failures are warned and dropped.
    pub fn log_best_effort(&self, record: &EventRecord) {
        if let Err(e) = self.log(record) {
            tracing::warn!(
                participant_id = %record.participant_id,
                event = ?record.event_type,
                error = %e,
                "dropping event record"
            );
        }
    }

    /// Replay the whole log in write order. Lines that do not parse are
    /// skipped (a torn final line after a crash must not poison the export).
    pub fn read_all(&self) -> Result<Vec<EventRecord>, StudyError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StudyError::EventLog(e)),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Counters reconstructed from the log for one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayCounters {
    pub chat_rounds: u32,
    pub link_shown_count: u32,
    pub link_click_count: u32,
    pub link_clicked: bool,
}

/// Fold the event sequence back into per-participant counters. Applying the
/// records in write order reproduces the live session counters as they stood
/// when each record was appended.
pub fn replay_counters(records: &[EventRecord]) -> HashMap<String, ReplayCounters> {
    let mut out: HashMap<String, ReplayCounters> = HashMap::new();
    for record in records {
        let counters = out.entry(record.participant_id.clone()).or_default();
        match record.event_type {
            EventKind::AssistantResponse => {
                counters.chat_rounds += 1;
                if record.payload.get("card_shown").and_then(|v| v.as_bool()) == Some(true) {
                    counters.link_shown_count += 1;
                }
            }
            EventKind::LinkClick => {
                counters.link_click_count += 1;
                counters.link_clicked = true;
            }
            EventKind::UserMessage | EventKind::ProceedClicked | EventKind::ReturnFromFigma => {}
        }
    }
    out
}
