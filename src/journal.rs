use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::Stage;
use crate::events::Event;
use crate::model::VmId;

/// Journal entry status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalStatus {
    Start,
    Ok,
    Fail,
}

/// A single journal entry (NDJSON line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Drill the entry belongs to.
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub source_vm: Option<VmId>,
    pub stage: Option<Stage>,
    pub status: JournalStatus,
    pub event: Event,
}

impl JournalEntry {
    pub fn from_event(id: Uuid, event: &Event) -> Self {
        let status = if event.is_failure() {
            JournalStatus::Fail
        } else if matches!(
            event,
            Event::DrillStarted { .. } | Event::JobTriggered { .. }
        ) {
            JournalStatus::Start
        } else {
            JournalStatus::Ok
        };
        Self {
            id,
            ts: Utc::now(),
            source_vm: event.source_vm().map(str::to_string),
            stage: event.stage(),
            status,
            event: event.clone(),
        }
    }
}

/// Journal writer that appends NDJSON lines.
pub struct JournalWriter {
    file: std::fs::File,
}

impl JournalWriter {
    /// Open journal file for appending.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn write(&mut self, entry: &JournalEntry) -> anyhow::Result<()> {
        let line = serde_json::to_string(entry)?;
        use std::io::Write;
        writeln!(&mut self.file, "{}", line)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read journal entries from a file.
pub fn read_journal(path: &Path) -> anyhow::Result<Vec<JournalEntry>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| anyhow::anyhow!("invalid journal line: {}", e))
        })
        .collect()
}
