//! Append-only record of what the agent did, one JSON object per line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AgentError;
use crate::session::Bucket;
use crate::types::{FailureKind, FillStrategy, RepairKind};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    Scanned {
        url: String,
        added: usize,
    },
    Classified {
        selector: String,
        strategy: FillStrategy,
        confidence: f64,
    },
    Settled {
        selector: String,
        label: String,
        bucket: Bucket,
        error: Option<FailureKind>,
    },
    Repair {
        selector: String,
        kind: RepairKind,
        confidence: f64,
    },
    Gate {
        form_completion: f64,
        success_rate: f64,
        cycle: u32,
    },
}

#[derive(Serialize)]
struct Line<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a JournalEvent,
}

pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();
        let persist = |source| AgentError::Persist {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(persist)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(persist)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, event: &JournalEvent) -> Result<(), AgentError> {
        let line = Line {
            at: Utc::now(),
            event,
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .map_err(|source| AgentError::Persist {
                path: self.path.clone(),
                source,
            })
    }
}

/// Writes the end-of-session summary next to the journal.
pub fn write_summary<T: Serialize>(path: &Path, summary: &T) -> Result<(), AgentError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| AgentError::Persist {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_event_is_one_timestamped_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(dir.path().join("run/actions.jsonl")).unwrap();
        journal
            .record(&JournalEvent::Scanned {
                url: "https://jobs.example.com".into(),
                added: 4,
            })
            .unwrap();
        journal
            .record(&JournalEvent::Settled {
                selector: "#email".into(),
                label: "Email".into(),
                bucket: Bucket::Completed,
                error: None,
            })
            .unwrap();

        let text = fs::read_to_string(journal.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "scanned");
        assert_eq!(lines[1]["bucket"], "completed");
        assert!(lines[1]["at"].is_string());
    }
}
