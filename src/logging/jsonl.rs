//! JSONL (JSON Lines) mirror of audit events
//!
//! Every event sent to the control plane can also be appended to a local
//! file, one JSON object per line with a millisecond timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::control::AuditSink;
use crate::protocol::ControlEvent;

/// One line of the audit file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    /// Time the event was recorded
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: ControlEvent,
}

impl AuditRecord {
    /// Stamp an event with the current time
    pub fn new(event: ControlEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// JSONL file writer with thread-safe buffered output
pub struct JsonlWriter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlWriter {
    /// Open the file for appending, creating it and its parent directory
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one record
    pub fn write(&self, record: &AuditRecord) -> std::io::Result<()> {
        let json = record
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?;

        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Flush any buffered data to the file
    pub fn flush(&self) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("Lock poisoned"))?;

        writer.flush()
    }
}

#[async_trait]
impl AuditSink for JsonlWriter {
    async fn emit(&self, event: ControlEvent) {
        if let Err(e) = self.write(&AuditRecord::new(event)) {
            tracing::warn!(error = %e, "Failed to write JSONL audit record");
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        // Best effort flush on drop
        let _ = self.flush();
    }
}
