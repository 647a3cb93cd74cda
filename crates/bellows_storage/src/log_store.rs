//! Per-job build log storage.
//!
//! One NDJSON file per job under `<root>/jobs/<job_id>.ndjson`, each line
//! `{"stream": ..., "data": ..., "time": ...}`. Chunks are flushed on append
//! so viewers backfilling mid-run see everything written so far.

use anyhow::{Context, Result};
use bellows_protocol::{JobId, LogStream};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// One stored log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogStream,
    pub data: String,
    pub time: DateTime<Utc>,
}

/// Append-only NDJSON log store.
pub struct LogStore {
    root: PathBuf,
    // Open append handles for running jobs; dropped on finalize.
    open: Mutex<HashMap<JobId, File>>,
}

impl LogStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        let jobs = root.join("jobs");
        fs::create_dir_all(&jobs)
            .with_context(|| format!("Failed to create log directory: {}", jobs.display()))?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.root.join("jobs").join(format!("{}.ndjson", job_id))
    }

    /// Append one chunk, timestamped now.
    pub fn append_chunk(&self, job_id: &JobId, stream: LogStream, data: &str) -> Result<()> {
        let entry = LogEntry {
            stream,
            data: data.to_string(),
            time: Utc::now(),
        };
        let line = serde_json::to_string(&entry)?;

        let mut open = self.open.lock().expect("log store lock poisoned");
        if !open.contains_key(job_id) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(job_id))
                .with_context(|| format!("Failed to open log file for job {}", job_id))?;
            open.insert(job_id.clone(), file);
        }
        let file = open.get_mut(job_id).expect("just inserted");
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    /// All entries for a job, in stored (append) order.
    pub fn read_entries(&self, job_id: &JobId) -> Result<Vec<LogEntry>> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path)
            .with_context(|| format!("Failed to read log file for job {}", job_id))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping corrupt log line for job {}: {}", job_id, e),
            }
        }
        Ok(entries)
    }

    /// Flush and drop the append handle. No further chunks are expected.
    pub fn finalize(&self, job_id: &JobId) -> Result<()> {
        let mut open = self.open.lock().expect("log store lock poisoned");
        if let Some(mut file) = open.remove(job_id) {
            file.flush()?;
        }
        Ok(())
    }
}
