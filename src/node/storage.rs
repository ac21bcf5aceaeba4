//! Append-only message log: one JSON record per line.
//!
//! Records are written exactly once, from the delivery path, in delivery
//! order. Startup replays the whole file; catch-up reads a suffix.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::proto::{ChatRecord, NodeId, SeqNo};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open message log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to append to message log {path}: {source}")]
    Append {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read message log {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct MessageLog {
    path: PathBuf,
    file: File,
}

impl MessageLog {
    /// Open (creating if absent) `node_<id>_messages.jsonl` under `log_dir`.
    pub fn open(log_dir: &Path, node_id: NodeId) -> Result<Self, StorageError> {
        std::fs::create_dir_all(log_dir).map_err(|source| StorageError::Open {
            path: log_dir.to_path_buf(),
            source,
        })?;
        let path = log_dir.join(format!("node_{}_messages.jsonl", node_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StorageError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush. Failure here is fatal to the node:
    /// delivering what cannot be persisted would break total order across
    /// a restart.
    pub fn append(&mut self, record: &ChatRecord) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record).map_err(|source| StorageError::Append {
            path: self.path.clone(),
            source: source.into(),
        })?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|source| StorageError::Append {
                path: self.path.clone(),
                source,
            })
    }

    /// Stream all records in file order. Malformed lines (a torn tail
    /// write from a crash) are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<ChatRecord>, StorageError> {
        let file = File::open(&self.path).map_err(|source| StorageError::Read {
            path: self.path.clone(),
            source,
        })?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| StorageError::Read {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = lineno + 1,
                        "skipping malformed log line: {err}"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Records with `seq_no > since`, ascending. The file is written in
    /// delivery order, which is ascending seq order.
    pub fn records_after(&self, since: SeqNo) -> Result<Vec<ChatRecord>, StorageError> {
        let mut records: Vec<ChatRecord> = self
            .load_all()?
            .into_iter()
            .filter(|record| record.seq_no > since)
            .collect();
        records.sort_by_key(|record| record.seq_no);
        Ok(records)
    }

    /// Highest seq_no in the log, or zero when empty.
    pub fn last_seq(&self) -> Result<SeqNo, StorageError> {
        Ok(self
            .load_all()?
            .iter()
            .map(|record| record.seq_no)
            .max()
            .unwrap_or(SeqNo::ZERO))
    }
}
