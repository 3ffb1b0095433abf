// SPDX-License-Identifier: AGPL-3.0
// LAN Shuttle Core - Transfer history persistence
//
// Stores finished transfer records in a local JSON file.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::session::{SessionInfo, SessionState};
use crate::settings::config_file;
use crate::types::{Role, SessionId, ShuttleError};

/// Maximum number of history entries to keep
const MAX_HISTORY_ENTRIES: usize = 100;

/// One finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub session_id: SessionId,
    pub role: Role,
    pub code: Option<String>,
    pub file_names: Vec<String>,
    pub total_bytes: u64,
    pub outcome: SessionState,
    pub reason: Option<String>,
    pub peer: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn from_session(info: &SessionInfo) -> Self {
        Self {
            session_id: info.id,
            role: info.role,
            code: info.code.as_ref().map(|c| c.to_string()),
            file_names: info.files.iter().map(|f| f.name.clone()).collect(),
            total_bytes: info.files.iter().map(|f| f.size_bytes).sum(),
            outcome: info.state,
            reason: info.reason.clone(),
            peer: info.peer.clone(),
            finished_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HistoryFile {
    records: Vec<TransferRecord>,
}

/// File-based transfer history storage
pub struct TransferHistory {
    records: RwLock<Vec<TransferRecord>>,
    file_path: Option<PathBuf>,
}

impl TransferHistory {
    /// Load from the platform config directory
    pub fn new() -> Result<Self, ShuttleError> {
        Self::with_path(config_file("history.json")?)
    }

    pub fn with_path(file_path: impl Into<PathBuf>) -> Result<Self, ShuttleError> {
        let file_path = file_path.into();

        let records = if file_path.exists() {
            let content = fs::read_to_string(&file_path)
                .map_err(|e| ShuttleError::FileIo(format!("Failed to read history: {}", e)))?;

            let file: HistoryFile = serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse history, starting fresh: {}", e);
                HistoryFile {
                    records: Vec::new(),
                }
            });

            file.records
        } else {
            Vec::new()
        };

        Ok(Self {
            records: RwLock::new(records),
            file_path: Some(file_path),
        })
    }

    /// History that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            file_path: None,
        }
    }

    fn persist(&self) -> Result<(), ShuttleError> {
        let Some(file_path) = &self.file_path else {
            return Ok(());
        };

        let file = HistoryFile {
            records: self.records.read().clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|e| {
            ShuttleError::Serialization(format!("Failed to serialize history: {}", e))
        })?;

        fs::write(file_path, content)
            .map_err(|e| ShuttleError::FileIo(format!("Failed to write history: {}", e)))?;

        Ok(())
    }

    /// All records, newest first
    pub fn list(&self) -> Vec<TransferRecord> {
        self.records.read().clone()
    }

    pub fn add(&self, record: TransferRecord) -> Result<(), ShuttleError> {
        {
            let mut records = self.records.write();
            records.insert(0, record);
            records.truncate(MAX_HISTORY_ENTRIES);
        }

        self.persist()
    }

    pub fn clear(&self) -> Result<(), ShuttleError> {
        self.records.write().clear();
        self.persist()
    }

    pub fn count(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for TransferHistory {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::in_memory())
    }
}
