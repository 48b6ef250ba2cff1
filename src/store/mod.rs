//! Checkpoint persistence.
//!
//! A checkpoint is a consistent snapshot of a run: the aggregate table, the
//! terminal status of every unit that contributed to it, and the loader
//! cursor to resume from. Statuses are saved as a delta over a base
//! checkpoint and loaded back in full. Stores must make a save
//! all-or-nothing: after a failed save the previous checkpoint is still the
//! latest one.
#[cfg(test)]
pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::aggregate::AggregateTable;
use crate::loader::Cursor;
use crate::status::UnitStatus;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointToken(pub i64);

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a run resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    Latest,
    Token(CheckpointToken),
}

impl FromStr for ResumeFrom {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(ResumeFrom::Latest);
        }
        s.parse::<i64>()
            .map(|id| ResumeFrom::Token(CheckpointToken(id)))
            .map_err(|_| format!("invalid resume token: {s} (expected a checkpoint id or \"latest\")"))
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown checkpoint {0}")]
    UnknownToken(CheckpointToken),

    #[error("checkpoint {token} was taken over corpus {found}, not {expected}")]
    CorpusMismatch {
        token: CheckpointToken,
        expected: String,
        found: String,
    },

    #[error("checkpoint {token} is corrupt: {message}")]
    Corrupt {
        token: CheckpointToken,
        message: String,
    },

    #[cfg(test)]
    #[error("injected checkpoint failure")]
    Injected,
}

/// Everything a run needs to resume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub corpus_id: String,
    /// Every unit before this offset is settled (in `statuses` or never
    /// enumerated by this shard).
    pub cursor: Cursor,
    pub table: AggregateTable,
    /// Checkpoint whose statuses this one extends. Loaded snapshots are
    /// complete and have no base.
    pub base: Option<CheckpointToken>,
    /// On save, the statuses settled since `base`; on load, every one.
    pub statuses: Vec<UnitStatus>,
    /// Units settled in total as of this checkpoint.
    pub units: u64,
}

/// Summary row of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointInfo {
    pub token: CheckpointToken,
    pub created_at: DateTime<Utc>,
    pub corpus_id: String,
    pub cursor: Cursor,
    pub units: u64,
}

pub trait CheckpointStore: Send {
    /// Persist `snapshot` atomically and return its token.
    fn save(&mut self, snapshot: &Snapshot) -> Result<CheckpointToken, CheckpointError>;

    fn load(&self, token: CheckpointToken) -> Result<Snapshot, CheckpointError>;

    fn latest(&self) -> Result<Option<CheckpointToken>, CheckpointError>;

    /// Stored checkpoints, oldest first.
    fn list(&self) -> Result<Vec<CheckpointInfo>, CheckpointError>;

    /// Token a resume request refers to; `None` when resuming from "latest"
    /// in an empty store.
    fn resolve(&self, from: ResumeFrom) -> Result<Option<CheckpointToken>, CheckpointError> {
        match from {
            ResumeFrom::Latest => self.latest(),
            ResumeFrom::Token(token) => Ok(Some(token)),
        }
    }

    /// Load a checkpoint, refusing one taken over a different corpus.
    fn load_for(&self, token: CheckpointToken, corpus_id: &str) -> Result<Snapshot, CheckpointError> {
        let snapshot = self.load(token)?;
        if snapshot.corpus_id != corpus_id {
            return Err(CheckpointError::CorpusMismatch {
                token,
                expected: corpus_id.to_string(),
                found: snapshot.corpus_id,
            });
        }
        Ok(snapshot)
    }
}
