use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::{CheckpointError, CheckpointInfo, CheckpointStore, CheckpointToken, Snapshot};
use crate::aggregate::{AggregateRow, AggregateTable};
use crate::loader::Cursor;
use crate::status::{FailureKind, UnitState, UnitStatus};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at DATETIME NOT NULL,
    corpus_id TEXT NOT NULL,
    cursor INTEGER NOT NULL,
    units_committed INTEGER NOT NULL,
    -- statuses not stored under this id are inherited from the base
    base_id INTEGER
);

CREATE TABLE IF NOT EXISTS aggregate_entries (
    checkpoint_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    identifier TEXT NOT NULL,
    count INTEGER NOT NULL,
    sum REAL,
    min REAL,
    max REAL,
    PRIMARY KEY (checkpoint_id, kind, identifier),
    FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS unit_status (
    checkpoint_id INTEGER NOT NULL,
    unit_id TEXT NOT NULL,
    unit_offset INTEGER NOT NULL,
    content_hash TEXT,
    state TEXT NOT NULL,
    failure_kind TEXT,
    reason TEXT,
    PRIMARY KEY (checkpoint_id, unit_id),
    FOREIGN KEY (checkpoint_id) REFERENCES checkpoints(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_status_state ON unit_status(checkpoint_id, state);

CREATE VIEW IF NOT EXISTS latest_aggregates AS
    SELECT kind, identifier, count, sum, min, max
    FROM aggregate_entries
    WHERE checkpoint_id = (SELECT MAX(id) FROM checkpoints);
"#;

/// Checkpoints in a SQLite database.
///
/// Each save is one transaction; if anything fails before the commit the
/// transaction is rolled back when it is dropped, leaving the previous
/// checkpoint as the latest. A save writes only the statuses that changed
/// since its base; loading follows the chain of bases back to the first.
pub struct SqliteStore {
    conn: Connection,
    retain: usize,
}

impl SqliteStore {
    /// Open (or create) a checkpoint database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        info!("Opening checkpoint database: {}", path.display());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, retain: 0 })
    }

    /// Keep only the newest `retain` checkpoints (0 keeps all).
    #[must_use]
    pub fn with_retain(mut self, retain: usize) -> Self {
        self.retain = retain;
        self
    }

    /// Aggregate rows of the newest checkpoint, read through the
    /// `latest_aggregates` view.
    pub fn latest_aggregates(&self) -> Result<AggregateTable, CheckpointError> {
        let mut stmt = self
            .conn
            .prepare("SELECT kind, identifier, count, sum, min, max FROM latest_aggregates")?;
        let rows = stmt.query_map([], read_aggregate_row)?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        AggregateTable::from_rows(rows).map_err(|message| CheckpointError::Corrupt {
            token: CheckpointToken(-1),
            message,
        })
    }
}

fn read_aggregate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggregateRow> {
    Ok(AggregateRow {
        kind: row.get(0)?,
        identifier: row.get(1)?,
        count: row.get::<_, i64>(2)? as u64,
        sum: row.get(3)?,
        min: row.get(4)?,
        max: row.get(5)?,
    })
}

/// Status row as stored, before its state is validated.
type StatusRow = (String, i64, Option<String>, String, Option<String>, Option<String>);

fn read_status(token: CheckpointToken, row: StatusRow) -> Result<UnitStatus, CheckpointError> {
    let (unit_id, offset, content_hash, state, kind, reason) = row;
    let corrupt = |message: String| CheckpointError::Corrupt { token, message };
    let state = match state.as_str() {
        "succeeded" => UnitState::Succeeded,
        "failed" => {
            let kind: FailureKind = kind
                .as_deref()
                .unwrap_or_default()
                .parse()
                .map_err(corrupt)?;
            UnitState::Failed {
                kind,
                reason: reason.unwrap_or_default(),
            }
        }
        other => return Err(corrupt(format!("non-terminal state {other} for {unit_id}"))),
    };
    Ok(UnitStatus {
        unit_id,
        offset: offset as u64,
        content_hash,
        state,
    })
}

/// Drop all but the newest `retain` checkpoints. Statuses of a dropped
/// checkpoint move into the surviving checkpoints based on it, without
/// overriding their own; newest first, so later statuses win.
fn prune(tx: &Transaction<'_>, retain: usize) -> Result<usize, CheckpointError> {
    let doomed = {
        let mut stmt = tx.prepare(
            "SELECT id, base_id FROM checkpoints WHERE id NOT IN
             (SELECT id FROM checkpoints ORDER BY id DESC LIMIT ?)
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![retain as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    for (id, base) in &doomed {
        let heirs = {
            let mut stmt = tx.prepare("SELECT id FROM checkpoints WHERE base_id = ?")?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for heir in heirs {
            tx.execute(
                "INSERT OR IGNORE INTO unit_status
                 (checkpoint_id, unit_id, unit_offset, content_hash, state, failure_kind, reason)
                 SELECT ?, unit_id, unit_offset, content_hash, state, failure_kind, reason
                 FROM unit_status WHERE checkpoint_id = ?",
                params![heir, id],
            )?;
            tx.execute(
                "UPDATE checkpoints SET base_id = ? WHERE id = ?",
                params![base, heir],
            )?;
        }
        tx.execute("DELETE FROM checkpoints WHERE id = ?", params![id])?;
    }
    Ok(doomed.len())
}

impl CheckpointStore for SqliteStore {
    fn save(&mut self, snapshot: &Snapshot) -> Result<CheckpointToken, CheckpointError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO checkpoints (created_at, corpus_id, cursor, units_committed, base_id)
             VALUES (?, ?, ?, ?, ?)",
            params![
                Utc::now(),
                snapshot.corpus_id,
                snapshot.cursor.0 as i64,
                snapshot.units as i64,
                snapshot.base.map(|token| token.0)
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut insert = tx.prepare(
                "INSERT INTO aggregate_entries (checkpoint_id, kind, identifier, count, sum, min, max)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for row in snapshot.table.rows() {
                insert.execute(params![
                    id,
                    row.kind,
                    row.identifier,
                    row.count as i64,
                    row.sum,
                    row.min,
                    row.max
                ])?;
            }

            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO unit_status
                 (checkpoint_id, unit_id, unit_offset, content_hash, state, failure_kind, reason)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for status in &snapshot.statuses {
                let (kind, reason) = match status.failure() {
                    Some((kind, reason)) => (Some(kind.as_str()), Some(reason)),
                    None => (None, None),
                };
                insert.execute(params![
                    id,
                    status.unit_id,
                    status.offset as i64,
                    status.content_hash,
                    status.state.as_str(),
                    kind,
                    reason
                ])?;
            }
        }

        if self.retain > 0 {
            let pruned = prune(&tx, self.retain)?;
            if pruned > 0 {
                debug!("pruned {pruned} old checkpoints");
            }
        }

        tx.commit()?;
        Ok(CheckpointToken(id))
    }

    fn load(&self, token: CheckpointToken) -> Result<Snapshot, CheckpointError> {
        let header: Option<(String, i64, i64, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT corpus_id, cursor, units_committed, base_id FROM checkpoints WHERE id = ?",
                params![token.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((corpus_id, cursor, units, mut base)) = header else {
            return Err(CheckpointError::UnknownToken(token));
        };
        let corrupt = |message: String| CheckpointError::Corrupt { token, message };

        let mut stmt = self.conn.prepare(
            "SELECT kind, identifier, count, sum, min, max FROM aggregate_entries WHERE checkpoint_id = ?",
        )?;
        let rows = stmt
            .query_map(params![token.0], read_aggregate_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let table = AggregateTable::from_rows(rows).map_err(corrupt)?;

        let mut stmt = self.conn.prepare(
            "SELECT unit_id, unit_offset, content_hash, state, failure_kind, reason
             FROM unit_status WHERE checkpoint_id = ?",
        )?;
        let mut base_of = self
            .conn
            .prepare("SELECT base_id FROM checkpoints WHERE id = ?")?;
        let mut statuses: HashMap<String, UnitStatus> = HashMap::new();
        let mut link = Some(token.0);
        while let Some(id) = link {
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<Result<Vec<StatusRow>, _>>()?;
            for row in rows {
                let status = read_status(token, row)?;
                statuses.entry(status.unit_id.clone()).or_insert(status);
            }
            link = base.take();
            if let Some(next) = link {
                if next >= id {
                    return Err(corrupt(format!("checkpoint {id} is based on a later one ({next})")));
                }
                base = base_of
                    .query_row(params![next], |row| row.get::<_, Option<i64>>(0))
                    .optional()?
                    .ok_or_else(|| corrupt(format!("missing base checkpoint {next}")))?;
            }
        }

        let mut statuses: Vec<UnitStatus> = statuses.into_values().collect();
        statuses.sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.unit_id.cmp(&b.unit_id)));

        Ok(Snapshot {
            corpus_id,
            cursor: Cursor(cursor as u64),
            table,
            base: None,
            statuses,
            units: units as u64,
        })
    }

    fn latest(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        let id: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM checkpoints", [], |row| row.get(0))?;
        Ok(id.map(CheckpointToken))
    }

    fn list(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, corpus_id, cursor, units_committed FROM checkpoints ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let created_at: DateTime<Utc> = row.get(1)?;
            Ok(CheckpointInfo {
                token: CheckpointToken(row.get(0)?),
                created_at,
                corpus_id: row.get(2)?,
                cursor: Cursor(row.get::<_, i64>(3)? as u64),
                units: row.get::<_, i64>(4)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
