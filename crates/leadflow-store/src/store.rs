use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::traits::{FlowStore, MessageStore};
use leadflow_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sequences (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        name TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        steps_json TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS pipelines (
        product_id TEXT PRIMARY KEY,
        stages_json TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS contacts (
        id TEXT PRIMARY KEY,
        deleted INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS leads (
        id TEXT PRIMARY KEY,
        product_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        stage TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_leads_contact ON leads(contact_id);

    CREATE TABLE IF NOT EXISTS cursors (
        id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL,
        sequence_id TEXT NOT NULL,
        contact_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        state TEXT NOT NULL,
        wait_json TEXT,
        due_at INTEGER,
        listening INTEGER NOT NULL DEFAULT 0,
        stop_reason TEXT,
        failure_json TEXT,
        started_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_cursors_one_active
        ON cursors(lead_id) WHERE state NOT IN ('stopped', 'completed');

    CREATE INDEX IF NOT EXISTS idx_cursors_state ON cursors(state);

    CREATE INDEX IF NOT EXISTS idx_cursors_due
        ON cursors(due_at) WHERE state = 'waiting_for_event';

    CREATE INDEX IF NOT EXISTS idx_cursors_listening
        ON cursors(lead_id) WHERE state = 'waiting_for_event' AND listening = 1;

    CREATE TABLE IF NOT EXISTS cursor_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cursor_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        kind TEXT NOT NULL,
        detail TEXT NOT NULL,
        at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_cursor_log_cursor ON cursor_log(cursor_id, id);

    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        contact_id TEXT NOT NULL,
        direction TEXT NOT NULL,
        body TEXT NOT NULL,
        ts INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_contact
        ON messages(contact_id, direction, ts);
";

/// SQLite-backed store for sequences, pipelines, leads, cursors and message history.
///
/// Timestamps are stored as Unix milliseconds so range queries compare numerically.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LeadflowError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadflowError::Database(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Authoring writes
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Insert or replace a sequence with all its steps.
    pub fn save_sequence(&self, sequence: &Sequence) -> Result<()> {
        let mut sequence = sequence.clone();
        sequence.normalize();
        let steps_json = serde_json::to_string(&sequence.steps)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sequences (id, account_id, name, active, steps_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                account_id = excluded.account_id,
                name = excluded.name,
                active = excluded.active,
                steps_json = excluded.steps_json",
            params![
                sequence.id.as_str(),
                sequence.account_id,
                sequence.name,
                sequence.active as i64,
                steps_json,
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    /// All sequences, ordered by name.
    pub fn list_sequences(&self) -> Result<Vec<Sequence>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, account_id, name, active, steps_json FROM sequences ORDER BY name")
            .map_err(db)?;
        let rows = stmt.query_map([], sequence_row).map_err(db)?;

        let mut sequences = Vec::new();
        for row in rows {
            sequences.push(decode_sequence(row.map_err(db)?)?);
        }
        Ok(sequences)
    }

    /// Delete a sequence. Cursors still pointing at it fail when they next run.
    pub fn delete_sequence(&self, id: &SequenceId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sequences WHERE id = ?1", params![id.as_str()])
            .map_err(db)?;
        Ok(())
    }

    /// Insert or replace a product pipeline.
    pub fn save_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let stages_json = serde_json::to_string(&pipeline.stages)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pipelines (product_id, stages_json) VALUES (?1, ?2)
             ON CONFLICT(product_id) DO UPDATE SET stages_json = excluded.stages_json",
            params![pipeline.product_id, stages_json],
        )
        .map_err(db)?;
        Ok(())
    }

    pub fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT product_id, stages_json FROM pipelines ORDER BY product_id")
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db)?;

        let mut pipelines = Vec::new();
        for row in rows {
            let (product_id, stages_json) = row.map_err(db)?;
            pipelines.push(Pipeline {
                product_id,
                stages: serde_json::from_str(&stages_json)?,
            });
        }
        Ok(pipelines)
    }

    /// Mark a contact deleted and drop its message history.
    pub fn delete_contact(&self, contact: &ContactId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO contacts (id, deleted) VALUES (?1, 1)
             ON CONFLICT(id) DO UPDATE SET deleted = 1",
            params![contact.as_str()],
        )
        .map_err(db)?;
        conn.execute(
            "DELETE FROM messages WHERE contact_id = ?1",
            params![contact.as_str()],
        )
        .map_err(db)?;
        Ok(())
    }

    /// Full message history of a contact, oldest first.
    pub fn messages_for_contact(&self, contact: &ContactId) -> Result<Vec<MessageEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, contact_id, direction, body, ts FROM messages
                 WHERE contact_id = ?1
                 ORDER BY ts ASC, rowid ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![contact.as_str()], message_row)
            .map_err(db)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(decode_message(row.map_err(db)?)?);
        }
        Ok(messages)
    }
}

// ---------------------------------------------------------------------------
// FlowStore
// ---------------------------------------------------------------------------

impl FlowStore for SqliteStore {
    fn load_sequence(&self, id: &SequenceId) -> Result<Option<Sequence>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, account_id, name, active, steps_json FROM sequences WHERE id = ?1",
                params![id.as_str()],
                sequence_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_sequence).transpose()
    }

    fn load_pipeline(&self, product_id: &str) -> Result<Option<Pipeline>> {
        let conn = self.conn()?;
        let stages_json: Option<String> = conn
            .query_row(
                "SELECT stages_json FROM pipelines WHERE product_id = ?1",
                params![product_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;

        match stages_json {
            Some(json) => Ok(Some(Pipeline {
                product_id: product_id.to_string(),
                stages: serde_json::from_str(&json)?,
            })),
            None => Ok(None),
        }
    }

    fn load_lead(&self, id: &LeadId) -> Result<Option<Lead>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, product_id, account_id, contact_id, stage, created_at, updated_at
                 FROM leads WHERE id = ?1",
                params![id.as_str()],
                lead_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_lead).transpose()
    }

    fn leads_for_contact(&self, contact: &ContactId) -> Result<Vec<Lead>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, product_id, account_id, contact_id, stage, created_at, updated_at
                 FROM leads WHERE contact_id = ?1
                 ORDER BY created_at ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![contact.as_str()], lead_row)
            .map_err(db)?;

        let mut leads = Vec::new();
        for row in rows {
            leads.push(decode_lead(row.map_err(db)?)?);
        }
        Ok(leads)
    }

    fn save_lead(&self, lead: &Lead) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO contacts (id) VALUES (?1)",
            params![lead.contact_id.as_str()],
        )
        .map_err(db)?;
        conn.execute(
            "INSERT INTO leads (id, product_id, account_id, contact_id, stage, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                stage = excluded.stage,
                updated_at = excluded.updated_at",
            params![
                lead.id.as_str(),
                lead.product_id,
                lead.account_id,
                lead.contact_id.as_str(),
                lead.stage,
                to_ms(lead.created_at),
                to_ms(lead.updated_at),
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn insert_cursor(&self, cursor: &Cursor) -> Result<()> {
        let wait_json = cursor.wait.as_ref().map(serde_json::to_string).transpose()?;
        let failure_json = cursor
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (due_at, listening) = wake_columns(cursor);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cursors (id, lead_id, sequence_id, contact_id, position, state,
                                  wait_json, stop_reason, failure_json, started_at, updated_at,
                                  due_at, listening)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                cursor.id.as_str(),
                cursor.lead_id.as_str(),
                cursor.sequence_id.as_str(),
                cursor.contact_id.as_str(),
                cursor.position as i64,
                cursor.state.as_str(),
                wait_json,
                cursor.stop_reason,
                failure_json,
                to_ms(cursor.started_at),
                to_ms(cursor.updated_at),
                due_at,
                listening,
            ],
        )
        .map_err(|e| constraint_or_db(e, &cursor.lead_id))?;
        Ok(())
    }

    fn update_cursor(&self, cursor: &Cursor) -> Result<()> {
        let wait_json = cursor.wait.as_ref().map(serde_json::to_string).transpose()?;
        let failure_json = cursor
            .failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let (due_at, listening) = wake_columns(cursor);
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE cursors SET position = ?2, state = ?3, wait_json = ?4,
                                    stop_reason = ?5, failure_json = ?6, updated_at = ?7,
                                    due_at = ?8, listening = ?9
                 WHERE id = ?1",
                params![
                    cursor.id.as_str(),
                    cursor.position as i64,
                    cursor.state.as_str(),
                    wait_json,
                    cursor.stop_reason,
                    failure_json,
                    to_ms(cursor.updated_at),
                    due_at,
                    listening,
                ],
            )
            .map_err(|e| constraint_or_db(e, &cursor.lead_id))?;
        if changed == 0 {
            return Err(LeadflowError::CursorNotFound(cursor.id.to_string()));
        }
        Ok(())
    }

    fn load_cursor(&self, id: &CursorId) -> Result<Option<Cursor>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM cursors WHERE id = ?1", CURSOR_COLUMNS),
                params![id.as_str()],
                cursor_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_cursor).transpose()
    }

    fn active_cursor(&self, lead: &LeadId) -> Result<Option<Cursor>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cursors
                     WHERE lead_id = ?1 AND state NOT IN ('stopped', 'completed')",
                    CURSOR_COLUMNS
                ),
                params![lead.as_str()],
                cursor_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_cursor).transpose()
    }

    fn cursors_for_lead(&self, lead: &LeadId) -> Result<Vec<Cursor>> {
        self.query_cursors(
            &format!(
                "SELECT {} FROM cursors WHERE lead_id = ?1
                 ORDER BY started_at DESC, rowid DESC",
                CURSOR_COLUMNS
            ),
            lead.as_str(),
        )
    }

    fn cursors_in_state(&self, state: CursorState) -> Result<Vec<Cursor>> {
        self.query_cursors(
            &format!(
                "SELECT {} FROM cursors WHERE state = ?1 ORDER BY updated_at ASC",
                CURSOR_COLUMNS
            ),
            state.as_str(),
        )
    }

    fn due_cursors(&self, now: DateTime<Utc>) -> Result<Vec<Cursor>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM cursors
                 WHERE state = 'waiting_for_event' AND due_at IS NOT NULL AND due_at <= ?1
                 ORDER BY due_at ASC",
                CURSOR_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt.query_map(params![to_ms(now)], cursor_row).map_err(db)?;

        let mut cursors = Vec::new();
        for row in rows {
            cursors.push(decode_cursor(row.map_err(db)?)?);
        }
        Ok(cursors)
    }

    fn listening_cursors(&self, lead: &LeadId) -> Result<Vec<Cursor>> {
        self.query_cursors(
            &format!(
                "SELECT {} FROM cursors
                 WHERE lead_id = ?1 AND state = 'waiting_for_event' AND listening = 1",
                CURSOR_COLUMNS
            ),
            lead.as_str(),
        )
    }

    fn append_log(&self, entry: &CursorLogEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cursor_log (cursor_id, position, kind, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.cursor_id.as_str(),
                entry.position as i64,
                entry.kind,
                entry.detail,
                to_ms(entry.at),
            ],
        )
        .map_err(db)?;
        Ok(())
    }

    fn load_log(&self, cursor: &CursorId) -> Result<Vec<CursorLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT cursor_id, position, kind, detail, at FROM cursor_log
                 WHERE cursor_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![cursor.as_str()], |row| {
                let cursor_id: String = row.get(0)?;
                let position: i64 = row.get(1)?;
                let kind: String = row.get(2)?;
                let detail: String = row.get(3)?;
                let at: i64 = row.get(4)?;
                Ok((cursor_id, position, kind, detail, at))
            })
            .map_err(db)?;

        let mut entries = Vec::new();
        for row in rows {
            let (cursor_id, position, kind, detail, at) = row.map_err(db)?;
            entries.push(CursorLogEntry {
                cursor_id: CursorId(cursor_id),
                position: position as usize,
                kind,
                detail,
                at: from_ms(at)?,
            });
        }
        Ok(entries)
    }
}

impl SqliteStore {
    fn query_cursors(&self, sql: &str, param: &str) -> Result<Vec<Cursor>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db)?;
        let rows = stmt.query_map(params![param], cursor_row).map_err(db)?;

        let mut cursors = Vec::new();
        for row in rows {
            cursors.push(decode_cursor(row.map_err(db)?)?);
        }
        Ok(cursors)
    }

    fn contact_exists(conn: &Connection, contact: &ContactId) -> Result<bool> {
        let deleted: Option<i64> = conn
            .query_row(
                "SELECT deleted FROM contacts WHERE id = ?1",
                params![contact.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        Ok(deleted == Some(0))
    }
}

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

impl MessageStore for SqliteStore {
    fn last_inbound_since(
        &self,
        contact: &ContactId,
        since: DateTime<Utc>,
    ) -> Result<Option<MessageEvent>> {
        let conn = self.conn()?;
        if !Self::contact_exists(&conn, contact)? {
            return Err(LeadflowError::ContactNotFound(contact.to_string()));
        }
        let row = conn
            .query_row(
                "SELECT id, contact_id, direction, body, ts FROM messages
                 WHERE contact_id = ?1 AND direction = 'inbound' AND ts >= ?2
                 ORDER BY ts DESC, rowid DESC
                 LIMIT 1",
                params![contact.as_str(), to_ms(since)],
                message_row,
            )
            .optional()
            .map_err(db)?;
        row.map(decode_message).transpose()
    }

    fn has_inbound_since(&self, contact: &ContactId, since: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        if !Self::contact_exists(&conn, contact)? {
            return Err(LeadflowError::ContactNotFound(contact.to_string()));
        }
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE contact_id = ?1 AND direction = 'inbound' AND ts >= ?2",
                params![contact.as_str(), to_ms(since)],
                |row| row.get(0),
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    fn record_message(&self, message: &MessageEvent) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO contacts (id) VALUES (?1)",
            params![message.contact_id.as_str()],
        )
        .map_err(db)?;
        conn.execute(
            "INSERT OR IGNORE INTO messages (id, contact_id, direction, body, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                message.id,
                message.contact_id.as_str(),
                message.direction.as_str(),
                message.body,
                to_ms(message.timestamp),
            ],
        )
        .map_err(db)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

const CURSOR_COLUMNS: &str = "id, lead_id, sequence_id, contact_id, position, state, \
                              wait_json, stop_reason, failure_json, started_at, updated_at";

type SequenceRow = (String, String, String, i64, String);
type LeadRow = (String, String, String, String, Option<String>, i64, i64);
type MessageRow = (String, String, String, String, i64);

struct CursorRow {
    id: String,
    lead_id: String,
    sequence_id: String,
    contact_id: String,
    position: i64,
    state: String,
    wait_json: Option<String>,
    stop_reason: Option<String>,
    failure_json: Option<String>,
    started_at: i64,
    updated_at: i64,
}

fn sequence_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_sequence((id, account_id, name, active, steps_json): SequenceRow) -> Result<Sequence> {
    let steps: Vec<Step> = serde_json::from_str(&steps_json)?;
    let mut sequence = Sequence::new(SequenceId(id), account_id, name, steps);
    sequence.active = active != 0;
    Ok(sequence)
}

fn lead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LeadRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_lead(
    (id, product_id, account_id, contact_id, stage, created_at, updated_at): LeadRow,
) -> Result<Lead> {
    Ok(Lead {
        id: LeadId(id),
        product_id,
        account_id,
        contact_id: ContactId(contact_id),
        stage,
        created_at: from_ms(created_at)?,
        updated_at: from_ms(updated_at)?,
    })
}

fn cursor_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CursorRow> {
    Ok(CursorRow {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        sequence_id: row.get(2)?,
        contact_id: row.get(3)?,
        position: row.get(4)?,
        state: row.get(5)?,
        wait_json: row.get(6)?,
        stop_reason: row.get(7)?,
        failure_json: row.get(8)?,
        started_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn decode_cursor(row: CursorRow) -> Result<Cursor> {
    let state = CursorState::parse(&row.state)
        .ok_or_else(|| LeadflowError::Database(format!("unknown cursor state: {}", row.state)))?;
    let wait = row
        .wait_json
        .as_deref()
        .map(serde_json::from_str::<Wait>)
        .transpose()?;
    let failure = row
        .failure_json
        .as_deref()
        .map(serde_json::from_str::<FailureRecord>)
        .transpose()?;

    Ok(Cursor {
        id: CursorId(row.id),
        lead_id: LeadId(row.lead_id),
        sequence_id: SequenceId(row.sequence_id),
        contact_id: ContactId(row.contact_id),
        position: row.position as usize,
        state,
        wait,
        stop_reason: row.stop_reason,
        failure,
        started_at: from_ms(row.started_at)?,
        updated_at: from_ms(row.updated_at)?,
    })
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_message((id, contact_id, direction, body, ts): MessageRow) -> Result<MessageEvent> {
    let direction = match direction.as_str() {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        other => {
            return Err(LeadflowError::Database(format!(
                "unknown message direction: {}",
                other
            )))
        }
    };
    Ok(MessageEvent {
        id,
        contact_id: ContactId(contact_id),
        direction,
        body,
        timestamp: from_ms(ts)?,
    })
}

/// Indexed copies of the wait's due time and listen flag. Only a waiting
/// cursor has wake sources.
fn wake_columns(cursor: &Cursor) -> (Option<i64>, i64) {
    match (&cursor.state, &cursor.wait) {
        (CursorState::WaitingForEvent, Some(wait)) => {
            (wait.due_at.map(to_ms), i64::from(wait.listen))
        }
        _ => (None, 0),
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| LeadflowError::Database(format!("invalid timestamp: {}", ms)))
}

fn db(e: rusqlite::Error) -> LeadflowError {
    LeadflowError::Database(e.to_string())
}

/// Map the one-active-cursor index violation onto its domain error.
fn constraint_or_db(e: rusqlite::Error, lead: &LeadId) -> LeadflowError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            LeadflowError::ActiveCursorExists(lead.to_string())
        }
        _ => db(e),
    }
}
