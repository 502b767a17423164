//! SQLite-backed local note cache.
//!
//! # Responsibility
//! - Persist one row per title in the `notes` table.
//! - Compute local version increments inside one transaction.
//! - Broadcast committed changes to observers.
//!
//! # Invariants
//! - Write paths call `Note::validate()` before SQL mutations.
//! - Read paths reject invalid persisted rows instead of masking them.
//! - Events are sent while the connection lock is held, so event order equals
//!   commit order.

use crate::model::note::{validate_title, Note, NoteVersion};
use crate::store::{LocalStore, StoreError, StoreEvent, StoreResult};
use log::{debug, error};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::broadcast;

const NOTE_SELECT_SQL: &str = "SELECT title, content, version FROM notes";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Local store over a migrated SQLite connection.
pub struct SqliteNoteStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteNoteStore {
    /// Wraps a connection returned by `open_db` / `open_db_in_memory`.
    pub fn new(conn: Connection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            events,
        }
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine: nobody is observing yet.
        let _ = self.events.send(event);
    }
}

impl LocalStore for SqliteNoteStore {
    fn get(&self, title: &str) -> StoreResult<Option<Note>> {
        let conn = self.conn.lock();
        select_note(&conn, title)
    }

    fn get_all(&self) -> StoreResult<Vec<Note>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{NOTE_SELECT_SQL} ORDER BY title ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut notes = Vec::new();
        while let Some(row) = rows.next()? {
            notes.push(parse_note_row(row)?);
        }
        Ok(notes)
    }

    fn upsert(&self, note: &Note, increment_version: bool) -> StoreResult<Note> {
        note.validate()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let version = if increment_version {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT version FROM notes WHERE title = ?1;",
                    [note.title.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let existing = existing.map(version_from_db).transpose()?.unwrap_or(0);
            existing.max(note.version).checked_add(1).ok_or_else(|| {
                StoreError::InvalidData(format!("version overflow for `{}`", note.title))
            })?
        } else {
            note.version
        };

        tx.execute(
            "INSERT INTO notes (title, content, version)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(title) DO UPDATE SET
                content = excluded.content,
                version = excluded.version;",
            params![note.title.as_str(), note.content.as_str(), version_to_db(version)?],
        )?;
        if let Err(err) = tx.commit() {
            error!(
                "event=note_upsert module=store status=error increment={} error={}",
                increment_version, err
            );
            return Err(err.into());
        }

        let stored = Note::with_version(note.title.clone(), note.content.clone(), version);
        debug!(
            "event=note_upsert module=store status=ok increment={} version={}",
            increment_version, version
        );
        self.publish(StoreEvent::Upserted(stored.clone()));
        Ok(stored)
    }

    fn delete(&self, note: &Note) -> StoreResult<bool> {
        validate_title(&note.title)?;

        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM notes WHERE title = ?1;", [note.title.as_str()])?;
        if changed == 0 {
            return Ok(false);
        }

        debug!("event=note_delete module=store status=ok");
        self.publish(StoreEvent::Deleted {
            title: note.title.clone(),
        });
        Ok(true)
    }

    fn exists(&self, title: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM notes WHERE title = ?1);",
            [title],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

fn select_note(conn: &Connection, title: &str) -> StoreResult<Option<Note>> {
    let mut stmt = conn.prepare(&format!("{NOTE_SELECT_SQL} WHERE title = ?1;"))?;
    let mut rows = stmt.query([title])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_note_row(row)?)),
        None => Ok(None),
    }
}

fn parse_note_row(row: &Row<'_>) -> StoreResult<Note> {
    let note = Note::with_version(
        row.get::<_, String>("title")?,
        row.get::<_, String>("content")?,
        version_from_db(row.get("version")?)?,
    );
    note.validate()?;
    Ok(note)
}

fn version_from_db(value: i64) -> StoreResult<NoteVersion> {
    NoteVersion::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("negative version `{value}` in notes.version")))
}

fn version_to_db(value: NoteVersion) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("version `{value}` exceeds storage range")))
}
