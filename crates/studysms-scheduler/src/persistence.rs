//! SQLite-backed participant store and message log.
//!
//! Dates are stored as `MM/DD/YYYY` text and the ignore flag as
//! `"True"`/`"False"`, so the file stays readable by the study's other tools.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use studysms_core::types::{
    format_date, ignore_from_str, ignore_to_str, normalize_name, normalize_phone, parse_date,
};
use studysms_core::{
    Direction, MessageRecord, NewParticipant, Participant, Result, Stage, StudySmsError,
};

/// Outcome of an update keyed by `(name, phone_number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyUpdate {
    /// Rows sharing the key.
    pub matched: usize,
    /// Rows actually written.
    pub updated: usize,
}

impl KeyUpdate {
    /// More than one row shares the key.
    pub fn is_duplicate(&self) -> bool {
        self.matched > 1
    }
}

/// A stored row that cannot be read back as a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableRow {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
    pub error: String,
}

/// Every participant row, split into readable and unreadable.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub participants: Vec<Participant>,
    pub unreadable: Vec<UnreadableRow>,
}

impl Roster {
    fn from_raw(raws: Vec<RawParticipant>) -> Self {
        let mut roster = Self::default();
        for raw in raws {
            match raw.into_participant() {
                Ok(p) => roster.participants.push(p),
                Err(bad) => {
                    tracing::warn!(
                        "⚠️ Skipping participant {} ({}, {}): {}",
                        bad.id,
                        bad.name,
                        bad.phone_number,
                        bad.error
                    );
                    roster.unreadable.push(bad);
                }
            }
        }
        roster
    }
}

/// A message about to be written to the log.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    pub direction: Direction,
    pub phone_number: &'a str,
    pub body: &'a str,
    pub stage: Option<Stage>,
    pub status: &'a str,
    pub provider_sid: Option<&'a str>,
    pub error: Option<&'a str>,
}

impl<'a> LogEntry<'a> {
    pub fn sent(to: &'a str, body: &'a str, stage: Option<Stage>, sid: &'a str) -> Self {
        Self {
            direction: Direction::Outbound,
            phone_number: to,
            body,
            stage,
            status: "sent",
            provider_sid: Some(sid),
            error: None,
        }
    }

    pub fn failed(to: &'a str, body: &'a str, stage: Option<Stage>, error: &'a str) -> Self {
        Self {
            direction: Direction::Outbound,
            phone_number: to,
            body,
            stage,
            status: "failed",
            provider_sid: None,
            error: Some(error),
        }
    }

    pub fn received(from: &'a str, body: &'a str, sid: Option<&'a str>) -> Self {
        Self {
            direction: Direction::Inbound,
            phone_number: from,
            body,
            stage: None,
            status: "received",
            provider_sid: sid,
            error: None,
        }
    }
}

/// Participant database.
pub struct ParticipantDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> StudySmsError + '_ {
    move |e| StudySmsError::Database(format!("{context}: {e}"))
}

/// Stage columns in schedule order, for SELECT lists.
fn stage_columns() -> String {
    Stage::ALL
        .iter()
        .map(|s| s.column())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Participant row as stored, before date parsing.
struct RawParticipant {
    id: i64,
    name: String,
    phone_number: String,
    date_of_study: String,
    ignore: String,
    stamps: Vec<Option<String>>,
}

impl RawParticipant {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let mut stamps = Vec::with_capacity(Stage::ALL.len());
        for i in 0..Stage::ALL.len() {
            stamps.push(row.get::<_, Option<String>>(5 + i)?);
        }
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            phone_number: row.get(2)?,
            date_of_study: row.get(3)?,
            ignore: row.get(4)?,
            stamps,
        })
    }

    fn into_participant(self) -> std::result::Result<Participant, UnreadableRow> {
        let date_of_study = match parse_date(&self.date_of_study) {
            Ok(date) => date,
            Err(e) => {
                return Err(UnreadableRow {
                    id: self.id,
                    name: self.name,
                    phone_number: self.phone_number,
                    error: format!("bad study date '{}': {e}", self.date_of_study),
                });
            }
        };
        let mut stamps = BTreeMap::new();
        for (stage, raw) in Stage::ALL.iter().zip(self.stamps) {
            let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
                continue;
            };
            match parse_date(&raw) {
                Ok(date) => {
                    stamps.insert(*stage, date);
                }
                Err(_) => {
                    // Unreadable stamp still counts as sent.
                    tracing::warn!("Participant {}: unreadable {stage} stamp '{raw}'", self.id);
                    stamps.insert(*stage, date_of_study);
                }
            }
        }
        Ok(Participant {
            id: self.id,
            name: self.name,
            phone_number: self.phone_number,
            date_of_study,
            ignore: ignore_from_str(&self.ignore),
            stamps,
        })
    }
}

impl ParticipantDb {
    /// Open or create the participant database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    /// Fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StudySmsError::Database(format!("Lock: {e}")))
    }

    /// Create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        let stamp_defs = Stage::ALL
            .iter()
            .map(|s| format!("                {} TEXT", s.column()))
            .collect::<Vec<_>>()
            .join(",\n");
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                phone_number TEXT NOT NULL,
                date_of_study TEXT NOT NULL,        -- MM/DD/YYYY
                "ignore" TEXT NOT NULL DEFAULT 'False',
{stamp_defs}
            );
            CREATE INDEX IF NOT EXISTS idx_participants_key
                ON participants(name, phone_number);

            CREATE TABLE IF NOT EXISTS message_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                direction TEXT NOT NULL,            -- 'outbound', 'inbound'
                phone_number TEXT NOT NULL,
                body TEXT NOT NULL,
                stage TEXT,
                status TEXT NOT NULL,               -- 'sent', 'failed', 'received'
                provider_sid TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_message_log_direction
                ON message_log(direction, id);
            "#
        ))
        .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Participants ──────────────────────────────────────

    /// Insert one participant. Returns the new row id.
    pub fn insert(&self, participant: &NewParticipant) -> Result<i64> {
        validate(participant)?;
        let conn = self.lock()?;
        insert_row(&conn, participant)?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a batch in one transaction: all rows land or none do.
    pub fn insert_many(&self, participants: &[NewParticipant]) -> Result<usize> {
        for p in participants {
            validate(p)?;
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin import"))?;
        for p in participants {
            insert_row(&tx, p)?;
        }
        tx.commit().map_err(db_err("Commit import"))?;
        Ok(participants.len())
    }

    /// Every readable participant, oldest first. Rows that cannot be read
    /// are logged and left out; use [`ParticipantDb::roster`] to see them.
    pub fn get_all(&self) -> Result<Vec<Participant>> {
        Ok(self.roster()?.participants)
    }

    /// Every row, oldest first, with unreadable rows kept apart.
    pub fn roster(&self) -> Result<Roster> {
        let conn = self.lock()?;
        let sql = format!(
            r#"SELECT id, name, phone_number, date_of_study, "ignore", {} FROM participants ORDER BY id"#,
            stage_columns()
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err("Load participants"))?;
        let raws = stmt
            .query_map([], RawParticipant::from_row)
            .map_err(db_err("Load participants"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Load participants"))?;
        Ok(Roster::from_raw(raws))
    }

    /// Rows matching `(name, phone_number)` after normalization.
    pub fn find(&self, name: &str, phone_number: &str) -> Result<Vec<Participant>> {
        let (name, phone) = normalize_key(name, phone_number)?;
        let conn = self.lock()?;
        let sql = format!(
            r#"SELECT id, name, phone_number, date_of_study, "ignore", {}
               FROM participants WHERE name = ?1 AND phone_number = ?2 ORDER BY id"#,
            stage_columns()
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err("Find participant"))?;
        let raws = stmt
            .query_map(params![name, phone], RawParticipant::from_row)
            .map_err(db_err("Find participant"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Find participant"))?;
        Ok(Roster::from_raw(raws).participants)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM participants", [], |row| row.get(0))
            .map_err(db_err("Count participants"))?;
        Ok(n as usize)
    }

    /// Stamp `stage` with `date` on every row with this key whose stamp is
    /// still empty. An existing stamp is never altered.
    pub fn upsert_stage(
        &self,
        name: &str,
        phone_number: &str,
        stage: Stage,
        date: NaiveDate,
    ) -> Result<KeyUpdate> {
        let (name, phone) = normalize_key(name, phone_number)?;
        self.stamp_stored(&name, &phone, stage, date)
    }

    /// Like [`ParticipantDb::upsert_stage`], but matches the key exactly as
    /// stored, without normalizing it first. Used for rows loaded from the
    /// table, whose key may predate normalization.
    pub fn stamp_stored(
        &self,
        name: &str,
        phone_number: &str,
        stage: Stage,
        date: NaiveDate,
    ) -> Result<KeyUpdate> {
        let conn = self.lock()?;
        let matched = key_count(&conn, name, phone_number)?;
        let col = stage.column();
        let updated = conn
            .execute(
                &format!(
                    "UPDATE participants SET {col} = ?1
                     WHERE name = ?2 AND phone_number = ?3 AND ({col} IS NULL OR {col} = '')"
                ),
                params![format_date(date), name, phone_number],
            )
            .map_err(db_err("Stamp stage"))?;
        let outcome = KeyUpdate { matched, updated };
        warn_duplicate(&outcome, name, phone_number);
        Ok(outcome)
    }

    /// Set or clear the ignore flag.
    pub fn set_ignore(&self, name: &str, phone_number: &str, ignore: bool) -> Result<KeyUpdate> {
        let (name, phone) = normalize_key(name, phone_number)?;
        let conn = self.lock()?;
        let matched = key_count(&conn, &name, &phone)?;
        if matched == 0 {
            return Err(StudySmsError::NotFound(format!(
                "No participant named '{name}' with phone number {phone}"
            )));
        }
        let updated = conn
            .execute(
                r#"UPDATE participants SET "ignore" = ?1 WHERE name = ?2 AND phone_number = ?3"#,
                params![ignore_to_str(ignore), name, phone],
            )
            .map_err(db_err("Set ignore"))?;
        let outcome = KeyUpdate { matched, updated };
        warn_duplicate(&outcome, &name, &phone);
        Ok(outcome)
    }

    /// Replace the phone number of every row keyed `(name, old)`.
    pub fn update_phone(&self, name: &str, old: &str, new: &str) -> Result<KeyUpdate> {
        let (name, old) = normalize_key(name, old)?;
        let new = normalize_phone(new)?;
        let conn = self.lock()?;
        let matched = key_count(&conn, &name, &old)?;
        if matched == 0 {
            return Err(StudySmsError::NotFound(format!(
                "No participant named '{name}' with phone number {old}"
            )));
        }
        let updated = conn
            .execute(
                "UPDATE participants SET phone_number = ?1 WHERE name = ?2 AND phone_number = ?3",
                params![new, name, old],
            )
            .map_err(db_err("Update phone"))?;
        let outcome = KeyUpdate { matched, updated };
        warn_duplicate(&outcome, &name, &old);
        Ok(outcome)
    }

    /// Delete every participant. The message log is kept.
    pub fn reset(&self) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM participants", [])
            .map_err(db_err("Reset"))?;
        tracing::warn!("Participant table reset: {deleted} rows deleted");
        Ok(deleted)
    }

    /// Run raw SQL; lets tests plant rows the typed API would refuse.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql).map_err(db_err("Raw SQL"))
    }

    // ─── Message log ──────────────────────────────────────

    pub fn log_message(&self, entry: &LogEntry<'_>) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO message_log
             (direction, phone_number, body, stage, status, provider_sid, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.direction.as_str(),
                entry.phone_number,
                entry.body,
                entry.stage.map(|s| s.column()),
                entry.status,
                entry.provider_sid,
                entry.error,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err("Log message"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent messages in one direction, newest first.
    pub fn messages(&self, direction: Direction, limit: usize) -> Result<Vec<MessageRecord>> {
        self.query_messages(
            "SELECT id, direction, phone_number, body, stage, status, provider_sid, error, created_at
             FROM message_log WHERE direction = ?1 ORDER BY id DESC LIMIT ?2",
            params![direction.as_str(), limit as i64],
        )
    }

    /// Most recent failed sends, newest first.
    pub fn failures(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        self.query_messages(
            "SELECT id, direction, phone_number, body, stage, status, provider_sid, error, created_at
             FROM message_log WHERE status = 'failed' ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(db_err("Load messages"))?;
        let rows = stmt
            .query_map(params, |row| {
                let direction: String = row.get(1)?;
                let stage: Option<String> = row.get(4)?;
                let created_at: String = row.get(8)?;
                Ok(MessageRecord {
                    id: row.get(0)?,
                    direction: if direction == "inbound" {
                        Direction::Inbound
                    } else {
                        Direction::Outbound
                    },
                    phone_number: row.get(2)?,
                    body: row.get(3)?,
                    stage: stage.and_then(|s| s.parse().ok()),
                    status: row.get(5)?,
                    provider_sid: row.get(6)?,
                    error: row.get(7)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })
            .map_err(db_err("Load messages"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Load messages"))
    }
}

fn validate(p: &NewParticipant) -> Result<()> {
    if p.name.trim().is_empty() {
        return Err(StudySmsError::Validation("Subject name is required".into()));
    }
    if p.phone_number.is_empty() || !p.phone_number.chars().all(|c| c.is_ascii_digit()) {
        return Err(StudySmsError::Validation(format!(
            "Phone number '{}' must be digits only",
            p.phone_number
        )));
    }
    Ok(())
}

fn insert_row(conn: &Connection, p: &NewParticipant) -> Result<()> {
    conn.execute(
        r#"INSERT INTO participants (name, phone_number, date_of_study, "ignore")
           VALUES (?1, ?2, ?3, ?4)"#,
        params![
            p.name,
            p.phone_number,
            format_date(p.date_of_study),
            ignore_to_str(false)
        ],
    )
    .map_err(db_err("Insert participant"))?;
    Ok(())
}

fn normalize_key(name: &str, phone_number: &str) -> Result<(String, String)> {
    let name = normalize_name(name);
    if name.is_empty() {
        return Err(StudySmsError::Validation("Subject name is required".into()));
    }
    Ok((name, normalize_phone(phone_number)?))
}

fn key_count(conn: &Connection, name: &str, phone: &str) -> Result<usize> {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM participants WHERE name = ?1 AND phone_number = ?2",
            params![name, phone],
            |row| row.get(0),
        )
        .map_err(db_err("Count key"))?;
    Ok(n as usize)
}

fn warn_duplicate(outcome: &KeyUpdate, name: &str, phone: &str) {
    if outcome.is_duplicate() {
        let err = StudySmsError::DuplicateKey {
            name: name.to_string(),
            phone: phone.to_string(),
            rows: outcome.matched,
        };
        tracing::warn!("{err}; all matching rows updated");
    }
}
