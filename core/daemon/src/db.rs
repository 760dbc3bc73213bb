//! SQLite persistence for attestd.
//!
//! This is the single-writer store backing the daemon: an append-only
//! events table, the sessions it materializes into, the append-only record
//! ledger, and an outbox of notifications for downstream delivery.
//!
//! Every timestamp column holds `format_timestamp` output (RFC3339, millis,
//! `Z`), so lexicographic comparisons in SQL match chronological ones.

use attest_core::record::canonical_bytes;
use attest_core::{
    format_timestamp, parse_timestamp, ActivityEvent, ActivityKind, AttendanceSession, ChainTip,
    EventPayload, EventSource, GenerationError, SessionMetadata, SessionMetrics, SessionStatus,
    VerificationRecord,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const OUTBOX_RECORD_ISSUED: &str = "record_issued";
pub const OUTBOX_SESSION_REJECTED: &str = "session_rejected";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const SESSION_COLUMNS: &str = "session_id, participant_id, meeting_id, scheduled_start, \
     scheduled_duration_min, status, join_time, leave_time, metrics, is_valid, metadata, \
     record_id";

const RECORD_COLUMNS: &str = "record_id, card_number, subject_session_id, chain_scope, sequence, \
     canonical_json, content_hash, previous_record_hash, record_hash, signature, key_id, \
     created_at";

pub struct Db {
    path: PathBuf,
}

/// Identity of the session a webhook event belongs to, created on first sight.
#[derive(Debug, Clone)]
pub struct SessionSeed {
    pub session_id: String,
    pub participant_id: String,
    pub meeting_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_duration_min: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended { sequence: i64 },
    Duplicate,
    UnknownSession,
    SessionClosed { status: SessionStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub participant_id: String,
    pub meeting_id: String,
    pub scheduled_start: String,
    pub scheduled_duration_min: u32,
    pub status: SessionStatus,
    pub is_valid: Option<bool>,
    pub record_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub updated_at: String,
}

/// Session fields written when the sweep settles a session.
#[derive(Debug, Clone)]
pub struct SessionOutcome<'a> {
    pub join_time: Option<DateTime<Utc>>,
    pub leave_time: Option<DateTime<Utc>>,
    pub metrics: Option<&'a SessionMetrics>,
    pub metadata: &'a SessionMetadata,
    pub is_valid: Option<bool>,
}

impl<'a> SessionOutcome<'a> {
    pub fn from_session(session: &'a AttendanceSession) -> Self {
        Self {
            join_time: session.join_time,
            leave_time: session.leave_time,
            metrics: session.metrics.as_ref(),
            metadata: &session.metadata,
            is_valid: session.is_valid,
        }
    }
}

/// Stored ledger row. `canonical_json` is kept verbatim so verification
/// recomputes hashes from exactly what was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    pub record_id: String,
    pub card_number: String,
    pub subject_session_id: String,
    pub chain_scope: String,
    pub sequence: i64,
    pub canonical_json: String,
    pub content_hash: String,
    pub previous_record_hash: String,
    pub record_hash: String,
    pub signature: String,
    pub key_id: String,
    pub created_at: String,
}

impl RecordRow {
    pub fn into_record(self) -> Result<VerificationRecord, String> {
        let fields = serde_json::from_str(&self.canonical_json).map_err(|err| {
            format!(
                "Failed to parse canonical record {}: {}",
                self.record_id, err
            )
        })?;
        Ok(VerificationRecord {
            card_number: self.card_number,
            fields,
            content_hash: self.content_hash,
            previous_record_hash: self.previous_record_hash,
            record_hash: self.record_hash,
            signature: self.signature,
            key_id: self.key_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub session_id: String,
    pub kind: String,
    pub record_id: Option<String>,
    pub enqueued_at: String,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    /// Append an event, creating the session first when a seed is given.
    ///
    /// Runs in one immediate transaction so the closed-session check and the
    /// insert cannot interleave with a finalization.
    pub fn append_event(
        &self,
        seed: Option<&SessionSeed>,
        session_id: &str,
        event: &ActivityEvent,
        received_at: DateTime<Utc>,
    ) -> Result<AppendOutcome, String> {
        self.append_event_within(seed, session_id, event, received_at, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like `append_event`, but waits at most `busy_timeout` for the write lock.
    pub fn append_event_within(
        &self,
        seed: Option<&SessionSeed>,
        session_id: &str,
        event: &ActivityEvent,
        received_at: DateTime<Utc>,
        busy_timeout: Duration,
    ) -> Result<AppendOutcome, String> {
        self.with_connection_timeout(busy_timeout, |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to start append transaction: {}", err))?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM events WHERE event_id = ?1",
                    params![event.event_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query event: {}", err))?;
            if existing.is_some() {
                return Ok(AppendOutcome::Duplicate);
            }

            let received = format_timestamp(received_at);
            if let Some(seed) = seed {
                tx.execute(
                    "INSERT INTO sessions \
                        (session_id, participant_id, meeting_id, scheduled_start, scheduled_end, \
                         scheduled_duration_min, status, metadata, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?8) \
                     ON CONFLICT(session_id) DO NOTHING",
                    params![
                        seed.session_id,
                        seed.participant_id,
                        seed.meeting_id,
                        format_timestamp(seed.scheduled_start),
                        format_timestamp(
                            seed.scheduled_start
                                + chrono::Duration::minutes(i64::from(
                                    seed.scheduled_duration_min
                                ))
                        ),
                        seed.scheduled_duration_min,
                        SessionStatus::InProgress.as_str(),
                        received,
                    ],
                )
                .map_err(|err| format!("Failed to create session: {}", err))?;
            }

            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query session status: {}", err))?;
            let status = match status {
                Some(value) => parse_status(&value)?,
                None => return Ok(AppendOutcome::UnknownSession),
            };
            if status.is_terminal() {
                return Ok(AppendOutcome::SessionClosed { status });
            }

            insert_event_row(&tx, session_id, event, &received)?;
            let sequence = tx.last_insert_rowid();
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE session_id = ?1",
                params![session_id, received],
            )
            .map_err(|err| format!("Failed to touch session: {}", err))?;

            tx.commit()
                .map_err(|err| format!("Failed to commit event append: {}", err))?;
            Ok(AppendOutcome::Appended { sequence })
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<AttendanceSession>, String> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS);
            let session = conn
                .query_row(&sql, params![session_id], read_session_row)
                .optional()
                .map_err(|err| format!("Failed to query session: {}", err))?;
            let Some(row) = session else {
                return Ok(None);
            };
            let mut session = row.into_session()?;
            session.events = load_events(conn, session_id)?;
            Ok(Some(session))
        })
    }

    pub fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT session_id, participant_id, meeting_id, scheduled_start, \
                        scheduled_duration_min, status, is_valid, record_id, metadata, updated_at \
                     FROM sessions \
                     WHERE (?1 IS NULL OR status = ?1) \
                     ORDER BY scheduled_start DESC, session_id ASC \
                     LIMIT ?2",
                )
                .map_err(|err| format!("Failed to prepare sessions query: {}", err))?;

            let rows = stmt
                .query_map(
                    params![status.map(|value| value.as_str()), limit as i64],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<bool>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, String>(9)?,
                        ))
                    },
                )
                .map_err(|err| format!("Failed to read session rows: {}", err))?;

            let mut summaries = Vec::new();
            for row in rows {
                let (
                    session_id,
                    participant_id,
                    meeting_id,
                    scheduled_start,
                    duration,
                    status,
                    is_valid,
                    record_id,
                    metadata,
                    updated_at,
                ) = row.map_err(|err| format!("Failed to decode session row: {}", err))?;
                let metadata: SessionMetadata = parse_json(&metadata, "session metadata")?;
                summaries.push(SessionSummary {
                    session_id,
                    participant_id,
                    meeting_id,
                    scheduled_start,
                    scheduled_duration_min: duration as u32,
                    status: parse_status(&status)?,
                    is_valid,
                    record_id,
                    rejection_reason: metadata.rejection_reason,
                    updated_at,
                });
            }
            Ok(summaries)
        })
    }

    pub fn count_sessions_by_status(&self) -> Result<BTreeMap<String, i64>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM sessions GROUP BY status")
                .map_err(|err| format!("Failed to prepare status count: {}", err))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|err| format!("Failed to count sessions: {}", err))?;
            let mut counts = BTreeMap::new();
            for row in rows {
                let (status, count) =
                    row.map_err(|err| format!("Failed to decode status count: {}", err))?;
                counts.insert(status, count);
            }
            Ok(counts)
        })
    }

    /// IN_PROGRESS sessions whose scheduled end is at or before `cutoff`.
    pub fn sessions_due_for_close(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, String> {
        self.with_connection(|conn| {
            query_ids(
                conn,
                "SELECT session_id FROM sessions \
                 WHERE status = 'in_progress' AND scheduled_end <= ?1 \
                 ORDER BY scheduled_end ASC, session_id ASC",
                params![format_timestamp(cutoff)],
            )
        })
    }

    /// COMPLETED, unrecorded, unclaimed sessions whose scheduled end is at or
    /// before `cutoff`.
    pub fn sessions_due_for_finalize(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, String> {
        self.with_connection(|conn| {
            query_ids(
                conn,
                "SELECT session_id FROM sessions \
                 WHERE status = 'completed' AND record_id IS NULL \
                   AND scheduled_end <= ?1 \
                   AND (claimed_until IS NULL OR claimed_until < ?2) \
                 ORDER BY scheduled_end ASC, session_id ASC",
                params![format_timestamp(cutoff), format_timestamp(now)],
            )
        })
    }

    /// IN_PROGRESS -> COMPLETED, appending the inferred LEAVE when one is given.
    ///
    /// Returns false when the session was no longer in progress.
    pub fn complete_session(
        &self,
        session_id: &str,
        inferred_leave: Option<&ActivityEvent>,
        outcome: &SessionOutcome<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to start close transaction: {}", err))?;
            let now = format_timestamp(now);

            let updated = tx
                .execute(
                    "UPDATE sessions SET status = 'completed', join_time = ?2, leave_time = ?3, \
                        metrics = ?4, metadata = ?5, updated_at = ?6 \
                     WHERE session_id = ?1 AND status = 'in_progress'",
                    params![
                        session_id,
                        outcome.join_time.map(format_timestamp),
                        outcome.leave_time.map(format_timestamp),
                        to_json_opt(outcome.metrics, "session metrics")?,
                        to_json(outcome.metadata, "session metadata")?,
                        now,
                    ],
                )
                .map_err(|err| format!("Failed to complete session: {}", err))?;
            if updated == 0 {
                return Ok(false);
            }

            if let Some(event) = inferred_leave {
                let exists: Option<i64> = tx
                    .query_row(
                        "SELECT seq FROM events WHERE event_id = ?1",
                        params![event.event_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|err| format!("Failed to query event: {}", err))?;
                if exists.is_none() {
                    insert_event_row(&tx, session_id, event, &now)?;
                }
            }

            tx.commit()
                .map_err(|err| format!("Failed to commit session close: {}", err))?;
            Ok(true)
        })
    }

    /// Take an exclusive finalization lease. False when another sweep holds it.
    pub fn claim_session(
        &self,
        session_id: &str,
        token: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions SET claim_token = ?2, claimed_until = ?3 \
                     WHERE session_id = ?1 AND status = 'completed' AND record_id IS NULL \
                       AND (claimed_until IS NULL OR claimed_until < ?4)",
                    params![
                        session_id,
                        token,
                        format_timestamp(lease_until),
                        format_timestamp(now)
                    ],
                )
                .map_err(|err| format!("Failed to claim session: {}", err))?;
            Ok(updated == 1)
        })
    }

    pub fn release_claim(&self, session_id: &str, token: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE sessions SET claim_token = NULL, claimed_until = NULL \
                 WHERE session_id = ?1 AND claim_token = ?2",
                params![session_id, token],
            )
            .map_err(|err| format!("Failed to release claim: {}", err))?;
            Ok(())
        })
    }

    /// COMPLETED -> REJECTED under the caller's claim, queueing a notification.
    pub fn reject_session(
        &self,
        session_id: &str,
        token: &str,
        outcome: &SessionOutcome<'_>,
        now: DateTime<Utc>,
    ) -> Result<bool, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to start reject transaction: {}", err))?;
            let now = format_timestamp(now);

            let updated = tx
                .execute(
                    "UPDATE sessions SET status = 'rejected', is_valid = 0, metrics = ?3, \
                        metadata = ?4, claim_token = NULL, claimed_until = NULL, updated_at = ?5 \
                     WHERE session_id = ?1 AND status = 'completed' AND record_id IS NULL \
                       AND claim_token = ?2",
                    params![
                        session_id,
                        token,
                        to_json_opt(outcome.metrics, "session metrics")?,
                        to_json(outcome.metadata, "session metadata")?,
                        now,
                    ],
                )
                .map_err(|err| format!("Failed to reject session: {}", err))?;
            if updated == 0 {
                return Ok(false);
            }

            enqueue(&tx, session_id, OUTBOX_SESSION_REJECTED, None, &now)?;
            tx.commit()
                .map_err(|err| format!("Failed to commit session rejection: {}", err))?;
            Ok(true)
        })
    }

    pub fn chain_tip(&self, chain_scope: &str) -> Result<Option<ChainTip>, String> {
        self.with_connection(|conn| read_chain_tip(conn, chain_scope))
    }

    /// Insert the record, link it to the session and mark it FINALIZED.
    ///
    /// The record and the status change commit together or not at all. The
    /// chain tip is re-read inside the transaction: if it moved since the
    /// record was built the insert is refused as a chain conflict.
    pub fn finalize_with_record(
        &self,
        record: &VerificationRecord,
        expected_tip: Option<&ChainTip>,
        token: &str,
        outcome: &SessionOutcome<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), GenerationError> {
        let canonical = String::from_utf8(canonical_bytes(&record.fields)?)
            .map_err(|err| GenerationError::Canonicalization(err.to_string()))?;
        let session_id = record.subject_session_id().to_string();
        let scope = record.chain_scope().to_string();

        let result = self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to start finalize transaction: {}", err))?;
            let now = format_timestamp(now);

            let existing: Option<String> = tx
                .query_row(
                    "SELECT record_id FROM records WHERE subject_session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| format!("Failed to query existing record: {}", err))?;
            if let Some(record_id) = existing {
                return Ok(Err(GenerationError::AlreadyExists {
                    session_id: session_id.clone(),
                    record_id,
                }));
            }

            if read_chain_tip(&tx, &scope)?.as_ref() != expected_tip {
                return Ok(Err(GenerationError::ChainConflict {
                    scope: scope.clone(),
                }));
            }

            let sql = format!(
                "INSERT INTO records ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                RECORD_COLUMNS
            );
            let inserted = tx.execute(
                &sql,
                params![
                    record.record_id(),
                    record.card_number,
                    session_id,
                    scope,
                    record.sequence() as i64,
                    canonical,
                    record.content_hash,
                    record.previous_record_hash,
                    record.record_hash,
                    record.signature,
                    record.key_id,
                    record.fields.created_at,
                ],
            );
            if let Err(err) = inserted {
                let message = err.to_string();
                if message.contains("records.subject_session_id") {
                    return Ok(Err(GenerationError::AlreadyExists {
                        session_id: session_id.clone(),
                        record_id: record.record_id().to_string(),
                    }));
                }
                if message.contains("records.chain_scope") {
                    return Ok(Err(GenerationError::ChainConflict {
                        scope: scope.clone(),
                    }));
                }
                return Err(format!("Failed to insert record: {}", message));
            }

            let updated = tx
                .execute(
                    "UPDATE sessions SET status = 'finalized', record_id = ?2, is_valid = ?3, \
                        join_time = ?4, leave_time = ?5, metrics = ?6, metadata = ?7, \
                        claim_token = NULL, claimed_until = NULL, updated_at = ?8 \
                     WHERE session_id = ?1 AND status = 'completed' AND record_id IS NULL \
                       AND claim_token = ?9",
                    params![
                        session_id,
                        record.record_id(),
                        outcome.is_valid,
                        outcome.join_time.map(format_timestamp),
                        outcome.leave_time.map(format_timestamp),
                        to_json_opt(outcome.metrics, "session metrics")?,
                        to_json(outcome.metadata, "session metadata")?,
                        now,
                        token,
                    ],
                )
                .map_err(|err| format!("Failed to finalize session: {}", err))?;
            if updated == 0 {
                return Ok(Err(GenerationError::NotEligible {
                    session_id: session_id.clone(),
                    reason: "claim lost or session no longer completed".to_string(),
                }));
            }

            enqueue(
                &tx,
                &session_id,
                OUTBOX_RECORD_ISSUED,
                Some(record.record_id()),
                &now,
            )?;
            tx.commit()
                .map_err(|err| format!("Failed to commit finalization: {}", err))?;
            Ok(Ok(()))
        });

        result.map_err(GenerationError::Storage)?
    }

    pub fn get_record_by_id(&self, record_id: &str) -> Result<Option<RecordRow>, String> {
        self.query_record("record_id = ?1", params![record_id])
    }

    pub fn get_record_by_card(&self, card_number: &str) -> Result<Option<RecordRow>, String> {
        self.query_record("card_number = ?1", params![card_number])
    }

    pub fn get_record_by_session(&self, session_id: &str) -> Result<Option<RecordRow>, String> {
        self.query_record("subject_session_id = ?1", params![session_id])
    }

    pub fn get_record_by_chain(
        &self,
        chain_scope: &str,
        sequence: u64,
    ) -> Result<Option<RecordRow>, String> {
        self.query_record(
            "chain_scope = ?1 AND sequence = ?2",
            params![chain_scope, sequence as i64],
        )
    }

    /// Hand out undelivered notifications oldest first and mark them delivered.
    pub fn drain_outbox(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| format!("Failed to start outbox transaction: {}", err))?;

            let entries = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, session_id, kind, record_id, enqueued_at FROM outbox \
                         WHERE delivered_at IS NULL ORDER BY id ASC LIMIT ?1",
                    )
                    .map_err(|err| format!("Failed to prepare outbox query: {}", err))?;
                let rows = stmt
                    .query_map(params![limit as i64], |row| {
                        Ok(OutboxEntry {
                            id: row.get(0)?,
                            session_id: row.get(1)?,
                            kind: row.get(2)?,
                            record_id: row.get(3)?,
                            enqueued_at: row.get(4)?,
                        })
                    })
                    .map_err(|err| format!("Failed to read outbox rows: {}", err))?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row.map_err(|err| format!("Failed to decode outbox row: {}", err))?);
                }
                entries
            };

            let delivered_at = format_timestamp(now);
            for entry in &entries {
                tx.execute(
                    "UPDATE outbox SET delivered_at = ?2 WHERE id = ?1",
                    params![entry.id, delivered_at],
                )
                .map_err(|err| format!("Failed to mark outbox entry delivered: {}", err))?;
            }

            tx.commit()
                .map_err(|err| format!("Failed to commit outbox drain: {}", err))?;
            Ok(entries)
        })
    }

    fn query_record(
        &self,
        predicate: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<RecordRow>, String> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM records WHERE {}", RECORD_COLUMNS, predicate);
            conn.query_row(&sql, params, |row| {
                Ok(RecordRow {
                    record_id: row.get(0)?,
                    card_number: row.get(1)?,
                    subject_session_id: row.get(2)?,
                    chain_scope: row.get(3)?,
                    sequence: row.get(4)?,
                    canonical_json: row.get(5)?,
                    content_hash: row.get(6)?,
                    previous_record_hash: row.get(7)?,
                    record_hash: row.get(8)?,
                    signature: row.get(9)?,
                    key_id: row.get(10)?,
                    created_at: row.get(11)?,
                })
            })
            .optional()
            .map_err(|err| format!("Failed to query record: {}", err))
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id TEXT NOT NULL UNIQUE,
                    session_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    source TEXT NOT NULL,
                    occurred_at TEXT NOT NULL,
                    received_at TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS events_session_seq ON events(session_id, seq);
                 CREATE TRIGGER IF NOT EXISTS events_no_update BEFORE UPDATE ON events
                 BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;
                 CREATE TRIGGER IF NOT EXISTS events_no_delete BEFORE DELETE ON events
                 BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;

                 CREATE TABLE IF NOT EXISTS sessions (
                    session_id TEXT PRIMARY KEY,
                    participant_id TEXT NOT NULL,
                    meeting_id TEXT NOT NULL,
                    scheduled_start TEXT NOT NULL,
                    scheduled_end TEXT NOT NULL,
                    scheduled_duration_min INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    join_time TEXT,
                    leave_time TEXT,
                    metrics TEXT,
                    is_valid INTEGER,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    record_id TEXT,
                    claim_token TEXT,
                    claimed_until TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS sessions_status_end ON sessions(status, scheduled_end);

                 CREATE TABLE IF NOT EXISTS records (
                    record_id TEXT PRIMARY KEY,
                    card_number TEXT NOT NULL UNIQUE,
                    subject_session_id TEXT NOT NULL UNIQUE,
                    chain_scope TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    canonical_json TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    previous_record_hash TEXT NOT NULL,
                    record_hash TEXT NOT NULL,
                    signature TEXT NOT NULL,
                    key_id TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(chain_scope, sequence)
                 );
                 CREATE TRIGGER IF NOT EXISTS records_no_update BEFORE UPDATE ON records
                 BEGIN SELECT RAISE(ABORT, 'records are immutable'); END;
                 CREATE TRIGGER IF NOT EXISTS records_no_delete BEFORE DELETE ON records
                 BEGIN SELECT RAISE(ABORT, 'records are immutable'); END;

                 CREATE TABLE IF NOT EXISTS outbox (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    session_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    record_id TEXT,
                    enqueued_at TEXT NOT NULL,
                    delivered_at TEXT
                 );
                 CREATE INDEX IF NOT EXISTS outbox_pending ON outbox(delivered_at, id);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))?;
            Ok(())
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        self.with_connection_timeout(DEFAULT_BUSY_TIMEOUT, op)
    }

    fn with_connection_timeout<T>(
        &self,
        busy_timeout: Duration,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open(busy_timeout)?;
        op(&mut conn)
    }

    fn open(&self, busy_timeout: Duration) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.busy_timeout(busy_timeout)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;

        Ok(conn)
    }
}

struct SessionRow {
    session_id: String,
    participant_id: String,
    meeting_id: String,
    scheduled_start: String,
    scheduled_duration_min: i64,
    status: String,
    join_time: Option<String>,
    leave_time: Option<String>,
    metrics: Option<String>,
    is_valid: Option<bool>,
    metadata: String,
    record_id: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<AttendanceSession, String> {
        Ok(AttendanceSession {
            scheduled_start: parse_required_timestamp(&self.scheduled_start, "scheduled_start")?,
            join_time: parse_optional_timestamp(self.join_time.as_deref(), "join_time")?,
            leave_time: parse_optional_timestamp(self.leave_time.as_deref(), "leave_time")?,
            status: parse_status(&self.status)?,
            metrics: match self.metrics {
                Some(value) => Some(parse_json(&value, "session metrics")?),
                None => None,
            },
            metadata: parse_json(&self.metadata, "session metadata")?,
            scheduled_duration_min: self.scheduled_duration_min as u32,
            is_valid: self.is_valid,
            record_id: self.record_id,
            session_id: self.session_id,
            participant_id: self.participant_id,
            meeting_id: self.meeting_id,
            events: Vec::new(),
        })
    }
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        session_id: row.get(0)?,
        participant_id: row.get(1)?,
        meeting_id: row.get(2)?,
        scheduled_start: row.get(3)?,
        scheduled_duration_min: row.get(4)?,
        status: row.get(5)?,
        join_time: row.get(6)?,
        leave_time: row.get(7)?,
        metrics: row.get(8)?,
        is_valid: row.get(9)?,
        metadata: row.get(10)?,
        record_id: row.get(11)?,
    })
}

fn load_events(conn: &Connection, session_id: &str) -> Result<Vec<ActivityEvent>, String> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, event_id, kind, source, occurred_at, payload FROM events \
             WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .map_err(|err| format!("Failed to prepare events query: {}", err))?;

    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|err| format!("Failed to read event rows: {}", err))?;

    let mut events = Vec::new();
    for row in rows {
        let (sequence, event_id, kind, source, occurred_at, payload) =
            row.map_err(|err| format!("Failed to decode event row: {}", err))?;
        let kind = ActivityKind::from_str(&kind)
            .ok_or_else(|| format!("Unknown event kind in store: {}", kind))?;
        let source = EventSource::from_str(&source)
            .ok_or_else(|| format!("Unknown event source in store: {}", source))?;
        let payload: EventPayload = parse_json(&payload, "event payload")?;
        events.push(ActivityEvent {
            occurred_at: parse_required_timestamp(&occurred_at, "occurred_at")?,
            event_id,
            kind,
            source,
            sequence,
            payload,
        });
    }
    Ok(events)
}

fn insert_event_row(
    conn: &Connection,
    session_id: &str,
    event: &ActivityEvent,
    received_at: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO events (event_id, session_id, kind, source, occurred_at, received_at, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            session_id,
            event.kind.as_str(),
            event.source.as_str(),
            format_timestamp(event.occurred_at),
            received_at,
            to_json(&event.payload, "event payload")?,
        ],
    )
    .map_err(|err| format!("Failed to insert event: {}", err))?;
    Ok(())
}

fn read_chain_tip(conn: &Connection, chain_scope: &str) -> Result<Option<ChainTip>, String> {
    conn.query_row(
        "SELECT sequence, record_hash FROM records WHERE chain_scope = ?1 \
         ORDER BY sequence DESC LIMIT 1",
        params![chain_scope],
        |row| {
            Ok(ChainTip {
                sequence: row.get::<_, i64>(0)? as u64,
                record_hash: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|err| format!("Failed to query chain tip: {}", err))
}

fn enqueue(
    conn: &Connection,
    session_id: &str,
    kind: &str,
    record_id: Option<&str>,
    enqueued_at: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO outbox (session_id, kind, record_id, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
        params![session_id, kind, record_id, enqueued_at],
    )
    .map_err(|err| format!("Failed to enqueue outbox entry: {}", err))?;
    Ok(())
}

fn query_ids(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<String>, String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| format!("Failed to prepare due-session query: {}", err))?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(|err| format!("Failed to read due sessions: {}", err))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(|err| format!("Failed to decode session id: {}", err))?);
    }
    Ok(ids)
}

fn parse_status(value: &str) -> Result<SessionStatus, String> {
    SessionStatus::from_str(value).ok_or_else(|| format!("Unknown session status in store: {}", value))
}

fn parse_required_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(value).ok_or_else(|| format!("Invalid {} in store: {}", field, value))
}

fn parse_optional_timestamp(
    value: Option<&str>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    value
        .map(|value| parse_required_timestamp(value, field))
        .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(value: &str, what: &str) -> Result<T, String> {
    serde_json::from_str(value).map_err(|err| format!("Failed to parse {}: {}", what, err))
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, String> {
    serde_json::to_string(value).map_err(|err| format!("Failed to serialize {}: {}", what, err))
}

fn to_json_opt<T: Serialize>(value: Option<&T>, what: &str) -> Result<Option<String>, String> {
    value.map(|value| to_json(value, what)).transpose()
}
