//! Event ingestion: webhooks and client heartbeats into the event store.
//!
//! Ingestion only appends. Timelines are rebuilt from the stored event set
//! when a session is assessed, so nothing here depends on arrival order.

use attest_core::webhook::{challenge_response, parse_webhook_body, verify_signature, WebhookMessage};
use attest_core::{
    parse_timestamp, ActivityEvent, ActivityKind, EventPayload, EventSource, HeartbeatSignals,
    IngestionError, SessionStatus,
};
use attest_protocol::{HeartbeatParams, HeartbeatState, WebhookParams};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::config::{IngestConfig, WebhookConfig};
use crate::db::{AppendOutcome, Db, SessionSeed};

/// Wall-clock budget for one ingestion call.
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(config: &IngestConfig) -> Self {
        Self {
            started: Instant::now(),
            budget: Duration::from_millis(config.deadline_ms),
        }
    }

    pub fn check(&self) -> Result<(), IngestionError> {
        if self.started.elapsed() > self.budget {
            return Err(IngestionError::DeadlineExceeded);
        }
        Ok(())
    }

    fn is_spent(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    /// Budget left for waiting on the store's write lock. Never zero, so a
    /// free lock is still taken.
    pub fn remaining(&self) -> Duration {
        self.budget
            .saturating_sub(self.started.elapsed())
            .max(Duration::from_millis(1))
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Append under the ingestion deadline. A write lock held past the budget
/// surfaces as `DeadlineExceeded` instead of a generic storage failure.
fn append_within(
    db: &Db,
    deadline: &Deadline,
    seed: Option<&SessionSeed>,
    session_id: &str,
    event: &ActivityEvent,
    now: DateTime<Utc>,
) -> Result<AppendOutcome, IngestionError> {
    deadline.check()?;
    match db.append_event_within(seed, session_id, event, now, deadline.remaining()) {
        Ok(outcome) => Ok(outcome),
        Err(err) if deadline.is_spent() => {
            tracing::warn!(
                session_id = %session_id,
                event_id = %event.event_id,
                elapsed_ms = deadline.elapsed_ms() as u64,
                error = %err,
                "Event append abandoned at ingestion deadline"
            );
            Err(IngestionError::DeadlineExceeded)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn ingest_webhook(
    db: &Db,
    webhook: &WebhookConfig,
    ingest: &IngestConfig,
    params: &WebhookParams,
    now: DateTime<Utc>,
) -> Result<Value, IngestionError> {
    let deadline = Deadline::start(ingest);
    let secret = webhook
        .secret
        .as_deref()
        .filter(|secret| !secret.is_empty())
        .ok_or(IngestionError::SecretNotConfigured)?;

    verify_signature(
        secret,
        &params.timestamp,
        &params.body,
        &params.signature,
        now,
        webhook.timestamp_tolerance_secs,
    )?;

    match parse_webhook_body(&params.body)? {
        WebhookMessage::UrlValidation { plain_token } => {
            tracing::info!("Answered webhook endpoint validation");
            challenge_response(secret, &plain_token)
        }
        WebhookMessage::Ignored { event } => {
            tracing::debug!(event = %event, "Ignoring untracked webhook event");
            Ok(json!({ "outcome": "ignored", "event": event }))
        }
        WebhookMessage::Participant(participant) => {
            let session_id = participant.session_id();
            let seed = SessionSeed {
                session_id: session_id.clone(),
                participant_id: participant.participant_id.clone(),
                meeting_id: participant.meeting_id.clone(),
                scheduled_start: participant.scheduled_start,
                scheduled_duration_min: participant.scheduled_duration_min,
            };
            let event = participant.to_activity_event();
            let outcome = append_within(db, &deadline, Some(&seed), &session_id, &event, now)?;
            finish(&deadline, &session_id, &event, outcome)
        }
    }
}

pub fn ingest_heartbeat(
    db: &Db,
    ingest: &IngestConfig,
    params: &HeartbeatParams,
    now: DateTime<Utc>,
) -> Result<Value, IngestionError> {
    let deadline = Deadline::start(ingest);
    let occurred_at = parse_timestamp(&params.occurred_at).ok_or_else(|| {
        IngestionError::MalformedPayload("occurred_at must be RFC3339".to_string())
    })?;
    let event = heartbeat_event(params, occurred_at);
    let outcome = append_within(db, &deadline, None, &params.session_id, &event, now)?;
    finish(&deadline, &params.session_id, &event, outcome)
}

fn heartbeat_event(params: &HeartbeatParams, occurred_at: DateTime<Utc>) -> ActivityEvent {
    ActivityEvent {
        event_id: params.event_id.clone(),
        kind: match params.state {
            HeartbeatState::Active => ActivityKind::HeartbeatActive,
            HeartbeatState::Idle => ActivityKind::HeartbeatIdle,
        },
        occurred_at,
        source: EventSource::ClientHeartbeat,
        sequence: 0,
        payload: EventPayload {
            heartbeat: Some(HeartbeatSignals {
                mouse_active: params.mouse_active,
                keyboard_active: params.keyboard_active,
                tab_focused: params.tab_focused,
            }),
            ..EventPayload::default()
        },
    }
}

fn finish(
    deadline: &Deadline,
    session_id: &str,
    event: &ActivityEvent,
    outcome: AppendOutcome,
) -> Result<Value, IngestionError> {
    match outcome {
        AppendOutcome::Appended { sequence } => {
            if deadline.check().is_err() {
                tracing::warn!(
                    session_id = %session_id,
                    event_id = %event.event_id,
                    elapsed_ms = deadline.elapsed_ms() as u64,
                    "Event stored after ingestion deadline"
                );
            }
            tracing::debug!(
                session_id = %session_id,
                event_id = %event.event_id,
                kind = event.kind.as_str(),
                sequence,
                "Event appended"
            );
            Ok(json!({
                "outcome": "appended",
                "session_id": session_id,
                "event_id": event.event_id,
                "sequence": sequence,
            }))
        }
        AppendOutcome::Duplicate => Ok(json!({
            "outcome": "duplicate",
            "session_id": session_id,
            "event_id": event.event_id,
        })),
        AppendOutcome::UnknownSession => Err(IngestionError::UnknownSession(session_id.to_string())),
        AppendOutcome::SessionClosed { status } => {
            tracing::info!(
                session_id = %session_id,
                event_id = %event.event_id,
                status = status.as_str(),
                "Dropped event for closed session"
            );
            Err(closed_error(session_id, status))
        }
    }
}

fn closed_error(session_id: &str, status: SessionStatus) -> IngestionError {
    IngestionError::SessionFinalized {
        session_id: session_id.to_string(),
        status: status.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::webhook::compute_signature;
    use chrono::TimeZone;

    const SECRET: &str = "whsec-test";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 5, 0)
            .single()
            .expect("now")
    }

    fn webhook_config() -> WebhookConfig {
        WebhookConfig {
            secret: Some(SECRET.to_string()),
            timestamp_tolerance_secs: 300,
        }
    }

    fn join_body() -> String {
        json!({
            "event": "meeting.participant_joined",
            "payload": {
                "object": {
                    "id": 8812,
                    "start_time": "2026-03-02T09:00:00Z",
                    "duration": 60,
                    "participant": {
                        "user_id": "user-7",
                        "event_id": "evt-join-1",
                        "join_time": "2026-03-02T09:01:00Z"
                    }
                }
            }
        })
        .to_string()
    }

    fn signed(body: String, at: DateTime<Utc>) -> WebhookParams {
        let timestamp = at.timestamp().to_string();
        WebhookParams {
            signature: compute_signature(SECRET, &timestamp, &body).expect("signature"),
            timestamp,
            body,
        }
    }

    fn heartbeat(session_id: &str, id: &str) -> HeartbeatParams {
        HeartbeatParams {
            event_id: id.to_string(),
            session_id: session_id.to_string(),
            occurred_at: "2026-03-02T09:03:00Z".to_string(),
            state: HeartbeatState::Active,
            mouse_active: true,
            keyboard_active: false,
            tab_focused: true,
        }
    }

    #[test]
    fn signed_join_creates_session_and_redelivery_deduplicates() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("attest.db")).expect("db init");
        let params = signed(join_body(), now());

        let first = ingest_webhook(&db, &webhook_config(), &IngestConfig::default(), &params, now())
            .expect("ingest");
        assert_eq!(first["outcome"], "appended");
        let session_id = first["session_id"].as_str().expect("session id").to_string();

        let again = ingest_webhook(&db, &webhook_config(), &IngestConfig::default(), &params, now())
            .expect("ingest");
        assert_eq!(again["outcome"], "duplicate");

        let session = db.get_session(&session_id).expect("get").expect("session");
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.meeting_id, "8812");
        assert_eq!(session.scheduled_duration_min, 60);
    }

    #[test]
    fn tampered_body_is_rejected_before_parsing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("attest.db")).expect("db init");
        let mut params = signed(join_body(), now());
        params.body = params.body.replace("user-7", "user-8");

        let err = ingest_webhook(&db, &webhook_config(), &IngestConfig::default(), &params, now())
            .expect_err("bad signature");
        assert_eq!(err, IngestionError::BadSignature);
        assert!(db.list_sessions(None, 10).expect("list").is_empty());
    }

    #[test]
    fn stale_and_unconfigured_webhooks_are_refused() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("attest.db")).expect("db init");
        let old = signed(join_body(), now() - chrono::Duration::minutes(10));
        let err = ingest_webhook(&db, &webhook_config(), &IngestConfig::default(), &old, now())
            .expect_err("stale");
        assert_eq!(err.code(), "stale_timestamp");

        let err = ingest_webhook(
            &db,
            &WebhookConfig::default(),
            &IngestConfig::default(),
            &signed(join_body(), now()),
            now(),
        )
        .expect_err("no secret");
        assert_eq!(err, IngestionError::SecretNotConfigured);
    }

    #[test]
    fn url_validation_returns_challenge() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("attest.db")).expect("db init");
        let body = json!({
            "event": "endpoint.url_validation",
            "payload": { "plainToken": "abc123" }
        })
        .to_string();
        let response = ingest_webhook(
            &db,
            &webhook_config(),
            &IngestConfig::default(),
            &signed(body, now()),
            now(),
        )
        .expect("challenge");
        assert_eq!(response["plainToken"], "abc123");
        assert_eq!(
            response["encryptedToken"].as_str().map(str::len),
            Some(64)
        );
    }

    #[test]
    fn heartbeat_requires_known_open_session() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("attest.db")).expect("db init");
        let err = ingest_heartbeat(&db, &IngestConfig::default(), &heartbeat("ses-none", "hb-1"), now())
            .expect_err("unknown");
        assert_eq!(err, IngestionError::UnknownSession("ses-none".to_string()));

        let joined = ingest_webhook(
            &db,
            &webhook_config(),
            &IngestConfig::default(),
            &signed(join_body(), now()),
            now(),
        )
        .expect("ingest");
        let session_id = joined["session_id"].as_str().expect("session id");
        let stored = ingest_heartbeat(&db, &IngestConfig::default(), &heartbeat(session_id, "hb-1"), now())
            .expect("heartbeat");
        assert_eq!(stored["outcome"], "appended");

        let session = db.get_session(session_id).expect("get").expect("session");
        let last = session.events.last().expect("event");
        assert_eq!(last.kind, ActivityKind::HeartbeatActive);
        assert_eq!(last.source, EventSource::ClientHeartbeat);
        assert_eq!(
            last.payload.heartbeat.map(|signals| signals.tab_focused),
            Some(true)
        );
    }

    #[test]
    fn held_write_lock_is_bounded_by_the_ingestion_deadline() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("attest.db");
        let db = Db::new(path.clone()).expect("db init");
        let joined = ingest_webhook(
            &db,
            &webhook_config(),
            &IngestConfig::default(),
            &signed(join_body(), now()),
            now(),
        )
        .expect("ingest");
        let session_id = joined["session_id"].as_str().expect("session id").to_string();

        let holder = rusqlite::Connection::open(&path).expect("open holder");
        holder
            .execute_batch("BEGIN IMMEDIATE;")
            .expect("take write lock");

        let tight = IngestConfig { deadline_ms: 150 };
        let started = Instant::now();
        let err = ingest_heartbeat(&db, &tight, &heartbeat(&session_id, "hb-locked"), now())
            .expect_err("lock outlasts deadline");
        assert_eq!(err, IngestionError::DeadlineExceeded);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "append waited {:?}",
            started.elapsed()
        );

        holder.execute_batch("ROLLBACK;").expect("release write lock");
        let stored = ingest_heartbeat(&db, &tight, &heartbeat(&session_id, "hb-locked"), now())
            .expect("heartbeat after release");
        assert_eq!(stored["outcome"], "appended");
    }

    #[test]
    fn exhausted_deadline_is_reported() {
        let deadline = Deadline {
            started: Instant::now() - Duration::from_millis(50),
            budget: Duration::from_millis(0),
        };
        assert_eq!(deadline.check(), Err(IngestionError::DeadlineExceeded));
        assert!(Deadline::start(&IngestConfig::default()).check().is_ok());
        assert_eq!(deadline.remaining(), Duration::from_millis(1));
    }
}
