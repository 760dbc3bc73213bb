//! Reconciliation sweep.
//!
//! Two phases per sweep:
//!
//! 1. Close: IN_PROGRESS sessions whose window plus grace has elapsed get an
//!    inferred LEAVE for any open presence interval and move to COMPLETED.
//! 2. Finalize: COMPLETED sessions are claimed, assessed, and either rejected
//!    (auto-reject risk) or issued exactly one verification record.
//!
//! Finalization runs one worker per chain scope; sessions sharing a scope
//! are processed in order so their records append to the chain serially.

use attest_core::reconcile::{infer_leave, inferred_leave_event, is_due_for_close, is_due_for_finalize};
use attest_core::{
    apply_timeline, assess_session, format_timestamp, timeline_for, GenerationError, PolicyConfig,
    ValidationStatus,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::config::DaemonConfig;
use crate::db::{Db, SessionOutcome};
use crate::generator::RecordGenerator;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepFailure {
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepSummary {
    pub trigger: String,
    pub started_at: String,
    pub finished_at: String,
    pub closed: usize,
    pub finalized: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<SweepFailure>,
}

enum Settled {
    Finalized,
    Rejected,
    Skipped,
    Failed(SweepFailure),
}

pub fn run_sweep(
    db: &Db,
    generator: &RecordGenerator,
    config: &DaemonConfig,
    trigger: &str,
    now: DateTime<Utc>,
) -> Result<SweepSummary, String> {
    let started = Instant::now();
    let mut summary = SweepSummary {
        trigger: trigger.to_string(),
        started_at: format_timestamp(now),
        finished_at: String::new(),
        closed: 0,
        finalized: 0,
        rejected: 0,
        skipped: 0,
        failed: 0,
        failures: Vec::new(),
    };
    let grace = config.scheduler.grace_period_min;
    let cutoff = now - Duration::minutes(i64::from(grace));

    for session_id in db.sessions_due_for_close(cutoff)? {
        match close_session(db, &config.policy, &session_id, grace, now) {
            Ok(true) => summary.closed += 1,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Failed to close session");
                summary.failed += 1;
                summary.failures.push(SweepFailure {
                    session_id,
                    error: err,
                });
            }
        }
    }

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for session_id in db.sessions_due_for_finalize(cutoff, now)? {
        let session = match db.get_session(&session_id) {
            Ok(Some(session)) => session,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %err, "Failed to load session");
                summary.failed += 1;
                summary.failures.push(SweepFailure {
                    session_id,
                    error: err,
                });
                continue;
            }
        };
        if !is_due_for_finalize(&session, grace, now) {
            continue;
        }
        groups
            .entry(generator.scope_key(&session))
            .or_default()
            .push(session.session_id);
    }

    let results: Vec<Settled> = std::thread::scope(|scope| {
        let workers: Vec<_> = groups
            .into_values()
            .map(|sessions| {
                scope.spawn(move || {
                    sessions
                        .into_iter()
                        .map(|session_id| settle_session(db, generator, config, session_id, now))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| match worker.join() {
                Ok(results) => results,
                Err(_) => vec![Settled::Failed(SweepFailure {
                    session_id: String::new(),
                    error: "finalization worker panicked".to_string(),
                })],
            })
            .collect()
    });

    for result in results {
        match result {
            Settled::Finalized => summary.finalized += 1,
            Settled::Rejected => summary.rejected += 1,
            Settled::Skipped => summary.skipped += 1,
            Settled::Failed(failure) => {
                summary.failed += 1;
                summary.failures.push(failure);
            }
        }
    }

    let elapsed = Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());
    summary.finished_at = format_timestamp(now + elapsed);
    tracing::info!(
        trigger = %summary.trigger,
        closed = summary.closed,
        finalized = summary.finalized,
        rejected = summary.rejected,
        skipped = summary.skipped,
        failed = summary.failed,
        "Reconciliation sweep finished"
    );
    Ok(summary)
}

fn close_session(
    db: &Db,
    policy: &PolicyConfig,
    session_id: &str,
    grace_min: u32,
    now: DateTime<Utc>,
) -> Result<bool, String> {
    let Some(mut session) = db.get_session(session_id)? else {
        return Ok(false);
    };
    if !is_due_for_close(&session, grace_min, now) {
        return Ok(false);
    }

    let mut inferred_event = None;
    if let Some(inferred) = infer_leave(&timeline_for(&session, policy), &policy.timeline) {
        let event = inferred_leave_event(session_id, &inferred);
        session.events.push(event.clone());
        session.metadata.inferred_leave = Some(inferred);
        inferred_event = Some(event);
    }

    let timeline = timeline_for(&session, policy);
    apply_timeline(&mut session, &timeline);
    let closed = db.complete_session(
        session_id,
        inferred_event.as_ref(),
        &SessionOutcome::from_session(&session),
        now,
    )?;
    if closed {
        tracing::info!(
            session_id = %session_id,
            inferred_leave = inferred_event.is_some(),
            "Session auto-closed"
        );
    }
    Ok(closed)
}

fn settle_session(
    db: &Db,
    generator: &RecordGenerator,
    config: &DaemonConfig,
    session_id: String,
    now: DateTime<Utc>,
) -> Settled {
    let token = ulid::Ulid::new().to_string();
    let lease_until = now + Duration::seconds(config.scheduler.claim_lease_secs as i64);

    match db.claim_session(&session_id, &token, now, lease_until) {
        Ok(true) => {}
        Ok(false) => return Settled::Skipped,
        Err(err) => return failed(session_id, err),
    }

    // Events may have arrived since the due scan; assess what is stored now.
    let mut session = match db.get_session(&session_id) {
        Ok(Some(session)) => session,
        Ok(None) => {
            release(db, &session_id, &token);
            return Settled::Skipped;
        }
        Err(err) => {
            release(db, &session_id, &token);
            return failed(session_id, err);
        }
    };

    let assessment = assess_session(&session, &config.policy);
    apply_timeline(&mut session, &assessment.timeline);
    session.is_valid = Some(assessment.validation.status == ValidationStatus::Passed);

    if assessment.fraud.auto_reject {
        session.is_valid = Some(false);
        session.metadata.rejection_reason = Some(assessment.fraud.rejection_summary());
        return match db.reject_session(
            &session_id,
            &token,
            &SessionOutcome::from_session(&session),
            now,
        ) {
            Ok(true) => {
                tracing::info!(
                    session_id = %session_id,
                    risk_score = assessment.fraud.risk_score,
                    "Session rejected by fraud screening"
                );
                Settled::Rejected
            }
            Ok(false) => Settled::Skipped,
            Err(err) => {
                release(db, &session_id, &token);
                failed(session_id, err)
            }
        };
    }

    match generator.generate(db, &session, &assessment, &token, now) {
        Ok(_) => Settled::Finalized,
        Err(err @ GenerationError::AlreadyExists { .. }) => {
            tracing::debug!(session_id = %session_id, error = %err, "Record already issued");
            release(db, &session_id, &token);
            Settled::Skipped
        }
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "Record generation failed");
            release(db, &session_id, &token);
            failed(session_id, err.to_string())
        }
    }
}

fn release(db: &Db, session_id: &str, token: &str) {
    if let Err(err) = db.release_claim(session_id, token) {
        tracing::warn!(session_id = %session_id, error = %err, "Failed to release claim");
    }
}

fn failed(session_id: String, error: String) -> Settled {
    Settled::Failed(SweepFailure { session_id, error })
}
