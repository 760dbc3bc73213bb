//! Pure decisions behind the reconciliation sweep.
//!
//! The daemon owns scheduling and persistence; this module decides which
//! sessions are due and what an auto-closed interval is credited.

use chrono::{DateTime, Duration, Utc};

use crate::config::TimelinePolicy;
use crate::timeline::Timeline;
use crate::types::{
    ActivityEvent, ActivityKind, AttendanceSession, EventPayload, EventSource, InferredLeave,
    InferredLeaveBasis, SessionStatus,
};

/// IN_PROGRESS sessions whose window plus grace has elapsed.
pub fn is_due_for_close(session: &AttendanceSession, grace_min: u32, now: DateTime<Utc>) -> bool {
    session.status == SessionStatus::InProgress && session.window_elapsed(grace_min, now)
}

/// COMPLETED sessions without a record whose window has fully elapsed.
pub fn is_due_for_finalize(
    session: &AttendanceSession,
    grace_min: u32,
    now: DateTime<Utc>,
) -> bool {
    session.status == SessionStatus::Completed
        && session.record_id.is_none()
        && session.metadata.rejection_reason.is_none()
        && session.window_elapsed(grace_min, now)
}

/// Leave time for a still-open presence interval.
///
/// Credits up to one heartbeat interval past the last heartbeat seen in the
/// open interval, never the scheduled end. Without such a heartbeat the
/// configured fallback is credited from the interval start.
pub fn infer_leave(timeline: &Timeline, policy: &TimelinePolicy) -> Option<InferredLeave> {
    let open = timeline.open_interval()?;
    let heartbeat = timeline
        .last_heartbeat_at
        .filter(|at| *at >= open.start);
    Some(match heartbeat {
        Some(at) => InferredLeave {
            at: at + Duration::seconds(policy.heartbeat_interval_secs as i64),
            basis: InferredLeaveBasis::LastHeartbeat,
        },
        None => InferredLeave {
            at: open.start
                + Duration::milliseconds((policy.no_activity_fallback_min * 60_000.0).round() as i64),
            basis: InferredLeaveBasis::NoActivityFallback,
        },
    })
}

/// Deterministic id: a re-run sweep appends the same event, which deduplicates.
pub fn inferred_leave_event_id(session_id: &str) -> String {
    format!("inferred-leave-{}", session_id)
}

pub fn inferred_leave_event(session_id: &str, inferred: &InferredLeave) -> ActivityEvent {
    ActivityEvent {
        event_id: inferred_leave_event_id(session_id),
        kind: ActivityKind::Leave,
        occurred_at: inferred.at,
        source: EventSource::SystemInferred,
        sequence: 0,
        payload: EventPayload {
            inferred_basis: Some(inferred.basis),
            ..EventPayload::default()
        },
    }
}
