//! Session-level entry points tying reconstruction, scoring and detection.

use serde::Serialize;

use crate::config::PolicyConfig;
use crate::engagement::{score_timeline, EngagementAssessment};
use crate::error::GenerationError;
use crate::fraud::{detect_violations, FraudAssessment};
use crate::timeline::{reconstruct, Timeline};
use crate::types::{AttendanceSession, SessionStatus};
use crate::validation::{evaluate, ValidationReport};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionAssessment {
    pub timeline: Timeline,
    pub engagement: EngagementAssessment,
    pub fraud: FraudAssessment,
    pub validation: ValidationReport,
}

pub fn timeline_for(session: &AttendanceSession, policy: &PolicyConfig) -> Timeline {
    reconstruct(
        &session.events,
        session.scheduled_duration_min,
        &policy.timeline,
    )
}

pub fn score_session(session: &AttendanceSession, policy: &PolicyConfig) -> EngagementAssessment {
    score_timeline(&timeline_for(session, policy), &policy.engagement)
}

pub fn detect_fraud(session: &AttendanceSession, policy: &PolicyConfig) -> FraudAssessment {
    let timeline = timeline_for(session, policy);
    let engagement = score_timeline(&timeline, &policy.engagement);
    detect_violations(
        &timeline,
        session.scheduled_duration_min,
        &engagement,
        &policy.fraud,
    )
}

/// Run every stage once over a single reconstruction.
pub fn assess_session(session: &AttendanceSession, policy: &PolicyConfig) -> SessionAssessment {
    let timeline = timeline_for(session, policy);
    let engagement = score_timeline(&timeline, &policy.engagement);
    let fraud = detect_violations(
        &timeline,
        session.scheduled_duration_min,
        &engagement,
        &policy.fraud,
    );
    let validation = evaluate(
        session.scheduled_start,
        session.scheduled_duration_min,
        &timeline,
        &policy.validation,
    );
    SessionAssessment {
        timeline,
        engagement,
        fraud,
        validation,
    }
}

/// Copy reconstructed metrics and data-quality flags onto the session.
pub fn apply_timeline(session: &mut AttendanceSession, timeline: &Timeline) {
    session.join_time = timeline.first_join;
    session.leave_time = timeline.last_leave;
    session.metrics = Some(timeline.metrics.clone());
    for flag in &timeline.data_quality {
        session.metadata.add_flag(*flag);
    }
}

/// Only completed, unrejected sessions without a record may be finalized.
pub fn check_eligibility(session: &AttendanceSession) -> Result<(), GenerationError> {
    if let Some(record_id) = &session.record_id {
        return Err(GenerationError::AlreadyExists {
            session_id: session.session_id.clone(),
            record_id: record_id.clone(),
        });
    }
    if let Some(reason) = &session.metadata.rejection_reason {
        return Err(GenerationError::NotEligible {
            session_id: session.session_id.clone(),
            reason: format!("rejected: {}", reason),
        });
    }
    if session.status != SessionStatus::Completed {
        return Err(GenerationError::NotEligible {
            session_id: session.session_id.clone(),
            reason: format!("status is {}", session.status.as_str()),
        });
    }
    Ok(())
}
