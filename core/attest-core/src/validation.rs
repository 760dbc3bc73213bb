//! Compliance validation gate for verification records.
//!
//! The gate is independent of the fraud rules. A failed CRITICAL check marks
//! the record `FAILED` but never suppresses it: the record is still built,
//! signed and chained so the failure is auditable.
//!
//! ## Accounting
//!
//! Attended time splits into three explicit buckets: active, idle, and away
//! (attended time no heartbeat covered). The active-ratio floor and the idle
//! ceiling both divide by attended time, so a session with large away time
//! can fail the floor while passing the ceiling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ValidationPolicy;
use crate::timeline::Timeline;
use crate::types::{minutes_between, Severity};

/// Ratios that compare equal to a threshold must pass it.
const RATIO_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    Passed,
    Failed,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Passed => "PASSED",
            ValidationStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationRule {
    Punctuality,
    ActiveTimeRatio,
    MinimumDuration,
    AttendanceRatio,
    IdleTimeCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckOutcome {
    Passed,
    Failed,
    /// The rule has no evidence to judge (e.g. no heartbeat coverage).
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub rule: ValidationRule,
    pub severity: Severity,
    pub outcome: CheckOutcome,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    pub fn check(&self, rule: ValidationRule) -> Option<&ValidationCheck> {
        self.checks.iter().find(|check| check.rule == rule)
    }

    pub fn failed_rules(&self) -> Vec<ValidationRule> {
        self.checks
            .iter()
            .filter(|check| check.outcome == CheckOutcome::Failed)
            .map(|check| check.rule)
            .collect()
    }
}

pub fn evaluate(
    scheduled_start: DateTime<Utc>,
    scheduled_duration_min: u32,
    timeline: &Timeline,
    policy: &ValidationPolicy,
) -> ValidationReport {
    let scheduled_end = scheduled_start + Duration::minutes(i64::from(scheduled_duration_min));
    let metrics = &timeline.metrics;
    let attended = metrics.total_duration_min;

    let checks = vec![
        punctuality(scheduled_start, scheduled_end, timeline, policy),
        active_ratio(timeline, policy),
        ValidationCheck {
            rule: ValidationRule::MinimumDuration,
            severity: Severity::Critical,
            outcome: pass_if(attended + RATIO_EPSILON >= policy.min_attended_min),
            message: format!(
                "attended {:.2} min, minimum {} min",
                attended, policy.min_attended_min
            ),
        },
        ValidationCheck {
            rule: ValidationRule::AttendanceRatio,
            severity: Severity::Critical,
            outcome: pass_if(
                metrics.attendance_percent + RATIO_EPSILON >= policy.min_attendance_percent,
            ),
            message: format!(
                "attendance {:.2}%, minimum {}%",
                metrics.attendance_percent, policy.min_attendance_percent
            ),
        },
        idle_ceiling(timeline, policy),
    ];

    let failed = checks
        .iter()
        .any(|check| check.severity == Severity::Critical && check.outcome == CheckOutcome::Failed);

    ValidationReport {
        status: if failed {
            ValidationStatus::Failed
        } else {
            ValidationStatus::Passed
        },
        checks,
    }
}

fn pass_if(condition: bool) -> CheckOutcome {
    if condition {
        CheckOutcome::Passed
    } else {
        CheckOutcome::Failed
    }
}

fn punctuality(
    scheduled_start: DateTime<Utc>,
    scheduled_end: DateTime<Utc>,
    timeline: &Timeline,
    policy: &ValidationPolicy,
) -> ValidationCheck {
    let (late, early) = match (
        timeline.first_join,
        timeline.intervals.last().map(|interval| interval.end),
    ) {
        (Some(join), Some(leave)) => (
            minutes_between(scheduled_start, join).max(0.0),
            minutes_between(leave, scheduled_end).max(0.0),
        ),
        _ => (minutes_between(scheduled_start, scheduled_end), 0.0),
    };
    let missed = late + early;
    ValidationCheck {
        rule: ValidationRule::Punctuality,
        severity: Severity::Critical,
        outcome: pass_if(missed <= policy.punctuality_grace_min + RATIO_EPSILON),
        message: format!(
            "late {:.2} min + early {:.2} min = {:.2} min, grace {} min",
            late, early, missed, policy.punctuality_grace_min
        ),
    }
}

fn active_ratio(timeline: &Timeline, policy: &ValidationPolicy) -> ValidationCheck {
    let attended = timeline.metrics.total_duration_min;
    if timeline.heartbeat_count == 0 || attended <= 0.0 {
        return ValidationCheck {
            rule: ValidationRule::ActiveTimeRatio,
            severity: Severity::Critical,
            outcome: CheckOutcome::NotApplicable,
            message: "no heartbeat coverage".to_string(),
        };
    }
    let ratio = timeline.metrics.active_duration_min / attended;
    ValidationCheck {
        rule: ValidationRule::ActiveTimeRatio,
        severity: Severity::Critical,
        outcome: pass_if(ratio + RATIO_EPSILON >= policy.min_active_ratio),
        message: format!(
            "active {:.2} of {:.2} min ({:.1}%), minimum {:.1}%",
            timeline.metrics.active_duration_min,
            attended,
            ratio * 100.0,
            policy.min_active_ratio * 100.0
        ),
    }
}

fn idle_ceiling(timeline: &Timeline, policy: &ValidationPolicy) -> ValidationCheck {
    let attended = timeline.metrics.total_duration_min;
    if timeline.heartbeat_count == 0 || attended <= 0.0 {
        return ValidationCheck {
            rule: ValidationRule::IdleTimeCeiling,
            severity: Severity::Warning,
            outcome: CheckOutcome::NotApplicable,
            message: "no heartbeat coverage".to_string(),
        };
    }
    let ratio = timeline.metrics.idle_duration_min / attended;
    ValidationCheck {
        rule: ValidationRule::IdleTimeCeiling,
        severity: Severity::Warning,
        outcome: pass_if(ratio <= policy.max_idle_ratio + RATIO_EPSILON),
        message: format!(
            "idle {:.2} of {:.2} min ({:.1}%), ceiling {:.1}%",
            timeline.metrics.idle_duration_min,
            attended,
            ratio * 100.0,
            policy.max_idle_ratio * 100.0
        ),
    }
}
