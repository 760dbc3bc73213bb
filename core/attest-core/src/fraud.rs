//! Rule-based anomaly detection.
//!
//! Rules are evaluated independently and their violations accumulate into a
//! capped risk score. A rejecting violation always wins over the score.

use serde::{Deserialize, Serialize};

use crate::config::FraudPolicy;
use crate::engagement::EngagementAssessment;
use crate::timeline::Timeline;
use crate::types::{Recommendation, Severity};

const MAX_RISK: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    ImpossibleDuration,
    ZeroOrNegativeDuration,
    NoEngagementSignals,
    EngagementAnalysisFailed,
    AttendanceBelowThreshold,
    DurationDataMismatch,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::ImpossibleDuration => "IMPOSSIBLE_DURATION",
            ViolationKind::ZeroOrNegativeDuration => "ZERO_OR_NEGATIVE_DURATION",
            ViolationKind::NoEngagementSignals => "NO_ENGAGEMENT_SIGNALS",
            ViolationKind::EngagementAnalysisFailed => "ENGAGEMENT_ANALYSIS_FAILED",
            ViolationKind::AttendanceBelowThreshold => "ATTENDANCE_BELOW_THRESHOLD",
            ViolationKind::DurationDataMismatch => "DURATION_DATA_MISMATCH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationAction {
    Reject,
    Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub action: ViolationAction,
    pub message: String,
}

impl Violation {
    fn new(kind: ViolationKind, severity: Severity, action: ViolationAction, message: String) -> Self {
        Self {
            kind,
            severity,
            action,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudAssessment {
    pub violations: Vec<Violation>,
    pub risk_score: u32,
    pub recommendation: Recommendation,
    pub auto_reject: bool,
}

impl FraudAssessment {
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|violation| violation.kind == kind)
    }

    /// One-line summary suitable for a rejection marker.
    pub fn rejection_summary(&self) -> String {
        let kinds: Vec<&str> = self
            .violations
            .iter()
            .map(|violation| violation.kind.as_str())
            .collect();
        if kinds.is_empty() {
            format!("risk score {}", self.risk_score)
        } else {
            format!("risk score {}: {}", self.risk_score, kinds.join(", "))
        }
    }
}

pub fn detect_violations(
    timeline: &Timeline,
    scheduled_duration_min: u32,
    engagement: &EngagementAssessment,
    policy: &FraudPolicy,
) -> FraudAssessment {
    let total = timeline.metrics.total_duration_min;
    let scheduled = f64::from(scheduled_duration_min);
    let mut violations = Vec::new();

    if total > scheduled + policy.duration_tolerance_min {
        violations.push(Violation::new(
            ViolationKind::ImpossibleDuration,
            Severity::Critical,
            ViolationAction::Reject,
            format!(
                "attended {:.2} min exceeds scheduled {} min by more than {} min",
                total, scheduled_duration_min, policy.duration_tolerance_min
            ),
        ));
    }

    if total <= 0.0 {
        violations.push(Violation::new(
            ViolationKind::ZeroOrNegativeDuration,
            Severity::Critical,
            ViolationAction::Reject,
            format!("attended duration is {:.2} min", total),
        ));
    }

    if !timeline.has_activity() && total > policy.no_engagement_min {
        violations.push(Violation::new(
            ViolationKind::NoEngagementSignals,
            Severity::Critical,
            ViolationAction::Reject,
            format!("no activity evidence across {:.2} min of presence", total),
        ));
    }

    if engagement.recommendation == Recommendation::Reject {
        violations.push(Violation::new(
            ViolationKind::EngagementAnalysisFailed,
            Severity::High,
            ViolationAction::Reject,
            format!("engagement scoring rejected the session (score {:.2})", engagement.score),
        ));
    }

    if timeline.metrics.attendance_percent < policy.attendance_threshold_percent {
        violations.push(Violation::new(
            ViolationKind::AttendanceBelowThreshold,
            Severity::Medium,
            ViolationAction::Flag,
            format!(
                "attendance {:.2}% is below {}%",
                timeline.metrics.attendance_percent, policy.attendance_threshold_percent
            ),
        ));
    }

    if let Some(reported) = timeline.provider_reported_min {
        if !timeline.has_open_interval() && (reported - total).abs() > policy.mismatch_tolerance_min
        {
            violations.push(Violation::new(
                ViolationKind::DurationDataMismatch,
                Severity::Medium,
                ViolationAction::Flag,
                format!(
                    "provider reported {:.2} min, events reconstruct {:.2} min",
                    reported, total
                ),
            ));
        }
    }

    let penalty = match engagement.recommendation {
        Recommendation::Reject => policy.engagement_reject_penalty,
        Recommendation::FlagForReview => policy.engagement_flag_penalty,
        Recommendation::Approve => 0,
    };
    let risk_score = violations
        .iter()
        .map(|violation| violation.severity.risk_points())
        .sum::<u32>()
        .saturating_add(penalty)
        .min(MAX_RISK);

    let recommendation = if violations
        .iter()
        .any(|violation| violation.action == ViolationAction::Reject)
    {
        Recommendation::Reject
    } else if !violations.is_empty() || risk_score > policy.review_risk {
        Recommendation::FlagForReview
    } else {
        Recommendation::Approve
    };

    let auto_reject = recommendation == Recommendation::Reject
        || risk_score >= policy.auto_reject_risk
        || violations
            .iter()
            .any(|violation| violation.severity == Severity::Critical);

    FraudAssessment {
        violations,
        risk_score,
        recommendation,
        auto_reject,
    }
}
