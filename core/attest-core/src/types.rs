//! Core data model shared by the daemon and its clients.
//!
//! Sessions are append-only: they gain events and move forward through
//! [`SessionStatus`], they are never rewritten or deleted.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════════
// Activity Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    Join,
    Rejoin,
    Leave,
    VideoOn,
    VideoOff,
    AudioOn,
    AudioOff,
    HeartbeatActive,
    HeartbeatIdle,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Join => "JOIN",
            ActivityKind::Rejoin => "REJOIN",
            ActivityKind::Leave => "LEAVE",
            ActivityKind::VideoOn => "VIDEO_ON",
            ActivityKind::VideoOff => "VIDEO_OFF",
            ActivityKind::AudioOn => "AUDIO_ON",
            ActivityKind::AudioOff => "AUDIO_OFF",
            ActivityKind::HeartbeatActive => "HEARTBEAT_ACTIVE",
            ActivityKind::HeartbeatIdle => "HEARTBEAT_IDLE",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "JOIN" => Some(ActivityKind::Join),
            "REJOIN" => Some(ActivityKind::Rejoin),
            "LEAVE" => Some(ActivityKind::Leave),
            "VIDEO_ON" => Some(ActivityKind::VideoOn),
            "VIDEO_OFF" => Some(ActivityKind::VideoOff),
            "AUDIO_ON" => Some(ActivityKind::AudioOn),
            "AUDIO_OFF" => Some(ActivityKind::AudioOff),
            "HEARTBEAT_ACTIVE" => Some(ActivityKind::HeartbeatActive),
            "HEARTBEAT_IDLE" => Some(ActivityKind::HeartbeatIdle),
            _ => None,
        }
    }

    pub fn opens_presence(&self) -> bool {
        matches!(self, ActivityKind::Join | ActivityKind::Rejoin)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(
            self,
            ActivityKind::HeartbeatActive | ActivityKind::HeartbeatIdle
        )
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            ActivityKind::VideoOn
                | ActivityKind::VideoOff
                | ActivityKind::AudioOn
                | ActivityKind::AudioOff
        )
    }

    /// Ordering among events that share a timestamp.
    ///
    /// A LEAVE and a REJOIN at the same instant is a reconnect, so the leave
    /// must be applied first.
    pub fn tie_rank(&self) -> u8 {
        match self {
            ActivityKind::Leave => 0,
            ActivityKind::Join | ActivityKind::Rejoin => 1,
            ActivityKind::VideoOn
            | ActivityKind::VideoOff
            | ActivityKind::AudioOn
            | ActivityKind::AudioOff => 2,
            ActivityKind::HeartbeatActive | ActivityKind::HeartbeatIdle => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    Webhook,
    ClientHeartbeat,
    /// Appended by the reconciliation sweep (inferred leave).
    SystemInferred,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Webhook => "WEBHOOK",
            EventSource::ClientHeartbeat => "CLIENT_HEARTBEAT",
            EventSource::SystemInferred => "SYSTEM_INFERRED",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "WEBHOOK" => Some(EventSource::Webhook),
            "CLIENT_HEARTBEAT" => Some(EventSource::ClientHeartbeat),
            "SYSTEM_INFERRED" => Some(EventSource::SystemInferred),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatSignals {
    pub mouse_active: bool,
    pub keyboard_active: bool,
    pub tab_focused: bool,
}

/// Event payload: a closed set of known fields plus an open extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSignals>,
    /// Duration the provider itself reported for the closing presence span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_basis: Option<InferredLeaveBasis>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub event_id: String,
    pub kind: ActivityKind,
    pub occurred_at: DateTime<Utc>,
    pub source: EventSource,
    /// Arrival position in the event store; breaks timestamp ties.
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub payload: EventPayload,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Completed,
    /// A verification record has been issued.
    Finalized,
    Rejected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Finalized => "finalized",
            SessionStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "finalized" => Some(SessionStatus::Finalized),
            "rejected" => Some(SessionStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Finalized | SessionStatus::Rejected)
    }

    /// Transitions only move forward.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::InProgress, SessionStatus::Completed)
                | (SessionStatus::InProgress, SessionStatus::Rejected)
                | (SessionStatus::Completed, SessionStatus::Finalized)
                | (SessionStatus::Completed, SessionStatus::Rejected)
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Metadata
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQualityFlag {
    /// No JOIN observed; the earliest event stands in for it.
    AssumedJoin,
    /// A LEAVE arrived while the participant was not present.
    OrphanLeave,
    /// The closing LEAVE was inferred by the reconciliation sweep.
    InferredLeave,
    NoHeartbeats,
}

impl DataQualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataQualityFlag::AssumedJoin => "ASSUMED_JOIN",
            DataQualityFlag::OrphanLeave => "ORPHAN_LEAVE",
            DataQualityFlag::InferredLeave => "INFERRED_LEAVE",
            DataQualityFlag::NoHeartbeats => "NO_HEARTBEATS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferredLeaveBasis {
    /// Last heartbeat plus one heartbeat interval.
    LastHeartbeat,
    /// No heartbeat in the open interval; configured fallback duration.
    NoActivityFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredLeave {
    pub at: DateTime<Utc>,
    pub basis: InferredLeaveBasis,
}

/// Structured session metadata with an explicit extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_quality: Vec<DataQualityFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred_leave: Option<InferredLeave>,
    /// Invalidity marker; a set value keeps the session out of finalization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl SessionMetadata {
    pub fn add_flag(&mut self, flag: DataQualityFlag) {
        if !self.data_quality.contains(&flag) {
            self.data_quality.push(flag);
            self.data_quality.sort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Attendance Session
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_duration_min: f64,
    pub active_duration_min: f64,
    pub idle_duration_min: f64,
    /// Attended time covered by neither active nor idle heartbeats.
    pub away_duration_min: f64,
    pub attendance_percent: f64,
    pub leave_rejoin_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub session_id: String,
    pub participant_id: String,
    pub meeting_id: String,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_duration_min: u32,
    #[serde(default)]
    pub join_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub leave_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default)]
    pub events: Vec<ActivityEvent>,
    #[serde(default)]
    pub metrics: Option<SessionMetrics>,
    #[serde(default)]
    pub is_valid: Option<bool>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub record_id: Option<String>,
}

impl AttendanceSession {
    pub fn scheduled_end(&self) -> DateTime<Utc> {
        self.scheduled_start + Duration::minutes(i64::from(self.scheduled_duration_min))
    }

    /// True once `scheduled_end + grace` lies in the past.
    pub fn window_elapsed(&self, grace_min: u32, now: DateTime<Utc>) -> bool {
        now >= self.scheduled_end() + Duration::minutes(i64::from(grace_min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Approve,
    FlagForReview,
    Reject,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "APPROVE",
            Recommendation::FlagForReview => "FLAG_FOR_REVIEW",
            Recommendation::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Warning,
}

impl Severity {
    /// Contribution to a fraud risk score.
    pub fn risk_points(&self) -> u32 {
        match self {
            Severity::Critical => 30,
            Severity::High => 20,
            Severity::Medium => 10,
            Severity::Warning => 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Time Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Canonical timestamp text: UTC, millisecond precision, `Z` suffix.
///
/// Every stored timestamp uses this form so lexical order matches time order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn minutes_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    end.signed_duration_since(start).num_milliseconds() as f64 / 60_000.0
}
