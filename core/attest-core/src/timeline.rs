//! Timeline reconstruction.
//!
//! Events arrive in any order. Reconstruction sorts them by occurrence,
//! walks them once, and produces presence intervals plus the active/idle/away
//! split that every downstream stage reads.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::TimelinePolicy;
use crate::types::{
    minutes_between, ActivityEvent, ActivityKind, DataQualityFlag, EventSource, SessionMetrics,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// No LEAVE closed this interval; `end` is the latest observed event.
    pub open: bool,
}

impl PresenceInterval {
    pub fn minutes(&self) -> f64 {
        minutes_between(self.start, self.end).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub events: Vec<ActivityEvent>,
    pub intervals: Vec<PresenceInterval>,
    pub first_join: Option<DateTime<Utc>>,
    pub last_leave: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_count: u32,
    /// Heartbeats and media toggles observed while present.
    pub activity_event_count: u32,
    pub camera_on_evidence: bool,
    pub audio_evidence: bool,
    /// Sum of durations the provider attached to LEAVE events, if any did.
    pub provider_reported_min: Option<f64>,
    pub metrics: SessionMetrics,
    pub data_quality: Vec<DataQualityFlag>,
}

impl Timeline {
    pub fn has_open_interval(&self) -> bool {
        self.intervals.last().is_some_and(|interval| interval.open)
    }

    pub fn open_interval(&self) -> Option<&PresenceInterval> {
        self.intervals.last().filter(|interval| interval.open)
    }

    pub fn has_activity(&self) -> bool {
        self.activity_event_count > 0
    }

    /// Activity events per attended minute; the denominator never drops below one.
    pub fn event_rate_per_min(&self) -> f64 {
        f64::from(self.activity_event_count) / self.metrics.total_duration_min.max(1.0)
    }

    pub fn has_flag(&self, flag: DataQualityFlag) -> bool {
        self.data_quality.contains(&flag)
    }
}

/// Sort order for reconstruction: time, then kind rank, then identity.
///
/// Keying ties on kind and event id rather than arrival position keeps the
/// result identical for every permutation of the same event set.
pub fn order_events(events: &mut [ActivityEvent]) {
    events.sort_by(|a, b| {
        a.occurred_at
            .cmp(&b.occurred_at)
            .then_with(|| a.kind.tie_rank().cmp(&b.kind.tie_rank()))
            .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
            .then_with(|| a.event_id.cmp(&b.event_id))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
}

#[derive(Default)]
struct Walk {
    intervals: Vec<PresenceInterval>,
    present_since: Option<DateTime<Utc>>,
    heartbeat_anchor: Option<DateTime<Utc>>,
    active_ms: i64,
    idle_ms: i64,
    openings: u32,
    heartbeat_count: u32,
    activity_event_count: u32,
    last_heartbeat_at: Option<DateTime<Utc>>,
    camera_on: bool,
    audio_on: bool,
    provider_secs: Option<u64>,
    flags: Vec<DataQualityFlag>,
}

impl Walk {
    fn open(&mut self, at: DateTime<Utc>) {
        self.present_since = Some(at);
        self.heartbeat_anchor = Some(at);
        self.openings += 1;
    }

    fn close(&mut self, at: DateTime<Utc>, open: bool) {
        if let Some(start) = self.present_since.take() {
            self.intervals.push(PresenceInterval {
                start,
                end: at.max(start),
                open,
            });
        }
        self.heartbeat_anchor = None;
    }

    fn flag(&mut self, flag: DataQualityFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }
}

/// Rebuild the ordered timeline and metrics for one session.
pub fn reconstruct(
    events: &[ActivityEvent],
    scheduled_duration_min: u32,
    policy: &TimelinePolicy,
) -> Timeline {
    let mut ordered = events.to_vec();
    order_events(&mut ordered);

    let max_gap = Duration::seconds(policy.max_heartbeat_gap_secs as i64);
    let mut walk = Walk::default();

    if let Some(first) = ordered.first() {
        if !first.kind.opens_presence() {
            walk.flag(DataQualityFlag::AssumedJoin);
            walk.open(first.occurred_at);
        }
    }

    for event in &ordered {
        let at = event.occurred_at;
        match event.kind {
            ActivityKind::Join | ActivityKind::Rejoin => {
                if walk.present_since.is_none() {
                    walk.open(at);
                }
            }
            ActivityKind::Leave => {
                if event.source == EventSource::SystemInferred {
                    walk.flag(DataQualityFlag::InferredLeave);
                }
                if walk.present_since.is_some() {
                    walk.close(at, false);
                    if let Some(secs) = event.payload.reported_duration_secs {
                        walk.provider_secs = Some(walk.provider_secs.unwrap_or(0) + secs);
                    }
                } else {
                    walk.flag(DataQualityFlag::OrphanLeave);
                }
            }
            ActivityKind::HeartbeatActive | ActivityKind::HeartbeatIdle => {
                walk.heartbeat_count += 1;
                walk.last_heartbeat_at = Some(at);
                if let Some(anchor) = walk.heartbeat_anchor {
                    let credited = at.signed_duration_since(anchor).min(max_gap);
                    let credited_ms = credited.num_milliseconds().max(0);
                    if event.kind == ActivityKind::HeartbeatActive {
                        walk.active_ms += credited_ms;
                    } else {
                        walk.idle_ms += credited_ms;
                    }
                    walk.heartbeat_anchor = Some(at);
                    walk.activity_event_count += 1;
                }
            }
            ActivityKind::VideoOn | ActivityKind::AudioOn => {
                if walk.present_since.is_some() {
                    if event.kind == ActivityKind::VideoOn {
                        walk.camera_on = true;
                    } else {
                        walk.audio_on = true;
                    }
                    walk.activity_event_count += 1;
                }
            }
            ActivityKind::VideoOff | ActivityKind::AudioOff => {
                if walk.present_since.is_some() {
                    walk.activity_event_count += 1;
                }
            }
        }
    }

    let last_event_at = ordered.last().map(|event| event.occurred_at);
    if let Some(end) = last_event_at {
        if walk.present_since.is_some() {
            walk.close(end, true);
        }
    }

    if walk.heartbeat_count == 0 {
        walk.flag(DataQualityFlag::NoHeartbeats);
    }
    walk.flags.sort();

    let total_min: f64 = walk.intervals.iter().map(PresenceInterval::minutes).sum();
    let active_min = walk.active_ms as f64 / 60_000.0;
    let idle_min = walk.idle_ms as f64 / 60_000.0;
    let attendance_percent = if scheduled_duration_min == 0 {
        0.0
    } else {
        (total_min / f64::from(scheduled_duration_min) * 100.0).clamp(0.0, 100.0)
    };

    let metrics = SessionMetrics {
        total_duration_min: total_min,
        active_duration_min: active_min,
        idle_duration_min: idle_min,
        away_duration_min: (total_min - active_min - idle_min).max(0.0),
        attendance_percent,
        leave_rejoin_count: walk.openings.saturating_sub(1),
    };

    Timeline {
        first_join: walk.intervals.first().map(|interval| interval.start),
        last_leave: walk
            .intervals
            .last()
            .filter(|interval| !interval.open)
            .map(|interval| interval.end),
        last_event_at,
        last_heartbeat_at: walk.last_heartbeat_at,
        heartbeat_count: walk.heartbeat_count,
        activity_event_count: walk.activity_event_count,
        camera_on_evidence: walk.camera_on,
        audio_evidence: walk.audio_on,
        provider_reported_min: walk.provider_secs.map(|secs| secs as f64 / 60.0),
        intervals: walk.intervals,
        metrics,
        data_quality: walk.flags,
        events: ordered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventPayload;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("start")
    }

    fn event(id: &str, kind: ActivityKind, offset_secs: i64) -> ActivityEvent {
        ActivityEvent {
            event_id: id.to_string(),
            kind,
            occurred_at: start() + Duration::seconds(offset_secs),
            source: if kind.is_heartbeat() {
                EventSource::ClientHeartbeat
            } else {
                EventSource::Webhook
            },
            sequence: 0,
            payload: EventPayload::default(),
        }
    }

    #[test]
    fn leave_and_rejoin_produce_two_intervals() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("l1", ActivityKind::Leave, 15 * 60),
            event("r", ActivityKind::Rejoin, 20 * 60),
            event("l2", ActivityKind::Leave, 60 * 60),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert_eq!(timeline.intervals.len(), 2);
        assert_eq!(timeline.metrics.total_duration_min, 55.0);
        assert_eq!(timeline.metrics.leave_rejoin_count, 1);
        assert!(!timeline.has_open_interval());
    }

    #[test]
    fn missing_join_uses_earliest_event_and_flags_it() {
        let events = vec![
            event("hb", ActivityKind::HeartbeatActive, 5 * 60),
            event("l", ActivityKind::Leave, 30 * 60),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert!(timeline.has_flag(DataQualityFlag::AssumedJoin));
        assert_eq!(timeline.first_join, Some(start() + Duration::minutes(5)));
        assert_eq!(timeline.metrics.total_duration_min, 25.0);
    }

    #[test]
    fn missing_leave_leaves_interval_open() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("hb", ActivityKind::HeartbeatActive, 120),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert!(timeline.has_open_interval());
        assert_eq!(timeline.last_leave, None);
        assert_eq!(timeline.metrics.total_duration_min, 2.0);
    }

    #[test]
    fn heartbeat_credit_is_capped_and_clipped_to_presence() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("hb1", ActivityKind::HeartbeatActive, 10 * 60),
            event("hb2", ActivityKind::HeartbeatIdle, 11 * 60),
            event("l", ActivityKind::Leave, 12 * 60),
            event("hb3", ActivityKind::HeartbeatActive, 13 * 60),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        // First heartbeat credits at most max_gap (3 min) of the 10-minute span.
        assert_eq!(timeline.metrics.active_duration_min, 3.0);
        assert_eq!(timeline.metrics.idle_duration_min, 1.0);
        assert_eq!(timeline.metrics.away_duration_min, 8.0);
        assert_eq!(timeline.heartbeat_count, 3);
        assert_eq!(timeline.activity_event_count, 2);
    }

    #[test]
    fn zero_heartbeats_leave_active_and_idle_at_zero() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("l", ActivityKind::Leave, 30 * 60),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert_eq!(timeline.metrics.active_duration_min, 0.0);
        assert_eq!(timeline.metrics.idle_duration_min, 0.0);
        assert_eq!(timeline.metrics.away_duration_min, 30.0);
        assert!(timeline.has_flag(DataQualityFlag::NoHeartbeats));
    }

    #[test]
    fn leave_sorts_before_rejoin_at_the_same_instant() {
        let events = vec![
            event("r", ActivityKind::Rejoin, 600),
            event("j", ActivityKind::Join, 0),
            event("l", ActivityKind::Leave, 600),
            event("l2", ActivityKind::Leave, 1200),
        ];
        let timeline = reconstruct(&events, 20, &TimelinePolicy::default());
        assert_eq!(timeline.intervals.len(), 2);
        assert_eq!(timeline.metrics.total_duration_min, 20.0);
        assert_eq!(timeline.metrics.attendance_percent, 100.0);
    }

    #[test]
    fn orphan_leave_is_flagged_not_counted() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("l", ActivityKind::Leave, 300),
            event("l-dup", ActivityKind::Leave, 400),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert!(timeline.has_flag(DataQualityFlag::OrphanLeave));
        assert_eq!(timeline.metrics.total_duration_min, 5.0);
    }

    #[test]
    fn media_signals_outside_presence_are_not_evidence() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("l", ActivityKind::Leave, 10 * 60),
            event("v", ActivityKind::VideoOn, 11 * 60),
            event("a", ActivityKind::AudioOn, 12 * 60),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert!(!timeline.camera_on_evidence);
        assert!(!timeline.audio_evidence);
        assert_eq!(timeline.activity_event_count, 0);

        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("v", ActivityKind::VideoOn, 60),
            event("l", ActivityKind::Leave, 10 * 60),
        ];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert!(timeline.camera_on_evidence);
        assert!(!timeline.audio_evidence);
    }

    #[test]
    fn provider_durations_are_summed_from_leave_payloads() {
        let mut leave = event("l", ActivityKind::Leave, 30 * 60);
        leave.payload.reported_duration_secs = Some(29 * 60);
        let events = vec![event("j", ActivityKind::Join, 0), leave];
        let timeline = reconstruct(&events, 60, &TimelinePolicy::default());
        assert_eq!(timeline.provider_reported_min, Some(29.0));
    }

    #[test]
    fn attendance_is_zero_for_zero_scheduled_duration() {
        let events = vec![
            event("j", ActivityKind::Join, 0),
            event("l", ActivityKind::Leave, 60),
        ];
        let timeline = reconstruct(&events, 0, &TimelinePolicy::default());
        assert_eq!(timeline.metrics.attendance_percent, 0.0);
    }
}
