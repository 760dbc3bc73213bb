//! Presence-confidence scoring.
//!
//! The composite score weights three sub-scores: visual presence (camera and
//! audio evidence), activity presence (any heartbeat or media toggle while
//! joined), and consistency (penalizes implausibly dense event streams).

use serde::{Deserialize, Serialize};

use crate::config::EngagementPolicy;
use crate::timeline::Timeline;
use crate::types::Recommendation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementLevel {
    High,
    Moderate,
    Low,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementFlag {
    NoVideo,
    NoAudio,
    NoActivity,
    ElevatedEventRate,
    LikelyAutomated,
    ZeroActivity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub visual: f64,
    pub activity: f64,
    pub consistency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementAssessment {
    pub score: f64,
    pub level: EngagementLevel,
    pub sub_scores: SubScores,
    pub event_rate_per_min: f64,
    pub flags: Vec<EngagementFlag>,
    pub recommendation: Recommendation,
}

impl EngagementAssessment {
    pub fn has_flag(&self, flag: EngagementFlag) -> bool {
        self.flags.contains(&flag)
    }
}

pub fn score_timeline(timeline: &Timeline, policy: &EngagementPolicy) -> EngagementAssessment {
    let mut flags = Vec::new();

    let mut visual = 0.0;
    if timeline.camera_on_evidence {
        visual += policy.camera_points;
    } else {
        flags.push(EngagementFlag::NoVideo);
    }
    if timeline.audio_evidence {
        visual += policy.audio_points;
    } else {
        flags.push(EngagementFlag::NoAudio);
    }

    let activity = if timeline.has_activity() {
        100.0
    } else {
        flags.push(EngagementFlag::NoActivity);
        0.0
    };

    let rate = timeline.event_rate_per_min();
    let consistency = if rate > policy.automated_rate_per_min {
        flags.push(EngagementFlag::LikelyAutomated);
        0.0
    } else if rate > policy.elevated_rate_per_min {
        flags.push(EngagementFlag::ElevatedEventRate);
        50.0
    } else {
        100.0
    };

    let raw = visual.min(100.0) * policy.visual_weight
        + activity * policy.activity_weight
        + consistency * policy.consistency_weight;
    // Two decimals so band boundaries are not at the mercy of float noise.
    let score = ((raw * 100.0).round() / 100.0).clamp(0.0, 100.0);

    let presence_min = timeline.metrics.total_duration_min;
    let zero_activity = !timeline.has_activity() && presence_min > policy.zero_activity_min;
    if zero_activity {
        flags.push(EngagementFlag::ZeroActivity);
    }

    let recommendation = if rate > policy.automated_rate_per_min || zero_activity {
        Recommendation::Reject
    } else if score >= policy.approve_score {
        Recommendation::Approve
    } else if score >= policy.review_score {
        if flags.contains(&EngagementFlag::NoVideo) {
            Recommendation::FlagForReview
        } else {
            Recommendation::Approve
        }
    } else if score >= policy.low_score {
        Recommendation::FlagForReview
    } else {
        Recommendation::Reject
    };

    flags.sort();
    EngagementAssessment {
        score,
        level: level_for(score, policy),
        sub_scores: SubScores {
            visual,
            activity,
            consistency,
        },
        event_rate_per_min: rate,
        flags,
        recommendation,
    }
}

fn level_for(score: f64, policy: &EngagementPolicy) -> EngagementLevel {
    if score >= policy.approve_score {
        EngagementLevel::High
    } else if score >= policy.review_score {
        EngagementLevel::Moderate
    } else if score >= policy.low_score {
        EngagementLevel::Low
    } else {
        EngagementLevel::Minimal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimelinePolicy;
    use crate::timeline::reconstruct;
    use crate::types::{ActivityEvent, ActivityKind, EventPayload, EventSource};
    use chrono::{Duration, TimeZone, Utc};

    fn event(id: String, kind: ActivityKind, offset_secs: i64) -> ActivityEvent {
        ActivityEvent {
            event_id: id,
            kind,
            occurred_at: Utc
                .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
                .single()
                .expect("start")
                + Duration::seconds(offset_secs),
            source: EventSource::Webhook,
            sequence: 0,
            payload: EventPayload::default(),
        }
    }

    fn session(minutes: i64, extra: Vec<(ActivityKind, i64)>) -> Timeline {
        let mut events = vec![
            event("join".to_string(), ActivityKind::Join, 0),
            event("leave".to_string(), ActivityKind::Leave, minutes * 60),
        ];
        for (idx, (kind, offset)) in extra.into_iter().enumerate() {
            events.push(event(format!("e{}", idx), kind, offset));
        }
        reconstruct(&events, minutes as u32, &TimelinePolicy::default())
    }

    #[test]
    fn camera_audio_and_activity_score_full_marks() {
        let timeline = session(
            30,
            vec![
                (ActivityKind::VideoOn, 5),
                (ActivityKind::AudioOn, 6),
                (ActivityKind::HeartbeatActive, 60),
            ],
        );
        let assessment = score_timeline(&timeline, &EngagementPolicy::default());
        assert_eq!(assessment.score, 100.0);
        assert_eq!(assessment.level, EngagementLevel::High);
        assert_eq!(assessment.recommendation, Recommendation::Approve);
        assert!(assessment.flags.is_empty());
    }

    #[test]
    fn activity_without_video_is_flagged_for_review() {
        let timeline = session(30, vec![(ActivityKind::HeartbeatActive, 60)]);
        let assessment = score_timeline(&timeline, &EngagementPolicy::default());
        // 0.3 * 100 + 0.2 * 100
        assert_eq!(assessment.score, 50.0);
        assert!(assessment.has_flag(EngagementFlag::NoVideo));
        assert_eq!(assessment.recommendation, Recommendation::FlagForReview);
    }

    #[test]
    fn camera_without_audio_still_scores_high() {
        let timeline = session(
            30,
            vec![(ActivityKind::VideoOn, 5), (ActivityKind::HeartbeatActive, 60)],
        );
        let assessment = score_timeline(&timeline, &EngagementPolicy::default());
        assert_eq!(assessment.score, 85.0);
        assert_eq!(assessment.recommendation, Recommendation::Approve);
    }

    #[test]
    fn silent_long_presence_is_rejected_for_zero_activity() {
        let timeline = session(45, vec![]);
        let assessment = score_timeline(&timeline, &EngagementPolicy::default());
        assert!(assessment.has_flag(EngagementFlag::ZeroActivity));
        assert_eq!(assessment.recommendation, Recommendation::Reject);
    }

    #[test]
    fn short_silent_presence_is_rejected_on_score_alone() {
        let timeline = session(5, vec![]);
        let assessment = score_timeline(&timeline, &EngagementPolicy::default());
        assert!(!assessment.has_flag(EngagementFlag::ZeroActivity));
        assert_eq!(assessment.score, 20.0);
        assert_eq!(assessment.level, EngagementLevel::Minimal);
        assert_eq!(assessment.recommendation, Recommendation::Reject);
    }

    #[test]
    fn elevated_rate_halves_consistency() {
        let extra = (0..12)
            .map(|idx| (ActivityKind::HeartbeatActive, 1 + idx * 5))
            .collect();
        let timeline = session(1, extra);
        let assessment = score_timeline(&timeline, &EngagementPolicy::default());
        assert_eq!(assessment.sub_scores.consistency, 50.0);
        assert!(assessment.has_flag(EngagementFlag::ElevatedEventRate));
    }
}
