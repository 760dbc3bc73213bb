//! Policy thresholds for scoring, fraud detection, and validation.
//!
//! Every field has a serde default so a partial `[policy]` table (or none at
//! all) yields the documented values. The daemon embeds [`PolicyConfig`] in
//! its TOML file; the library itself never touches the filesystem.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub engagement: EngagementPolicy,
    #[serde(default)]
    pub fraud: FraudPolicy,
    #[serde(default)]
    pub validation: ValidationPolicy,
    #[serde(default)]
    pub timeline: TimelinePolicy,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engagement
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementPolicy {
    #[serde(default = "default_visual_weight")]
    pub visual_weight: f64,
    #[serde(default = "default_activity_weight")]
    pub activity_weight: f64,
    #[serde(default = "default_consistency_weight")]
    pub consistency_weight: f64,
    #[serde(default = "default_camera_points")]
    pub camera_points: f64,
    #[serde(default = "default_audio_points")]
    pub audio_points: f64,
    /// Events per minute above which consistency drops to half.
    #[serde(default = "default_elevated_rate_per_min")]
    pub elevated_rate_per_min: f64,
    /// Events per minute above which the stream is treated as automated.
    #[serde(default = "default_automated_rate_per_min")]
    pub automated_rate_per_min: f64,
    #[serde(default = "default_zero_activity_min")]
    pub zero_activity_min: f64,
    #[serde(default = "default_approve_score")]
    pub approve_score: f64,
    #[serde(default = "default_review_score")]
    pub review_score: f64,
    #[serde(default = "default_low_score")]
    pub low_score: f64,
}

impl Default for EngagementPolicy {
    fn default() -> Self {
        Self {
            visual_weight: default_visual_weight(),
            activity_weight: default_activity_weight(),
            consistency_weight: default_consistency_weight(),
            camera_points: default_camera_points(),
            audio_points: default_audio_points(),
            elevated_rate_per_min: default_elevated_rate_per_min(),
            automated_rate_per_min: default_automated_rate_per_min(),
            zero_activity_min: default_zero_activity_min(),
            approve_score: default_approve_score(),
            review_score: default_review_score(),
            low_score: default_low_score(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fraud
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudPolicy {
    /// Minutes a session may exceed its schedule before it is impossible.
    #[serde(default = "default_duration_tolerance_min")]
    pub duration_tolerance_min: f64,
    #[serde(default = "default_no_engagement_min")]
    pub no_engagement_min: f64,
    #[serde(default = "default_attendance_threshold_percent")]
    pub attendance_threshold_percent: f64,
    /// Allowed disagreement between reconstructed and provider-reported minutes.
    #[serde(default = "default_mismatch_tolerance_min")]
    pub mismatch_tolerance_min: f64,
    #[serde(default = "default_review_risk")]
    pub review_risk: u32,
    #[serde(default = "default_auto_reject_risk")]
    pub auto_reject_risk: u32,
    #[serde(default = "default_reject_penalty")]
    pub engagement_reject_penalty: u32,
    #[serde(default = "default_flag_penalty")]
    pub engagement_flag_penalty: u32,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            duration_tolerance_min: default_duration_tolerance_min(),
            no_engagement_min: default_no_engagement_min(),
            attendance_threshold_percent: default_attendance_threshold_percent(),
            mismatch_tolerance_min: default_mismatch_tolerance_min(),
            review_risk: default_review_risk(),
            auto_reject_risk: default_auto_reject_risk(),
            engagement_reject_penalty: default_reject_penalty(),
            engagement_flag_penalty: default_flag_penalty(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validation Gate
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    /// Late join plus early leave, in minutes.
    #[serde(default = "default_punctuality_grace_min")]
    pub punctuality_grace_min: f64,
    #[serde(default = "default_min_active_ratio")]
    pub min_active_ratio: f64,
    #[serde(default = "default_min_attended_min")]
    pub min_attended_min: f64,
    #[serde(default = "default_min_attendance_percent")]
    pub min_attendance_percent: f64,
    #[serde(default = "default_max_idle_ratio")]
    pub max_idle_ratio: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            punctuality_grace_min: default_punctuality_grace_min(),
            min_active_ratio: default_min_active_ratio(),
            min_attended_min: default_min_attended_min(),
            min_attendance_percent: default_min_attendance_percent(),
            max_idle_ratio: default_max_idle_ratio(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Timeline
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelinePolicy {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Longest span a single heartbeat may credit.
    #[serde(default = "default_max_heartbeat_gap_secs")]
    pub max_heartbeat_gap_secs: u64,
    /// Presence credited to an auto-closed interval that saw no heartbeat.
    ///
    /// This is a product decision pending review; keep it small.
    #[serde(default = "default_no_activity_fallback_min")]
    pub no_activity_fallback_min: f64,
}

impl Default for TimelinePolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_heartbeat_gap_secs: default_max_heartbeat_gap_secs(),
            no_activity_fallback_min: default_no_activity_fallback_min(),
        }
    }
}

fn default_visual_weight() -> f64 {
    0.5
}

fn default_activity_weight() -> f64 {
    0.3
}

fn default_consistency_weight() -> f64 {
    0.2
}

fn default_camera_points() -> f64 {
    70.0
}

fn default_audio_points() -> f64 {
    30.0
}

fn default_elevated_rate_per_min() -> f64 {
    10.0
}

fn default_automated_rate_per_min() -> f64 {
    15.0
}

fn default_zero_activity_min() -> f64 {
    10.0
}

fn default_approve_score() -> f64 {
    80.0
}

fn default_review_score() -> f64 {
    50.0
}

fn default_low_score() -> f64 {
    30.0
}

fn default_duration_tolerance_min() -> f64 {
    15.0
}

fn default_no_engagement_min() -> f64 {
    10.0
}

fn default_attendance_threshold_percent() -> f64 {
    80.0
}

fn default_mismatch_tolerance_min() -> f64 {
    5.0
}

fn default_review_risk() -> u32 {
    50
}

fn default_auto_reject_risk() -> u32 {
    80
}

fn default_reject_penalty() -> u32 {
    25
}

fn default_flag_penalty() -> u32 {
    15
}

fn default_punctuality_grace_min() -> f64 {
    10.0
}

fn default_min_active_ratio() -> f64 {
    0.8
}

fn default_min_attended_min() -> f64 {
    5.0
}

fn default_min_attendance_percent() -> f64 {
    80.0
}

fn default_max_idle_ratio() -> f64 {
    0.2
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_max_heartbeat_gap_secs() -> u64 {
    180
}

fn default_no_activity_fallback_min() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_remaining_defaults() {
        let policy: PolicyConfig = serde_json::from_str(
            r#"{ "fraud": { "duration_tolerance_min": 20.0 }, "timeline": { "no_activity_fallback_min": 2.5 } }"#,
        )
        .expect("policy");
        assert_eq!(policy.fraud.duration_tolerance_min, 20.0);
        assert_eq!(policy.fraud.auto_reject_risk, 80);
        assert_eq!(policy.timeline.no_activity_fallback_min, 2.5);
        assert_eq!(policy.timeline.heartbeat_interval_secs, 60);
        assert_eq!(policy.engagement, EngagementPolicy::default());
    }
}
