//! End-to-end scenarios over the pure library: events in, signed records out.

use attest_core::engagement::EngagementFlag;
use attest_core::fraud::ViolationKind;
use attest_core::record::{canonical_bytes, content_hash, Fixed2};
use attest_core::validation::ValidationRule;
use attest_core::{
    assess_session, build_record, check_eligibility, verify_record, ActivityEvent, ActivityKind,
    AttendanceSession, ChainScope, ChainTip, EventPayload, EventSource, GenerationError,
    IntegrityReason, PolicyConfig, Recommendation, RecordInput, RecordSigner, SessionAssessment,
    SessionMetadata, SessionStatus, ValidationStatus, VerificationRecord, GENESIS_HASH,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("start")
}

fn at_ms(id: impl Into<String>, kind: ActivityKind, offset_ms: i64) -> ActivityEvent {
    ActivityEvent {
        event_id: id.into(),
        kind,
        occurred_at: start() + Duration::milliseconds(offset_ms),
        source: if kind.is_heartbeat() {
            EventSource::ClientHeartbeat
        } else {
            EventSource::Webhook
        },
        sequence: 0,
        payload: EventPayload::default(),
    }
}

fn at_min(id: impl Into<String>, kind: ActivityKind, minute: i64) -> ActivityEvent {
    at_ms(id, kind, minute * 60_000)
}

/// Join, camera and audio on, an active heartbeat every minute, leave.
fn engaged_events(join_min: i64, leave_min: i64) -> Vec<ActivityEvent> {
    let mut events = vec![
        at_min("join", ActivityKind::Join, join_min),
        at_min("video", ActivityKind::VideoOn, join_min),
        at_min("audio", ActivityKind::AudioOn, join_min),
        at_min("leave", ActivityKind::Leave, leave_min),
    ];
    for minute in (join_min + 1)..leave_min {
        events.push(at_min(
            format!("hb-{}", minute),
            ActivityKind::HeartbeatActive,
            minute,
        ));
    }
    events
}

fn session(id: &str, scheduled_min: u32, events: Vec<ActivityEvent>) -> AttendanceSession {
    AttendanceSession {
        session_id: id.to_string(),
        participant_id: "participant-7".to_string(),
        meeting_id: "meeting-42".to_string(),
        scheduled_start: start(),
        scheduled_duration_min: scheduled_min,
        join_time: None,
        leave_time: None,
        status: SessionStatus::Completed,
        events: events
            .into_iter()
            .enumerate()
            .map(|(idx, mut event)| {
                event.sequence = idx as i64 + 1;
                event
            })
            .collect(),
        metrics: None,
        is_valid: None,
        metadata: SessionMetadata::default(),
        record_id: None,
    }
}

fn record_for(
    session: &AttendanceSession,
    assessment: &SessionAssessment,
    tip: Option<&ChainTip>,
    signer: &RecordSigner,
    record_id: &str,
) -> VerificationRecord {
    let input = RecordInput {
        record_id: record_id.to_string(),
        created_at: start() + Duration::hours(2),
        chain_scope: ChainScope::Participant.key_for(session),
        session,
        timeline: &assessment.timeline,
        engagement: &assessment.engagement,
        fraud: &assessment.fraud,
        validation: &assessment.validation,
    };
    build_record(&input, tip, signer).expect("build record")
}

fn tip_of(record: &VerificationRecord) -> ChainTip {
    ChainTip {
        sequence: record.sequence(),
        record_hash: record.record_hash.clone(),
    }
}

#[test]
fn scenario_a_full_engaged_attendance_is_approved_and_passes() {
    let session = session("ses-a", 60, engaged_events(0, 60));
    let assessment = assess_session(&session, &PolicyConfig::default());

    assert_eq!(assessment.timeline.metrics.total_duration_min, 60.0);
    assert_eq!(assessment.timeline.metrics.attendance_percent, 100.0);
    assert_eq!(assessment.engagement.score, 100.0);
    assert_eq!(assessment.engagement.recommendation, Recommendation::Approve);
    assert_eq!(assessment.fraud.recommendation, Recommendation::Approve);
    assert!(!assessment.fraud.auto_reject);
    assert_eq!(assessment.validation.status, ValidationStatus::Passed);

    let signer = RecordSigner::from_seed([11u8; 32]);
    let record = record_for(&session, &assessment, None, &signer, "rec-a");
    assert_eq!(record.previous_record_hash, GENESIS_HASH);
    assert_eq!(record.validation_status(), ValidationStatus::Passed);
    assert_eq!(record.fields.metrics.total_duration_min, Fixed2::from_f64(60.0));
    assert!(verify_record(&record, None, &signer.verifier()).valid);
}

#[test]
fn scenario_b_late_and_early_fails_validation_but_is_still_signed() {
    let session = session("ses-b", 60, engaged_events(7, 50));
    let assessment = assess_session(&session, &PolicyConfig::default());

    assert_eq!(assessment.validation.status, ValidationStatus::Failed);
    assert!(assessment
        .validation
        .failed_rules()
        .contains(&ValidationRule::Punctuality));
    assert!(!assessment.fraud.auto_reject);

    let signer = RecordSigner::from_seed([12u8; 32]);
    let record = record_for(&session, &assessment, None, &signer, "rec-b");
    assert_eq!(record.validation_status(), ValidationStatus::Failed);
    let report = verify_record(&record, None, &signer.verifier());
    assert!(report.valid, "{:?}", report.findings);
}

#[test]
fn scenario_c_leave_and_rejoin() {
    let events = vec![
        at_min("join", ActivityKind::Join, 0),
        at_min("leave-1", ActivityKind::Leave, 15),
        at_min("rejoin", ActivityKind::Rejoin, 20),
        at_min("leave-2", ActivityKind::Leave, 60),
    ];
    let session = session("ses-c", 60, events);
    let assessment = assess_session(&session, &PolicyConfig::default());
    let metrics = &assessment.timeline.metrics;

    assert_eq!(assessment.timeline.intervals.len(), 2);
    assert_eq!(metrics.total_duration_min, 55.0);
    assert_eq!(metrics.leave_rejoin_count, 1);
    assert!((metrics.attendance_percent - 91.666_666).abs() < 0.001);
    assert_eq!(Fixed2::from_f64(metrics.attendance_percent).to_string(), "91.67");
}

#[test]
fn scenario_d_no_engagement_signals_auto_rejects() {
    let events = vec![
        at_min("join", ActivityKind::Join, 0),
        at_min("leave", ActivityKind::Leave, 60),
    ];
    let session = session("ses-d", 60, events);
    let assessment = assess_session(&session, &PolicyConfig::default());

    assert_eq!(assessment.timeline.metrics.total_duration_min, 60.0);
    assert!(assessment
        .fraud
        .has_violation(ViolationKind::NoEngagementSignals));
    assert_eq!(assessment.fraud.recommendation, Recommendation::Reject);
    assert!(assessment.fraud.auto_reject);
}

#[test]
fn scenario_e_dense_heartbeats_are_likely_automated() {
    let mut events = vec![
        at_min("join", ActivityKind::Join, 0),
        at_min("video", ActivityKind::VideoOn, 0),
        at_min("audio", ActivityKind::AudioOn, 0),
        at_min("leave", ActivityKind::Leave, 30),
    ];
    // 500 heartbeats spread evenly inside 30 minutes.
    for idx in 1..=500i64 {
        events.push(at_ms(
            format!("hb-{}", idx),
            ActivityKind::HeartbeatActive,
            idx * 3_600 - 1_800,
        ));
    }
    let session = session("ses-e", 30, events);
    let assessment = assess_session(&session, &PolicyConfig::default());

    assert!(assessment.engagement.event_rate_per_min > 15.0);
    assert_eq!(assessment.engagement.sub_scores.consistency, 0.0);
    assert!(assessment.engagement.has_flag(EngagementFlag::LikelyAutomated));
    assert_eq!(assessment.engagement.recommendation, Recommendation::Reject);
}

#[test]
fn reconstruction_is_independent_of_arrival_order() {
    let mut events = engaged_events(0, 15);
    events.push(at_min("rejoin", ActivityKind::Rejoin, 15));
    events.push(at_min("idle-1", ActivityKind::HeartbeatIdle, 17));
    events.push(at_min("idle-2", ActivityKind::HeartbeatIdle, 17));
    events.push(at_min("leave-2", ActivityKind::Leave, 45));
    for minute in 18..45 {
        events.push(at_min(
            format!("hb2-{}", minute),
            ActivityKind::HeartbeatActive,
            minute,
        ));
    }

    let policy = PolicyConfig::default();
    let baseline = assess_session(&session("ses-perm", 60, events.clone()), &policy);

    let mut permutations = vec![events.iter().rev().cloned().collect::<Vec<_>>()];
    let mut rotated = events.clone();
    rotated.rotate_left(7);
    permutations.push(rotated);
    // Deterministic pseudo-random shuffles.
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    for _ in 0..5 {
        let mut shuffled = events.clone();
        for idx in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled.swap(idx, (state % (idx as u64 + 1)) as usize);
        }
        permutations.push(shuffled);
    }

    for permutation in permutations {
        let assessment = assess_session(&session("ses-perm", 60, permutation), &policy);
        assert_eq!(assessment.timeline.metrics, baseline.timeline.metrics);
        assert_eq!(assessment.timeline.intervals, baseline.timeline.intervals);
        assert_eq!(assessment.engagement, baseline.engagement);
    }
}

#[test]
fn attendance_boundary_eighty_passes_and_seventy_nine_ninety_nine_fails() {
    let policy = PolicyConfig::default();
    let exact = session("ses-80", 100, engaged_events(0, 80));
    let exact_report = assess_session(&exact, &policy);
    assert!(!exact_report
        .validation
        .failed_rules()
        .contains(&ValidationRule::AttendanceRatio));
    assert!(!exact_report
        .fraud
        .has_violation(ViolationKind::AttendanceBelowThreshold));

    let mut short_events = engaged_events(0, 80);
    for event in short_events.iter_mut().filter(|e| e.event_id == "leave") {
        event.occurred_at = start() + Duration::milliseconds(4_799_400);
    }
    let short = session("ses-7999", 100, short_events);
    let short_report = assess_session(&short, &policy);
    assert!(short_report
        .validation
        .failed_rules()
        .contains(&ValidationRule::AttendanceRatio));
    assert!(short_report
        .fraud
        .has_violation(ViolationKind::AttendanceBelowThreshold));
}

#[test]
fn chain_links_and_detects_predecessor_tampering() {
    let policy = PolicyConfig::default();
    let signer = RecordSigner::from_seed([21u8; 32]);
    let key = signer.verifier();

    let mut records: Vec<VerificationRecord> = Vec::new();
    for idx in 0..3 {
        let session = session(&format!("ses-chain-{}", idx), 60, engaged_events(0, 60));
        let assessment = assess_session(&session, &policy);
        let tip = records.last().map(tip_of);
        records.push(record_for(
            &session,
            &assessment,
            tip.as_ref(),
            &signer,
            &format!("rec-{}", idx),
        ));
    }

    for (idx, record) in records.iter().enumerate() {
        let bytes = canonical_bytes(&record.fields).expect("canonical bytes");
        assert_eq!(content_hash(&bytes), record.content_hash);
        let predecessor = idx.checked_sub(1).map(|prev| &records[prev]);
        assert!(verify_record(record, predecessor, &key).valid);
        if let Some(prev) = predecessor {
            assert_eq!(record.previous_record_hash, prev.record_hash);
        }
    }

    let mut tampered = records[0].clone();
    tampered.fields.metrics.total_duration_min = Fixed2::from_f64(59.0);
    let own = verify_record(&tampered, None, &key);
    assert!(own.has_reason(IntegrityReason::TamperedContent));
    let next = verify_record(&records[1], Some(&tampered), &key);
    assert!(!next.valid);
    assert_eq!(next.reasons, vec![IntegrityReason::ChainBroken]);

    let missing = verify_record(&records[2], None, &key);
    assert!(missing.has_reason(IntegrityReason::ChainBroken));
}

#[test]
fn forged_signature_and_foreign_key_are_reported() {
    let policy = PolicyConfig::default();
    let signer = RecordSigner::from_seed([31u8; 32]);
    let session = session("ses-sig", 60, engaged_events(0, 60));
    let assessment = assess_session(&session, &policy);
    let record = record_for(&session, &assessment, None, &signer, "rec-sig");

    let mut forged = record.clone();
    forged.signature = RecordSigner::from_seed([32u8; 32]).sign(&record.content_hash, GENESIS_HASH);
    let report = verify_record(&forged, None, &signer.verifier());
    assert_eq!(report.reasons, vec![IntegrityReason::InvalidSignature]);

    let other_key = RecordSigner::from_seed([33u8; 32]).verifier();
    assert!(verify_record(&record, None, &other_key).has_reason(IntegrityReason::InvalidSignature));
}

#[test]
fn finalized_session_cannot_generate_again() {
    let mut session = session("ses-once", 60, engaged_events(0, 60));
    assert!(check_eligibility(&session).is_ok());

    session.status = SessionStatus::Finalized;
    session.record_id = Some("rec-once".to_string());
    let err = check_eligibility(&session).expect_err("second generation");
    assert!(err.is_already_exists());

    let mut rejected = self::session("ses-rejected", 60, Vec::new());
    rejected.metadata.rejection_reason = Some("risk score 85".to_string());
    assert!(matches!(
        check_eligibility(&rejected),
        Err(GenerationError::NotEligible { .. })
    ));
}
