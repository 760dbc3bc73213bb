//! Canonical verification records: snapshot, hash, chain link, signature.
//!
//! A record's canonical fields serialize to a byte sequence that is a pure
//! function of their values: declaration-ordered structs, sequences instead
//! of maps, and fixed-point decimal strings instead of floats. The content
//! hash covers those bytes; the record hash links the content hash to its
//! predecessor; the signature covers both hashes.

use chrono::{DateTime, Datelike, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::engagement::{EngagementAssessment, EngagementFlag, EngagementLevel};
use crate::error::{AttestError, Result};
use crate::fraud::{FraudAssessment, ViolationKind};
use crate::timeline::Timeline;
use crate::types::{
    format_timestamp, AttendanceSession, DataQualityFlag, Recommendation, Severity,
};
use crate::validation::{CheckOutcome, ValidationReport, ValidationRule, ValidationStatus};

pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Previous-record hash of the first record in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const CONTENT_DOMAIN: &[u8] = b"attest-record-content-v1";
const LINK_DOMAIN: &[u8] = b"attest-record-link-v1";
const SIGNATURE_DOMAIN: &[u8] = b"attest-record-signature-v1";

const CARD_PREFIX: &str = "ATT";
const CARD_HASH_CHARS: usize = 10;

// ═══════════════════════════════════════════════════════════════════════════════
// Fixed-Point Numbers
// ═══════════════════════════════════════════════════════════════════════════════

/// A decimal with exactly two fractional digits, serialized as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed2(i64);

impl Fixed2 {
    pub fn from_f64(value: f64) -> Self {
        Fixed2((value * 100.0).round() as i64)
    }

    pub fn hundredths(&self) -> i64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || AttestError::InvalidFixedPoint(value.to_string());
        let (negative, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let (whole, frac) = digits.split_once('.').ok_or_else(invalid)?;
        if whole.is_empty()
            || frac.len() != 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
            || (whole.len() > 1 && whole.starts_with('0'))
        {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let frac: i64 = frac.parse().map_err(|_| invalid())?;
        let magnitude = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(invalid)?;
        if negative && magnitude == 0 {
            return Err(invalid());
        }
        Ok(Fixed2(if negative { -magnitude } else { magnitude }))
    }
}

impl fmt::Display for Fixed2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, magnitude / 100, magnitude % 100)
    }
}

impl Serialize for Fixed2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fixed2 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Fixed2::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Chain Scope
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainScope {
    #[default]
    Participant,
    Meeting,
    Global,
}

impl ChainScope {
    /// Ledger key that groups records into one chain.
    pub fn key_for(&self, session: &AttendanceSession) -> String {
        match self {
            ChainScope::Participant => format!("participant:{}", session.participant_id),
            ChainScope::Meeting => format!("meeting:{}", session.meeting_id),
            ChainScope::Global => "global".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Canonical Fields
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanonicalMetrics {
    pub total_duration_min: Fixed2,
    pub active_duration_min: Fixed2,
    pub idle_duration_min: Fixed2,
    pub away_duration_min: Fixed2,
    pub attendance_percent: Fixed2,
    pub leave_rejoin_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngagementSummary {
    pub score: Fixed2,
    pub level: EngagementLevel,
    pub recommendation: Recommendation,
    pub flags: Vec<EngagementFlag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViolationSummary {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FraudSummary {
    pub risk_score: u32,
    pub recommendation: Recommendation,
    pub violations: Vec<ViolationSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSummary {
    pub rule: ValidationRule,
    pub severity: Severity,
    pub outcome: CheckOutcome,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationSummary {
    pub status: ValidationStatus,
    pub checks: Vec<CheckSummary>,
}

/// The published, hashed snapshot of one finalized session.
///
/// Field order here is the serialization order; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CanonicalRecord {
    pub schema_version: u32,
    pub record_id: String,
    pub subject_session_id: String,
    pub participant_id: String,
    pub meeting_id: String,
    pub chain_scope: String,
    pub sequence: u64,
    pub scheduled_start: String,
    pub scheduled_duration_min: u32,
    pub join_time: Option<String>,
    pub leave_time: Option<String>,
    pub metrics: CanonicalMetrics,
    pub engagement: EngagementSummary,
    pub fraud: FraudSummary,
    pub validation: ValidationSummary,
    pub data_quality: Vec<DataQualityFlag>,
    pub created_at: String,
}

pub fn canonical_bytes(fields: &CanonicalRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(fields).map_err(|source| AttestError::Json {
        context: format!("record {}", fields.record_id),
        source,
    })
}

pub fn content_hash(canonical: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CONTENT_DOMAIN);
    hasher.update(canonical);
    hex::encode(hasher.finalize())
}

/// Hash that the next record in the chain stores as its predecessor.
pub fn link_hash(previous_record_hash: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(LINK_DOMAIN);
    hasher.update(previous_record_hash.as_bytes());
    hasher.update(content_hash.as_bytes());
    hex::encode(hasher.finalize())
}

fn signature_message(content_hash: &str, previous_record_hash: &str) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(SIGNATURE_DOMAIN.len() + content_hash.len() + previous_record_hash.len());
    message.extend_from_slice(SIGNATURE_DOMAIN);
    message.extend_from_slice(content_hash.as_bytes());
    message.extend_from_slice(previous_record_hash.as_bytes());
    message
}

/// Human-readable public identifier, e.g. `ATT-2026-3FA9C01B7D`.
pub fn card_number(content_hash: &str, year: i32) -> String {
    let prefix: String = content_hash.chars().take(CARD_HASH_CHARS).collect();
    format!("{}-{}-{}", CARD_PREFIX, year, prefix.to_ascii_uppercase())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════════

fn key_id_for(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    hex::encode(&digest[..8])
}

pub struct RecordSigner {
    signing_key: SigningKey,
}

impl RecordSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|err| AttestError::KeyMalformed(format!("seed is not hex: {}", err)))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            AttestError::KeyMalformed(format!("seed must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn key_id(&self) -> String {
        key_id_for(&self.signing_key.verifying_key())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn verifier(&self) -> RecordVerifierKey {
        RecordVerifierKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    pub fn sign(&self, content_hash: &str, previous_record_hash: &str) -> String {
        let message = signature_message(content_hash, previous_record_hash);
        hex::encode(self.signing_key.sign(&message).to_bytes())
    }
}

impl fmt::Debug for RecordSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSigner")
            .field("key_id", &self.key_id())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RecordVerifierKey {
    verifying_key: VerifyingKey,
}

impl RecordVerifierKey {
    pub fn from_hex(public_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(public_key_hex.trim())
            .map_err(|err| AttestError::KeyMalformed(format!("public key is not hex: {}", err)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            AttestError::KeyMalformed(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| AttestError::KeyMalformed(err.to_string()))?;
        Ok(Self { verifying_key })
    }

    pub fn key_id(&self) -> String {
        key_id_for(&self.verifying_key)
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// False for malformed hex as well as for a wrong signature.
    pub fn verify(&self, content_hash: &str, previous_record_hash: &str, signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(bytes.as_slice()) else {
            return false;
        };
        let message = signature_message(content_hash, previous_record_hash);
        self.verifying_key.verify(&message, &signature).is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub card_number: String,
    pub fields: CanonicalRecord,
    pub content_hash: String,
    pub previous_record_hash: String,
    pub record_hash: String,
    pub signature: String,
    pub key_id: String,
}

impl VerificationRecord {
    pub fn record_id(&self) -> &str {
        &self.fields.record_id
    }

    pub fn subject_session_id(&self) -> &str {
        &self.fields.subject_session_id
    }

    pub fn chain_scope(&self) -> &str {
        &self.fields.chain_scope
    }

    pub fn sequence(&self) -> u64 {
        self.fields.sequence
    }

    pub fn validation_status(&self) -> ValidationStatus {
        self.fields.validation.status
    }
}

/// Latest record of a chain scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub sequence: u64,
    pub record_hash: String,
}

pub struct RecordInput<'a> {
    pub record_id: String,
    pub created_at: DateTime<Utc>,
    pub chain_scope: String,
    pub session: &'a AttendanceSession,
    pub timeline: &'a Timeline,
    pub engagement: &'a EngagementAssessment,
    pub fraud: &'a FraudAssessment,
    pub validation: &'a ValidationReport,
}

pub fn snapshot(input: &RecordInput<'_>, sequence: u64) -> CanonicalRecord {
    let metrics = &input.timeline.metrics;
    CanonicalRecord {
        schema_version: RECORD_SCHEMA_VERSION,
        record_id: input.record_id.clone(),
        subject_session_id: input.session.session_id.clone(),
        participant_id: input.session.participant_id.clone(),
        meeting_id: input.session.meeting_id.clone(),
        chain_scope: input.chain_scope.clone(),
        sequence,
        scheduled_start: format_timestamp(input.session.scheduled_start),
        scheduled_duration_min: input.session.scheduled_duration_min,
        join_time: input.timeline.first_join.map(format_timestamp),
        leave_time: input
            .timeline
            .intervals
            .last()
            .map(|interval| format_timestamp(interval.end)),
        metrics: CanonicalMetrics {
            total_duration_min: Fixed2::from_f64(metrics.total_duration_min),
            active_duration_min: Fixed2::from_f64(metrics.active_duration_min),
            idle_duration_min: Fixed2::from_f64(metrics.idle_duration_min),
            away_duration_min: Fixed2::from_f64(metrics.away_duration_min),
            attendance_percent: Fixed2::from_f64(metrics.attendance_percent),
            leave_rejoin_count: metrics.leave_rejoin_count,
        },
        engagement: EngagementSummary {
            score: Fixed2::from_f64(input.engagement.score),
            level: input.engagement.level,
            recommendation: input.engagement.recommendation,
            flags: input.engagement.flags.clone(),
        },
        fraud: FraudSummary {
            risk_score: input.fraud.risk_score,
            recommendation: input.fraud.recommendation,
            violations: input
                .fraud
                .violations
                .iter()
                .map(|violation| ViolationSummary {
                    kind: violation.kind,
                    severity: violation.severity,
                    message: violation.message.clone(),
                })
                .collect(),
        },
        validation: ValidationSummary {
            status: input.validation.status,
            checks: input
                .validation
                .checks
                .iter()
                .map(|check| CheckSummary {
                    rule: check.rule,
                    severity: check.severity,
                    outcome: check.outcome,
                    message: check.message.clone(),
                })
                .collect(),
        },
        data_quality: input.timeline.data_quality.clone(),
        created_at: format_timestamp(input.created_at),
    }
}

/// Build, hash, link and sign the next record of a chain.
pub fn build_record(
    input: &RecordInput<'_>,
    tip: Option<&ChainTip>,
    signer: &RecordSigner,
) -> Result<VerificationRecord> {
    let (sequence, previous_record_hash) = match tip {
        Some(tip) => (tip.sequence + 1, tip.record_hash.clone()),
        None => (1, GENESIS_HASH.to_string()),
    };
    let fields = snapshot(input, sequence);
    let content_hash = content_hash(&canonical_bytes(&fields)?);
    let record_hash = link_hash(&previous_record_hash, &content_hash);
    let signature = signer.sign(&content_hash, &previous_record_hash);

    Ok(VerificationRecord {
        card_number: card_number(&content_hash, input.created_at.year()),
        fields,
        content_hash,
        previous_record_hash,
        record_hash,
        signature,
        key_id: signer.key_id(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_point_formats_and_parses_strictly() {
        assert_eq!(Fixed2::from_f64(91.666_666).to_string(), "91.67");
        assert_eq!(Fixed2::from_f64(-0.5).to_string(), "-0.50");
        assert_eq!(Fixed2::from_f64(60.0).to_string(), "60.00");
        assert_eq!(Fixed2::parse("79.99").expect("parse").hundredths(), 7999);
        for bad in ["79.9", "079.99", "1e2", "", "-0.00", "12.345", "+1.00"] {
            assert!(Fixed2::parse(bad).is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn card_number_uses_uppercase_hash_prefix() {
        let hash = "3fa9c01b7d5e00000000000000000000";
        assert_eq!(card_number(hash, 2026), "ATT-2026-3FA9C01B7D");
    }

    #[test]
    fn signature_verifies_and_rejects_altered_inputs() {
        let signer = RecordSigner::from_seed([7u8; 32]);
        let verifier = signer.verifier();
        let content = content_hash(b"{}");
        let signature = signer.sign(&content, GENESIS_HASH);
        assert!(verifier.verify(&content, GENESIS_HASH, &signature));
        assert!(!verifier.verify(&content_hash(b"[]"), GENESIS_HASH, &signature));
        assert!(!verifier.verify(&content, &content, &signature));
        assert!(!verifier.verify(&content, GENESIS_HASH, "zz"));
    }

    #[test]
    fn signer_round_trips_through_hex() {
        let signer = RecordSigner::from_seed([3u8; 32]);
        let restored = RecordSigner::from_hex(&signer.seed_hex()).expect("restore");
        assert_eq!(signer.key_id(), restored.key_id());
        assert_eq!(signer.key_id().len(), 16);
        let verifier =
            RecordVerifierKey::from_hex(&signer.public_key_hex()).expect("verifier from hex");
        assert_eq!(verifier.key_id(), signer.key_id());
        assert!(RecordSigner::from_hex("abcd").is_err());
    }

    #[test]
    fn link_hash_depends_on_predecessor() {
        let content = content_hash(b"payload");
        assert_ne!(link_hash(GENESIS_HASH, &content), link_hash(&content, &content));
        assert_eq!(link_hash(GENESIS_HASH, &content).len(), 64);
    }
}
