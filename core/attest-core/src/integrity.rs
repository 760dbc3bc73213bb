//! Independent integrity verification of published records.
//!
//! Verification only reads published canonical fields and never mutates
//! anything. Every mismatch is itemized; a record can be tampered and
//! chain-broken at the same time.

use serde::{Deserialize, Serialize};

use crate::record::{
    canonical_bytes, card_number, content_hash, link_hash, RecordVerifierKey, VerificationRecord,
    GENESIS_HASH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityReason {
    TamperedContent,
    InvalidSignature,
    ChainBroken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub reasons: Vec<IntegrityReason>,
    /// Human-readable detail per failed check.
    pub findings: Vec<String>,
}

impl IntegrityReport {
    fn from_findings(mut found: Vec<(IntegrityReason, String)>) -> Self {
        found.sort_by(|a, b| a.0.cmp(&b.0));
        let mut reasons: Vec<IntegrityReason> = found.iter().map(|(reason, _)| *reason).collect();
        reasons.dedup();
        Self {
            valid: reasons.is_empty(),
            reasons,
            findings: found.into_iter().map(|(_, detail)| detail).collect(),
        }
    }

    /// Report for a record whose stored fields no longer parse.
    pub fn unreadable(detail: impl Into<String>) -> Self {
        Self::from_findings(vec![(IntegrityReason::TamperedContent, detail.into())])
    }

    pub fn has_reason(&self, reason: IntegrityReason) -> bool {
        self.reasons.contains(&reason)
    }
}

/// Recompute the hash a record actually deserves from its canonical fields.
pub fn recompute_record_hash(record: &VerificationRecord) -> Option<String> {
    let bytes = canonical_bytes(&record.fields).ok()?;
    Some(link_hash(&record.previous_record_hash, &content_hash(&bytes)))
}

/// Verify one record against its predecessor in the same chain scope.
///
/// `predecessor` must be the record with `sequence - 1`, or `None` when no
/// such record is stored.
pub fn verify_record(
    record: &VerificationRecord,
    predecessor: Option<&VerificationRecord>,
    key: &RecordVerifierKey,
) -> IntegrityReport {
    let mut found = Vec::new();

    match canonical_bytes(&record.fields) {
        Ok(bytes) => {
            let recomputed = content_hash(&bytes);
            if recomputed != record.content_hash {
                found.push((
                    IntegrityReason::TamperedContent,
                    format!(
                        "content hash {} does not match canonical fields ({})",
                        record.content_hash, recomputed
                    ),
                ));
            }
        }
        Err(err) => found.push((IntegrityReason::TamperedContent, err.to_string())),
    }

    let expected_link = link_hash(&record.previous_record_hash, &record.content_hash);
    if expected_link != record.record_hash {
        found.push((
            IntegrityReason::TamperedContent,
            "record hash does not match its content and predecessor hashes".to_string(),
        ));
    }

    if let Some(year) = record.fields.created_at.get(..4).and_then(|y| y.parse::<i32>().ok()) {
        if card_number(&record.content_hash, year) != record.card_number {
            found.push((
                IntegrityReason::TamperedContent,
                format!("card number {} does not derive from the content hash", record.card_number),
            ));
        }
    }

    if record.key_id != key.key_id() {
        found.push((
            IntegrityReason::InvalidSignature,
            format!("record signed by unknown key {}", record.key_id),
        ));
    } else if !key.verify(
        &record.content_hash,
        &record.previous_record_hash,
        &record.signature,
    ) {
        found.push((
            IntegrityReason::InvalidSignature,
            "signature does not verify".to_string(),
        ));
    }

    check_chain(record, predecessor, &mut found);
    IntegrityReport::from_findings(found)
}

fn check_chain(
    record: &VerificationRecord,
    predecessor: Option<&VerificationRecord>,
    found: &mut Vec<(IntegrityReason, String)>,
) {
    if record.sequence() <= 1 {
        if record.previous_record_hash != GENESIS_HASH {
            found.push((
                IntegrityReason::ChainBroken,
                "first record of a chain must link to the genesis hash".to_string(),
            ));
        }
        return;
    }

    let Some(predecessor) = predecessor else {
        found.push((
            IntegrityReason::ChainBroken,
            format!("predecessor at sequence {} is missing", record.sequence() - 1),
        ));
        return;
    };

    if predecessor.chain_scope() != record.chain_scope()
        || predecessor.sequence() + 1 != record.sequence()
    {
        found.push((
            IntegrityReason::ChainBroken,
            "predecessor is not the previous record of this chain".to_string(),
        ));
        return;
    }

    match recompute_record_hash(predecessor) {
        Some(actual) if actual == record.previous_record_hash => {}
        Some(_) => found.push((
            IntegrityReason::ChainBroken,
            format!(
                "previous record hash does not match record {}",
                predecessor.record_id()
            ),
        )),
        None => found.push((
            IntegrityReason::ChainBroken,
            format!("predecessor {} cannot be canonicalized", predecessor.record_id()),
        )),
    }
}
