//! Public record lookup with integrity verification.
//!
//! Lookups are read-only. Every returned record carries a fresh integrity
//! report computed from the stored canonical fields and its stored
//! predecessor.

use attest_core::{
    verify_record, IntegrityReason, IntegrityReport, RecordVerifierKey, VerificationRecord,
};
use attest_protocol::RecordLookup;
use serde::Serialize;

use crate::db::{Db, RecordRow};

#[derive(Debug, Clone, Serialize)]
pub struct PublicRecordView {
    pub record_id: String,
    pub card_number: String,
    /// `None` when the stored canonical fields no longer parse.
    pub record: Option<VerificationRecord>,
    pub integrity: IntegrityReport,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub record_id: String,
    pub card_number: String,
    pub valid: bool,
    pub reasons: Vec<IntegrityReason>,
}

impl From<&PublicRecordView> for VerifyOutcome {
    fn from(view: &PublicRecordView) -> Self {
        Self {
            record_id: view.record_id.clone(),
            card_number: view.card_number.clone(),
            valid: view.integrity.valid,
            reasons: view.integrity.reasons.clone(),
        }
    }
}

pub fn lookup(
    db: &Db,
    key: &RecordVerifierKey,
    query: &RecordLookup,
) -> Result<Option<PublicRecordView>, String> {
    let row = match (&query.record_id, &query.card_number) {
        (Some(record_id), _) => db.get_record_by_id(record_id)?,
        (None, Some(card_number)) => db.get_record_by_card(card_number)?,
        (None, None) => None,
    };
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(inspect(db, key, row)?))
}

pub fn verify(
    db: &Db,
    key: &RecordVerifierKey,
    query: &RecordLookup,
) -> Result<Option<VerifyOutcome>, String> {
    Ok(lookup(db, key, query)?.map(|view| VerifyOutcome::from(&view)))
}

fn inspect(db: &Db, key: &RecordVerifierKey, row: RecordRow) -> Result<PublicRecordView, String> {
    let record_id = row.record_id.clone();
    let card_number = row.card_number.clone();
    let chain_scope = row.chain_scope.clone();
    let sequence = row.sequence;

    let record = match row.into_record() {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(record_id = %record_id, error = %err, "Stored record is unreadable");
            return Ok(PublicRecordView {
                record_id,
                card_number,
                record: None,
                integrity: IntegrityReport::unreadable(err),
            });
        }
    };

    // Predecessor position comes from the stored row, not the canonical fields.
    let predecessor = if sequence > 1 {
        db.get_record_by_chain(&chain_scope, (sequence - 1) as u64)?
            .and_then(|row| row.into_record().ok())
    } else {
        None
    };

    let integrity = verify_record(&record, predecessor.as_ref(), key);
    if !integrity.valid {
        tracing::warn!(
            record_id = %record_id,
            reasons = ?integrity.reasons,
            "Record failed integrity verification"
        );
    }
    Ok(PublicRecordView {
        record_id,
        card_number,
        record: Some(record),
        integrity,
    })
}
