//! Verification record generation.
//!
//! Builds, signs and persists the record for one claimed session. Appends to
//! a chain scope are serialized in-process by a per-scope lock; the store
//! re-checks the tip inside its transaction, so a second process writing the
//! same database is refused as a chain conflict instead of forking the chain.

use attest_core::{
    build_record, check_eligibility, AttendanceSession, ChainScope, GenerationError, RecordInput,
    RecordSigner, SessionAssessment, VerificationRecord,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::db::{Db, SessionOutcome};

pub struct RecordGenerator {
    signer: RecordSigner,
    chain_scope: ChainScope,
    scope_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RecordGenerator {
    pub fn new(signer: RecordSigner, chain_scope: ChainScope) -> Self {
        Self {
            signer,
            chain_scope,
            scope_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn signer(&self) -> &RecordSigner {
        &self.signer
    }

    pub fn chain_scope(&self) -> ChainScope {
        self.chain_scope
    }

    pub fn scope_key(&self, session: &AttendanceSession) -> String {
        self.chain_scope.key_for(session)
    }

    /// Issue the single record for `session`.
    ///
    /// `session` must carry the reconstructed metrics and validity; `token`
    /// is the caller's finalization claim.
    pub fn generate(
        &self,
        db: &Db,
        session: &AttendanceSession,
        assessment: &SessionAssessment,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<VerificationRecord, GenerationError> {
        check_eligibility(session)?;
        if let Some(existing) = db.get_record_by_session(&session.session_id)? {
            return Err(GenerationError::AlreadyExists {
                session_id: session.session_id.clone(),
                record_id: existing.record_id,
            });
        }

        let scope = self.scope_key(session);
        let lock = self.scope_lock(&scope)?;
        let _guard = lock
            .lock()
            .map_err(|_| GenerationError::Storage("chain scope lock poisoned".to_string()))?;

        let tip = db.chain_tip(&scope)?;
        let input = RecordInput {
            record_id: ulid::Ulid::new().to_string(),
            created_at: now,
            chain_scope: scope.clone(),
            session,
            timeline: &assessment.timeline,
            engagement: &assessment.engagement,
            fraud: &assessment.fraud,
            validation: &assessment.validation,
        };
        let record = build_record(&input, tip.as_ref(), &self.signer)?;
        db.finalize_with_record(
            &record,
            tip.as_ref(),
            token,
            &SessionOutcome::from_session(session),
            now,
        )?;

        tracing::info!(
            session_id = %session.session_id,
            record_id = %record.record_id(),
            card_number = %record.card_number,
            chain_scope = %scope,
            sequence = record.sequence(),
            status = record.validation_status().as_str(),
            "Issued verification record"
        );
        Ok(record)
    }

    fn scope_lock(&self, scope: &str) -> Result<Arc<Mutex<()>>, GenerationError> {
        let mut locks = self
            .scope_locks
            .lock()
            .map_err(|_| GenerationError::Storage("scope lock table poisoned".to_string()))?;
        Ok(locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}
