//! # attest-core
//!
//! Domain logic for attendance attestation: turning raw, possibly
//! out-of-order attendance events into signed, hash-chained compliance
//! records.
//!
//! ## Design Principles
//!
//! - **Synchronous and pure**: No I/O and no async runtime. The daemon owns
//!   persistence, scheduling and keys; everything here is a function of its
//!   inputs.
//! - **Order independent**: Timelines depend on the event set, never on
//!   arrival order.
//! - **Deterministic bytes**: Canonical records serialize identically on
//!   every run, so hashes and signatures can be recomputed by anyone.
//! - **Audited outcomes**: A failed validation is a successful, signed
//!   result; only system faults are errors.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use attest_core::{assess_session, PolicyConfig};
//!
//! let policy = PolicyConfig::default();
//! let assessment = assess_session(&session, &policy);
//! if assessment.fraud.auto_reject {
//!     // mark the session rejected; no record is issued
//! }
//! ```

pub mod assessment;
pub mod config;
pub mod engagement;
pub mod error;
pub mod fraud;
pub mod integrity;
pub mod reconcile;
pub mod record;
pub mod timeline;
pub mod types;
pub mod validation;
pub mod webhook;

pub use assessment::*;
pub use config::*;
pub use engagement::{EngagementAssessment, EngagementFlag, EngagementLevel};
pub use error::{AttestError, GenerationError, IngestionError, Result};
pub use fraud::{FraudAssessment, Violation, ViolationAction, ViolationKind};
pub use integrity::{verify_record, IntegrityReason, IntegrityReport};
pub use record::{
    build_record, ChainScope, ChainTip, RecordInput, RecordSigner, RecordVerifierKey,
    VerificationRecord, GENESIS_HASH,
};
pub use timeline::{reconstruct, PresenceInterval, Timeline};
pub use types::*;
pub use validation::{ValidationReport, ValidationStatus};
