//! Shared daemon state: store, configuration, signer and sweep bookkeeping.

use attest_core::RecordVerifierKey;
use chrono::Utc;
use std::sync::Mutex;

use crate::config::DaemonConfig;
use crate::db::Db;
use crate::generator::RecordGenerator;
use crate::scheduler::{run_sweep, SweepSummary};

pub struct SharedState {
    pub db: Db,
    pub config: DaemonConfig,
    pub generator: RecordGenerator,
    verifier: RecordVerifierKey,
    sweep_lock: Mutex<()>,
    last_sweep: Mutex<Option<SweepSummary>>,
}

impl SharedState {
    pub fn new(db: Db, config: DaemonConfig, generator: RecordGenerator) -> Self {
        let verifier = generator.signer().verifier();
        Self {
            db,
            config,
            generator,
            verifier,
            sweep_lock: Mutex::new(()),
            last_sweep: Mutex::new(None),
        }
    }

    pub fn verifier(&self) -> &RecordVerifierKey {
        &self.verifier
    }

    /// Run one sweep. Overlapping triggers wait for the running sweep.
    pub fn sweep(&self, trigger: &str) -> Result<SweepSummary, String> {
        let _guard = self
            .sweep_lock
            .lock()
            .map_err(|_| "sweep lock poisoned".to_string())?;
        let summary = run_sweep(&self.db, &self.generator, &self.config, trigger, Utc::now())?;
        if let Ok(mut last) = self.last_sweep.lock() {
            *last = Some(summary.clone());
        }
        Ok(summary)
    }

    pub fn last_sweep_snapshot(&self) -> Option<SweepSummary> {
        self.last_sweep.lock().ok().and_then(|last| last.clone())
    }
}
