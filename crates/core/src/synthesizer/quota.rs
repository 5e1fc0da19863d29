// crates/core/src/synthesizer/quota.rs

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::SynthesisAttempt;

#[derive(Debug, Default)]
struct Ledger {
    used: u32,
    failures: Vec<SynthesisAttempt>,
}

/// Per-key synthesis budget. Lives as long as the process; nothing is
/// persisted, so a restart starts every key from zero.
#[derive(Debug)]
pub struct SynthesisQuota {
    max_attempts: u32,
    ledgers: Mutex<HashMap<String, Ledger>>,
}

impl SynthesisQuota {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn remaining(&self, key: &str) -> u32 {
        let ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        let used = ledgers.get(key).map(|l| l.used).unwrap_or(0);
        self.max_attempts.saturating_sub(used)
    }

    /// Take one unit for `key`, returning the 1-based attempt number.
    pub fn try_acquire(&self, key: &str) -> Option<u32> {
        let mut ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        let ledger = ledgers.entry(key.to_string()).or_default();
        if ledger.used >= self.max_attempts {
            return None;
        }
        ledger.used += 1;
        Some(ledger.used)
    }

    pub fn record_failure(&self, key: &str, attempt: SynthesisAttempt) {
        self.ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .failures
            .push(attempt);
    }

    /// Failed attempts recorded for `key`, oldest first.
    pub fn history(&self, key: &str) -> Vec<SynthesisAttempt> {
        self.ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|l| l.failures.clone())
            .unwrap_or_default()
    }
}
