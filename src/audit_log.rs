//! Bounded audit trail of master key requests, readable via a diagnostic
//! accessor. Recorded for operational visibility only — never returned to
//! a SAE over the wire.

use crate::model::KeyRequestRecord;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Oldest entries are dropped once this many records have accumulated.
const CAPACITY: usize = 256;

pub struct RequestAuditLog {
    records: Mutex<VecDeque<KeyRequestRecord>>,
}

impl Default for RequestAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestAuditLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        }
    }

    pub fn record(&self, record: KeyRequestRecord) {
        let mut records = self.records.lock().expect("audit log mutex poisoned");
        if records.len() == CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Diagnostic accessor: most recent requests first.
    pub fn recent(&self) -> Vec<KeyRequestRecord> {
        let records = self.records.lock().expect("audit log mutex poisoned");
        records.iter().rev().cloned().collect()
    }
}
