//! Per-instance provisioning progress
//!
//! A single-slot, in-memory record per instance id serving the asynchronous
//! `last_operation` API. State survives only as long as the process; a broker
//! restart forgets every instance, which the `last_operation` handler reports
//! as `failed`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use tracing::info;

/// Latest known state of one instance's lifecycle
#[derive(Clone, Debug)]
pub struct ProgressRecord {
    /// When the state was recorded
    pub at: Instant,
    /// State name, e.g. `IN_PROGRESS_KUBERNETES_OK` or `FAILED`
    pub state: String,
    /// Error description accompanying a failure
    pub error: Option<String>,
}

/// Keyed single-slot progress log
///
/// `record` overwrites the current slot for an id; `read` returns a copy of
/// the last record. Readers share the lock, writers are exclusive, and no
/// lock is held across I/O.
#[derive(Default)]
pub struct ProgressStore {
    records: RwLock<HashMap<String, ProgressRecord>>,
}

impl ProgressStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the record for `instance_id`
    pub fn record(&self, instance_id: &str, state: &str, error: Option<String>) {
        info!(instance_id, state, error = ?error, "instance progress");
        let mut records = self.records.write().expect("progress lock poisoned");
        records.insert(
            instance_id.to_string(),
            ProgressRecord {
                at: Instant::now(),
                state: state.to_string(),
                error,
            },
        );
    }

    /// True iff at least one record was ever issued for `instance_id`
    pub fn has(&self, instance_id: &str) -> bool {
        let records = self.records.read().expect("progress lock poisoned");
        records.contains_key(instance_id)
    }

    /// Copy of the last record for `instance_id`
    pub fn read(&self, instance_id: &str) -> Option<ProgressRecord> {
        let records = self.records.read().expect("progress lock poisoned");
        records.get(instance_id).cloned()
    }

}
