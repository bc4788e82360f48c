//! # Commit Manager
//!
//! Binds a validated candidate as the active device. The previous record (or its absence)
//! is captured as a [`RollbackSnapshot`] and written together with the new record in one
//! document write, so there is never a committed device without its undo point.
//!
//! Commit and undo share one [`CommitLock`]; a second caller arriving while either is
//! running is turned away rather than queued.

use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::CommitConfig;
use crate::discovery::Candidate;
use crate::store::{ActiveDeviceRecord, DeviceSummary, RecordStore, RollbackSnapshot, StoreError};
use crate::validator::{ValidationLedger, ValidationStatus};

/// Serializes commit and undo.
pub type CommitLock = Arc<Mutex<()>>;

pub fn new_commit_lock() -> CommitLock {
    Arc::new(Mutex::new(()))
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit refused for {identifier}: {reason}")]
    ValidationFailed { identifier: String, reason: String },

    #[error("another commit or undo is in progress")]
    InProgress,

    #[error("failed to persist commit: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResult {
    pub applied: bool,
    /// Sequence of the snapshot that undoes this commit; `None` for dry-runs.
    pub snapshot_id: Option<u64>,
    pub previous: Option<ActiveDeviceRecord>,
    pub record: ActiveDeviceRecord,
    /// Whether a fresh reachable validation backed this commit.
    pub validated: bool,
}

pub struct CommitManager {
    store: Arc<dyn RecordStore>,
    ledger: Arc<ValidationLedger>,
    lock: CommitLock,
    max_snapshots: usize,
    max_validation_age: ChronoDuration,
}

impl CommitManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<ValidationLedger>,
        lock: CommitLock,
        config: &CommitConfig,
        max_snapshots: usize,
    ) -> Self {
        Self {
            store,
            ledger,
            lock,
            max_snapshots,
            max_validation_age: ChronoDuration::seconds(
                i64::try_from(config.validation_max_age_seconds).unwrap_or(i64::MAX),
            ),
        }
    }

    pub async fn commit(&self, candidate: &Candidate, dry_run: bool) -> Result<CommitResult, CommitError> {
        let _guard = self.lock.try_lock().map_err(|_| CommitError::InProgress)?;

        let now = Utc::now();
        let entry = self.ledger.latest(&candidate.identifier);
        let validated = entry
            .as_ref()
            .map(|e| e.authorizes_commit(self.max_validation_age, now))
            .unwrap_or(false);

        if !validated && !dry_run {
            let reason = match &entry {
                None => "candidate has not been validated".to_string(),
                Some(e) if e.status == ValidationStatus::Reachable => format!(
                    "validation is older than {}s, validate again",
                    self.max_validation_age.num_seconds()
                ),
                Some(e) => format!("last validation was {:?}", e.status),
            };
            warn!("commit: refusing {}: {}", candidate.identifier, reason);
            return Err(CommitError::ValidationFailed {
                identifier: candidate.identifier.clone(),
                reason,
            });
        }

        let current = self.store.load()?;
        let record = ActiveDeviceRecord {
            identifier: candidate.identifier.clone(),
            kind: candidate.kind,
            committed_at: now,
            device: entry
                .as_ref()
                .and_then(|e| e.device_info.as_ref())
                .map(DeviceSummary::from),
        };
        let previous = current.active.clone();

        if dry_run {
            info!(
                "commit: dry-run {} {} (previous: {})",
                candidate.kind,
                candidate.identifier,
                describe(previous.as_ref())
            );
            return Ok(CommitResult {
                applied: false,
                snapshot_id: None,
                previous,
                record,
                validated,
            });
        }

        let sequence = current.next_sequence;
        let mut next = current.clone();
        next.push_snapshot(
            RollbackSnapshot {
                sequence,
                taken_at: now,
                previous: previous.clone(),
                retired: false,
            },
            self.max_snapshots,
        );
        next.active = Some(record.clone());

        if let Err(e) = self.store.store_if_unchanged(current.version, next) {
            warn!("commit: persisting {} failed: {}", candidate.identifier, e);
            return Err(CommitError::Persistence(e));
        }

        audit!(
            "commit {} {} applied (snapshot {}, previous: {})",
            candidate.kind,
            candidate.identifier,
            sequence,
            describe(previous.as_ref())
        );
        Ok(CommitResult {
            applied: true,
            snapshot_id: Some(sequence),
            previous,
            record,
            validated,
        })
    }
}

pub(crate) fn describe(record: Option<&ActiveDeviceRecord>) -> String {
    match record {
        Some(r) => format!("{} {}", r.kind, r.identifier),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use crate::validator::ValidationResult;

    fn manager(store: Arc<MemoryRecordStore>, ledger: Arc<ValidationLedger>) -> CommitManager {
        CommitManager::new(store, ledger, new_commit_lock(), &CommitConfig::default(), 32)
    }

    fn mark(ledger: &ValidationLedger, candidate: &Candidate, status: ValidationStatus) {
        ledger.record(&ValidationResult {
            candidate: candidate.clone(),
            status,
            device_info: None,
            raw_output: String::new(),
            exit_code: Some(0),
            timed_out: false,
            reason: String::new(),
            validated_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn unvalidated_commit_is_refused_and_state_unchanged() {
        let store = Arc::new(MemoryRecordStore::new());
        let mgr = manager(store.clone(), Arc::new(ValidationLedger::new()));
        let err = mgr.commit(&Candidate::serial("COM7"), false).await.unwrap_err();
        assert!(matches!(err, CommitError::ValidationFailed { .. }));
        assert_eq!(store.load().unwrap().version, 0);
    }

    #[tokio::test]
    async fn ambiguous_validation_does_not_authorize() {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = Arc::new(ValidationLedger::new());
        let c = Candidate::serial("/dev/ttyUSB0");
        mark(&ledger, &c, ValidationStatus::Ambiguous);
        let err = manager(store, ledger).commit(&c, false).await.unwrap_err();
        match err {
            CommitError::ValidationFailed { reason, .. } => assert!(reason.contains("Ambiguous")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dry_run_reports_without_persisting() {
        let store = Arc::new(MemoryRecordStore::new());
        let mgr = manager(store.clone(), Arc::new(ValidationLedger::new()));
        let result = mgr.commit(&Candidate::serial("COM7"), true).await.unwrap();
        assert!(!result.applied);
        assert!(!result.validated);
        assert!(result.snapshot_id.is_none());
        assert_eq!(result.record.identifier, "COM7");
        let state = store.load().unwrap();
        assert!(state.active.is_none());
        assert!(state.snapshots.is_empty());
    }

    #[tokio::test]
    async fn held_lock_rejects_commit() {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = Arc::new(ValidationLedger::new());
        let lock = new_commit_lock();
        let mgr = CommitManager::new(store, ledger.clone(), lock.clone(), &CommitConfig::default(), 32);
        let c = Candidate::serial("/dev/ttyACM0");
        mark(&ledger, &c, ValidationStatus::Reachable);

        let _held = lock.lock().await;
        assert!(matches!(mgr.commit(&c, false).await, Err(CommitError::InProgress)));
    }

    #[tokio::test]
    async fn write_failure_keeps_prior_record() {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = Arc::new(ValidationLedger::new());
        let mgr = manager(store.clone(), ledger.clone());
        let first = Candidate::serial("/dev/ttyUSB0");
        let second = Candidate::serial("/dev/ttyUSB1");
        mark(&ledger, &first, ValidationStatus::Reachable);
        mark(&ledger, &second, ValidationStatus::Reachable);

        mgr.commit(&first, false).await.unwrap();
        store.fail_writes(true);
        let err = mgr.commit(&second, false).await.unwrap_err();
        assert!(matches!(err, CommitError::Persistence(_)));

        let state = store.load().unwrap();
        assert_eq!(state.active.unwrap().identifier, "/dev/ttyUSB0");
        assert_eq!(state.snapshots.len(), 1);
    }
}
