//! # Undo Manager
//!
//! Reverts the most recent applied commit. Only the newest snapshot is ever eligible;
//! once restored it is retired, so a second undo fails until another commit happens.

use log::warn;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::commit::{describe, CommitLock};
use crate::store::{ActiveDeviceRecord, RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum UndoError {
    #[error("no snapshot available to undo")]
    NoSnapshotAvailable,

    #[error("another commit or undo is in progress")]
    InProgress,

    #[error("failed to persist undo: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct UndoResult {
    /// Set on every successful undo, including one that cleared the active device.
    pub restored: bool,
    /// The record that is active again, `None` when undo cleared the active device.
    pub restored_record: Option<ActiveDeviceRecord>,
    pub restored_identifier: Option<String>,
    pub snapshot_id: u64,
}

pub struct UndoManager {
    store: Arc<dyn RecordStore>,
    lock: CommitLock,
}

impl UndoManager {
    pub fn new(store: Arc<dyn RecordStore>, lock: CommitLock) -> Self {
        Self { store, lock }
    }

    pub async fn undo(&self) -> Result<UndoResult, UndoError> {
        let _guard = self.lock.try_lock().map_err(|_| UndoError::InProgress)?;

        let current = self.store.load()?;
        let snapshot = current
            .undo_candidate()
            .cloned()
            .ok_or(UndoError::NoSnapshotAvailable)?;

        let mut next = current.clone();
        next.active = snapshot.previous.clone();
        if let Some(last) = next.snapshots.last_mut() {
            last.retired = true;
        }

        if let Err(e) = self.store.store_if_unchanged(current.version, next) {
            warn!("undo: persisting snapshot {} failed: {}", snapshot.sequence, e);
            return Err(UndoError::Persistence(e));
        }

        audit!(
            "undo snapshot {}: {} -> {}",
            snapshot.sequence,
            describe(current.active.as_ref()),
            describe(snapshot.previous.as_ref())
        );
        Ok(UndoResult {
            restored_identifier: snapshot.previous.as_ref().map(|r| r.identifier.clone()),
            restored: true,
            restored_record: snapshot.previous,
            snapshot_id: snapshot.sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::new_commit_lock;
    use crate::store::{DeviceState, MemoryRecordStore, RollbackSnapshot};
    use chrono::Utc;

    #[tokio::test]
    async fn empty_store_has_nothing_to_undo() {
        let undo = UndoManager::new(Arc::new(MemoryRecordStore::new()), new_commit_lock());
        assert!(matches!(undo.undo().await, Err(UndoError::NoSnapshotAvailable)));
    }

    #[tokio::test]
    async fn undo_clears_device_when_snapshot_was_empty() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut state = DeviceState::default();
        state.active = Some(ActiveDeviceRecord {
            identifier: "COM4".into(),
            kind: crate::discovery::CandidateKind::Serial,
            committed_at: Utc::now(),
            device: None,
        });
        state.push_snapshot(
            RollbackSnapshot {
                sequence: 0,
                taken_at: Utc::now(),
                previous: None,
                retired: false,
            },
            8,
        );
        store.store_if_unchanged(0, state).unwrap();

        let undo = UndoManager::new(store.clone(), new_commit_lock());
        let result = undo.undo().await.unwrap();
        assert!(result.restored);
        assert!(result.restored_record.is_none());
        assert_eq!(result.snapshot_id, 0);
        assert!(store.load().unwrap().active.is_none());
        assert!(matches!(undo.undo().await, Err(UndoError::NoSnapshotAvailable)));
    }

    #[tokio::test]
    async fn held_lock_rejects_undo() {
        let lock = new_commit_lock();
        let undo = UndoManager::new(Arc::new(MemoryRecordStore::new()), lock.clone());
        let _held = lock.lock().await;
        assert!(matches!(undo.undo().await, Err(UndoError::InProgress)));
    }
}
