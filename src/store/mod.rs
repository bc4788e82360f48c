//! Persistence for the active device and its rollback snapshots.
//!
//! The whole device state lives in one versioned document so a commit (new record plus
//! snapshot) or an undo (restored record plus retired snapshot) is a single
//! write-if-unchanged. Readers observe either the old document or the new one.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use crate::discovery::CandidateKind;
use crate::validator::DeviceInfo;

const TREE_DEVICE: &str = "meshdock_device";
const STATE_KEY: &[u8] = b"device_state";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Someone else wrote the document since it was loaded.
    #[error("device state changed concurrently (expected version {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity fields kept with a committed device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub node_id: Option<String>,
    pub long_name: Option<String>,
    pub firmware_version: Option<String>,
}

impl From<&DeviceInfo> for DeviceSummary {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            node_id: info.node_id.clone(),
            long_name: info.long_name.clone(),
            firmware_version: info.firmware_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDeviceRecord {
    pub identifier: String,
    pub kind: CandidateKind,
    pub committed_at: DateTime<Utc>,
    pub device: Option<DeviceSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    pub sequence: u64,
    pub taken_at: DateTime<Utc>,
    /// `None` means no device was configured before the commit.
    pub previous: Option<ActiveDeviceRecord>,
    pub retired: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Bumped by every successful write.
    pub version: u64,
    pub active: Option<ActiveDeviceRecord>,
    /// Ordered by sequence, oldest first.
    pub snapshots: Vec<RollbackSnapshot>,
    pub next_sequence: u64,
}

impl DeviceState {
    /// The newest snapshot, if it has not been undone yet.
    pub fn undo_candidate(&self) -> Option<&RollbackSnapshot> {
        self.snapshots.last().filter(|s| !s.retired)
    }

    /// Append a snapshot and drop the oldest ones beyond `max_snapshots`.
    pub fn push_snapshot(&mut self, snapshot: RollbackSnapshot, max_snapshots: usize) {
        self.next_sequence = self.next_sequence.max(snapshot.sequence + 1);
        self.snapshots.push(snapshot);
        if self.snapshots.len() > max_snapshots {
            let excess = self.snapshots.len() - max_snapshots;
            self.snapshots.drain(..excess);
        }
    }
}

/// Versioned, atomic storage of [`DeviceState`].
pub trait RecordStore: Send + Sync {
    fn load(&self) -> Result<DeviceState, StoreError>;

    /// Persist `state` only if the stored version still equals `expected_version`.
    /// Returns the stored document with its new version.
    fn store_if_unchanged(&self, expected_version: u64, state: DeviceState) -> Result<DeviceState, StoreError>;
}

/// sled-backed store; one bincode document under a fixed key.
pub struct SledRecordStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let tree = db.open_tree(TREE_DEVICE)?;
        Ok(Self { _db: db, tree })
    }

    fn decode(bytes: &[u8]) -> Result<DeviceState, StoreError> {
        Ok(bincode::deserialize::<DeviceState>(bytes)?)
    }

    /// A write only counts once flushed. On a failed flush the swapped-in document is
    /// swapped back out so the caller's error matches what `load` returns afterwards.
    fn settle(
        &self,
        previous: Option<sled::IVec>,
        written: Vec<u8>,
        flushed: Result<(), sled::Error>,
    ) -> Result<(), StoreError> {
        let Err(flush_error) = flushed else {
            return Ok(());
        };
        match self.tree.compare_and_swap(STATE_KEY, Some(written), previous) {
            Ok(Ok(())) => {
                if let Err(e) = self.tree.flush() {
                    warn!("store: flush after rollback failed: {}", e);
                }
            }
            Ok(Err(_)) => warn!("store: document changed before rollback, leaving it in place"),
            Err(e) => warn!("store: rollback after failed flush failed: {}", e),
        }
        Err(StoreError::Sled(flush_error))
    }
}

impl RecordStore for SledRecordStore {
    fn load(&self) -> Result<DeviceState, StoreError> {
        match self.tree.get(STATE_KEY)? {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(DeviceState::default()),
        }
    }

    fn store_if_unchanged(&self, expected_version: u64, mut state: DeviceState) -> Result<DeviceState, StoreError> {
        let current = self.tree.get(STATE_KEY)?;
        let found = match &current {
            Some(bytes) => Self::decode(bytes)?.version,
            None => 0,
        };
        if found != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found,
            });
        }

        state.version = expected_version + 1;
        let encoded = bincode::serialize(&state)?;
        match self
            .tree
            .compare_and_swap(STATE_KEY, current.clone(), Some(encoded.clone()))?
        {
            Ok(()) => {
                let flushed = self.tree.flush().map(|_| ());
                self.settle(current, encoded, flushed)?;
                Ok(state)
            }
            Err(cas) => {
                let found = match cas.current {
                    Some(bytes) => Self::decode(&bytes)?.version,
                    None => 0,
                };
                Err(StoreError::Conflict {
                    expected: expected_version,
                    found,
                })
            }
        }
    }
}

/// Process-local store for ephemeral runs and tests. Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<DeviceState>,
    fail_writes: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self) -> Result<DeviceState, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn store_if_unchanged(&self, expected_version: u64, mut state: DeviceState) -> Result<DeviceState, StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        let mut current = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                found: current.version,
            });
        }
        state.version = expected_version + 1;
        *current = state.clone();
        Ok(state)
    }
}
