//! # Onboarding
//!
//! Wires configuration into the discovery → validation → commit/undo pipeline and the
//! telemetry read path, and implements auto-connect: discover, validate every candidate
//! concurrently, pick a reachable one and commit it (or dry-run). `find` pairs BLE
//! advertisers with the mesh nodes reporting the same MAC.

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::cache::{CacheBackend, TelemetryCache};
use crate::commit::{new_commit_lock, CommitError, CommitManager, CommitResult};
use crate::config::{Config, StoreBackend};
use crate::discovery::{
    normalize_ble_address, Candidate, CandidateKind, Discovery, DiscoveryDegraded, DiscoveryReport, PortLister,
    SystemPortLister,
};
use crate::probe::{CommandGateway, ProbeGateway, ProbePolicy};
use crate::store::{ActiveDeviceRecord, MemoryRecordStore, RecordStore, RollbackSnapshot, SledRecordStore, StoreError};
use crate::telemetry::{correlate_ble, BleNodeMatch, NodeSummary, TelemetryService};
use crate::undo::{UndoError, UndoManager, UndoResult};
use crate::validator::{ValidationLedger, ValidationResult, Validator};

#[derive(Debug, Clone, Serialize)]
pub struct AutoConnectSummary {
    pub attempts: Vec<ValidationResult>,
    pub chosen: Option<Candidate>,
    pub commit: Option<CommitResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<DiscoveryDegraded>,
}

/// Discovery joined with the active device's node list.
#[derive(Debug, Clone, Serialize)]
pub struct FindReport {
    pub discovery: DiscoveryReport,
    pub nodes: Vec<NodeSummary>,
    /// Why `nodes` is empty when the telemetry read failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes_error: Option<String>,
    pub matches: Vec<BleNodeMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub active: Option<ActiveDeviceRecord>,
    /// The snapshot the next undo would restore.
    pub undo_available: Option<RollbackSnapshot>,
    pub snapshots: usize,
    pub version: u64,
    pub cache_backend: &'static str,
}

pub struct Onboarding {
    store: Arc<dyn RecordStore>,
    discovery: Discovery,
    validator: Validator,
    commits: CommitManager,
    undo: UndoManager,
    telemetry: TelemetryService,
}

impl Onboarding {
    /// Build the pipeline from `config`: subprocess gateway, system serial enumeration,
    /// the configured record store and a cache backend selected now.
    pub async fn open(config: &Config) -> Result<Self> {
        let gateway: Arc<dyn ProbeGateway> = Arc::new(CommandGateway::from_config(&config.probe));
        let store = open_store(config)?;
        let backend = CacheBackend::select(&config.cache).await;
        Ok(Self::with_parts(config, gateway, Arc::new(SystemPortLister), store, backend))
    }

    pub fn with_parts(
        config: &Config,
        gateway: Arc<dyn ProbeGateway>,
        ports: Arc<dyn PortLister>,
        store: Arc<dyn RecordStore>,
        backend: CacheBackend,
    ) -> Self {
        let policy = ProbePolicy::from(&config.probe);
        let ledger = Arc::new(ValidationLedger::new());
        let lock = new_commit_lock();
        Self {
            discovery: Discovery::new(Arc::clone(&gateway), ports, config.discovery.clone()),
            validator: Validator::new(Arc::clone(&gateway), policy, Arc::clone(&ledger)),
            commits: CommitManager::new(
                Arc::clone(&store),
                ledger,
                Arc::clone(&lock),
                &config.commit,
                config.store.max_snapshots,
            ),
            undo: UndoManager::new(Arc::clone(&store), lock),
            telemetry: TelemetryService::new(
                gateway,
                policy,
                TelemetryCache::new(backend, &config.cache),
                Arc::clone(&store),
            ),
            store,
        }
    }

    pub fn telemetry(&self) -> &TelemetryService {
        &self.telemetry
    }

    pub async fn discover(&self) -> DiscoveryReport {
        self.discovery.discover().await
    }

    pub async fn validate(&self, candidate: &Candidate, expected: Option<&str>) -> ValidationResult {
        self.validator.validate_expecting(candidate, expected).await
    }

    pub async fn commit(&self, candidate: &Candidate, dry_run: bool) -> Result<CommitResult, CommitError> {
        self.commits.commit(candidate, dry_run).await
    }

    pub async fn undo(&self) -> Result<UndoResult, UndoError> {
        self.undo.undo().await
    }

    /// Discover, validate all candidates, then commit the preferred reachable candidate
    /// (or the first reachable one). Nothing reachable means nothing is committed.
    pub async fn auto_connect(&self, dry_run: bool, prefer: Option<&str>) -> Result<AutoConnectSummary, CommitError> {
        let report = self.discovery.discover().await;
        let candidates: Vec<Candidate> = report.candidates().cloned().collect();
        let attempts = self.validator.validate_all(&candidates).await;

        let reachable = || attempts.iter().filter(|r| r.is_reachable()).map(|r| &r.candidate);
        let chosen = prefer
            .and_then(|p| reachable().find(|c| same_identifier(c, p)))
            .or_else(|| reachable().next())
            .cloned();

        let commit = match &chosen {
            Some(candidate) => Some(self.commits.commit(candidate, dry_run).await?),
            None => {
                info!(
                    "auto-connect: none of {} candidate(s) reachable",
                    candidates.len()
                );
                None
            }
        };

        Ok(AutoConnectSummary {
            attempts,
            chosen,
            commit,
            diagnostics: report.diagnostics,
        })
    }

    /// Discover, read nodes through the telemetry cache and pair BLE candidates with nodes
    /// by MAC. A failed node read leaves `matches` empty and is reported, not returned.
    pub async fn find(&self) -> FindReport {
        let (discovery, nodes) = tokio::join!(self.discovery.discover(), self.telemetry.nodes());
        let (nodes, nodes_error) = match nodes {
            Ok(read) => (read.data, None),
            Err(e) => {
                warn!("find: node list unavailable: {}", e);
                (Vec::new(), Some(e.to_string()))
            }
        };
        let matches = correlate_ble(&discovery.bluetooth, &nodes);
        info!(
            "find: {} BLE candidate(s), {} node(s), {} match(es)",
            discovery.bluetooth.len(),
            nodes.len(),
            matches.len()
        );
        FindReport {
            discovery,
            nodes,
            nodes_error,
            matches,
        }
    }

    pub fn status(&self) -> Result<DeviceStatus, StoreError> {
        let state = self.store.load()?;
        Ok(DeviceStatus {
            undo_available: state.undo_candidate().cloned(),
            snapshots: state.snapshots.len(),
            version: state.version,
            active: state.active,
            cache_backend: self.telemetry.cache().backend().name(),
        })
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn RecordStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRecordStore::new())),
        StoreBackend::Sled => {
            let path = Path::new(&config.store.data_dir).join("device");
            let store = SledRecordStore::open(&path)
                .with_context(|| format!("opening device store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn same_identifier(candidate: &Candidate, wanted: &str) -> bool {
    match candidate.kind {
        CandidateKind::Bluetooth => candidate.identifier == normalize_ble_address(wanted),
        CandidateKind::Serial => candidate.identifier.eq_ignore_ascii_case(wanted.trim()),
    }
}
