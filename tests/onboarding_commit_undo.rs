mod common;

use std::sync::Arc;

use common::{test_config, FixedPorts, Reply, ScriptedGateway, INFO_OUTPUT};
use meshdock::cache::CacheBackend;
use meshdock::commit::CommitError;
use meshdock::discovery::{Candidate, CandidateKind};
use meshdock::onboard::Onboarding;
use meshdock::store::{MemoryRecordStore, RecordStore, SledRecordStore};
use meshdock::undo::UndoError;
use meshdock::validator::ValidationStatus;

fn onboarding(gateway: Arc<ScriptedGateway>, ports: Vec<Candidate>, store: Arc<dyn RecordStore>) -> Onboarding {
    Onboarding::with_parts(
        &test_config(),
        gateway,
        Arc::new(FixedPorts(ports)),
        store,
        CacheBackend::local(),
    )
}

#[tokio::test]
async fn commit_then_undo_restores_prior_record_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(SledRecordStore::open(tmp.path()).unwrap());
    let gateway = ScriptedGateway::new();
    let first = Candidate::serial("/dev/ttyUSB0");
    let second = Candidate::bluetooth("9c:13:9e:e6:fc:30");
    gateway.on_info(&first, Reply::ok(INFO_OUTPUT));
    gateway.on_info(&second, Reply::ok(INFO_OUTPUT));
    let ob = onboarding(gateway, vec![], store.clone());

    assert!(ob.validate(&first, None).await.is_reachable());
    let c1 = ob.commit(&first, false).await.unwrap();
    assert!(c1.applied);
    assert!(c1.previous.is_none());
    let device = c1.record.device.clone().unwrap();
    assert_eq!(device.long_name.as_deref(), Some("Base Camp"));
    assert_eq!(device.firmware_version.as_deref(), Some("2.3.2.63df972"));

    assert!(ob.validate(&second, None).await.is_reachable());
    let c2 = ob.commit(&second, false).await.unwrap();
    assert_eq!(c2.previous.as_ref(), Some(&c1.record));
    assert_eq!(c2.record.kind, CandidateKind::Bluetooth);
    assert_eq!(c2.snapshot_id, Some(c1.snapshot_id.unwrap() + 1));

    let undone = ob.undo().await.unwrap();
    assert_eq!(undone.snapshot_id, c2.snapshot_id.unwrap());
    assert!(undone.restored);
    assert_eq!(undone.restored_record.as_ref(), Some(&c1.record));
    assert_eq!(undone.restored_identifier.as_deref(), Some("/dev/ttyUSB0"));
    assert_eq!(store.load().unwrap().active, Some(c1.record.clone()));

    let second_undo = ob.undo().await.unwrap_err();
    assert!(matches!(second_undo, UndoError::NoSnapshotAvailable));
    assert_eq!(store.load().unwrap().active, Some(c1.record));
}

#[tokio::test]
async fn undo_of_first_commit_leaves_no_device() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let gateway = ScriptedGateway::new();
    let radio = Candidate::serial("COM4");
    gateway.on_info(&radio, Reply::ok(INFO_OUTPUT));
    let ob = onboarding(gateway, vec![], store.clone());

    ob.validate(&radio, None).await;
    ob.commit(&radio, false).await.unwrap();
    let undone = ob.undo().await.unwrap();
    assert!(undone.restored);
    assert!(undone.restored_record.is_none());
    assert!(undone.restored_identifier.is_none());
    assert!(store.load().unwrap().active.is_none());
    assert!(ob.status().unwrap().undo_available.is_none());
}

#[tokio::test]
async fn dry_run_changes_nothing_and_leaves_nothing_to_undo() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let gateway = ScriptedGateway::new();
    let radio = Candidate::serial("/dev/ttyACM0");
    gateway.on_info(&radio, Reply::ok(INFO_OUTPUT));
    let ob = onboarding(gateway, vec![], store.clone());
    let before = store.load().unwrap();

    ob.validate(&radio, None).await;
    let result = ob.commit(&radio, true).await.unwrap();
    assert!(!result.applied);
    assert!(result.validated);
    assert!(result.snapshot_id.is_none());
    assert_eq!(result.record.identifier, "/dev/ttyACM0");

    assert_eq!(store.load().unwrap(), before);
    assert!(matches!(ob.undo().await, Err(UndoError::NoSnapshotAvailable)));
}

#[tokio::test]
async fn unvalidated_com7_cannot_be_committed() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let ob = onboarding(ScriptedGateway::new(), vec![], store.clone());

    let err = ob.commit(&Candidate::from_identifier("COM7"), false).await.unwrap_err();
    assert!(matches!(err, CommitError::ValidationFailed { .. }));
    assert_eq!(store.load().unwrap().version, 0);
    assert!(store.load().unwrap().active.is_none());
}

#[tokio::test]
async fn unreachable_validation_blocks_commit() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let gateway = ScriptedGateway::new();
    let radio = Candidate::serial("COM7");
    gateway.on_info(&radio, Reply::fail(1, "Error: could not open port COM7"));
    let ob = onboarding(gateway, vec![], store.clone());

    let validation = ob.validate(&radio, None).await;
    assert_eq!(validation.status, ValidationStatus::Unreachable);
    assert!(matches!(
        ob.commit(&radio, false).await,
        Err(CommitError::ValidationFailed { .. })
    ));
    assert!(store.load().unwrap().active.is_none());
}

#[tokio::test]
async fn auto_connect_prefers_requested_reachable_candidate() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let gateway = ScriptedGateway::new();
    let dead = Candidate::serial("/dev/ttyUSB0");
    let usb = Candidate::serial("/dev/ttyACM0");
    let ble = Candidate::bluetooth("9C:13:9E:E6:FC:30");
    gateway.on_info(&dead, Reply::fail(1, "Error: timed out waiting for connection"));
    gateway.on_info(&usb, Reply::ok(INFO_OUTPUT));
    gateway.on_info(&ble, Reply::ok(INFO_OUTPUT));
    gateway.on("--ble-scan", Reply::ok("Found: name='Meshtastic_fc30' address='9c:13:9e:e6:fc:30'\n"));
    let ob = onboarding(gateway, vec![dead.clone(), usb.clone()], store.clone());

    let summary = ob.auto_connect(false, Some("9c-13-9e-e6-fc-30")).await.unwrap();
    assert_eq!(summary.attempts.len(), 3);
    assert_eq!(summary.attempts[0].status, ValidationStatus::Unreachable);
    assert_eq!(summary.chosen.as_ref().map(|c| c.identifier.as_str()), Some("9C:13:9E:E6:FC:30"));
    assert!(summary.commit.unwrap().applied);
    assert_eq!(store.load().unwrap().active.unwrap().kind, CandidateKind::Bluetooth);
}

#[tokio::test]
async fn auto_connect_dry_run_picks_first_reachable_without_persisting() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let gateway = ScriptedGateway::new();
    let dead = Candidate::serial("/dev/ttyUSB0");
    let usb = Candidate::serial("/dev/ttyACM0");
    gateway.on_info(&usb, Reply::ok(INFO_OUTPUT));
    gateway.on("--ble-scan", Reply::fail(1, "BleakError: Bluetooth adapter not found"));
    let ob = onboarding(gateway, vec![dead, usb], store.clone());

    let summary = ob.auto_connect(true, None).await.unwrap();
    assert_eq!(summary.chosen.unwrap().identifier, "/dev/ttyACM0");
    let commit = summary.commit.unwrap();
    assert!(!commit.applied);
    assert_eq!(summary.diagnostics.len(), 1);
    assert!(store.load().unwrap().active.is_none());
}

#[tokio::test]
async fn auto_connect_with_nothing_reachable_commits_nothing() {
    let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let ob = onboarding(
        ScriptedGateway::new(),
        vec![Candidate::serial("COM3")],
        store.clone(),
    );
    let summary = ob.auto_connect(false, None).await.unwrap();
    assert!(summary.chosen.is_none());
    assert!(summary.commit.is_none());
    assert_eq!(store.load().unwrap().version, 0);
}
