//! # Discovery Engine
//!
//! Enumerates transport endpoints a radio might sit behind: host serial ports and BLE
//! advertisers. Discovery never mutates anything and never fails as a whole; a transport
//! that cannot be enumerated contributes an empty list and a [`DiscoveryDegraded`]
//! diagnostic instead.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshdock::config::Config;
//! use meshdock::discovery::{Discovery, SystemPortLister};
//! use meshdock::probe::CommandGateway;
//!
//! # async fn run() {
//! let cfg = Config::default();
//! let gateway = Arc::new(CommandGateway::from_config(&cfg.probe));
//! let discovery = Discovery::new(gateway, Arc::new(SystemPortLister), cfg.discovery.clone());
//! let report = discovery.discover().await;
//! for c in report.candidates() {
//!     println!("{} {}", c.kind, c.identifier);
//! }
//! # }
//! ```

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DiscoveryConfig;
use crate::logutil::last_line;
use crate::probe::{ProbeGateway, ProbePolicy};

/// Serial enumeration is a sysfs/registry walk; anything slower than this is treated as hung.
const SERIAL_ENUM_TIMEOUT: Duration = Duration::from_secs(5);
/// Process start-up allowance on top of the BLE scan window.
const BLE_SCAN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Serial,
    Bluetooth,
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateKind::Serial => write!(f, "serial"),
            CandidateKind::Bluetooth => write!(f, "ble"),
        }
    }
}

/// A discovered, unverified device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    /// Port path (`/dev/ttyUSB0`, `COM4`) or normalized BLE address.
    pub identifier: String,
    /// Informational only (vendor id, product, BLE name, RSSI).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Candidate {
    pub fn serial(path: impl Into<String>) -> Self {
        let path: String = path.into();
        Self {
            kind: CandidateKind::Serial,
            identifier: path.trim().to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn bluetooth(address: &str) -> Self {
        Self {
            kind: CandidateKind::Bluetooth,
            identifier: normalize_ble_address(address),
            metadata: BTreeMap::new(),
        }
    }

    /// Build a candidate from an operator-typed identifier. `COM*` and paths are serial;
    /// anything else containing `:` is taken as a BLE address.
    pub fn from_identifier(identifier: &str) -> Self {
        let id = identifier.trim();
        let looks_serial = id.to_ascii_uppercase().starts_with("COM") || id.starts_with('/');
        if !looks_serial && id.contains(':') {
            Self::bluetooth(id)
        } else {
            Self::serial(id)
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }

    /// CLI arguments selecting this endpoint.
    pub fn probe_args(&self) -> Vec<String> {
        let flag = match self.kind {
            CandidateKind::Serial => "--port",
            CandidateKind::Bluetooth => "--ble",
        };
        vec![flag.to_string(), self.identifier.clone()]
    }
}

/// `aa-bb-cc-dd-ee-ff`, `AABBCCDDEEFF` and `aa:bb:cc:dd:ee:ff` all become
/// `AA:BB:CC:DD:EE:FF`. Identifiers that are not 48-bit MACs (macOS reports UUIDs) are
/// only trimmed and upper-cased.
pub fn normalize_ble_address(address: &str) -> String {
    let trimmed = address.trim();
    let trimmed = trimmed
        .strip_prefix("ble:")
        .or_else(|| trimmed.strip_prefix("BLE:"))
        .unwrap_or(trimmed);
    let hex: String = trimmed
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        hex.to_ascii_uppercase()
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    } else {
        trimmed.to_ascii_uppercase()
    }
}

/// A transport that could not be enumerated during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryDegraded {
    pub transport: CandidateKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    pub serial: Vec<Candidate>,
    pub bluetooth: Vec<Candidate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<DiscoveryDegraded>,
}

impl DiscoveryReport {
    /// Serial candidates first, then BLE, in enumeration order.
    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.serial.iter().chain(self.bluetooth.iter())
    }

    pub fn is_degraded(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.serial.len() + self.bluetooth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host serial port enumeration seam.
pub trait PortLister: Send + Sync {
    fn list_ports(&self) -> anyhow::Result<Vec<Candidate>>;
}

/// Enumerates ports with the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortLister;

#[cfg(feature = "serial")]
impl PortLister for SystemPortLister {
    fn list_ports(&self) -> anyhow::Result<Vec<Candidate>> {
        use serialport::SerialPortType;

        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let c = Candidate::serial(p.port_name);
                match p.port_type {
                    SerialPortType::UsbPort(usb) => c
                        .with_meta("type", "usb")
                        .with_meta("vid", format!("{:04x}", usb.vid))
                        .with_meta("pid", format!("{:04x}", usb.pid))
                        .with_meta("manufacturer", usb.manufacturer.unwrap_or_default())
                        .with_meta("product", usb.product.unwrap_or_default())
                        .with_meta("serial_number", usb.serial_number.unwrap_or_default()),
                    SerialPortType::BluetoothPort => c.with_meta("type", "bluetooth"),
                    SerialPortType::PciPort => c.with_meta("type", "pci"),
                    SerialPortType::Unknown => c,
                }
            })
            .collect())
    }
}

#[cfg(not(feature = "serial"))]
impl PortLister for SystemPortLister {
    fn list_ports(&self) -> anyhow::Result<Vec<Candidate>> {
        Err(anyhow::anyhow!("serial support not compiled in (enable the `serial` feature)"))
    }
}

/// Parse `--ble-scan` output: either a JSON array of `{address, name, rssi}` objects or
/// text lines of the form `Found: name='Meshtastic_1a2b' address='AA:BB:..'`.
pub fn parse_ble_scan(stdout: &str) -> Vec<Candidate> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(stdout.trim()) {
        return items
            .iter()
            .filter_map(|item| {
                let address = item.get("address")?.as_str()?;
                let mut c = Candidate::bluetooth(address);
                if let Some(name) = item.get("name").and_then(Value::as_str) {
                    c = c.with_meta("name", name);
                }
                if let Some(rssi) = item.get("rssi").and_then(Value::as_i64) {
                    c = c.with_meta("rssi", rssi.to_string());
                }
                Some(c)
            })
            .collect();
    }

    stdout
        .lines()
        .filter_map(|line| {
            let address = quoted_field(line, "address")?;
            let mut c = Candidate::bluetooth(address);
            if let Some(name) = quoted_field(line, "name") {
                c = c.with_meta("name", name);
            }
            Some(c)
        })
        .collect()
}

/// Value of `field='...'` (or `field="..."`) within `line`.
fn quoted_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let start = line.find(&format!("{field}="))? + field.len() + 1;
    let rest = &line[start..];
    let quote = rest.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let body = &rest[1..];
    let end = body.find(quote)?;
    Some(&body[..end]).filter(|v| !v.is_empty())
}

pub struct Discovery {
    gateway: Arc<dyn ProbeGateway>,
    ports: Arc<dyn PortLister>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(
        gateway: Arc<dyn ProbeGateway>,
        ports: Arc<dyn PortLister>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            gateway,
            ports,
            config,
        }
    }

    /// Enumerate serial ports and scan BLE concurrently, then deduplicate by identifier.
    pub async fn discover(&self) -> DiscoveryReport {
        let (serial, ble) = tokio::join!(self.list_serial(), self.scan_ble());
        let mut report = DiscoveryReport::default();
        let mut seen = HashSet::new();

        match serial {
            Ok(list) => report.serial = dedup_into(list, &mut seen),
            Err(reason) => {
                warn!("discovery: serial enumeration degraded: {}", reason);
                report.diagnostics.push(DiscoveryDegraded {
                    transport: CandidateKind::Serial,
                    reason,
                });
            }
        }
        match ble {
            Ok(list) => report.bluetooth = dedup_into(list, &mut seen),
            Err(reason) => {
                warn!("discovery: BLE scan degraded: {}", reason);
                report.diagnostics.push(DiscoveryDegraded {
                    transport: CandidateKind::Bluetooth,
                    reason,
                });
            }
        }

        info!(
            "discovery: {} serial, {} BLE candidate(s){}",
            report.serial.len(),
            report.bluetooth.len(),
            if report.is_degraded() { " (degraded)" } else { "" }
        );
        report
    }

    async fn list_serial(&self) -> Result<Vec<Candidate>, String> {
        if !self.config.serial_enabled {
            return Ok(Vec::new());
        }
        let ports = Arc::clone(&self.ports);
        let task = tokio::task::spawn_blocking(move || ports.list_ports());
        match tokio::time::timeout(SERIAL_ENUM_TIMEOUT, task).await {
            Ok(Ok(Ok(list))) => Ok(list),
            Ok(Ok(Err(e))) => Err(format!("serial enumeration failed: {e}")),
            Ok(Err(join)) => Err(format!("serial enumeration task failed: {join}")),
            Err(_) => Err(format!(
                "serial enumeration exceeded {:?}",
                SERIAL_ENUM_TIMEOUT
            )),
        }
    }

    async fn scan_ble(&self) -> Result<Vec<Candidate>, String> {
        if !self.config.ble_enabled {
            return Ok(Vec::new());
        }
        let policy = ProbePolicy::new(
            Duration::from_secs(self.config.ble_scan_seconds) + BLE_SCAN_GRACE,
            0,
        );
        let result = self
            .gateway
            .invoke(&["--ble-scan".to_string()], policy)
            .await
            .map_err(|e| e.to_string())?;
        if !result.success() {
            let detail = last_line(&result.stderr);
            return Err(format!(
                "BLE scan exited with {:?}{}",
                result.exit_code,
                if detail.is_empty() { String::new() } else { format!(": {detail}") }
            ));
        }
        let found = parse_ble_scan(&result.stdout);
        debug!("discovery: BLE scan reported {} advertiser(s)", found.len());
        Ok(found)
    }
}

fn dedup_into(list: Vec<Candidate>, seen: &mut HashSet<String>) -> Vec<Candidate> {
    list.into_iter()
        .filter(|c| !c.identifier.is_empty() && seen.insert(c.identifier.clone()))
        .collect()
}
