//! Node and position telemetry read from `meshtastic --info`, served through the
//! [`TelemetryCache`].
//!
//! Fingerprints are scoped by the active device (`default` when none is committed):
//! `<device>/nodes`, `<device>/positions` and `<device>/node:<id>`. A commit or undo
//! therefore never serves the previous radio's telemetry.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::cache::{CacheError, CacheRead, Freshness, TelemetryCache};
use crate::discovery::{normalize_ble_address, Candidate};
use crate::logutil::last_line;
use crate::probe::{ProbeGateway, ProbePolicy};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub macaddr: Option<String>,
    pub hw_model: Option<String>,
    pub snr: Option<f64>,
    pub hops_away: Option<u32>,
    /// Unix seconds.
    pub last_heard: Option<i64>,
    pub battery: Option<f64>,
    pub position: Option<Position>,
}

impl NodeSummary {
    /// Build a summary from one entry of the `nodes` collection. `key` is the map key
    /// when the collection is an object.
    pub fn from_entry(key: Option<&str>, node: &Value) -> Option<Self> {
        let user = node.get("user").filter(|u| u.is_object()).unwrap_or(node);
        let id = text(user, &["id"])
            .or_else(|| text(node, &["id", "nodeId", "node_id"]))
            .or_else(|| key.map(str::to_string))
            .or_else(|| number(node, &["num"]).map(|n| format!("!{:08x}", n as u64)))?;

        let metrics = node
            .get("deviceMetrics")
            .or_else(|| node.get("device_metrics"))
            .unwrap_or(&Value::Null);

        Some(Self {
            id,
            long_name: text(user, &["longName", "long_name", "name"]),
            short_name: text(user, &["shortName", "short_name"]),
            macaddr: text(user, &["macaddr", "mac"]),
            hw_model: text(user, &["hwModel", "hw_model"]).or_else(|| text(metrics, &["hwModel"])),
            snr: number(node, &["snr"]),
            hops_away: number(node, &["hopsAway", "hops_away"]).map(|h| h as u32),
            last_heard: number(node, &["lastHeard", "last_heard"]).map(|t| t as i64),
            battery: number(node, &["battery", "batteryLevel", "battery_level"])
                .or_else(|| number(metrics, &["batteryLevel", "battery_level", "battery"])),
            position: position(node),
        })
    }

    pub fn last_heard_at(&self) -> Option<DateTime<Utc>> {
        self.last_heard.and_then(|t| DateTime::from_timestamp(t, 0))
    }

    /// Match on id (with or without `!`), MAC or short name, ignoring case.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.trim().trim_start_matches('!');
        if q.is_empty() {
            return false;
        }
        self.id.trim_start_matches('!').eq_ignore_ascii_case(q)
            || self.macaddr.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(q))
            || self.short_name.as_deref().is_some_and(|s| s.eq_ignore_ascii_case(q))
    }
}

/// Every node in an `--info` payload.
pub fn parse_nodes(payload: &Value) -> Vec<NodeSummary> {
    match payload.get("nodes") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(key, node)| NodeSummary::from_entry(Some(key), node))
            .collect(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|node| NodeSummary::from_entry(None, node))
            .collect(),
        _ => Vec::new(),
    }
}

fn text(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match value.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Look in `position`/`pos`/`location`/`gps`, then at the top level. Integer
/// `latitudeI`/`longitudeI` fields are in 1e-7 degrees.
fn position(node: &Value) -> Option<Position> {
    let mut sources: Vec<&Value> = ["position", "pos", "location", "gps"]
        .iter()
        .filter_map(|k| node.get(*k))
        .filter(|v| v.is_object())
        .collect();
    sources.push(node);

    let lat = sources.iter().find_map(|v| coordinate(v, &["lat", "latitude"], &["latitudeI", "latitude_i"]))?;
    let lon = sources
        .iter()
        .find_map(|v| coordinate(v, &["lon", "lng", "longitude"], &["longitudeI", "longitude_i"]))?;
    let alt = sources.iter().find_map(|v| number(v, &["alt", "altitude"]));
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some(Position { lat, lon, alt })
}

fn coordinate(value: &Value, degrees: &[&str], scaled: &[&str]) -> Option<f64> {
    number(value, degrees).or_else(|| number(value, scaled).map(|v| v * 1e-7))
}

/// A BLE advertiser paired with the mesh node reporting the same MAC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BleNodeMatch {
    pub ble: Candidate,
    pub node: NodeSummary,
}

/// Pair BLE candidates with nodes whose `macaddr` normalizes to the candidate's address.
pub fn correlate_ble(ble: &[Candidate], nodes: &[NodeSummary]) -> Vec<BleNodeMatch> {
    ble.iter()
        .filter_map(|candidate| {
            let node = nodes.iter().find(|n| {
                n.macaddr
                    .as_deref()
                    .is_some_and(|mac| normalize_ble_address(mac) == candidate.identifier)
            })?;
            Some(BleNodeMatch {
                ble: candidate.clone(),
                node: node.clone(),
            })
        })
        .collect()
}

/// A cached telemetry read decoded into `T`.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry<T> {
    pub data: T,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl<T> Telemetry<T> {
    fn from_read(read: CacheRead, data: T) -> Self {
        Self {
            data,
            fetched_at: read.fetched_at,
            freshness: read.freshness,
        }
    }
}

pub struct TelemetryService {
    gateway: Arc<dyn ProbeGateway>,
    policy: ProbePolicy,
    cache: TelemetryCache,
    store: Arc<dyn RecordStore>,
}

impl TelemetryService {
    pub fn new(
        gateway: Arc<dyn ProbeGateway>,
        policy: ProbePolicy,
        cache: TelemetryCache,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            gateway,
            policy,
            cache,
            store,
        }
    }

    pub fn cache(&self) -> &TelemetryCache {
        &self.cache
    }

    pub async fn nodes(&self) -> Result<Telemetry<Vec<NodeSummary>>, CacheError> {
        let (scope, fetch) = self.info_fetch();
        let read = self
            .cache
            .get(&format!("{scope}/nodes"), move || async move {
                let payload = fetch.await?;
                encode(parse_nodes(&payload))
            })
            .await?;
        let nodes = decode(&read.value);
        Ok(Telemetry::from_read(read, nodes))
    }

    /// Nodes reporting a usable position.
    pub async fn positions(&self) -> Result<Telemetry<Vec<NodeSummary>>, CacheError> {
        let (scope, fetch) = self.info_fetch();
        let read = self
            .cache
            .get(&format!("{scope}/positions"), move || async move {
                let payload = fetch.await?;
                let located: Vec<NodeSummary> = parse_nodes(&payload)
                    .into_iter()
                    .filter(|n| n.position.is_some())
                    .collect();
                encode(located)
            })
            .await?;
        let nodes = decode(&read.value);
        Ok(Telemetry::from_read(read, nodes))
    }

    pub async fn node(&self, id: &str) -> Result<Telemetry<Option<NodeSummary>>, CacheError> {
        let (scope, fetch) = self.info_fetch();
        let query = id.trim().to_string();
        let fingerprint = format!("{scope}/node:{}", query.to_ascii_lowercase());
        let read = self
            .cache
            .get(&fingerprint, move || async move {
                let payload = fetch.await?;
                encode(parse_nodes(&payload).into_iter().find(|n| n.matches(&query)))
            })
            .await?;
        let node = decode(&read.value);
        Ok(Telemetry::from_read(read, node))
    }

    /// The committed device, if any.
    fn active_device(&self) -> Option<Candidate> {
        match self.store.load() {
            Ok(state) => state.active.map(|record| Candidate {
                kind: record.kind,
                identifier: record.identifier,
                metadata: Default::default(),
            }),
            Err(e) => {
                warn!("telemetry: cannot read active device, using CLI default: {}", e);
                None
            }
        }
    }

    /// Cache scope plus an `--info` fetch against the active device; no active device
    /// selects the CLI's default device.
    fn info_fetch(&self) -> (String, impl Future<Output = Result<Value, String>> + Send + 'static) {
        let gateway = Arc::clone(&self.gateway);
        let policy = self.policy;
        let device = self.active_device();
        let scope = device
            .as_ref()
            .map(|c| c.identifier.clone())
            .unwrap_or_else(|| "default".to_string());
        let mut args = device.map(|c| c.probe_args()).unwrap_or_default();
        args.push("--info".to_string());
        let fetch = async move {
            let result = gateway.invoke(&args, policy).await.map_err(|e| e.to_string())?;
            if !result.success() {
                return Err(format!(
                    "--info exited with {:?}: {}",
                    result.exit_code,
                    last_line(&result.stderr)
                ));
            }
            result
                .json
                .ok_or_else(|| "--info produced no JSON".to_string())
        };
        (scope, fetch)
    }
}

fn encode<T: Serialize>(data: T) -> Result<Value, String> {
    serde_json::to_value(data).map_err(|e| e.to_string())
}

/// Entries written by another process with a different shape decode as empty.
fn decode<T: serde::de::DeserializeOwned + Default>(value: &Value) -> T {
    match serde_json::from_value(value.clone()) {
        Ok(data) => data,
        Err(e) => {
            warn!("telemetry: cached entry has an unexpected shape: {}", e);
            T::default()
        }
    }
}
