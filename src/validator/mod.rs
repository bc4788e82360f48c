//! # Validator
//!
//! Answers "is this candidate a Meshtastic radio I can talk to?" with one read-only
//! `--info` probe. The answer is three-valued:
//!
//! - [`ValidationStatus::Reachable`]: clean exit and a payload that identifies a node
//! - [`ValidationStatus::Ambiguous`]: clean exit, but nothing identifying came back
//! - [`ValidationStatus::Unreachable`]: non-zero exit, timeout or launch failure
//!
//! Every result is recorded in the shared [`ValidationLedger`], which the commit path
//! consults before binding a device.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use log::{debug, info};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::discovery::Candidate;
use crate::logutil::{escape_log_capped, last_line, PROBE_PREVIEW_CHARS};
use crate::probe::{ProbeError, ProbeGateway, ProbePolicy, ProbeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Reachable,
    Unreachable,
    Ambiguous,
}

/// What the radio said about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub node_num: Option<u64>,
    /// `!xxxxxxxx` form of `node_num`, or the id reported by the payload.
    pub node_id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
    pub firmware_version: Option<String>,
    pub macaddr: Option<String>,
    #[serde(skip)]
    pub raw: Value,
}

impl DeviceInfo {
    /// Pull the local node's identity out of `--info` JSON.
    pub fn from_payload(payload: &Value) -> Self {
        let my_info = payload.get("myInfo").or_else(|| payload.get("my_info"));
        let node_num = my_info
            .and_then(|m| field(m, &["myNodeNum", "my_node_num"]))
            .or_else(|| field(payload, &["myNodeNum", "my_node_num"]))
            .and_then(Value::as_u64);

        let metadata = payload.get("metadata");
        let firmware_version = metadata
            .and_then(|m| field(m, &["firmwareVersion", "firmware_version"]))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut info = DeviceInfo {
            node_num,
            node_id: node_num.map(|n| format!("!{n:08x}")),
            firmware_version,
            hw_model: metadata
                .and_then(|m| field(m, &["hwModel", "hw_model"]))
                .and_then(Value::as_str)
                .map(str::to_string),
            raw: payload.clone(),
            ..Default::default()
        };

        if let Some(user) = own_user(payload, info.node_id.as_deref(), node_num) {
            info.long_name = text_field(user, &["longName", "long_name", "name"]);
            info.short_name = text_field(user, &["shortName", "short_name"]);
            info.macaddr = text_field(user, &["macaddr", "mac"]);
            if info.hw_model.is_none() {
                info.hw_model = text_field(user, &["hwModel", "hw_model"]);
            }
            if info.node_id.is_none() {
                info.node_id = text_field(user, &["id"]);
            }
        }
        info
    }

    /// Short human label: long name, node id or nothing.
    pub fn label(&self) -> Option<&str> {
        self.long_name.as_deref().or(self.node_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub candidate: Candidate,
    pub status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    #[serde(skip)]
    pub raw_output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub reason: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    pub fn is_reachable(&self) -> bool {
        self.status == ValidationStatus::Reachable
    }
}

/// Latest status per identifier, as seen by the commit path.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub status: ValidationStatus,
    pub validated_at: DateTime<Utc>,
    pub device_info: Option<DeviceInfo>,
}

impl LedgerEntry {
    /// Reachable and validated no longer than `max_age` ago.
    pub fn authorizes_commit(&self, max_age: ChronoDuration, now: DateTime<Utc>) -> bool {
        self.status == ValidationStatus::Reachable && now - self.validated_at <= max_age
    }
}

#[derive(Debug, Default)]
pub struct ValidationLedger {
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl ValidationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &ValidationResult) {
        let entry = LedgerEntry {
            status: result.status,
            validated_at: result.validated_at,
            device_info: result.device_info.clone(),
        };
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(result.candidate.identifier.clone(), entry);
    }

    pub fn latest(&self, identifier: &str) -> Option<LedgerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(identifier)
            .cloned()
    }
}

pub struct Validator {
    gateway: Arc<dyn ProbeGateway>,
    policy: ProbePolicy,
    ledger: Arc<ValidationLedger>,
}

impl Validator {
    pub fn new(gateway: Arc<dyn ProbeGateway>, policy: ProbePolicy, ledger: Arc<ValidationLedger>) -> Self {
        Self {
            gateway,
            policy,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<ValidationLedger> {
        &self.ledger
    }

    pub async fn validate(&self, candidate: &Candidate) -> ValidationResult {
        self.validate_expecting(candidate, None).await
    }

    /// Validate, additionally requiring `expected` (MAC, node id or name) to appear in the
    /// payload before the candidate counts as reachable.
    pub async fn validate_expecting(&self, candidate: &Candidate, expected: Option<&str>) -> ValidationResult {
        let mut args = candidate.probe_args();
        args.push("--info".to_string());
        let outcome = self.gateway.invoke(&args, self.policy).await;
        let result = classify(candidate, outcome, expected);

        match result.status {
            ValidationStatus::Reachable => info!(
                "validate: {} {} reachable ({})",
                candidate.kind, candidate.identifier, result.reason
            ),
            _ => info!(
                "validate: {} {} {:?}: {}",
                candidate.kind, candidate.identifier, result.status, result.reason
            ),
        }
        if !result.raw_output.is_empty() {
            debug!(
                "validate: {} output: {}",
                candidate.identifier,
                escape_log_capped(&result.raw_output, PROBE_PREVIEW_CHARS)
            );
        }
        self.ledger.record(&result);
        result
    }

    /// Validate every candidate concurrently; results come back in input order.
    pub async fn validate_all(&self, candidates: &[Candidate]) -> Vec<ValidationResult> {
        join_all(candidates.iter().map(|c| self.validate(c))).await
    }
}

/// Turn one probe outcome into a classified result.
pub fn classify(
    candidate: &Candidate,
    outcome: Result<ProbeResult, ProbeError>,
    expected: Option<&str>,
) -> ValidationResult {
    let mut result = ValidationResult {
        candidate: candidate.clone(),
        status: ValidationStatus::Unreachable,
        device_info: None,
        raw_output: String::new(),
        exit_code: None,
        timed_out: false,
        reason: String::new(),
        validated_at: Utc::now(),
    };

    let probe = match outcome {
        Ok(probe) => probe,
        Err(e) => {
            result.timed_out = matches!(e, ProbeError::Timeout { .. });
            result.reason = e.to_string();
            return result;
        }
    };
    result.exit_code = probe.exit_code;
    result.timed_out = probe.timed_out;
    result.raw_output = probe.stdout.clone();

    if !probe.success() {
        let detail = last_line(&probe.stderr);
        result.reason = if detail.is_empty() {
            format!("probe exited with {:?}", probe.exit_code)
        } else {
            format!("probe exited with {:?}: {}", probe.exit_code, detail)
        };
        return result;
    }

    let payload = match probe.json {
        Some(payload) if is_identifying(&payload) => payload,
        Some(_) => {
            result.status = ValidationStatus::Ambiguous;
            result.reason = "probe succeeded but the payload does not identify a node".to_string();
            return result;
        }
        None => {
            result.status = ValidationStatus::Ambiguous;
            result.reason = if probe.stdout.trim().is_empty() {
                "probe succeeded with empty output".to_string()
            } else {
                "probe succeeded but output is not JSON".to_string()
            };
            return result;
        }
    };

    let info = DeviceInfo::from_payload(&payload);
    if let Some(expected) = expected.map(str::trim).filter(|e| !e.is_empty()) {
        if !payload_mentions(&payload, expected) {
            result.status = ValidationStatus::Ambiguous;
            result.reason = format!("device answered but `{expected}` was not found in its payload");
            result.device_info = Some(info);
            return result;
        }
    }

    result.status = ValidationStatus::Reachable;
    result.reason = match info.label() {
        Some(label) => format!("Found {label}"),
        None => "Found a node payload".to_string(),
    };
    result.device_info = Some(info);
    result
}

/// `myInfo`/`my_info`/`myNodeNum`, `metadata.firmwareVersion` or a non-empty `nodes` collection.
pub fn is_identifying(payload: &Value) -> bool {
    if field(payload, &["myInfo", "my_info", "myNodeNum", "my_node_num"]).is_some() {
        return true;
    }
    if payload
        .get("metadata")
        .and_then(|m| field(m, &["firmwareVersion", "firmware_version"]))
        .is_some()
    {
        return true;
    }
    match payload.get("nodes") {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Array(list)) => !list.is_empty(),
        _ => false,
    }
}

/// Case-insensitive, separator-insensitive search for `expected` among the payload's values.
fn payload_mentions(payload: &Value, expected: &str) -> bool {
    let needle = normalize_ident(expected);
    if needle.is_empty() {
        return false;
    }
    let mut stack = vec![payload];
    while let Some(value) = stack.pop() {
        match value {
            Value::String(s) if normalize_ident(s) == needle => return true,
            Value::Number(n) if n.to_string() == needle => return true,
            Value::Array(items) => stack.extend(items.iter()),
            Value::Object(map) => {
                for (key, v) in map {
                    if normalize_ident(key) == needle {
                        return true;
                    }
                    stack.push(v);
                }
            }
            _ => {}
        }
    }
    false
}

fn normalize_ident(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ':' | '-' | '!' | ' ' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| value.get(*k)).filter(|v| !v.is_null())
}

fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    field(value, keys).and_then(Value::as_str).map(str::to_string)
}

/// The `user` object of the local node inside `nodes`, matched by id or number.
fn own_user<'a>(payload: &'a Value, node_id: Option<&str>, node_num: Option<u64>) -> Option<&'a Value> {
    let matches = |key: Option<&str>, node: &Value| -> bool {
        let user = node.get("user");
        let id = user.and_then(|u| u.get("id")).and_then(Value::as_str);
        let num = node.get("num").and_then(Value::as_u64);
        (node_id.is_some() && (key == node_id || id == node_id)) || (node_num.is_some() && num == node_num)
    };
    let node = match payload.get("nodes")? {
        Value::Object(map) => map
            .iter()
            .find(|&(k, n)| matches(Some(k.as_str()), n))
            .map(|(_, n)| n),
        Value::Array(list) => list.iter().find(|n| matches(None, *n)),
        _ => None,
    }?;
    Some(node.get("user").unwrap_or(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn ok(stdout: &str) -> Result<ProbeResult, ProbeError> {
        Ok(ProbeResult {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            json: crate::probe::extract_json(stdout),
            attempts: 1,
            ..Default::default()
        })
    }

    fn com7() -> Candidate {
        Candidate::serial("COM7")
    }

    #[test]
    fn exit_code_one_is_unreachable() {
        let probe = Ok(ProbeResult {
            exit_code: Some(1),
            stderr: "Error: could not open port COM7\n".to_string(),
            attempts: 1,
            ..Default::default()
        });
        let result = classify(&com7(), probe, None);
        assert_eq!(result.status, ValidationStatus::Unreachable);
        assert!(result.reason.contains("could not open port"));
    }

    #[test]
    fn timeout_and_launch_failure_are_unreachable() {
        let timeout = classify(
            &com7(),
            Err(ProbeError::Timeout {
                attempts: 3,
                timeout: Duration::from_secs(1),
            }),
            None,
        );
        assert_eq!(timeout.status, ValidationStatus::Unreachable);
        assert!(timeout.timed_out);

        let launch = classify(
            &com7(),
            Err(ProbeError::LaunchFailure {
                command: "meshtastic".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
            None,
        );
        assert_eq!(launch.status, ValidationStatus::Unreachable);
        assert!(!launch.timed_out);
    }

    #[test]
    fn empty_or_anonymous_output_is_ambiguous() {
        assert_eq!(classify(&com7(), ok(""), None).status, ValidationStatus::Ambiguous);
        assert_eq!(
            classify(&com7(), ok("Connected to radio"), None).status,
            ValidationStatus::Ambiguous
        );
        assert_eq!(
            classify(&com7(), ok(r#"{"nodes": {}}"#), None).status,
            ValidationStatus::Ambiguous
        );
    }

    #[test]
    fn info_payload_is_reachable_with_device_info() {
        let out = r#"My info: {"myNodeNum": 2665937968}
Metadata: {"firmwareVersion": "2.3.2", "hwModel": "TBEAM"}
Nodes in mesh: {"!9ee6fc30": {"num": 2665937968, "user": {"id": "!9ee6fc30", "longName": "Base Camp", "shortName": "BC01", "macaddr": "9c:13:9e:e6:fc:30"}}}"#;
        let result = classify(&com7(), ok(out), None);
        assert_eq!(result.status, ValidationStatus::Reachable);
        let info = result.device_info.unwrap();
        assert_eq!(info.node_id.as_deref(), Some("!9ee6fc30"));
        assert_eq!(info.long_name.as_deref(), Some("Base Camp"));
        assert_eq!(info.firmware_version.as_deref(), Some("2.3.2"));
        assert_eq!(info.hw_model.as_deref(), Some("TBEAM"));
        assert_eq!(result.reason, "Found Base Camp");
    }

    #[test]
    fn expected_identifier_must_appear() {
        let payload = json!({"nodes": [{"id": "9C:13:9E:E8:37:71", "name": "Test"}]}).to_string();
        let ble = Candidate::bluetooth("9C:13:9E:E8:37:71");

        let hit = classify(&ble, ok(&payload), Some("9c139ee83771"));
        assert_eq!(hit.status, ValidationStatus::Reachable);

        let miss = classify(&ble, ok(&payload), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(miss.status, ValidationStatus::Ambiguous);
        assert!(miss.device_info.is_some());
    }

    #[test]
    fn ledger_entry_ages_out() {
        let now = Utc::now();
        let entry = LedgerEntry {
            status: ValidationStatus::Reachable,
            validated_at: now - ChronoDuration::seconds(700),
            device_info: None,
        };
        assert!(!entry.authorizes_commit(ChronoDuration::seconds(600), now));
        assert!(entry.authorizes_commit(ChronoDuration::seconds(900), now));

        let ambiguous = LedgerEntry {
            status: ValidationStatus::Ambiguous,
            validated_at: now,
            device_info: None,
        };
        assert!(!ambiguous.authorizes_commit(ChronoDuration::seconds(600), now));
    }
}
