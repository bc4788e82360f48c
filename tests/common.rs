//! Test utilities & fixtures.
//! A scripted stand-in for the `meshtastic` CLI plus a fixed serial port list.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshdock::config::{Config, StoreBackend};
use meshdock::discovery::{Candidate, PortLister};
use meshdock::probe::{extract_json, ProbeError, ProbeGateway, ProbePolicy, ProbeResult};

/// Realistic `--info` output for a T-Beam named "Base Camp".
pub const INFO_OUTPUT: &str = r#"Connected to radio

Owner: Base Camp (BC01)
My info: { "myNodeNum": 2665937968, "rebootCount": 4 }
Metadata: { "firmwareVersion": "2.3.2.63df972", "hwModel": "TBEAM" }

Nodes in mesh: {
  "!9ee6fc30": {
    "num": 2665937968,
    "user": { "id": "!9ee6fc30", "longName": "Base Camp", "shortName": "BC01", "macaddr": "9c:13:9e:e6:fc:30", "hwModel": "TBEAM" },
    "position": { "latitude": 47.3977, "longitude": 8.5431, "altitude": 408 },
    "deviceMetrics": { "batteryLevel": 87 },
    "lastHeard": 1718000000
  },
  "!a1b2c3d4": {
    "num": 2712847316,
    "user": { "id": "!a1b2c3d4", "longName": "Ridge Relay", "shortName": "RR" },
    "snr": 5.5,
    "hopsAway": 1
  }
}
"#;

#[derive(Clone)]
#[allow(dead_code)]
pub enum Reply {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    Timeout,
    Launch,
}

#[allow(dead_code)]
impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Reply::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Reply::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Answers by the joined argument list; unknown invocations exit 1.
#[derive(Default)]
#[allow(dead_code)]
pub struct ScriptedGateway {
    replies: Mutex<HashMap<String, Reply>>,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
}

#[allow(dead_code)]
impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, args: &str, reply: Reply) {
        self.replies.lock().unwrap().insert(args.to_string(), reply);
    }

    /// Script `--info` for a candidate's probe arguments.
    pub fn on_info(&self, candidate: &Candidate, reply: Reply) {
        let mut args = candidate.probe_args();
        args.push("--info".to_string());
        self.on(&args.join(" "), reply);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeGateway for ScriptedGateway {
    async fn invoke(&self, args: &[String], policy: ProbePolicy) -> Result<ProbeResult, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&args.join(" "))
            .cloned()
            .unwrap_or_else(|| Reply::fail(1, "Error: no device found"));
        match reply {
            Reply::Exit { code, stdout, stderr } => Ok(ProbeResult {
                exit_code: Some(code),
                json: extract_json(&stdout),
                stdout,
                stderr,
                timed_out: false,
                attempts: 1,
            }),
            Reply::Timeout => Err(ProbeError::Timeout {
                attempts: policy.max_retries + 1,
                timeout: policy.timeout,
            }),
            Reply::Launch => Err(ProbeError::LaunchFailure {
                command: "meshtastic".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }
}

#[allow(dead_code)]
pub struct FixedPorts(pub Vec<Candidate>);

impl PortLister for FixedPorts {
    fn list_ports(&self) -> anyhow::Result<Vec<Candidate>> {
        Ok(self.0.clone())
    }
}

#[allow(dead_code)]
pub struct BrokenPorts;

impl PortLister for BrokenPorts {
    fn list_ports(&self) -> anyhow::Result<Vec<Candidate>> {
        Err(anyhow::anyhow!("permission denied enumerating /dev"))
    }
}

/// In-memory store, no Redis, short timeouts.
#[allow(dead_code)]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.backend = StoreBackend::Memory;
    config.cache.redis_url = None;
    config.probe.timeout_seconds = 1;
    config.probe.max_retries = 0;
    config.discovery.ble_scan_seconds = 1;
    config
}
