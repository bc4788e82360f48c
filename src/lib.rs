//! # Meshdock - Device Onboarding and Telemetry Cache for Meshtastic Radios
//!
//! Meshdock brings a serial or Bluetooth Meshtastic radio under management through a
//! discover → validate → commit pipeline with a one-step undo, and serves node telemetry
//! from the slow `meshtastic` CLI through a single-flight read-through cache.
//!
//! ## Features
//!
//! - **Discovery**: serial port enumeration plus a time-bounded BLE scan, deduplicated and never failing as a whole.
//! - **Validation**: one read-only `--info` probe per candidate, classified reachable / ambiguous / unreachable.
//! - **Commit with Undo**: the active device and its rollback snapshot are written in one compare-and-swap.
//! - **Telemetry Cache**: at most one CLI invocation per fingerprint per freshness window, stale fallback on failure.
//! - **Redis Mirroring**: optional shared cache backend, selected once at startup with a local fallback.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshdock::config::Config;
//! use meshdock::onboard::Onboarding;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let onboarding = Onboarding::open(&config).await?;
//!
//!     // Dry-run first: shows what would be committed without touching the store
//!     let summary = onboarding.auto_connect(true, None).await?;
//!     println!("would choose {:?}", summary.chosen.map(|c| c.identifier));
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`probe`] - bounded, retried invocations of the `meshtastic` CLI
//! - [`discovery`] - serial and BLE candidate enumeration
//! - [`validator`] - candidate classification and the validation ledger
//! - [`store`] - versioned device state (sled or in-memory)
//! - [`commit`] / [`undo`] - transactional device binding and rollback
//! - [`cache`] / [`telemetry`] - read-through telemetry cache and node parsing
//! - [`onboard`] - the assembled pipeline and auto-connect
//! - [`config`] - configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//! │  Discovery  │ → │  Validator  │ → │ Commit/Undo │ → RecordStore
//! └─────────────┘   └─────────────┘   └─────────────┘
//!        │                 │
//! ┌──────────────────────────────┐    ┌─────────────────┐
//! │      Probe Gateway (CLI)     │ ←  │ Telemetry Cache │ ← readers
//! └──────────────────────────────┘    └─────────────────┘
//! ```

/// Log to the `audit` target (routed to `logging.audit_file` by the binary).
macro_rules! audit {
    ($($arg:tt)*) => { log::info!(target: "audit", $($arg)*); };
}

pub mod cache;
pub mod commit;
pub mod config;
pub mod discovery;
pub mod logutil;
pub mod onboard;
pub mod probe;
pub mod store;
pub mod telemetry;
pub mod undo;
pub mod validator;
