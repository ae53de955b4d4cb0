// crates/ecmaster-rs/src/config.rs
//! Bus configuration and the persisted JSON document.
//!
//! The document carries an optional `network` section (adapter and cycle
//! time) next to the PDO sections consumed by [`crate::pdo`]:
//!
//! ```json
//! {
//!   "network": { "adapter": "eth1", "cycle_ms": 1.0 },
//!   "default": { "rx_pdo": ["0x1600"], "tx_pdo": ["0x1A00"] },
//!   "slaves":  { "0": { "rx_pdo": ["0x1600", "0x1605"], "tx_pdo": [6656] } }
//! }
//! ```

use crate::error::ConfigurationError;
use core::fmt;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Cycle time of the PDO update loop when none is configured.
pub const DEFAULT_CYCLE_TIME: Duration = Duration::from_millis(10);

/// Every time constant of the cyclic engine and the recovery state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Period of the frame exchange loop.
    pub frame_period: Duration,
    /// Bounded wait for the inbound process-data frame.
    pub receive_timeout: Duration,
    /// Bounded wait for aggregate SAFE-OP and OP during `open`.
    pub state_timeout: Duration,
    /// Sleep of the frame and PDO loops while a reconnection is running.
    pub reconnect_poll: Duration,
    /// Period of the health-check loop.
    pub health_period: Duration,
    /// Sleep of the health-check loop while a reconnection is running.
    pub health_pause: Duration,
    /// Consecutive failed health checks that trigger a full reconnection.
    pub health_threshold: u32,
    /// Bound on a single device reconfigure or recover during health checks.
    pub recovery_timeout: Duration,
    /// Pause between tearing down the old engine and the first attempt.
    pub reconnect_settle: Duration,
    /// How long one reconnection attempt pumps frames waiting for OP.
    pub reconnect_deadline: Duration,
    /// Pump interval inside a reconnection attempt.
    pub reconnect_pump: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Upper bound on waiting for the loop threads to finish on close.
    pub join_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            frame_period: Duration::from_millis(1),
            receive_timeout: Duration::from_millis(10),
            state_timeout: Duration::from_millis(50),
            reconnect_poll: Duration::from_millis(50),
            health_period: Duration::from_millis(300),
            health_pause: Duration::from_millis(100),
            health_threshold: 7,
            recovery_timeout: Duration::from_millis(500),
            reconnect_settle: Duration::from_millis(100),
            reconnect_deadline: Duration::from_secs(5),
            reconnect_pump: Duration::from_millis(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Settings of one bus manager instance.
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Adapter name; `None` picks the first adapter found.
    pub adapter: Option<String>,
    /// Period of the PDO update loop.
    pub cycle_time: Duration,
    /// Rebuild the bus automatically after persistent health-check failures.
    pub auto_reconnect: bool,
    pub timing: Timing,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            cycle_time: DEFAULT_CYCLE_TIME,
            auto_reconnect: true,
            timing: Timing::default(),
        }
    }
}

impl BusConfig {
    /// Fills the adapter and cycle time from a persisted `network` section
    /// where the caller left them unset.
    pub fn apply_network(&mut self, network: &NetworkSection) {
        if self.adapter.is_none() {
            self.adapter = network.adapter.clone().filter(|a| !a.is_empty());
        }
        if self.cycle_time == DEFAULT_CYCLE_TIME {
            if let Some(cycle) = network.cycle_time() {
                self.cycle_time = cycle;
            }
        }
    }
}

/// A 16-bit object-dictionary index as it appears in the document:
/// `"0x1600"`, `"5632"` or `5632` on input, always `"0x1600"` on output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PdoIndex(pub u16);

impl PdoIndex {
    pub fn parse(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => trimmed.parse::<u16>(),
        };
        parsed
            .map(PdoIndex)
            .map_err(|e| format!("invalid PDO index '{text}': {e}"))
    }
}

impl fmt::Display for PdoIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl Serialize for PdoIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct PdoIndexVisitor;

impl Visitor<'_> for PdoIndexVisitor {
    type Value = PdoIndex;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 16-bit index as integer or \"0x\"-prefixed string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<PdoIndex, E> {
        u16::try_from(v)
            .map(PdoIndex)
            .map_err(|_| E::custom(format!("PDO index {v} exceeds 0xFFFF")))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<PdoIndex, E> {
        u16::try_from(v)
            .map(PdoIndex)
            .map_err(|_| E::custom(format!("PDO index {v} out of range")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<PdoIndex, E> {
        PdoIndex::parse(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PdoIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PdoIndexVisitor)
    }
}

/// `rx_pdo` / `tx_pdo` lists of one document entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_pdo: Option<Vec<PdoIndex>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_pdo: Option<Vec<PdoIndex>>,
}

impl AssignmentEntry {
    pub fn new(rx: &[u16], tx: &[u16]) -> Self {
        Self {
            rx_pdo: Some(rx.iter().copied().map(PdoIndex).collect()),
            tx_pdo: Some(tx.iter().copied().map(PdoIndex).collect()),
        }
    }

    /// `{}` carries no assignment at all.
    pub fn is_empty(&self) -> bool {
        self.rx_pdo.is_none() && self.tx_pdo.is_none()
    }
}

/// The `network` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_ms: Option<f64>,
}

impl NetworkSection {
    pub fn new(adapter: Option<String>, cycle_time: Duration) -> Self {
        Self {
            adapter,
            cycle_ms: Some(cycle_time.as_micros() as f64 / 1000.0),
        }
    }

    /// The configured cycle time, when it is a positive finite number of milliseconds.
    pub fn cycle_time(&self) -> Option<Duration> {
        self.cycle_ms
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
    }
}

/// The whole persisted document. Unknown top-level keys survive a load/save cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<AssignmentEntry>,
    /// Per-device entries keyed by the decimal device index.
    #[serde(default)]
    pub slaves: BTreeMap<String, AssignmentEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MasterDocument {
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(text).map_err(|e| ConfigurationError::Document(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Document(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// Loads `path`, or returns an empty document when it does not exist yet.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigurationError> {
        serde_json::to_string_pretty(self)
            .map(|mut s| {
                s.push('\n');
                s
            })
            .map_err(|e| ConfigurationError::Document(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigurationError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)
            .map_err(|e| ConfigurationError::Document(format!("{}: {e}", path.display())))
    }

    pub fn set_slave(&mut self, index: u16, entry: AssignmentEntry) {
        self.slaves.insert(index.to_string(), entry);
    }

    /// Merges an update: every slave entry in `update` replaces the stored
    /// one with the same key, and a present `network` section replaces the
    /// stored one. Other stored entries are kept.
    pub fn merge(&mut self, update: MasterDocument) {
        self.slaves.extend(update.slaves);
        if update.network.is_some() {
            self.network = update.network;
        }
    }
}
