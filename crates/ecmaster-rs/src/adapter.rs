// crates/ecmaster-rs/src/adapter.rs
//! Network adapter enumeration and resolution.

use crate::error::{EngineError, MasterError};
use serde::{Deserialize, Serialize};

/// A host network interface able to reach the fieldbus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Identifier handed to the engine when opening.
    pub name: String,
    /// Human readable description, possibly empty.
    pub description: String,
}

impl AdapterInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Something that can list the host's network adapters.
pub trait AdapterSource {
    fn adapters(&self) -> Result<Vec<AdapterInfo>, EngineError>;
}

/// Lists the adapters known to `source`.
pub fn list_adapters<S: AdapterSource + ?Sized>(source: &S) -> Result<Vec<AdapterInfo>, MasterError> {
    source
        .adapters()
        .map_err(|e| MasterError::connection(format!("Failed to enumerate adapters: {e}")))
}

/// Picks the adapter named `wanted`, or the first adapter when `wanted` is `None`.
pub fn resolve_adapter<S: AdapterSource + ?Sized>(
    source: &S,
    wanted: Option<&str>,
) -> Result<AdapterInfo, MasterError> {
    let adapters = list_adapters(source)?;
    if adapters.is_empty() {
        return Err(MasterError::connection("No network adapters found"));
    }

    let Some(wanted) = wanted else {
        // `adapters` is non-empty here.
        return Ok(adapters[0].clone());
    };

    if let Some(found) = adapters.iter().find(|a| a.name == wanted) {
        return Ok(found.clone());
    }

    let available = adapters
        .iter()
        .map(|a| format!("  {} - {}", a.name, a.description))
        .collect::<Vec<_>>()
        .join("\n");
    Err(MasterError::connection(format!(
        "Adapter '{wanted}' not found. Available:\n{available}"
    )))
}

/// Description fragments of adapters that can never carry EtherCAT frames.
const SKIPPED_DESCRIPTIONS: &[&str] = &[
    "wi-fi",
    "wifi",
    "bluetooth",
    "loopback",
    "wan miniport",
    "hyper-v",
];

/// Linux interface name prefixes of loopback, wireless or virtual links.
const SKIPPED_NAME_PREFIXES: &[&str] = &["lo", "wlan", "wlp", "docker", "br-", "veth", "virbr"];

/// Whether an adapter is a plausible wired fieldbus port.
pub fn is_fieldbus_candidate(adapter: &AdapterInfo) -> bool {
    let description = adapter.description.to_lowercase();
    if SKIPPED_DESCRIPTIONS.iter().any(|s| description.contains(s)) {
        return false;
    }
    !SKIPPED_NAME_PREFIXES
        .iter()
        .any(|p| adapter.name.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdapters(Vec<AdapterInfo>);

    impl AdapterSource for FixedAdapters {
        fn adapters(&self) -> Result<Vec<AdapterInfo>, EngineError> {
            Ok(self.0.clone())
        }
    }

    fn two_ports() -> FixedAdapters {
        FixedAdapters(vec![
            AdapterInfo::new("eth0", "Onboard"),
            AdapterInfo::new("eth1", "PCIe NIC"),
        ])
    }

    #[test]
    fn resolves_first_adapter_when_unnamed() {
        let found = resolve_adapter(&two_ports(), None).unwrap();
        assert_eq!(found.name, "eth0");
    }

    #[test]
    fn resolves_named_adapter() {
        let found = resolve_adapter(&two_ports(), Some("eth1")).unwrap();
        assert_eq!(found.description, "PCIe NIC");
    }

    #[test]
    fn unknown_adapter_lists_available() {
        let err = resolve_adapter(&two_ports(), Some("eth9")).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("eth9"));
        assert!(text.contains("eth0 - Onboard"));
        assert!(text.contains("eth1 - PCIe NIC"));
    }

    #[test]
    fn empty_host_is_a_connection_error() {
        let err = resolve_adapter(&FixedAdapters(Vec::new()), None).unwrap_err();
        assert!(matches!(err, MasterError::Connection { .. }));
    }

    #[test]
    fn filters_virtual_and_wireless_links() {
        let keep = AdapterInfo::new("enp3s0", "");
        assert!(is_fieldbus_candidate(&keep));
        for name in ["lo", "wlp2s0", "docker0", "br-5f2a", "veth12", "virbr0"] {
            assert!(!is_fieldbus_candidate(&AdapterInfo::new(name, "")), "{name}");
        }
        let bt = AdapterInfo::new(r"\Device\NPF_{X}", "Bluetooth Device (PAN)");
        assert!(!is_fieldbus_candidate(&bt));
    }
}
