// crates/ecmaster-rs/src/pdo/mapping.rs
use crate::config::{AssignmentEntry, MasterDocument};
use crate::error::ConfigurationError;
use crate::od;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::Path;

/// RxPDO assigned to SM2 when nothing else is configured.
pub const DEFAULT_RX_PDO: &[u16] = &[od::IDX_RXPDO_MAPPING_START];
/// TxPDO assigned to SM3 when nothing else is configured.
pub const DEFAULT_TX_PDO: &[u16] = &[od::IDX_TXPDO_MAPPING_START];

/// Ordered receive/transmit PDO lists for one device. List order is the
/// on-wire field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoAssignment {
    pub rx_pdo: Vec<u16>,
    pub tx_pdo: Vec<u16>,
}

impl PdoAssignment {
    pub fn new(rx_pdo: impl Into<Vec<u16>>, tx_pdo: impl Into<Vec<u16>>) -> Self {
        Self {
            rx_pdo: rx_pdo.into(),
            tx_pdo: tx_pdo.into(),
        }
    }

    fn from_entry(entry: &AssignmentEntry) -> Self {
        let list = |l: &Option<Vec<crate::config::PdoIndex>>| {
            l.iter().flatten().map(|i| i.0).collect::<Vec<_>>()
        };
        Self {
            rx_pdo: list(&entry.rx_pdo),
            tx_pdo: list(&entry.tx_pdo),
        }
    }

    fn to_entry(&self) -> AssignmentEntry {
        AssignmentEntry::new(&self.rx_pdo, &self.tx_pdo)
    }
}

impl Default for PdoAssignment {
    /// The built-in `[0x1600]` / `[0x1A00]` assignment.
    fn default() -> Self {
        Self::new(DEFAULT_RX_PDO, DEFAULT_TX_PDO)
    }
}

/// Per-device assignments plus an optional wildcard default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdoMapping {
    pub default: Option<PdoAssignment>,
    pub slaves: BTreeMap<u16, PdoAssignment>,
}

impl PdoMapping {
    /// Extracts the PDO sections of a persisted document.
    pub fn from_document(doc: &MasterDocument) -> Result<Self, ConfigurationError> {
        let default = doc
            .default
            .as_ref()
            .filter(|e| !e.is_empty())
            .map(PdoAssignment::from_entry);

        let mut slaves = BTreeMap::new();
        for (key, entry) in &doc.slaves {
            let index = key.trim().parse::<u16>().map_err(|_| {
                ConfigurationError::Document(format!("invalid slave index '{key}'"))
            })?;
            slaves.insert(index, PdoAssignment::from_entry(entry));
        }
        Ok(Self { default, slaves })
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        Self::from_document(&MasterDocument::from_json(text)?)
    }

    /// Writes the PDO sections into `doc`, replacing any existing ones.
    pub fn store_into(&self, doc: &mut MasterDocument) {
        doc.default = self.default.as_ref().map(PdoAssignment::to_entry);
        doc.slaves = self
            .slaves
            .iter()
            .map(|(i, a)| (i.to_string(), a.to_entry()))
            .collect();
    }

    /// The per-index entry, else the default entry, else `fallback`.
    pub fn resolve(&self, index: u16, fallback: &PdoAssignment) -> PdoAssignment {
        self.slaves
            .get(&index)
            .or(self.default.as_ref())
            .unwrap_or(fallback)
            .clone()
    }
}

/// Reads the PDO sections of the document at `path`.
///
/// A failure here means "use engine defaults"; callers log it and carry on
/// without a mapping.
pub fn load_mapping(path: impl AsRef<Path>) -> Result<PdoMapping, ConfigurationError> {
    let path = path.as_ref();
    let mapping = PdoMapping::from_document(&MasterDocument::load(path)?)?;
    debug!(
        "[PDO] Loaded {} slave entries from {} (default: {})",
        mapping.slaves.len(),
        path.display(),
        mapping.default.is_some()
    );
    Ok(mapping)
}

/// Like [`load_mapping`] but degrades to `None` with a warning.
pub fn load_mapping_or_defaults(path: impl AsRef<Path>) -> Option<PdoMapping> {
    match load_mapping(path.as_ref()) {
        Ok(mapping) => Some(mapping),
        Err(e) => {
            warn!("[PDO] {e}; using built-in PDO defaults");
            None
        }
    }
}

/// Resolves the assignment for device `index`, never failing.
pub fn resolve(mapping: Option<&PdoMapping>, index: u16, fallback: &PdoAssignment) -> PdoAssignment {
    match mapping {
        Some(m) => m.resolve(index, fallback),
        None => fallback.clone(),
    }
}
