// crates/ecmaster-rs/src/discovery.rs
//! One-shot bus inspection.
//!
//! `discover` opens the adapter, scans the bus, builds the I/O map and reads
//! identity and PDO information from every device, then closes the adapter
//! again. It never requests a state past PRE-OP/SAFE-OP, so it is safe to run
//! against a machine that must not move. Object-dictionary reads are
//! best-effort: a failing read leaves its field empty.

use crate::access::EngineAccess;
use crate::adapter::resolve_adapter;
use crate::error::{ConfigurationError, MasterError};
use crate::hal::{EngineFactory, FieldbusEngine};
use crate::od;
use crate::pdo::{self, PdoAssignment, PdoMapping, PdoMappingEntry};
use log::{debug, info};
use serde::Serialize;

/// One PDO and the objects it maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PdoDescription {
    /// `"0x1A00"` style.
    pub pdo_index: String,
    pub objects: Vec<PdoMappingEntry>,
}

/// Everything `discover` learns about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveDescription {
    pub index: u16,
    pub name: String,
    pub vendor_id: String,
    pub product_code: String,
    pub revision: String,
    pub state: String,
    pub output_bytes: usize,
    pub input_bytes: usize,
    pub device_name: String,
    pub hw_version: String,
    pub fw_version: String,
    pub rx_pdo: Vec<PdoDescription>,
    pub tx_pdo: Vec<PdoDescription>,
    pub available_rx_pdo: Vec<PdoDescription>,
    pub available_tx_pdo: Vec<PdoDescription>,
}

/// Scans the bus behind `adapter` and describes every device found.
///
/// When `mapping` is given, its assignment is written to each device before
/// the I/O map is built so the reported sizes reflect it (write failures are
/// ignored). An empty bus yields an empty list.
pub fn discover<F: EngineFactory + ?Sized>(
    factory: &F,
    adapter: Option<&str>,
    mapping: Option<&PdoMapping>,
) -> Result<Vec<SlaveDescription>, MasterError> {
    let adapter = resolve_adapter(factory, adapter)?;
    info!("Discovering slaves on {}", adapter.name);
    let mut engine = factory.open(&adapter).map_err(|e| {
        MasterError::connection(format!("Failed to open adapter '{}': {e}", adapter.name))
    })?;
    let result = scan(engine.as_mut(), mapping);
    engine.close();
    result
}

fn scan(
    engine: &mut dyn FieldbusEngine,
    mapping: Option<&PdoMapping>,
) -> Result<Vec<SlaveDescription>, MasterError> {
    let count = engine.config_init()?;
    if count == 0 {
        info!("No slaves found");
        return Ok(Vec::new());
    }

    if let Some(mapping) = mapping {
        let fallback = PdoAssignment::default();
        let mut access = EngineAccess::new(engine, 0);
        for index in 0..count {
            let assignment = mapping.resolve(index, &fallback);
            let applied = access.slave(index).map_err(MasterError::from).and_then(|slave| {
                pdo::apply(&mut access, slave, &assignment.rx_pdo, &assignment.tx_pdo)
                    .map_err(MasterError::from)
            });
            if let Err(e) = applied {
                debug!("Slave {index}: PDO assignment skipped: {e}");
            }
        }
    }

    if let Err(cause) = engine.config_map() {
        return Err(ConfigurationError::IoMap {
            cause,
            report: crate::bus::StateReport::collect(engine),
        }
        .into());
    }

    let mut slaves = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        slaves.push(describe(engine, index)?);
    }
    info!("Discovered {} slave(s)", slaves.len());
    Ok(slaves)
}

fn describe(engine: &mut dyn FieldbusEngine, index: u16) -> Result<SlaveDescription, MasterError> {
    let info = engine.slave_info(index)?;
    Ok(SlaveDescription {
        index,
        name: info.name,
        vendor_id: format!("0x{:08X}", info.vendor_id),
        product_code: format!("0x{:08X}", info.product_code),
        revision: format!("0x{:08X}", info.revision),
        state: info.state.to_string(),
        output_bytes: info.output_bytes,
        input_bytes: info.input_bytes,
        device_name: read_identity_string(engine, index, od::IDX_MANUFACT_DEV_NAME_VS),
        hw_version: read_identity_string(engine, index, od::IDX_MANUFACT_HW_VERSION_VS),
        fw_version: read_identity_string(engine, index, od::IDX_MANUFACT_SW_VERSION_VS),
        rx_pdo: read_assignment(engine, index, od::IDX_SM2_RXPDO_ASSIGN),
        tx_pdo: read_assignment(engine, index, od::IDX_SM3_TXPDO_ASSIGN),
        available_rx_pdo: probe_range(engine, index, od::RXPDO_PROBE_RANGE),
        available_tx_pdo: probe_range(engine, index, od::TXPDO_PROBE_RANGE),
    })
}

/// Devices disagree on the upload size they accept for visible strings, so
/// several sizes are tried and the longest text wins.
fn read_identity_string(engine: &mut dyn FieldbusEngine, slave: u16, index: u16) -> String {
    let mut best = String::new();
    for max_len in [Some(64), Some(32), Some(16), None] {
        let Ok(raw) = engine.sdo_read(slave, index, 0, max_len) else {
            continue;
        };
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches('\0').trim();
        if text.len() > best.len() {
            best = text.to_string();
        }
    }
    best
}

fn read_count(engine: &mut dyn FieldbusEngine, slave: u16, index: u16) -> Option<u8> {
    engine
        .sdo_read(slave, index, od::SUBIDX_NUMBER_OF_ENTRIES, None)
        .ok()
        .map(|raw| raw.first().copied().unwrap_or(0))
}

fn read_assignment(engine: &mut dyn FieldbusEngine, slave: u16, sm_index: u16) -> Vec<PdoDescription> {
    let Some(count) = read_count(engine, slave, sm_index) else {
        return Vec::new();
    };
    (1..=count)
        .filter_map(|sub| {
            let raw = engine.sdo_read(slave, sm_index, sub, Some(2)).ok()?;
            let pdo_index = u16::from_le_bytes([*raw.first()?, *raw.get(1)?]);
            Some(PdoDescription {
                pdo_index: format!("0x{pdo_index:04X}"),
                objects: read_mapping(engine, slave, pdo_index),
            })
        })
        .collect()
}

fn read_mapping(engine: &mut dyn FieldbusEngine, slave: u16, pdo_index: u16) -> Vec<PdoMappingEntry> {
    let Some(count) = read_count(engine, slave, pdo_index) else {
        return Vec::new();
    };
    (1..=count)
        .filter_map(|sub| {
            let raw = engine.sdo_read(slave, pdo_index, sub, Some(4)).ok()?;
            let bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
            Some(PdoMappingEntry::from_u32(u32::from_le_bytes(bytes)))
        })
        .collect()
}

fn probe_range(
    engine: &mut dyn FieldbusEngine,
    slave: u16,
    range: std::ops::RangeInclusive<u16>,
) -> Vec<PdoDescription> {
    range
        .filter(|&pdo_index| read_count(engine, slave, pdo_index).is_some_and(|n| n > 0))
        .collect::<Vec<u16>>()
        .into_iter()
        .map(|pdo_index| PdoDescription {
            pdo_index: format!("0x{pdo_index:04X}"),
            objects: read_mapping(engine, slave, pdo_index),
        })
        .collect()
}
