// crates/ecmaster-rs/src/pdo/assign.rs
use crate::access::{EngineAccess, SlaveRef};
use crate::error::{ConfigurationError, EngineError};
use crate::od::{IDX_SM2_RXPDO_ASSIGN, IDX_SM3_TXPDO_ASSIGN, SUBIDX_NUMBER_OF_ENTRIES};
use log::{debug, trace};

/// Installs the SM2 (RxPDO) and SM3 (TxPDO) assignment lists on one device.
///
/// Both counts are zeroed first, each list is written at sub-indices 1..N,
/// and each count is restored only after its list is complete. The first
/// rejected write aborts the rest.
pub fn apply(
    engine: &mut EngineAccess<'_>,
    slave: SlaveRef,
    rx_pdo: &[u16],
    tx_pdo: &[u16],
) -> Result<(), ConfigurationError> {
    let rx_count = entry_count(slave, IDX_SM2_RXPDO_ASSIGN, rx_pdo)?;
    let tx_count = entry_count(slave, IDX_SM3_TXPDO_ASSIGN, tx_pdo)?;

    let mut write = |index: u16, sub_index: u8, data: &[u8]| -> Result<(), ConfigurationError> {
        trace!(
            "[PDO] Slave {}: write {index:#06X}:{sub_index:02X} = {data:02X?}",
            slave.index
        );
        engine
            .sdo_write(slave, index, sub_index, data)
            .map_err(|cause| ConfigurationError::PdoWrite {
                slave: slave.index,
                index,
                sub_index,
                cause,
            })
    };

    write(IDX_SM2_RXPDO_ASSIGN, SUBIDX_NUMBER_OF_ENTRIES, &[0])?;
    write(IDX_SM3_TXPDO_ASSIGN, SUBIDX_NUMBER_OF_ENTRIES, &[0])?;
    write_list(&mut write, IDX_SM2_RXPDO_ASSIGN, rx_pdo, rx_count)?;
    write_list(&mut write, IDX_SM3_TXPDO_ASSIGN, tx_pdo, tx_count)?;

    debug!(
        "[PDO] Slave {}: assigned RxPDO {:04X?}, TxPDO {:04X?}",
        slave.index, rx_pdo, tx_pdo
    );
    Ok(())
}

fn entry_count(slave: SlaveRef, sm_index: u16, pdos: &[u16]) -> Result<u8, ConfigurationError> {
    u8::try_from(pdos.len()).map_err(|_| ConfigurationError::PdoWrite {
        slave: slave.index,
        index: sm_index,
        sub_index: SUBIDX_NUMBER_OF_ENTRIES,
        cause: EngineError::Io(format!("{} PDOs exceed 255 assignment entries", pdos.len())),
    })
}

fn write_list(
    write: &mut impl FnMut(u16, u8, &[u8]) -> Result<(), ConfigurationError>,
    sm_index: u16,
    pdos: &[u16],
    count: u8,
) -> Result<(), ConfigurationError> {
    for (sub_index, pdo) in (1..=count).zip(pdos) {
        write(sm_index, sub_index, &pdo.to_le_bytes())?;
    }
    write(sm_index, SUBIDX_NUMBER_OF_ENTRIES, &[count])
}
