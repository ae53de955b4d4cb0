// crates/ecmaster-rs/src/od.rs
//! Well-known CoE object dictionary indices used by the bus manager,
//! following the `IDX_` / `SUBIDX_` naming convention.

use core::ops::RangeInclusive;

// 0x10xx: General Communication
pub const IDX_DEVICE_TYPE_U32: u16 = 0x1000;
pub const IDX_MANUFACT_DEV_NAME_VS: u16 = 0x1008;
pub const IDX_MANUFACT_HW_VERSION_VS: u16 = 0x1009;
pub const IDX_MANUFACT_SW_VERSION_VS: u16 = 0x100A;

// 0x16xx / 0x1Axx: PDO Mapping Parameters
pub const IDX_RXPDO_MAPPING_START: u16 = 0x1600;
pub const IDX_TXPDO_MAPPING_START: u16 = 0x1A00;

/// Mapping objects probed when cataloguing a device's available PDOs.
pub const RXPDO_PROBE_RANGE: RangeInclusive<u16> =
    IDX_RXPDO_MAPPING_START..=IDX_RXPDO_MAPPING_START + 0x0F;
pub const TXPDO_PROBE_RANGE: RangeInclusive<u16> =
    IDX_TXPDO_MAPPING_START..=IDX_TXPDO_MAPPING_START + 0x0F;

// 0x1Cxx: Sync Manager PDO assignment
pub const IDX_SM2_RXPDO_ASSIGN: u16 = 0x1C12;
pub const IDX_SM3_TXPDO_ASSIGN: u16 = 0x1C13;

/// Sub-index 0 of every array/record: NumberOfEntries.
pub const SUBIDX_NUMBER_OF_ENTRIES: u8 = 0;
