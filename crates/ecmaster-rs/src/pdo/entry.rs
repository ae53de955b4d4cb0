// crates/ecmaster-rs/src/pdo/entry.rs
use core::fmt;
use serde::{Serialize, Serializer};

/// One object mapped into a PDO, parsed from a UNSIGNED32 mapping value:
/// index in bits 31..16, sub-index in bits 15..8, bit length in bits 7..0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMappingEntry {
    pub index: u16,
    pub sub_index: u8,
    pub length_bits: u8,
}

impl PdoMappingEntry {
    pub fn from_u32(value: u32) -> Self {
        Self {
            index: (value >> 16) as u16,
            sub_index: ((value >> 8) & 0xFF) as u8,
            length_bits: (value & 0xFF) as u8,
        }
    }

    pub fn to_u32(&self) -> u32 {
        (u32::from(self.index) << 16) | (u32::from(self.sub_index) << 8) | u32::from(self.length_bits)
    }
}

impl fmt::Display for PdoMappingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:04X}:{:02X} ({} bit)",
            self.index, self.sub_index, self.length_bits
        )
    }
}

impl Serialize for PdoMappingEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("PdoMappingEntry", 3)?;
        s.serialize_field("index", &format!("0x{:04X}", self.index))?;
        s.serialize_field("subindex", &self.sub_index)?;
        s.serialize_field("bits", &self.length_bits)?;
        s.end()
    }
}
