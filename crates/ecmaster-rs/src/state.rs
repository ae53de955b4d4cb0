// crates/ecmaster-rs/src/state.rs
//! Device and bus state vocabulary: the EtherCAT application-layer states,
//! the error/acknowledge flag, and the AL status code table.

use core::fmt;
use serde::{Serialize, Serializer};

/// Raw bit set alongside the state code when a device reports an error
/// (read) or when the master acknowledges one (write).
pub const STATE_ACK_FLAG: u16 = 0x10;

/// Application-layer state of one device, or of the bus in aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcState {
    #[default]
    None,
    Init,
    PreOp,
    Boot,
    SafeOp,
    Op,
    /// A state code outside the defined set.
    Unknown(u8),
}

impl EcState {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::Init => 0x01,
            Self::PreOp => 0x02,
            Self::Boot => 0x03,
            Self::SafeOp => 0x04,
            Self::Op => 0x08,
            Self::Unknown(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::None,
            0x01 => Self::Init,
            0x02 => Self::PreOp,
            0x03 => Self::Boot,
            0x04 => Self::SafeOp,
            0x08 => Self::Op,
            other => Self::Unknown(other),
        }
    }

    pub fn name(self) -> String {
        match self {
            Self::None => "NONE".into(),
            Self::Init => "INIT".into(),
            Self::PreOp => "PRE-OP".into(),
            Self::Boot => "BOOT".into(),
            Self::SafeOp => "SAFE-OP".into(),
            Self::Op => "OP".into(),
            Self::Unknown(c) => format!("0x{c:02X}"),
        }
    }
}

impl fmt::Display for EcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A state as read back from (or written to) a device: the base state plus
/// the error/acknowledge flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlaveState {
    pub state: EcState,
    pub error: bool,
}

impl SlaveState {
    pub const fn new(state: EcState) -> Self {
        Self {
            state,
            error: false,
        }
    }

    /// The request that acknowledges a pending error while staying in `state`.
    pub const fn acknowledge(state: EcState) -> Self {
        Self { state, error: true }
    }

    pub fn from_raw(raw: u16) -> Self {
        Self {
            state: EcState::from_code((raw & !STATE_ACK_FLAG) as u8),
            error: raw & STATE_ACK_FLAG != 0,
        }
    }

    pub fn raw(self) -> u16 {
        let base = u16::from(self.state.code());
        if self.error { base | STATE_ACK_FLAG } else { base }
    }

    pub fn is(self, state: EcState) -> bool {
        !self.error && self.state == state
    }
}

impl From<EcState> for SlaveState {
    fn from(state: EcState) -> Self {
        Self::new(state)
    }
}

impl fmt::Display for SlaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "{}+ERR", self.state)
        } else {
            write!(f, "{}", self.state)
        }
    }
}

impl Serialize for SlaveState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Coarse lifecycle phase of a bus, as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusPhase {
    /// No engine is open.
    #[default]
    Idle,
    /// An engine is open but the bus is not flagged operational.
    PreOp,
    /// Cyclic data exchange is running in OPERATIONAL.
    Op,
}

impl BusPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::PreOp => "PRE-OP",
            Self::Op => "OP",
        }
    }
}

impl fmt::Display for BusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for BusPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Human readable text for an AL status code (ETG.1000.6).
pub fn al_status_text(code: u16) -> &'static str {
    match code {
        0x0000 => "No error",
        0x0001 => "Unspecified error",
        0x0011 => "Invalid requested state change",
        0x0012 => "Unknown requested state",
        0x0013 => "Bootstrap not supported",
        0x0014 => "No valid firmware",
        0x0015 => "Invalid mailbox configuration (BOOT)",
        0x0016 => "Invalid mailbox configuration (PREOP)",
        0x0017 => "Invalid sync manager configuration",
        0x0018 => "No valid inputs available",
        0x0019 => "No valid outputs",
        0x001A => "Synchronization error",
        0x001B => "Sync manager watchdog",
        0x001C => "Invalid sync manager types",
        0x001D => "Invalid output configuration",
        0x001E => "Invalid input configuration",
        0x001F => "Invalid watchdog configuration",
        0x0020 => "Slave needs cold start",
        0x0021 => "Slave needs INIT",
        0x0022 => "Slave needs PREOP",
        0x0023 => "Slave needs SAFEOP",
        0x0024 => "Invalid input mapping",
        0x0025 => "Invalid output mapping",
        0x0026 => "Inconsistent settings",
        0x0027 => "FreeRun not supported",
        0x0028 => "SyncMode not supported",
        0x0029 => "FreeRun needs 3-buffer mode",
        0x002A => "Background watchdog",
        0x002B => "No valid inputs and outputs",
        0x002C => "Fatal sync error",
        0x002D => "No sync error",
        0x002E => "Invalid input FMMU configuration",
        0x0030 => "Invalid DC sync configuration",
        0x0031 => "Invalid DC latch configuration",
        0x0032 => "PLL error",
        0x0033 => "DC sync I/O error",
        0x0034 => "DC sync timeout",
        0x0035 => "DC invalid sync cycle time",
        0x0036 => "DC sync0 cycle time",
        0x0037 => "DC sync1 cycle time",
        0x0041 => "MBX_AOE",
        0x0042 => "MBX_EOE",
        0x0043 => "MBX_COE",
        0x0044 => "MBX_FOE",
        0x0045 => "MBX_SOE",
        0x004F => "MBX_VOE",
        0x0050 => "EEPROM no access",
        0x0051 => "EEPROM error",
        0x0060 => "Slave restarted locally",
        0x0061 => "Device identification value updated",
        0x00F0 => "Application controller available",
        _ => "Unknown",
    }
}
