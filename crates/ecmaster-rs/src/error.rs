// crates/ecmaster-rs/src/error.rs
//! Error taxonomy for the bus manager.
//!
//! `EngineError` is what a single engine primitive reports. The bus lifecycle
//! surfaces failures to its caller as a `MasterError`, which is one of the
//! three fatal-to-the-operation kinds: connection, communication, configuration.

use crate::bus::report::StateReport;
use core::fmt;

/// Failure reported by a `FieldbusEngine` primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The adapter could not be opened by the engine.
    AdapterOpen(String),
    /// The addressed device position does not exist on the bus.
    NoSuchSlave(u16),
    /// A bounded wait elapsed before the engine answered.
    Timeout,
    /// An object-dictionary transfer was aborted by the device.
    SdoAbort {
        index: u16,
        sub_index: u8,
        abort_code: u32,
    },
    /// The caller holds a device reference from an engine that has since been replaced.
    StaleReference,
    /// The engine has been closed.
    Closed,
    /// Any other I/O failure inside the engine.
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterOpen(s) => write!(f, "Failed to open adapter: {s}"),
            Self::NoSuchSlave(i) => write!(f, "No slave at position {i}"),
            Self::Timeout => write!(f, "Engine operation timed out"),
            Self::SdoAbort {
                index,
                sub_index,
                abort_code,
            } => write!(
                f,
                "SDO abort on {index:#06X}:{sub_index:#04X} (code {abort_code:#010X})"
            ),
            Self::StaleReference => write!(f, "Slave reference belongs to a replaced engine"),
            Self::Closed => write!(f, "Engine is closed"),
            Self::Io(s) => write!(f, "Engine I/O error: {s}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// PDO mapping or I/O map negotiation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The persisted mapping document could not be read or parsed.
    Document(String),
    /// A sync-manager assignment write was rejected.
    PdoWrite {
        slave: u16,
        index: u16,
        sub_index: u8,
        cause: EngineError,
    },
    /// A device handle failed to configure itself for a reason other than a PDO write.
    Slave { slave: u16, cause: String },
    /// The engine failed to finalize the I/O map.
    IoMap {
        cause: EngineError,
        report: StateReport,
    },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document(s) => write!(f, "Invalid PDO mapping document: {s}"),
            Self::PdoWrite {
                slave,
                index,
                sub_index,
                cause,
            } => write!(
                f,
                "PDO config failed for slave {slave} at {index:#06X}:{sub_index:02X}: {cause}"
            ),
            Self::Slave { slave, cause } => {
                write!(f, "Failed to configure slave {slave}: {cause}")
            }
            Self::IoMap { cause, report } => {
                write!(f, "Failed to map process data: {cause}\n{report}")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PdoWrite { cause, .. } | Self::IoMap { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// Error surfaced by the bus lifecycle operations (`open`, `discover`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// Adapter resolution, state-transition timeouts, empty bus.
    Connection {
        message: String,
        report: Option<StateReport>,
    },
    /// Cyclic or object-dictionary communication failure.
    Communication(String),
    /// PDO mapping or final I/O-map negotiation failure.
    Configuration(ConfigurationError),
}

impl MasterError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            report: None,
        }
    }

    pub fn connection_with_report(message: impl Into<String>, report: StateReport) -> Self {
        Self::Connection {
            message: message.into(),
            report: Some(report),
        }
    }

    /// The per-device diagnostic snapshot attached to the error, if any.
    pub fn report(&self) -> Option<&StateReport> {
        match self {
            Self::Connection { report, .. } => report.as_ref(),
            Self::Configuration(ConfigurationError::IoMap { report, .. }) => Some(report),
            _ => None,
        }
    }
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection {
                message,
                report: Some(report),
            } => write!(f, "{message}\n{report}"),
            Self::Connection { message, .. } => write!(f, "{message}"),
            Self::Communication(s) => write!(f, "Communication error: {s}"),
            Self::Configuration(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for MasterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Configuration(e) => Some(e),
            _ => None,
        }
    }
}

// --- From Implementations for Error Conversion ---

impl From<EngineError> for MasterError {
    fn from(err: EngineError) -> Self {
        MasterError::Communication(err.to_string())
    }
}

impl From<ConfigurationError> for MasterError {
    fn from(err: ConfigurationError) -> Self {
        MasterError::Configuration(err)
    }
}
