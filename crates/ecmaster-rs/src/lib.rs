// crates/ecmaster-rs/src/lib.rs
//! Bus lifecycle, cyclic I/O and recovery for EtherCAT masters.
//!
//! Frame construction, scanning and mailbox transfers are delegated to a
//! [`FieldbusEngine`] supplied by the platform crate; this crate decides when
//! to call them.

// --- Foundation Modules ---
pub mod error;
pub mod hal;
pub mod od;
pub mod state;

// --- Configuration ---
pub mod adapter;
pub mod config;
pub mod pdo;

// --- Device Access ---
pub mod access;
pub mod slave;

// --- Bus Lifecycle ---
pub mod bus;
pub mod discovery;
pub mod latency;

// --- Top-level Exports ---
pub use access::{EngineAccess, SlaveRef};
pub use adapter::{AdapterInfo, AdapterSource, is_fieldbus_candidate, list_adapters, resolve_adapter};
pub use bus::{BusProbe, CounterSnapshot, EtherCatBus, SlaveId, StateReport};
pub use config::{BusConfig, MasterDocument, Timing};
pub use discovery::{SlaveDescription, discover};
pub use error::{ConfigurationError, EngineError, MasterError};
pub use hal::{EngineFactory, FieldbusEngine, ProcessDataPort, SlaveInfo};
pub use latency::{LatencyProbe, LatencyReport};
pub use pdo::{PdoAssignment, PdoMapping};
pub use slave::{GenericSlave, ProcessImage, SlaveHandle};
pub use state::{BusPhase, EcState, SlaveState};
