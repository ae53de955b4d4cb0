// crates/ecmaster-rs/src/hal.rs
//! Hardware Abstraction Layer: the primitives the bus manager consumes from
//! the underlying fieldbus engine (frame construction, scanning, state
//! requests and mailbox transfers all live behind this seam).

use crate::adapter::{AdapterInfo, AdapterSource};
use crate::error::EngineError;
use crate::state::{EcState, SlaveState};
use std::sync::Arc;
use std::time::Duration;

/// Identity and live status of one device as known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlaveInfo {
    pub name: String,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub state: SlaveState,
    /// Last AL status code read from the device (0 when none was reported).
    pub al_status: u16,
    pub output_bytes: usize,
    pub input_bytes: usize,
}

/// Produces a fresh engine for an adapter. One factory serves the initial
/// open and every reconnection attempt.
pub trait EngineFactory: AdapterSource + Send + Sync {
    /// Opens the adapter and returns an engine owning it.
    fn open(&self, adapter: &AdapterInfo) -> Result<Box<dyn FieldbusEngine>, EngineError>;
}

/// The cyclic process-data path of an engine.
///
/// The frame loop drives a port from its own thread while state and mailbox
/// primitives run on the engine, so implementations synchronize internally.
/// Once the engine is closed every call fails with `EngineError::Closed`.
pub trait ProcessDataPort: Send + Sync {
    fn send_processdata(&self) -> Result<(), EngineError>;

    /// Receives the inbound frame, waiting at most `timeout`, and returns its working counter.
    fn receive_processdata(&self, timeout: Duration) -> Result<u16, EngineError>;

    /// The working counter a fully healthy cycle returns.
    fn expected_wkc(&self) -> u16;
}

/// A live fieldbus engine bound to one adapter.
///
/// Slave positions are zero-based. Timeouts are upper bounds; an engine may
/// return earlier.
pub trait FieldbusEngine: Send {
    // --- Bus-wide configuration ---

    /// Scans the bus and returns the number of devices found.
    fn config_init(&mut self) -> Result<u16, EngineError>;

    /// Builds the process-data I/O map from the configured PDO assignments.
    fn config_map(&mut self) -> Result<(), EngineError>;

    /// Number of devices found by the last `config_init`.
    fn slave_count(&self) -> u16;

    /// Releases the adapter. Later calls fail with `EngineError::Closed`.
    fn close(&mut self);

    // --- Aggregate state ---

    /// Requests `target` for every device.
    fn request_state(&mut self, target: EcState) -> Result<(), EngineError>;

    /// Waits up to `timeout` for every device to reach `target` and returns
    /// the lowest state observed.
    fn state_check(&mut self, target: EcState, timeout: Duration) -> Result<EcState, EngineError>;

    /// Refreshes every device's state and returns the lowest one.
    fn read_state(&mut self) -> Result<EcState, EngineError>;

    // --- Cyclic process data ---

    /// A handle on the process-data path, shared with the frame loop.
    /// Requested once the I/O map is built.
    fn process_data(&self) -> Arc<dyn ProcessDataPort>;

    // --- Per-device access ---

    fn slave_info(&self, slave: u16) -> Result<SlaveInfo, EngineError>;

    /// State as of the last refresh (`read_state`, `state_check`, or a write).
    fn slave_state(&self, slave: u16) -> Result<SlaveState, EngineError>;

    fn write_slave_state(&mut self, slave: u16, state: SlaveState) -> Result<(), EngineError>;

    fn slave_state_check(
        &mut self,
        slave: u16,
        target: EcState,
        timeout: Duration,
    ) -> Result<SlaveState, EngineError>;

    /// Reconfigures the device in place. `Ok(true)` when it came back.
    fn reconfigure_slave(&mut self, slave: u16, timeout: Duration) -> Result<bool, EngineError>;

    /// Re-addresses a device that dropped off the bus. `Ok(true)` when it was found again.
    fn recover_slave(&mut self, slave: u16, timeout: Duration) -> Result<bool, EngineError>;

    fn is_lost(&self, slave: u16) -> bool;

    fn set_lost(&mut self, slave: u16, lost: bool);

    /// Reads an object-dictionary entry. `max_len` bounds the upload buffer;
    /// `None` lets the engine pick.
    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        max_len: Option<usize>,
    ) -> Result<Vec<u8>, EngineError>;

    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), EngineError>;

    // --- Process image ---

    /// The device's latest input image.
    fn inputs(&self, slave: u16) -> Result<Vec<u8>, EngineError>;

    /// Negotiated output image size in bytes.
    fn output_len(&self, slave: u16) -> Result<usize, EngineError>;

    /// Replaces the device's output image. `data` must be exactly `output_len` bytes.
    fn set_outputs(&mut self, slave: u16, data: &[u8]) -> Result<(), EngineError>;
}
