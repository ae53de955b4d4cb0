// crates/ecmaster-rs/src/slave.rs
//! The contract every device taking part in the cyclic exchange implements,
//! and a ready-made generic implementation.

use crate::access::{EngineAccess, SlaveRef};
use crate::error::MasterError;
use crate::pdo;
use log::trace;
use std::sync::{Arc, Mutex, PoisonError};

/// A device registered with a bus.
///
/// The bus calls these from its lifecycle operations and loop threads. Any
/// returned error (or panic) is caught at the call site, logged and counted;
/// it never stops the cycle for other devices. `configure` failures during
/// `open` are the one exception: they abort the open.
pub trait SlaveHandle: Send {
    /// Bus position this handle drives.
    fn slave_index(&self) -> u16;

    /// Stores the device reference and optionally installs the PDO assignment.
    /// Called again on every reconnection, so it must be idempotent.
    fn configure(
        &mut self,
        engine: &mut EngineAccess<'_>,
        slave: SlaveRef,
        rx_pdo: &[u16],
        tx_pdo: &[u16],
    ) -> Result<(), MasterError>;

    /// Writes a neutral output image of the negotiated size. Called once after
    /// the I/O map is final and before the first exchange.
    fn seed_outputs(&mut self, engine: &mut EngineAccess<'_>, slave: SlaveRef)
    -> Result<(), MasterError>;

    /// Reads the latest inputs and writes pending outputs. Runs under the
    /// device-list lock on every PDO update period, so it must not block.
    fn on_cycle(&mut self, engine: &mut EngineAccess<'_>, reconnecting: bool)
    -> Result<(), MasterError>;

    /// Drives outputs to a safe neutral value on close. `engine` is `None`
    /// when no engine is live any more.
    fn safe_stop(&mut self, engine: Option<&mut EngineAccess<'_>>) -> Result<(), MasterError>;

    /// Re-acquires the device reference after the bus was rebuilt.
    fn on_reconnect(&mut self, engine: &mut EngineAccess<'_>) -> Result<(), MasterError>;
}

#[derive(Debug, Default)]
struct ImageState {
    inputs: Vec<u8>,
    outputs: Vec<u8>,
}

/// Shared input/output bytes of a [`GenericSlave`]. The application keeps a
/// clone; the bus updates it every cycle.
#[derive(Debug, Clone, Default)]
pub struct ProcessImage {
    inner: Arc<Mutex<ImageState>>,
}

impl ProcessImage {
    fn lock(&self) -> std::sync::MutexGuard<'_, ImageState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest input bytes (device to master).
    pub fn inputs(&self) -> Vec<u8> {
        self.lock().inputs.clone()
    }

    /// Output bytes currently commanded (master to device).
    pub fn outputs(&self) -> Vec<u8> {
        self.lock().outputs.clone()
    }

    /// Replaces the commanded outputs. Written to the device only when the
    /// length matches the negotiated output size.
    pub fn set_outputs(&self, data: impl Into<Vec<u8>>) {
        self.lock().outputs = data.into();
    }
}

type CycleCallback = Box<dyn FnMut(&ProcessImage) + Send>;

/// A device handle that works with any slave: it exposes raw PDO bytes
/// through a [`ProcessImage`] and runs an optional callback every cycle.
///
/// With `use_default_pdo` (the default) the device keeps the PDO mapping from
/// its EEPROM; otherwise the resolved assignment is written during configure.
pub struct GenericSlave {
    index: u16,
    use_default_pdo: bool,
    on_cycle: Option<CycleCallback>,
    image: ProcessImage,
    slave: Option<SlaveRef>,
}

impl GenericSlave {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            use_default_pdo: true,
            on_cycle: None,
            image: ProcessImage::default(),
            slave: None,
        }
    }

    /// Applies the configured PDO assignment instead of the device defaults.
    pub fn with_custom_pdo(mut self) -> Self {
        self.use_default_pdo = false;
        self
    }

    pub fn with_callback(mut self, callback: impl FnMut(&ProcessImage) + Send + 'static) -> Self {
        self.on_cycle = Some(Box::new(callback));
        self
    }

    /// A handle to this device's process image.
    pub fn image(&self) -> ProcessImage {
        self.image.clone()
    }
}

impl SlaveHandle for GenericSlave {
    fn slave_index(&self) -> u16 {
        self.index
    }

    fn configure(
        &mut self,
        engine: &mut EngineAccess<'_>,
        slave: SlaveRef,
        rx_pdo: &[u16],
        tx_pdo: &[u16],
    ) -> Result<(), MasterError> {
        self.slave = Some(slave);
        if !self.use_default_pdo && (!rx_pdo.is_empty() || !tx_pdo.is_empty()) {
            pdo::apply(engine, slave, rx_pdo, tx_pdo)?;
        }
        Ok(())
    }

    fn seed_outputs(
        &mut self,
        engine: &mut EngineAccess<'_>,
        slave: SlaveRef,
    ) -> Result<(), MasterError> {
        let zeros = vec![0u8; engine.output_len(slave)?];
        engine.set_outputs(slave, &zeros)?;
        self.image.set_outputs(zeros);
        Ok(())
    }

    fn on_cycle(
        &mut self,
        engine: &mut EngineAccess<'_>,
        reconnecting: bool,
    ) -> Result<(), MasterError> {
        let Some(slave) = self.slave else {
            return Ok(());
        };
        if reconnecting || !engine.is_current(slave) {
            return Ok(());
        }

        let inputs = engine.inputs(slave)?;
        self.image.lock().inputs = inputs;
        if let Some(callback) = self.on_cycle.as_mut() {
            callback(&self.image);
        }

        let outputs = self.image.outputs();
        if outputs.is_empty() {
            return Ok(());
        }
        let expected = engine.output_len(slave)?;
        if outputs.len() == expected {
            engine.set_outputs(slave, &outputs)?;
        } else {
            trace!(
                "Slave {}: output image is {} bytes, device expects {expected}; not written",
                self.index,
                outputs.len()
            );
        }
        Ok(())
    }

    fn safe_stop(&mut self, engine: Option<&mut EngineAccess<'_>>) -> Result<(), MasterError> {
        let (Some(engine), Some(slave)) = (engine, self.slave) else {
            return Ok(());
        };
        // A reference from a replaced engine has nothing left to stop.
        let Ok(len) = engine.output_len(slave) else {
            return Ok(());
        };
        if len > 0 {
            let zeros = vec![0u8; len];
            if let Err(e) = engine.set_outputs(slave, &zeros) {
                trace!("Slave {}: safe stop write failed: {e}", self.index);
            }
            self.image.set_outputs(zeros);
        }
        Ok(())
    }

    fn on_reconnect(&mut self, engine: &mut EngineAccess<'_>) -> Result<(), MasterError> {
        self.slave = Some(engine.slave(self.index)?);
        Ok(())
    }
}
