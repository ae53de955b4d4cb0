// crates/ecmaster-rs/src/access.rs
//! Generation-checked access to the live engine.
//!
//! The bus replaces its engine wholesale when it reconnects. Every engine it
//! installs gets a new generation number, and a [`SlaveRef`] remembers the
//! generation it was issued under. Access through a reference from an older
//! engine fails with [`EngineError::StaleReference`] instead of addressing
//! whatever device now sits at that position.

use crate::error::EngineError;
use crate::hal::{FieldbusEngine, SlaveInfo};
use crate::state::SlaveState;

/// A device position tied to the engine generation it was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveRef {
    pub index: u16,
    pub generation: u64,
}

/// Borrowed view of the engine handed to device callbacks.
pub struct EngineAccess<'a> {
    engine: &'a mut dyn FieldbusEngine,
    generation: u64,
}

impl<'a> EngineAccess<'a> {
    pub fn new(engine: &'a mut dyn FieldbusEngine, generation: u64) -> Self {
        Self { engine, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slave_count(&self) -> u16 {
        self.engine.slave_count()
    }

    /// Acquires a reference to the device at `index` for this generation.
    pub fn slave(&self, index: u16) -> Result<SlaveRef, EngineError> {
        if index >= self.engine.slave_count() {
            return Err(EngineError::NoSuchSlave(index));
        }
        Ok(SlaveRef {
            index,
            generation: self.generation,
        })
    }

    pub fn is_current(&self, slave: SlaveRef) -> bool {
        slave.generation == self.generation
    }

    fn check(&self, slave: SlaveRef) -> Result<u16, EngineError> {
        if self.is_current(slave) {
            Ok(slave.index)
        } else {
            Err(EngineError::StaleReference)
        }
    }

    pub fn info(&self, slave: SlaveRef) -> Result<SlaveInfo, EngineError> {
        self.engine.slave_info(self.check(slave)?)
    }

    pub fn state(&self, slave: SlaveRef) -> Result<SlaveState, EngineError> {
        self.engine.slave_state(self.check(slave)?)
    }

    pub fn inputs(&self, slave: SlaveRef) -> Result<Vec<u8>, EngineError> {
        self.engine.inputs(self.check(slave)?)
    }

    pub fn output_len(&self, slave: SlaveRef) -> Result<usize, EngineError> {
        self.engine.output_len(self.check(slave)?)
    }

    pub fn set_outputs(&mut self, slave: SlaveRef, data: &[u8]) -> Result<(), EngineError> {
        let index = self.check(slave)?;
        self.engine.set_outputs(index, data)
    }

    pub fn sdo_read(
        &mut self,
        slave: SlaveRef,
        index: u16,
        sub_index: u8,
        max_len: Option<usize>,
    ) -> Result<Vec<u8>, EngineError> {
        let position = self.check(slave)?;
        self.engine.sdo_read(position, index, sub_index, max_len)
    }

    pub fn sdo_write(
        &mut self,
        slave: SlaveRef,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let position = self.check(slave)?;
        self.engine.sdo_write(position, index, sub_index, data)
    }

    /// The raw engine, for primitives not wrapped here.
    pub fn engine(&mut self) -> &mut dyn FieldbusEngine {
        &mut *self.engine
    }
}
