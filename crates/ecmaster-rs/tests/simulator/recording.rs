// crates/ecmaster-rs/tests/simulator/recording.rs
//! A device handle that records every callback the bus makes.

use ecmaster_rs::{BusProbe, EngineAccess, MasterError, SlaveHandle, SlaveRef, pdo};
use std::sync::{Arc, Mutex};

pub type SharedLog = Arc<Mutex<Vec<String>>>;

pub struct RecordingSlave {
    index: u16,
    log: SharedLog,
    apply_pdo: bool,
    fail_cycle: bool,
    probe: Option<BusProbe>,
    slave: Option<SlaveRef>,
}

impl RecordingSlave {
    pub fn new(index: u16, log: SharedLog) -> Self {
        Self {
            index,
            log,
            apply_pdo: false,
            fail_cycle: false,
            probe: None,
            slave: None,
        }
    }

    /// Writes the resolved PDO assignment during configure.
    pub fn applying_pdo(mut self) -> Self {
        self.apply_pdo = true;
        self
    }

    /// Every `on_cycle` returns an error.
    pub fn failing_cycle(mut self) -> Self {
        self.fail_cycle = true;
        self
    }

    /// Records the bus's reconnecting flag from inside `on_reconnect`.
    pub fn observing(mut self, probe: BusProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    fn record(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }
}

impl SlaveHandle for RecordingSlave {
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
        self.record(format!("configure {}", self.index));
        self.slave = Some(slave);
        if self.apply_pdo {
            pdo::apply(engine, slave, rx_pdo, tx_pdo)?;
        }
        Ok(())
    }

    fn seed_outputs(
        &mut self,
        _engine: &mut EngineAccess<'_>,
        _slave: SlaveRef,
    ) -> Result<(), MasterError> {
        self.record(format!("seed {}", self.index));
        Ok(())
    }

    fn on_cycle(
        &mut self,
        _engine: &mut EngineAccess<'_>,
        reconnecting: bool,
    ) -> Result<(), MasterError> {
        self.record(format!("cycle {} reconnecting={reconnecting}", self.index));
        if self.fail_cycle {
            return Err(MasterError::Communication("device refused".into()));
        }
        Ok(())
    }

    fn safe_stop(&mut self, engine: Option<&mut EngineAccess<'_>>) -> Result<(), MasterError> {
        self.record(format!("safe_stop {} engine={}", self.index, engine.is_some()));
        Ok(())
    }

    fn on_reconnect(&mut self, engine: &mut EngineAccess<'_>) -> Result<(), MasterError> {
        let reconnecting = self.probe.as_ref().map(BusProbe::is_reconnecting);
        self.record(format!("reconnect {} reconnecting={reconnecting:?}", self.index));
        self.slave = Some(engine.slave(self.index)?);
        Ok(())
    }
}
