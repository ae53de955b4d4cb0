// crates/ecmaster-rs/src/bus/recovery.rs
//! Per-device recovery and full-bus reconnection.

use super::Shared;
use super::counters::BusFlags;
use super::cycle::StopSignal;
use super::guard::guarded;
use super::slot::EngineLease;
use super::startup;
use crate::adapter::resolve_adapter;
use crate::config::Timing;
use crate::error::{EngineError, MasterError};
use crate::hal::FieldbusEngine;
use crate::state::{EcState, SlaveState};
use log::{error, info, warn};
use std::time::{Duration, Instant};

/// State check timeout while pumping frames towards OP after a rebuild.
const PUMP_STATE_CHECK: Duration = Duration::from_millis(1);

/// One action taken by [`recover_slave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// SAFE-OP with the error flag set: the error was acknowledged.
    Acknowledged,
    /// Clean SAFE-OP: OP was requested.
    RequestedOp,
    /// Some other state: the device was reconfigured in place.
    Reconfigured { success: bool },
    /// The device answered nothing and was marked lost.
    MarkedLost,
    /// A lost device was re-addressed.
    Recovered { success: bool },
    /// A device marked lost answered again without re-addressing.
    Found,
}

/// Tries to bring one device that left OP back, based on its last known state.
/// Returns the actions taken, in order.
pub fn recover_slave(
    engine: &mut dyn FieldbusEngine,
    slave: u16,
    timing: &Timing,
) -> Result<Vec<RecoveryStep>, EngineError> {
    recover_leased(&mut Exclusive(engine), slave, timing)
}

/// An engine borrowed for the whole recovery.
struct Exclusive<'a>(&'a mut dyn FieldbusEngine);

impl EngineLease for Exclusive<'_> {
    fn lease<R>(
        &mut self,
        f: impl FnOnce(&mut dyn FieldbusEngine) -> R,
    ) -> Result<R, EngineError> {
        Ok(f(&mut *self.0))
    }
}

/// [`recover_slave`] with every primitive run through `engine` on its own.
pub(crate) fn recover_leased(
    engine: &mut impl EngineLease,
    slave: u16,
    timing: &Timing,
) -> Result<Vec<RecoveryStep>, EngineError> {
    let mut steps = Vec::new();
    let state = engine.call(|e| e.slave_state(slave))?;

    if state == SlaveState::acknowledge(EcState::SafeOp) {
        engine.call(|e| e.write_slave_state(slave, SlaveState::acknowledge(EcState::SafeOp)))?;
        steps.push(RecoveryStep::Acknowledged);
    } else if state == SlaveState::new(EcState::SafeOp) {
        engine.call(|e| e.write_slave_state(slave, SlaveState::new(EcState::Op)))?;
        steps.push(RecoveryStep::RequestedOp);
    } else if state.raw() > 0 {
        let success = engine.call(|e| e.reconfigure_slave(slave, timing.recovery_timeout))?;
        if success {
            engine.lease(|e| e.set_lost(slave, false))?;
        }
        steps.push(RecoveryStep::Reconfigured { success });
    } else if !engine.lease(|e| e.is_lost(slave))? {
        let checked =
            engine.call(|e| e.slave_state_check(slave, EcState::Op, timing.state_timeout))?;
        if checked.raw() == 0 {
            engine.lease(|e| e.set_lost(slave, true))?;
            error!("Slave {slave} lost!");
            steps.push(RecoveryStep::MarkedLost);
        }
    }

    if engine.lease(|e| e.is_lost(slave))? {
        if engine.call(|e| e.slave_state(slave))?.raw() == 0 {
            let success = engine.call(|e| e.recover_slave(slave, timing.recovery_timeout))?;
            if success {
                engine.lease(|e| e.set_lost(slave, false))?;
                info!("Slave {slave} recovered");
            }
            steps.push(RecoveryStep::Recovered { success });
        } else {
            engine.lease(|e| e.set_lost(slave, false))?;
            steps.push(RecoveryStep::Found);
        }
    }
    Ok(steps)
}

/// Exponential retry delay with an upper bound.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// The delay to wait now. Doubles the next one, up to the bound.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

fn cancelled(shared: &Shared, stop: &StopSignal) -> bool {
    stop.is_stopped() || BusFlags::is_set(&shared.flags.shutdown)
}

/// Tears the engine down and rebuilds the bus from scratch, retrying with
/// backoff until it succeeds or the bus is stopped. Returns `true` once the
/// bus is back in OP.
pub(crate) fn reconnect(shared: &Shared, stop: &StopSignal) -> bool {
    let timing = &shared.config.timing;
    BusFlags::set(&shared.flags.in_op, false);
    BusFlags::set(&shared.flags.reconnecting, true);
    warn!("Connection lost, attempting reconnect ...");
    stop.sleep(timing.reconnect_settle);

    if let Some(mut engine) = shared.engine.take() {
        engine.close();
    }

    let mut backoff = Backoff::new(timing.backoff_initial, timing.backoff_max);
    while !cancelled(shared, stop) {
        match attempt_rebuild(shared, stop) {
            Ok(()) => {
                BusFlags::set(&shared.flags.check_requested, false);
                BusFlags::set(&shared.flags.in_op, true);
                shared.counters.reset_frames();
                {
                    let mut slaves = shared.lock_slaves();
                    shared.engine.access(|access| {
                        for registered in slaves.iter_mut() {
                            let index = registered.handle.slave_index();
                            guarded(&shared.counters, index, "on_reconnect", || {
                                registered.handle.on_reconnect(&mut *access)
                            });
                        }
                    });
                }
                BusFlags::set(&shared.flags.reconnecting, false);
                shared.counters.reconnected();
                info!("Successfully reconnected");
                return true;
            }
            Err(e) => {
                if cancelled(shared, stop) {
                    break;
                }
                let delay = backoff.next_delay();
                warn!(
                    "Reconnect attempt failed: {e}; retrying in {:.0}s",
                    delay.as_secs_f64()
                );
                if stop.sleep(delay) {
                    break;
                }
            }
        }
    }
    BusFlags::set(&shared.flags.reconnecting, false);
    info!("Reconnect cancelled");
    false
}

/// One rebuild attempt on a fresh engine. The engine is installed only once
/// it has reached OP; on any failure it is closed here.
fn attempt_rebuild(shared: &Shared, stop: &StopSignal) -> Result<(), MasterError> {
    let adapter = resolve_adapter(shared.factory.as_ref(), shared.config.adapter.as_deref())?;
    let mut engine = shared.factory.open(&adapter)?;
    let generation = shared.engine.reserve_generation();

    match rebuild_to_op(shared, engine.as_mut(), generation, stop) {
        Ok(()) if !cancelled(shared, stop) => {
            shared.engine.install(engine, generation);
            Ok(())
        }
        Ok(()) => {
            engine.close();
            Err(MasterError::connection("Reconnect cancelled"))
        }
        Err(e) => {
            engine.close();
            Err(e)
        }
    }
}

fn rebuild_to_op(
    shared: &Shared,
    engine: &mut dyn FieldbusEngine,
    generation: u64,
    stop: &StopSignal,
) -> Result<(), MasterError> {
    let timing = &shared.config.timing;
    startup::bring_up_to_safe_op(shared, engine, generation)?;
    startup::seed_slaves(shared, engine, generation);
    engine.request_state(EcState::Op)?;

    let port = engine.process_data();
    let deadline = Instant::now() + timing.reconnect_deadline;
    while Instant::now() < deadline {
        if cancelled(shared, stop) {
            return Err(MasterError::connection("Reconnect cancelled"));
        }
        port.send_processdata()?;
        // A lost frame here is expected while devices come up.
        let _ = port.receive_processdata(timing.receive_timeout);
        if engine.state_check(EcState::Op, PUMP_STATE_CHECK)? == EcState::Op {
            return Ok(());
        }
        if stop.sleep(timing.reconnect_pump) {
            return Err(MasterError::connection("Reconnect cancelled"));
        }
    }
    Err(MasterError::Communication("Failed to reach OP".into()))
}
