// crates/ecmaster-rs/src/bus/startup.rs
//! Bus bring-up shared by `open` and reconnection: scan, per-device
//! configuration, I/O map, SAFE-OP, output seeding.

use super::Shared;
use super::guard::{CallOutcome, guarded};
use super::report::StateReport;
use super::slot::EngineSlot;
use crate::access::EngineAccess;
use crate::error::{ConfigurationError, MasterError};
use crate::hal::FieldbusEngine;
use crate::pdo::{PdoAssignment, resolve};
use crate::state::EcState;
use log::{debug, info};
use std::thread;
use std::time::{Duration, Instant};

/// Slice used when polling for a state so the engine lock is never held long.
const STATE_POLL_SLICE: Duration = Duration::from_millis(1);

fn hex_list(pdos: &[u16]) -> String {
    let items: Vec<String> = pdos.iter().map(|p| format!("0x{p:04X}")).collect();
    format!("[{}]", items.join(", "))
}

/// Takes a freshly opened engine from scan to SAFE-OP with every registered
/// device configured. Returns the number of devices found.
pub(crate) fn bring_up_to_safe_op(
    shared: &Shared,
    engine: &mut dyn FieldbusEngine,
    generation: u64,
) -> Result<u16, MasterError> {
    let timing = &shared.config.timing;

    let count = engine
        .config_init()
        .map_err(|e| MasterError::connection(format!("Bus scan failed: {e}")))?;
    if count == 0 {
        return Err(MasterError::connection("No EtherCAT slaves found"));
    }
    info!("Found {count} EtherCAT slave(s)");
    for index in 0..count {
        engine.set_lost(index, false);
    }

    configure_slaves(shared, engine, generation, count)?;
    map_io(engine)?;

    let reached = engine.state_check(EcState::SafeOp, timing.state_timeout);
    if !matches!(reached, Ok(EcState::SafeOp)) {
        return Err(MasterError::connection_with_report(
            "Failed to reach SAFE-OP state.",
            StateReport::collect(engine),
        ));
    }
    Ok(count)
}

/// Hands every registered device its reference and PDO assignment. The first
/// failing device aborts the bring-up.
pub(crate) fn configure_slaves(
    shared: &Shared,
    engine: &mut dyn FieldbusEngine,
    generation: u64,
    count: u16,
) -> Result<(), MasterError> {
    let mut slaves = shared.lock_slaves();
    let mut access = EngineAccess::new(engine, generation);
    let fallback = PdoAssignment::default();

    for registered in slaves.iter_mut() {
        let index = registered.handle.slave_index();
        if index >= count {
            return Err(ConfigurationError::Slave {
                slave: index,
                cause: format!("not present on the bus ({count} found)"),
            }
            .into());
        }
        let slave = access.slave(index)?;
        let assignment = resolve(shared.mapping.as_ref(), index, &fallback);

        let outcome = guarded(&shared.counters, index, "configure", || {
            registered
                .handle
                .configure(&mut access, slave, &assignment.rx_pdo, &assignment.tx_pdo)
        });
        match outcome {
            CallOutcome::Ok => info!(
                "Slave {index}: configured RxPDO={} TxPDO={}",
                hex_list(&assignment.rx_pdo),
                hex_list(&assignment.tx_pdo)
            ),
            CallOutcome::Failed(MasterError::Configuration(e)) => return Err(e.into()),
            CallOutcome::Failed(other) => {
                return Err(ConfigurationError::Slave {
                    slave: index,
                    cause: other.to_string(),
                }
                .into());
            }
            CallOutcome::Panicked(message) => {
                return Err(ConfigurationError::Slave {
                    slave: index,
                    cause: format!("panicked: {message}"),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Finalizes the process-data image and logs each device's negotiated sizes.
pub(crate) fn map_io(engine: &mut dyn FieldbusEngine) -> Result<(), MasterError> {
    if let Err(cause) = engine.config_map() {
        return Err(ConfigurationError::IoMap {
            cause,
            report: StateReport::collect(engine),
        }
        .into());
    }
    debug!("I/O map after config_map():");
    for diag in StateReport::collect(engine).slaves {
        debug!(
            "  [{}] {}: Out={}B, In={}B",
            diag.index, diag.name, diag.output_bytes, diag.input_bytes
        );
    }
    Ok(())
}

/// Writes each device's neutral output image before the first exchange.
/// Failures are logged and counted but do not abort the bring-up.
pub(crate) fn seed_slaves(shared: &Shared, engine: &mut dyn FieldbusEngine, generation: u64) {
    let mut slaves = shared.lock_slaves();
    let mut access = EngineAccess::new(engine, generation);
    for registered in slaves.iter_mut() {
        let index = registered.handle.slave_index();
        let Ok(slave) = access.slave(index) else {
            continue;
        };
        guarded(&shared.counters, index, "seed_outputs", || {
            registered.handle.seed_outputs(&mut access, slave)
        });
    }
}

/// Polls the installed engine until every device reports `target` or
/// `timeout` elapses. The engine lock is released between polls so the frame
/// loop keeps exchanging process data.
pub(crate) fn wait_for_state(slot: &EngineSlot, target: EcState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match slot.with(|e| e.state_check(target, STATE_POLL_SLICE)) {
            Some(Ok(state)) if state == target => return true,
            None => return false,
            _ => {}
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(STATE_POLL_SLICE);
    }
}
