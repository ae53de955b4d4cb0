// crates/ecmaster-rs/src/bus/guard.rs
//! Catch-and-continue policy for device callbacks.

use super::counters::BusCounters;
use crate::error::MasterError;
use log::{error, warn};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// How a guarded callback ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallOutcome {
    Ok,
    Failed(MasterError),
    Panicked(String),
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one device callback, catching both returned errors and panics.
/// Failures are logged with the device and operation and counted.
pub(crate) fn guarded(
    counters: &BusCounters,
    slave: u16,
    operation: &str,
    f: impl FnOnce() -> Result<(), MasterError>,
) -> CallOutcome {
    let outcome = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return CallOutcome::Ok,
        Ok(Err(e)) => {
            warn!("Slave {slave}: {operation} failed: {e}");
            CallOutcome::Failed(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Slave {slave}: {operation} panicked: {message}");
            CallOutcome::Panicked(message)
        }
    };
    counters.callback_fault();
    outcome
}
