// crates/ecmaster-rs/src/bus/report.rs
//! Per-device diagnostic snapshot attached to failed transitions.

use crate::hal::FieldbusEngine;
use crate::state::{SlaveState, al_status_text};
use core::fmt;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveDiagnostic {
    pub index: u16,
    pub name: String,
    pub state: SlaveState,
    /// `None` when the device reported no AL status code.
    pub al_status: Option<u16>,
    pub output_bytes: usize,
    pub input_bytes: usize,
}

impl SlaveDiagnostic {
    pub fn al_text(&self) -> Option<&'static str> {
        self.al_status.map(al_status_text)
    }
}

impl fmt::Display for SlaveDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  [{}] {}: state={}, AL=", self.index, self.name, self.state)?;
        match self.al_status {
            Some(code) => write!(f, "0x{code:04X} ({})", al_status_text(code))?,
            None => f.write_str("N/A")?,
        }
        write!(f, ", Out={}B, In={}B", self.output_bytes, self.input_bytes)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateReport {
    pub slaves: Vec<SlaveDiagnostic>,
}

impl StateReport {
    /// Snapshots every device the engine knows about. Devices whose info
    /// cannot be read are listed with what is known.
    pub fn collect(engine: &dyn FieldbusEngine) -> Self {
        let slaves = (0..engine.slave_count())
            .map(|index| match engine.slave_info(index) {
                Ok(info) => SlaveDiagnostic {
                    index,
                    name: if info.name.is_empty() {
                        format!("slave {index}")
                    } else {
                        info.name
                    },
                    state: info.state,
                    al_status: (info.al_status != 0).then_some(info.al_status),
                    output_bytes: info.output_bytes,
                    input_bytes: info.input_bytes,
                },
                Err(_) => SlaveDiagnostic {
                    index,
                    name: format!("slave {index}"),
                    state: engine.slave_state(index).unwrap_or_default(),
                    al_status: None,
                    output_bytes: 0,
                    input_bytes: 0,
                },
            })
            .collect();
        Self { slaves }
    }
}

impl fmt::Display for StateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.slaves.is_empty() {
            return f.write_str("No slave state info available.");
        }
        f.write_str("Slave details:")?;
        for slave in &self.slaves {
            write!(f, "\n{slave}")?;
        }
        Ok(())
    }
}
