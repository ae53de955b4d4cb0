// crates/ecmaster-rs-linux/src/lib.rs
#![cfg(target_os = "linux")]
//! Linux adapter enumeration for `ecmaster-rs`.
//!
//! Engines open adapters by interface name (`eth1`, `enp3s0`). Linux
//! interfaces carry no vendor description, so the description is assembled
//! from the link flags and the hardware address.

use ecmaster_rs::{AdapterInfo, AdapterSource, EngineError};
use log::{debug, trace};
use pnet::datalink::{self, NetworkInterface as PnetInterface};

/// Lists the host's network interfaces through `pnet`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxAdapters {
    /// Drop interfaces that are administratively down.
    pub up_only: bool,
}

impl LinuxAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn up_only() -> Self {
        Self { up_only: true }
    }
}

impl AdapterSource for LinuxAdapters {
    fn adapters(&self) -> Result<Vec<AdapterInfo>, EngineError> {
        let interfaces = datalink::interfaces();
        let adapters: Vec<AdapterInfo> = interfaces
            .iter()
            .filter(|iface| !self.up_only || iface.is_up())
            .map(describe)
            .collect();
        debug!(
            "Found {} network interfaces ({} listed)",
            interfaces.len(),
            adapters.len()
        );
        Ok(adapters)
    }
}

/// Builds the adapter entry of one interface.
pub fn describe(iface: &PnetInterface) -> AdapterInfo {
    let mut parts = Vec::new();
    if !iface.description.is_empty() {
        parts.push(iface.description.clone());
    }
    if iface.is_loopback() {
        parts.push("loopback".to_string());
    }
    match iface.mac {
        Some(mac) if !mac.is_zero() => parts.push(format!("MAC {mac}")),
        _ => {}
    }
    if !iface.is_up() {
        parts.push("down".to_string());
    }
    trace!("Interface {} (index {}): {:?}", iface.name, iface.index, parts);
    AdapterInfo::new(iface.name.clone(), parts.join(", "))
}
