// crates/ecmaster-rs-panel/src/lib.rs
//! Web control panel for an `ecmaster-rs` bus.
//!
//! A [`BusSession`] owns at most one bus and the persisted document path.
//! [`router`] exposes it as a JSON API; [`serve`] binds and runs that router.
//!
//! ```no_run
//! # async fn run(factory: std::sync::Arc<dyn ecmaster_rs::EngineFactory>) -> std::io::Result<()> {
//! use ecmaster_rs_panel::{BusSession, serve};
//! use std::sync::Arc;
//!
//! let session = Arc::new(BusSession::new(factory, "ethercat_config.json"));
//! serve("0.0.0.0:8080".parse().unwrap(), session).await
//! # }
//! ```

mod error;
mod server;
mod session;
#[cfg(test)]
mod stub;

pub use error::PanelError;
pub use server::{router, serve};
pub use session::{AdapterEntry, AdapterListing, BusSession, ConnectOutcome, SessionStatus};
