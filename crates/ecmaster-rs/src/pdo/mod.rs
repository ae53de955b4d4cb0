// crates/ecmaster-rs/src/pdo/mod.rs
//! PDO mapping configuration: which receive/transmit PDOs each device's sync
//! managers expose, and the mailbox writes that install that assignment.

pub mod assign;
pub mod entry;
pub mod mapping;

pub use assign::apply;
pub use entry::PdoMappingEntry;
pub use mapping::{
    DEFAULT_RX_PDO, DEFAULT_TX_PDO, PdoAssignment, PdoMapping, load_mapping, resolve,
};
