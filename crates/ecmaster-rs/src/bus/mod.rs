// crates/ecmaster-rs/src/bus/mod.rs
//! The bus lifecycle manager.
//!
//! An [`EtherCatBus`] owns one adapter. `open` scans the bus, configures every
//! registered device, walks the bus through SAFE-OP into OP and starts three
//! loop threads:
//!
//! - frame exchange (every `Timing::frame_period`): send and receive process
//!   data, compare working counters;
//! - PDO update (every `BusConfig::cycle_time`): run each device's `on_cycle`
//!   under the device-list lock;
//! - health check (every `Timing::health_period`): recover devices that left
//!   OP and rebuild the whole bus once failures persist.
//!
//! Lock order is always device list, then engine slot.

pub mod counters;
mod cycle;
mod guard;
pub mod recovery;
pub mod report;
mod slot;
mod startup;

pub use counters::{BusCounters, CounterSnapshot};
pub use recovery::RecoveryStep;
pub use report::{SlaveDiagnostic, StateReport};

use crate::access::EngineAccess;
use crate::adapter::resolve_adapter;
use crate::config::{BusConfig, MasterDocument};
use crate::error::MasterError;
use crate::hal::EngineFactory;
use crate::pdo::{PdoMapping, mapping::load_mapping_or_defaults};
use crate::slave::SlaveHandle;
use crate::state::{BusPhase, EcState};
use counters::BusFlags;
use cycle::Workers;
use guard::guarded;
use log::{error, info, warn};
use slot::EngineSlot;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identifies a registered device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlaveId(u64);

pub(crate) struct Registered {
    pub id: SlaveId,
    pub handle: Box<dyn SlaveHandle>,
}

/// State shared between the owning `EtherCatBus` and its loop threads.
pub(crate) struct Shared {
    pub factory: Arc<dyn EngineFactory>,
    pub config: BusConfig,
    pub mapping: Option<PdoMapping>,
    pub engine: EngineSlot,
    pub slaves: Mutex<Vec<Registered>>,
    pub flags: BusFlags,
    pub counters: BusCounters,
}

impl Shared {
    pub fn lock_slaves(&self) -> MutexGuard<'_, Vec<Registered>> {
        self.slaves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Manages one EtherCAT bus: bring-up, cyclic exchange, recovery and teardown.
pub struct EtherCatBus {
    shared: Arc<Shared>,
    workers: Option<Workers>,
    next_id: AtomicU64,
}

impl EtherCatBus {
    pub fn new(factory: Arc<dyn EngineFactory>, config: BusConfig) -> Self {
        Self::with_mapping(factory, config, None)
    }

    /// A bus whose devices get their PDO assignment from `mapping`.
    pub fn with_mapping(
        factory: Arc<dyn EngineFactory>,
        config: BusConfig,
        mapping: Option<PdoMapping>,
    ) -> Self {
        let flags = BusFlags::default();
        BusFlags::set(&flags.auto_reconnect, config.auto_reconnect);
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                mapping,
                engine: EngineSlot::default(),
                slaves: Mutex::new(Vec::new()),
                flags,
                counters: BusCounters::default(),
            }),
            workers: None,
            next_id: AtomicU64::new(0),
        }
    }

    /// A bus configured from a persisted document. The `network` section fills
    /// whatever `config` leaves unset; an unreadable document means built-in
    /// PDO defaults.
    pub fn from_document(
        factory: Arc<dyn EngineFactory>,
        mut config: BusConfig,
        path: impl AsRef<Path>,
    ) -> Self {
        let path = path.as_ref();
        if let Ok(doc) = MasterDocument::load(path) {
            if let Some(network) = &doc.network {
                config.apply_network(network);
            }
        }
        let mapping = load_mapping_or_defaults(path);
        Self::with_mapping(factory, config, mapping)
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Adds a device to the cyclic exchange. Handles registered while the bus
    /// is open are configured on the next open or reconnection.
    pub fn register_slave(&self, handle: impl SlaveHandle + 'static) -> SlaveId {
        self.register_boxed(Box::new(handle))
    }

    pub fn register_boxed(&self, handle: Box<dyn SlaveHandle>) -> SlaveId {
        let id = SlaveId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.lock_slaves().push(Registered { id, handle });
        id
    }

    /// Removes a device and hands its handle back.
    pub fn unregister_slave(&self, id: SlaveId) -> Option<Box<dyn SlaveHandle>> {
        let mut slaves = self.shared.lock_slaves();
        let position = slaves.iter().position(|r| r.id == id)?;
        Some(slaves.remove(position).handle)
    }

    pub fn registered_count(&self) -> usize {
        self.shared.lock_slaves().len()
    }

    /// Brings the bus into OP and starts the loop threads.
    pub fn open(&mut self) -> Result<(), MasterError> {
        if self.workers.is_some() || self.shared.engine.is_live() {
            return Err(MasterError::connection("Bus is already open"));
        }
        let shared = &self.shared;
        let timing = &shared.config.timing;
        BusFlags::set(&shared.flags.shutdown, false);
        BusFlags::set(&shared.flags.reconnecting, false);
        BusFlags::set(&shared.flags.check_requested, false);

        let adapter = resolve_adapter(shared.factory.as_ref(), shared.config.adapter.as_deref())?;
        info!("Opening adapter {} ({})", adapter.name, adapter.description);
        let mut engine = shared.factory.open(&adapter).map_err(|e| {
            MasterError::connection(format!("Failed to open adapter '{}': {e}", adapter.name))
        })?;

        let generation = shared.engine.reserve_generation();
        if let Err(e) = startup::bring_up_to_safe_op(shared, engine.as_mut(), generation) {
            error!("Bus open failed: {e}");
            engine.close();
            return Err(e);
        }
        info!("Reached SAFE-OP state");

        startup::seed_slaves(shared, engine.as_mut(), generation);
        shared.engine.install(engine, generation);
        shared.counters.reset_frames();

        let workers = match Workers::start(shared) {
            Ok(w) => w,
            Err(e) => {
                self.teardown_engine();
                return Err(MasterError::connection(format!("Failed to start loop threads: {e}")));
            }
        };
        self.workers = Some(workers);

        let requested = shared
            .engine
            .with(|e| e.request_state(EcState::Op))
            .unwrap_or(Err(crate::error::EngineError::Closed));
        let reached = requested.is_ok()
            && startup::wait_for_state(&shared.engine, EcState::Op, timing.state_timeout);
        if !reached {
            if let Some(w) = self.workers.take() {
                w.stop(timing.join_timeout);
            }
            let report = shared.engine.with(|e| StateReport::collect(e)).unwrap_or_default();
            self.teardown_engine();
            let err = MasterError::connection_with_report("Failed to reach OP state.", report);
            error!("Bus open failed: {err}");
            return Err(err);
        }

        BusFlags::set(&shared.flags.in_op, true);
        info!("Reached OP state, bus ready");
        Ok(())
    }

    /// Stops every device, the loop threads and the engine. Does nothing when
    /// the bus is not open.
    pub fn close(&mut self) {
        let shared = &self.shared;
        if self.workers.is_none() && !shared.engine.is_live() {
            return;
        }
        BusFlags::set(&shared.flags.shutdown, true);

        {
            let mut slaves = shared.lock_slaves();
            let stopped = shared.engine.access(|access| {
                for r in slaves.iter_mut() {
                    let index = r.handle.slave_index();
                    guarded(&shared.counters, index, "safe_stop", || {
                        r.handle.safe_stop(Some(&mut *access))
                    });
                }
            });
            if stopped.is_none() {
                for r in slaves.iter_mut() {
                    let index = r.handle.slave_index();
                    guarded(&shared.counters, index, "safe_stop", || r.handle.safe_stop(None));
                }
            }
        }

        BusFlags::set(&shared.flags.in_op, false);
        if let Some(w) = self.workers.take() {
            w.stop(shared.config.timing.join_timeout);
        }
        self.teardown_engine();
        BusFlags::set(&self.shared.flags.reconnecting, false);
        BusFlags::set(&self.shared.flags.check_requested, false);
        info!("Bus closed");
    }

    fn teardown_engine(&self) {
        if let Some(mut engine) = self.shared.engine.take() {
            engine.close();
        }
    }

    /// Engine open and the bus flagged operational.
    pub fn is_connected(&self) -> bool {
        self.shared.engine.is_live() && BusFlags::is_set(&self.shared.flags.in_op)
    }

    pub fn phase(&self) -> BusPhase {
        if self.workers.is_none() && !self.shared.engine.is_live() {
            BusPhase::Idle
        } else if BusFlags::is_set(&self.shared.flags.in_op) {
            BusPhase::Op
        } else {
            BusPhase::PreOp
        }
    }

    pub fn is_reconnecting(&self) -> bool {
        BusFlags::is_set(&self.shared.flags.reconnecting)
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        BusFlags::set(&self.shared.flags.auto_reconnect, enabled);
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }

    /// Number of devices on the live engine, 0 when closed.
    pub fn slave_count(&self) -> u16 {
        self.shared.engine.with(|e| e.slave_count()).unwrap_or(0)
    }

    /// Per-device diagnostics from the live engine.
    pub fn state_report(&self) -> Option<StateReport> {
        self.shared.engine.with(|e| StateReport::collect(e))
    }

    /// Runs `f` against the live engine, serialized with the loop threads.
    pub fn with_engine<R>(
        &self,
        f: impl FnOnce(&mut EngineAccess<'_>) -> R,
    ) -> Result<R, MasterError> {
        self.shared
            .engine
            .access(f)
            .ok_or_else(|| MasterError::connection("Bus is not open"))
    }

    /// A cloneable read-only view for other threads.
    pub fn probe(&self) -> BusProbe {
        BusProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for EtherCatBus {
    fn drop(&mut self) {
        if self.workers.is_some() || self.shared.engine.is_live() {
            warn!("Bus dropped while open; closing");
            self.close();
        }
    }
}

/// Observes a bus's flags and counters without owning it.
#[derive(Clone)]
pub struct BusProbe {
    shared: Arc<Shared>,
}

impl BusProbe {
    pub fn is_reconnecting(&self) -> bool {
        BusFlags::is_set(&self.shared.flags.reconnecting)
    }

    pub fn is_operational(&self) -> bool {
        BusFlags::is_set(&self.shared.flags.in_op)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.shared.counters.snapshot()
    }
}
