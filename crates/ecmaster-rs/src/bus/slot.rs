// crates/ecmaster-rs/src/bus/slot.rs
use crate::access::EngineAccess;
use crate::error::EngineError;
use crate::hal::{FieldbusEngine, ProcessDataPort};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Installed {
    engine: Box<dyn FieldbusEngine>,
    generation: u64,
}

/// Holds the live engine, if any, tagged with the generation it was installed
/// under. Engines are only ever swapped whole.
///
/// The engine's process-data port sits behind its own lock, so the frame loop
/// never waits for state or mailbox work holding the engine.
#[derive(Default)]
pub(crate) struct EngineSlot {
    inner: Mutex<Option<Installed>>,
    port: Mutex<Option<Arc<dyn ProcessDataPort>>>,
    next_generation: AtomicU64,
}

impl EngineSlot {
    fn lock(&self) -> MutexGuard<'_, Option<Installed>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the generation for an engine about to be configured.
    pub fn reserve_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock_port(&self) -> MutexGuard<'_, Option<Arc<dyn ProcessDataPort>>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn install(&self, engine: Box<dyn FieldbusEngine>, generation: u64) {
        let port = engine.process_data();
        let mut inner = self.lock();
        *inner = Some(Installed { engine, generation });
        *self.lock_port() = Some(port);
    }

    pub fn take(&self) -> Option<Box<dyn FieldbusEngine>> {
        let mut inner = self.lock();
        self.lock_port().take();
        inner.take().map(|i| i.engine)
    }

    pub fn is_live(&self) -> bool {
        self.lock().is_some()
    }

    /// The live engine's process-data port. Never waits on the engine lock.
    pub fn port(&self) -> Option<Arc<dyn ProcessDataPort>> {
        self.lock_port().clone()
    }

    /// Runs `f` against the live engine. `None` when the slot is empty.
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn FieldbusEngine) -> R) -> Option<R> {
        let mut guard = self.lock();
        guard.as_mut().map(|i| f(i.engine.as_mut()))
    }

    /// Like [`EngineSlot::with`] but through a generation-checked view.
    pub fn access<R>(&self, f: impl FnOnce(&mut EngineAccess<'_>) -> R) -> Option<R> {
        let mut guard = self.lock();
        guard.as_mut().map(|i| {
            let mut access = EngineAccess::new(i.engine.as_mut(), i.generation);
            f(&mut access)
        })
    }

    /// A lease on the engine installed right now. `None` when the slot is empty.
    pub fn lease(&self) -> Option<SlotLease<'_>> {
        let generation = self.lock().as_ref()?.generation;
        Some(SlotLease {
            slot: self,
            generation,
        })
    }
}

/// Runs engine primitives one at a time.
pub(crate) trait EngineLease {
    fn lease<R>(
        &mut self,
        f: impl FnOnce(&mut dyn FieldbusEngine) -> R,
    ) -> Result<R, EngineError>;

    fn call<R>(
        &mut self,
        f: impl FnOnce(&mut dyn FieldbusEngine) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        self.lease(f)?
    }
}

/// Takes the slot lock for each primitive and releases it in between. Fails
/// with `Closed` once the engine it was created for is gone or replaced.
pub(crate) struct SlotLease<'a> {
    slot: &'a EngineSlot,
    generation: u64,
}

impl EngineLease for SlotLease<'_> {
    fn lease<R>(
        &mut self,
        f: impl FnOnce(&mut dyn FieldbusEngine) -> R,
    ) -> Result<R, EngineError> {
        let mut guard = self.slot.lock();
        match guard.as_mut() {
            Some(i) if i.generation == self.generation => Ok(f(i.engine.as_mut())),
            _ => Err(EngineError::Closed),
        }
    }
}
