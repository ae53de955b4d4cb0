// crates/ecmaster-rs-panel/src/session.rs
//! The single bus a panel controls, plus the document it persists to.

use crate::error::PanelError;
use ecmaster_rs::config::NetworkSection;
use ecmaster_rs::latency::DEFAULT_SAMPLES;
use ecmaster_rs::pdo::mapping::load_mapping_or_defaults;
use ecmaster_rs::{
    BusConfig, BusPhase, CounterSnapshot, EngineFactory, EtherCatBus, LatencyProbe,
    LatencyReport, MasterDocument, PdoMapping, SlaveDescription, discover,
    is_fieldbus_candidate, list_adapters,
};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterEntry {
    pub name: String,
    pub desc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterListing {
    pub adapters: Vec<AdapterEntry>,
    pub current: Option<String>,
    pub state: BusPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub ok: bool,
    pub state: BusPhase,
    pub slaves: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: BusPhase,
    pub adapter: Option<String>,
    /// Cycle time in milliseconds.
    pub cycle: f64,
    pub slaves: u16,
    /// Text of the last failed connect, empty when none.
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<CounterSnapshot>,
}

struct SessionState {
    bus: Option<EtherCatBus>,
    adapter: Option<String>,
    cycle_ms: f64,
    last_error: String,
    /// A connect is opening a bus outside the lock.
    opening: bool,
    /// Bumped by every disconnect; a connect that started under an older
    /// value discards its bus.
    epoch: u64,
}

impl SessionState {
    fn phase(&self) -> BusPhase {
        if self.opening {
            return BusPhase::PreOp;
        }
        self.bus.as_ref().map_or(BusPhase::Idle, EtherCatBus::phase)
    }
}

/// Holds the panel's bus between requests. All methods block; the server
/// calls them from blocking tasks.
pub struct BusSession {
    factory: Arc<dyn EngineFactory>,
    document_path: PathBuf,
    base_config: BusConfig,
    state: Mutex<SessionState>,
}

impl BusSession {
    /// Creates an idle session. Adapter and cycle time start from the
    /// document's `network` section when it has one.
    pub fn new(factory: Arc<dyn EngineFactory>, document_path: impl Into<PathBuf>) -> Self {
        Self::with_config(factory, document_path, BusConfig::default())
    }

    /// Like [`BusSession::new`], with `base` supplying timing and defaults for
    /// every bus the session opens.
    pub fn with_config(
        factory: Arc<dyn EngineFactory>,
        document_path: impl Into<PathBuf>,
        base: BusConfig,
    ) -> Self {
        let document_path = document_path.into();
        let mut initial = base.clone();
        match MasterDocument::load_or_default(&document_path) {
            Ok(doc) => {
                if let Some(network) = &doc.network {
                    initial.apply_network(network);
                }
            }
            Err(e) => warn!("Ignoring network settings: {e}"),
        }
        Self {
            factory,
            document_path,
            base_config: base,
            state: Mutex::new(SessionState {
                bus: None,
                adapter: initial.adapter,
                cycle_ms: initial.cycle_time.as_micros() as f64 / 1000.0,
                last_error: String::new(),
                opening: false,
                epoch: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn document_path(&self) -> &Path {
        &self.document_path
    }

    pub fn phase(&self) -> BusPhase {
        self.lock().phase()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.lock();
        SessionStatus {
            state: state.phase(),
            adapter: state.adapter.clone(),
            cycle: state.cycle_ms,
            slaves: state.bus.as_ref().map_or(0, EtherCatBus::slave_count),
            error: state.last_error.clone(),
            counters: state.bus.as_ref().map(EtherCatBus::counters),
        }
    }

    /// Adapters that can plausibly reach a fieldbus.
    pub fn adapters(&self) -> Result<AdapterListing, PanelError> {
        let adapters = list_adapters(self.factory.as_ref())?
            .into_iter()
            .filter(is_fieldbus_candidate)
            .map(|a| AdapterEntry {
                name: a.name,
                desc: a.description,
            })
            .collect();
        let state = self.lock();
        Ok(AdapterListing {
            adapters,
            current: state.adapter.clone(),
            state: state.phase(),
        })
    }

    fn mapping(&self) -> Option<PdoMapping> {
        if self.document_path.exists() {
            load_mapping_or_defaults(&self.document_path)
        } else {
            None
        }
    }

    /// Opens a new bus on `adapter` (or the session's adapter) with the given
    /// cycle time, replacing any bus that is not operational. On success the
    /// choice is persisted to the document's `network` section.
    ///
    /// The session lock is released while the bus opens; meanwhile the
    /// session reports PRE-OP and refuses a second connect.
    pub fn connect(
        &self,
        adapter: Option<String>,
        cycle_ms: Option<f64>,
    ) -> Result<ConnectOutcome, PanelError> {
        let (config, epoch, old) = {
            let mut state = self.lock();
            if state.opening {
                return Err(PanelError::Refused("Connect already in progress."));
            }
            if state.phase() == BusPhase::Op {
                return Err(PanelError::Refused("Already in OP. Stop first."));
            }
            let old = state.bus.take();
            state.last_error.clear();
            if let Some(adapter) = adapter.filter(|a| !a.is_empty()) {
                state.adapter = Some(adapter);
            }
            if let Some(ms) = cycle_ms.filter(|ms| ms.is_finite() && *ms > 0.0) {
                state.cycle_ms = ms;
            }
            state.opening = true;
            let config = BusConfig {
                adapter: state.adapter.clone(),
                cycle_time: Duration::from_micros((state.cycle_ms * 1000.0).round() as u64),
                ..self.base_config.clone()
            };
            (config, state.epoch, old)
        };
        if let Some(mut old) = old {
            old.close();
        }

        let (adapter, cycle_time) = (config.adapter.clone(), config.cycle_time);
        let mut bus = EtherCatBus::with_mapping(Arc::clone(&self.factory), config, self.mapping());
        let opened = bus.open();

        let mut state = self.lock();
        state.opening = false;
        if state.epoch != epoch {
            drop(state);
            bus.close();
            info!("Panel disconnected while connecting; bus discarded");
            return Err(PanelError::Refused("Disconnected while connecting."));
        }
        if let Err(e) = opened {
            warn!("Connect failed: {e}");
            state.last_error = e.to_string();
            return Err(e.into());
        }
        let slaves = bus.slave_count();
        let phase = bus.phase();
        info!(
            "Panel connected on {} ({slaves} slaves, {} ms)",
            adapter.as_deref().unwrap_or("<first adapter>"),
            state.cycle_ms
        );
        state.bus = Some(bus);
        drop(state);
        self.persist_network(adapter, cycle_time);
        Ok(ConnectOutcome {
            ok: true,
            state: phase,
            slaves,
        })
    }

    fn persist_network(&self, adapter: Option<String>, cycle_time: Duration) {
        let result = MasterDocument::load_or_default(&self.document_path).and_then(|mut doc| {
            doc.network = Some(NetworkSection::new(adapter, cycle_time));
            doc.save(&self.document_path)
        });
        if let Err(e) = result {
            warn!("Failed to save network settings: {e}");
        }
    }

    /// Closes the bus, if any, and clears the last error.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.epoch = state.epoch.wrapping_add(1);
        if let Some(mut bus) = state.bus.take() {
            bus.close();
            info!("Panel disconnected");
        }
        state.last_error.clear();
    }

    /// Scans the bus without entering OP. Refused while a bus is open, since
    /// discovery needs the adapter to itself.
    pub fn discover(&self, adapter: Option<String>) -> Result<Vec<SlaveDescription>, PanelError> {
        let state = self.lock();
        if state.phase() != BusPhase::Idle {
            return Err(PanelError::Refused(
                "Stop first: discovery needs exclusive adapter access.",
            ));
        }
        let adapter = adapter
            .filter(|a| !a.is_empty())
            .or_else(|| state.adapter.clone());
        let mapping = self.mapping();
        Ok(discover(
            self.factory.as_ref(),
            adapter.as_deref(),
            mapping.as_ref(),
        )?)
    }

    /// Times `samples` mailbox reads against device `slave`.
    pub fn run_latency_probe(
        &self,
        slave: u16,
        samples: Option<usize>,
    ) -> Result<LatencyReport, PanelError> {
        let state = self.lock();
        let bus = match &state.bus {
            Some(bus) if bus.phase() == BusPhase::Op => bus,
            _ => return Err(PanelError::Refused("Bus must be in OP to run the network test.")),
        };
        let mut probe = LatencyProbe::new(slave).with_samples(samples.unwrap_or(DEFAULT_SAMPLES));
        probe.run(bus)?;
        probe.analyze().ok_or(PanelError::InsufficientData)
    }

    /// The stored document as raw JSON, or an empty skeleton.
    pub fn pdo_document(&self) -> Result<serde_json::Value, PanelError> {
        if !self.document_path.exists() {
            return Ok(serde_json::json!({ "default": {}, "slaves": {} }));
        }
        let doc = MasterDocument::load(&self.document_path)?;
        serde_json::to_value(&doc)
            .map_err(|e| PanelError::from(ecmaster_rs::ConfigurationError::Document(e.to_string())))
    }

    /// Merges `update` into the stored document. A `network` section also
    /// becomes the session's adapter and cycle time for the next connect.
    pub fn update_pdo_document(&self, update: MasterDocument) -> Result<(), PanelError> {
        let mut state = self.lock();
        let mut doc = MasterDocument::load_or_default(&self.document_path)?;
        if let Some(network) = &update.network {
            if network.adapter.is_some() {
                state.adapter = network.adapter.clone().filter(|a| !a.is_empty());
            }
            if let Some(cycle) = network.cycle_time() {
                state.cycle_ms = cycle.as_micros() as f64 / 1000.0;
            }
        }
        doc.merge(update);
        doc.save(&self.document_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubFactory;
    use ecmaster_rs::config::AssignmentEntry;
    use std::thread;
    use std::time::Instant;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn document(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ecmaster-panel-{name}-{}.json",
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();
        path
    }

    fn session(path: &Path, slaves: u16) -> BusSession {
        BusSession::new(Arc::new(StubFactory::new(slaves)), path)
    }

    fn wait_for_phase(session: &BusSession, phase: BusPhase) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if session.phase() == phase {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn adapters_skip_virtual_links() {
        let path = document("adapters");
        let listing = session(&path, 1).adapters().unwrap();
        let names: Vec<&str> = listing.adapters.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["eth0", "eth1"]);
        assert_eq!(listing.state, BusPhase::Idle);
    }

    #[test]
    fn connect_persists_the_network_section() {
        init_logger();
        let path = document("connect");
        let session = session(&path, 2);

        let outcome = session.connect(Some("eth1".into()), Some(4.0)).unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.state, BusPhase::Op);
        assert_eq!(outcome.slaves, 2);

        let status = session.status();
        assert_eq!(status.adapter.as_deref(), Some("eth1"));
        assert_eq!(status.cycle, 4.0);
        assert!(status.error.is_empty());

        let doc = MasterDocument::load(&path).unwrap();
        let network = doc.network.unwrap();
        assert_eq!(network.adapter.as_deref(), Some("eth1"));
        assert_eq!(network.cycle_time(), Some(Duration::from_millis(4)));

        // A fresh session picks the saved choice up again.
        session.disconnect();
        let reloaded = BusSession::new(Arc::new(StubFactory::new(1)), &path);
        assert_eq!(reloaded.status().adapter.as_deref(), Some("eth1"));
        assert_eq!(reloaded.status().cycle, 4.0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn operational_bus_refuses_connect_and_discover() {
        init_logger();
        let path = document("refuse");
        let session = session(&path, 1);
        session.connect(None, None).unwrap();

        let err = session.connect(None, None).unwrap_err();
        assert_eq!(err.to_string(), "Already in OP. Stop first.");
        assert!(matches!(session.discover(None), Err(PanelError::Refused(_))));

        session.disconnect();
        assert_eq!(session.phase(), BusPhase::Idle);
        assert_eq!(session.discover(None).unwrap().len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn status_answers_while_a_connect_is_opening() {
        init_logger();
        let path = document("opening");
        let factory = StubFactory::new(1).with_open_delay(Duration::from_millis(300));
        let session = Arc::new(BusSession::new(Arc::new(factory), &path));

        let connecting = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.connect(None, None))
        };
        assert!(wait_for_phase(&session, BusPhase::PreOp));

        let started = Instant::now();
        let status = session.status();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(status.state, BusPhase::PreOp);
        assert_eq!(
            session.connect(None, None).unwrap_err().to_string(),
            "Connect already in progress."
        );
        assert!(matches!(session.discover(None), Err(PanelError::Refused(_))));

        let outcome = connecting.join().unwrap().unwrap();
        assert_eq!(outcome.state, BusPhase::Op);
        assert_eq!(session.status().slaves, 1);
        session.disconnect();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn disconnect_discards_a_bus_still_opening() {
        init_logger();
        let path = document("discard");
        let factory = StubFactory::new(1).with_open_delay(Duration::from_millis(200));
        let session = Arc::new(BusSession::new(Arc::new(factory), &path));

        let connecting = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.connect(None, None))
        };
        assert!(wait_for_phase(&session, BusPhase::PreOp));
        session.disconnect();

        let err = connecting.join().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Disconnected while connecting.");
        assert_eq!(session.phase(), BusPhase::Idle);
        assert!(!path.exists());
    }

    #[test]
    fn failed_connect_is_remembered() {
        init_logger();
        let path = document("failed");
        let session = session(&path, 0);

        let err = session.connect(None, None).unwrap_err();
        assert!(matches!(err, PanelError::Bus(_)));
        let status = session.status();
        assert_eq!(status.state, BusPhase::Idle);
        assert!(status.error.contains("No EtherCAT slaves found"), "{}", status.error);
        assert!(!path.exists());

        session.disconnect();
        assert!(session.status().error.is_empty());
    }

    #[test]
    fn latency_probe_requires_op() {
        init_logger();
        let path = document("latency");
        let session = session(&path, 1);
        assert!(matches!(
            session.run_latency_probe(0, Some(20)),
            Err(PanelError::Refused(_))
        ));

        session.connect(None, None).unwrap();
        let report = session.run_latency_probe(0, Some(20)).unwrap();
        assert_eq!(report.count, 20);
        assert_eq!(report.errors, 0);

        assert!(matches!(
            session.run_latency_probe(0, Some(5)),
            Err(PanelError::InsufficientData)
        ));
        assert!(matches!(
            session.run_latency_probe(5, Some(20)),
            Err(PanelError::Bus(_))
        ));
        session.disconnect();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn document_update_merges_slave_entries() {
        let path = document("merge");
        let mut stored = MasterDocument::default();
        stored.set_slave(0, AssignmentEntry::new(&[0x1600], &[0x1A00]));
        stored.set_slave(1, AssignmentEntry::new(&[0x1601], &[]));
        stored.extra.insert("site".into(), serde_json::json!("line 3"));
        stored.save(&path).unwrap();
        let session = session(&path, 1);

        let update = MasterDocument::from_json(
            r#"{
                "slaves": { "1": { "rx_pdo": ["0x1602"], "tx_pdo": ["0x1A02"] } },
                "network": { "adapter": "eth1", "cycle_ms": 2.5 }
            }"#,
        )
        .unwrap();
        session.update_pdo_document(update).unwrap();

        let raw = session.pdo_document().unwrap();
        assert_eq!(raw["slaves"]["0"]["rx_pdo"][0], "0x1600");
        assert_eq!(raw["slaves"]["1"]["rx_pdo"][0], "0x1602");
        assert_eq!(raw["network"]["adapter"], "eth1");
        assert_eq!(raw["site"], "line 3");
        assert_eq!(session.status().cycle, 2.5);
        assert_eq!(session.status().adapter.as_deref(), Some("eth1"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_document_reads_as_skeleton() {
        let path = document("skeleton");
        let raw = session(&path, 1).pdo_document().unwrap();
        assert_eq!(raw, serde_json::json!({ "default": {}, "slaves": {} }));
    }
}
