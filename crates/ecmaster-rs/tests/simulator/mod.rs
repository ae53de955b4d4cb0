// crates/ecmaster-rs/tests/simulator/mod.rs
//! A scriptable in-memory fieldbus used by the integration tests.
//!
//! `SimulatedFactory` hands out `SimulatedEngine`s that all share one
//! `SimState`. Tests change the script (drop the link, fail a write, hang the
//! receive path) through `SimulatedFactory::script` while the bus runs.
#![allow(dead_code)]

pub mod recording;

pub use recording::{RecordingSlave, SharedLog};

use ecmaster_rs::{
    AdapterInfo, AdapterSource, EcState, EngineError, EngineFactory, FieldbusEngine,
    ProcessDataPort, SlaveInfo, SlaveState,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Abort code the simulator answers for a missing object.
pub const ABORT_OBJECT_MISSING: u32 = 0x0602_0000;

/// One device as the simulated bus presents it.
#[derive(Debug, Clone)]
pub struct SimSlave {
    pub name: String,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub state: SlaveState,
    pub al_status: u16,
    pub output_len: usize,
    pub inputs: Vec<u8>,
    pub outputs: Vec<u8>,
    pub lost: bool,
    pub od: HashMap<(u16, u8), Vec<u8>>,
}

impl SimSlave {
    /// A device with one RxPDO (0x1600) and one TxPDO (0x1A00) of one byte each.
    pub fn digital_io(name: &str) -> Self {
        let mut od = HashMap::new();
        od.insert((0x1000, 0), 0x0001_1389u32.to_le_bytes().to_vec());
        od.insert((0x1008, 0), name.as_bytes().to_vec());
        od.insert((0x1009, 0), b"01\0\0".to_vec());
        od.insert((0x100A, 0), b"v1.2".to_vec());
        od.insert((0x1C12, 0), vec![1]);
        od.insert((0x1C12, 1), 0x1600u16.to_le_bytes().to_vec());
        od.insert((0x1C13, 0), vec![1]);
        od.insert((0x1C13, 1), 0x1A00u16.to_le_bytes().to_vec());
        od.insert((0x1600, 0), vec![1]);
        od.insert((0x1600, 1), 0x7000_0108u32.to_le_bytes().to_vec());
        od.insert((0x1601, 0), vec![0]);
        od.insert((0x1A00, 0), vec![1]);
        od.insert((0x1A00, 1), 0x6000_0108u32.to_le_bytes().to_vec());
        Self {
            name: name.to_string(),
            vendor_id: 0x0000_0002,
            product_code: 0x0712_3052,
            revision: 0x0010_0000,
            state: SlaveState::new(EcState::Init),
            al_status: 0,
            output_len: 1,
            inputs: vec![0xA5],
            outputs: Vec::new(),
            lost: false,
            od,
        }
    }
}

/// An object-dictionary write as the simulator saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoWrite {
    pub slave: u16,
    pub index: u16,
    pub sub_index: u8,
    pub data: Vec<u8>,
}

/// The script shared by every engine the factory opens.
#[derive(Debug, Default)]
pub struct SimState {
    /// Devices present on the bus when an engine scans it.
    pub slaves: Vec<SimSlave>,
    /// Fail the n-th (1-based) object write addressed to a device, per engine.
    pub fail_write: Option<(u16, usize)>,
    /// Sleep this long in `receive_processdata` and then time out.
    pub hang_receive: Option<Duration>,
    /// No frame comes back and no device answers.
    pub link_down: bool,
    /// Devices refuse to leave SAFE-OP.
    pub stuck_in_safe_op: bool,
    pub fail_config_map: bool,
    /// This device keeps dropping back to PRE-OP and short-changes the
    /// working counter.
    pub faulted_slave: Option<u16>,
    /// Reconfiguring or re-addressing a device takes this long.
    pub slow_recovery: Option<Duration>,

    pub opens: usize,
    pub frames_sent: usize,
    /// Receives currently blocked in the simulator.
    pub receiving: usize,
    pub closes: usize,
    pub sdo_writes: Vec<SdoWrite>,
    pub state_writes: Vec<(u16, SlaveState)>,
    pub reconfigure_calls: usize,
    pub recover_calls: usize,
}

#[derive(Clone)]
pub struct SimulatedFactory {
    state: Arc<Mutex<SimState>>,
    adapters: Vec<AdapterInfo>,
}

impl SimulatedFactory {
    pub fn new(slaves: Vec<SimSlave>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                slaves,
                ..SimState::default()
            })),
            adapters: vec![AdapterInfo::new("sim0", "Simulated EtherCAT segment")],
        }
    }

    pub fn with_slaves(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| SimSlave::digital_io(&format!("SIM-IO{i}")))
                .collect(),
        )
    }

    /// A concrete engine, for tests that drive engine primitives directly.
    pub fn open_engine(&self) -> SimulatedEngine {
        self.script().opens += 1;
        SimulatedEngine {
            state: Arc::clone(&self.state),
            slaves: Vec::new(),
            writes_per_slave: HashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
            devices: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Locks the shared script for inspection or modification.
    pub fn script(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }
}

impl AdapterSource for SimulatedFactory {
    fn adapters(&self) -> Result<Vec<AdapterInfo>, EngineError> {
        Ok(self.adapters.clone())
    }
}

impl EngineFactory for SimulatedFactory {
    fn open(&self, _adapter: &AdapterInfo) -> Result<Box<dyn FieldbusEngine>, EngineError> {
        Ok(Box::new(self.open_engine()))
    }
}

pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
    slaves: Vec<SimSlave>,
    writes_per_slave: HashMap<u16, usize>,
    closed: Arc<AtomicBool>,
    devices: Arc<AtomicU16>,
}

/// Process-data side of a [`SimulatedEngine`].
pub struct SimulatedPort {
    state: Arc<Mutex<SimState>>,
    closed: Arc<AtomicBool>,
    devices: Arc<AtomicU16>,
}

impl SimulatedPort {
    fn script(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    fn live(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

impl ProcessDataPort for SimulatedPort {
    fn send_processdata(&self) -> Result<(), EngineError> {
        self.live()?;
        self.script().frames_sent += 1;
        Ok(())
    }

    fn receive_processdata(&self, _timeout: Duration) -> Result<u16, EngineError> {
        self.live()?;
        let (hang, link_down, faulted) = {
            let script = self.script();
            (script.hang_receive, script.link_down, script.faulted_slave.is_some())
        };
        if let Some(hang) = hang {
            self.script().receiving += 1;
            thread::sleep(hang);
            self.script().receiving -= 1;
            return Err(EngineError::Timeout);
        }
        if link_down {
            return Ok(0);
        }
        let expected = self.expected_wkc();
        Ok(if faulted { expected.saturating_sub(1) } else { expected })
    }

    fn expected_wkc(&self) -> u16 {
        self.devices.load(Ordering::Acquire) * 3
    }
}

impl SimulatedEngine {
    /// Overrides a device's state as if it had been read from the bus.
    pub fn force_state(&mut self, slave: u16, state: SlaveState) {
        self.slaves[usize::from(slave)].state = state;
    }

    fn script(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    fn link_down(&self) -> bool {
        self.script().link_down
    }

    fn live(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn device(&self, slave: u16) -> Result<&SimSlave, EngineError> {
        self.slaves
            .get(usize::from(slave))
            .ok_or(EngineError::NoSuchSlave(slave))
    }

    fn device_mut(&mut self, slave: u16) -> Result<&mut SimSlave, EngineError> {
        self.slaves
            .get_mut(usize::from(slave))
            .ok_or(EngineError::NoSuchSlave(slave))
    }

    fn lowest_state(&self) -> EcState {
        self.slaves
            .iter()
            .map(|s| s.state.state)
            .min_by_key(|s| s.code())
            .unwrap_or(EcState::None)
    }

    fn reachable(&self, target: EcState) -> EcState {
        if target == EcState::Op && self.script().stuck_in_safe_op {
            EcState::SafeOp
        } else {
            target
        }
    }
}

impl FieldbusEngine for SimulatedEngine {
    fn config_init(&mut self) -> Result<u16, EngineError> {
        self.live()?;
        let script = self.script();
        let slaves = if script.link_down {
            Vec::new()
        } else {
            script.slaves.clone()
        };
        drop(script);
        self.slaves = slaves;
        for slave in &mut self.slaves {
            slave.state = SlaveState::new(EcState::PreOp);
        }
        self.devices.store(self.slaves.len() as u16, Ordering::Release);
        Ok(self.slaves.len() as u16)
    }

    fn config_map(&mut self) -> Result<(), EngineError> {
        self.live()?;
        if self.script().fail_config_map {
            return Err(EngineError::Io("I/O map overflow".into()));
        }
        for slave in &mut self.slaves {
            slave.outputs = vec![0; slave.output_len];
            slave.state = SlaveState::new(EcState::SafeOp);
        }
        Ok(())
    }

    fn slave_count(&self) -> u16 {
        self.slaves.len() as u16
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.script().closes += 1;
        }
    }

    fn request_state(&mut self, target: EcState) -> Result<(), EngineError> {
        self.live()?;
        if self.link_down() {
            return Ok(());
        }
        let reached = self.reachable(target);
        for slave in &mut self.slaves {
            slave.state = SlaveState::new(reached);
        }
        Ok(())
    }

    fn state_check(&mut self, _target: EcState, _timeout: Duration) -> Result<EcState, EngineError> {
        self.read_state()
    }

    fn read_state(&mut self) -> Result<EcState, EngineError> {
        self.live()?;
        let (down, faulted) = {
            let script = self.script();
            (script.link_down, script.faulted_slave)
        };
        if down {
            for slave in &mut self.slaves {
                slave.state = SlaveState::new(EcState::None);
            }
        } else if let Some(device) = faulted.and_then(|i| self.slaves.get_mut(usize::from(i))) {
            device.state = SlaveState::new(EcState::PreOp);
        }
        Ok(self.lowest_state())
    }

    fn process_data(&self) -> Arc<dyn ProcessDataPort> {
        Arc::new(SimulatedPort {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            devices: Arc::clone(&self.devices),
        })
    }

    fn slave_info(&self, slave: u16) -> Result<SlaveInfo, EngineError> {
        let device = self.device(slave)?;
        Ok(SlaveInfo {
            name: device.name.clone(),
            vendor_id: device.vendor_id,
            product_code: device.product_code,
            revision: device.revision,
            state: device.state,
            al_status: device.al_status,
            output_bytes: device.output_len,
            input_bytes: device.inputs.len(),
        })
    }

    fn slave_state(&self, slave: u16) -> Result<SlaveState, EngineError> {
        Ok(self.device(slave)?.state)
    }

    fn write_slave_state(&mut self, slave: u16, state: SlaveState) -> Result<(), EngineError> {
        self.live()?;
        self.script().state_writes.push((slave, state));
        let device = self.device_mut(slave)?;
        device.state = SlaveState::new(state.state);
        Ok(())
    }

    fn slave_state_check(
        &mut self,
        slave: u16,
        _target: EcState,
        _timeout: Duration,
    ) -> Result<SlaveState, EngineError> {
        let down = self.link_down();
        let device = self.device_mut(slave)?;
        if down {
            device.state = SlaveState::new(EcState::None);
        }
        Ok(device.state)
    }

    fn reconfigure_slave(&mut self, slave: u16, _timeout: Duration) -> Result<bool, EngineError> {
        let slow = {
            let mut script = self.script();
            script.reconfigure_calls += 1;
            script.slow_recovery
        };
        if let Some(slow) = slow {
            thread::sleep(slow);
        }
        let down = self.link_down();
        let device = self.device_mut(slave)?;
        if down {
            return Ok(false);
        }
        device.state = SlaveState::new(EcState::SafeOp);
        Ok(true)
    }

    fn recover_slave(&mut self, slave: u16, _timeout: Duration) -> Result<bool, EngineError> {
        let slow = {
            let mut script = self.script();
            script.recover_calls += 1;
            script.slow_recovery
        };
        if let Some(slow) = slow {
            thread::sleep(slow);
        }
        let down = self.link_down();
        let device = self.device_mut(slave)?;
        if down {
            return Ok(false);
        }
        device.state = SlaveState::new(EcState::PreOp);
        Ok(true)
    }

    fn is_lost(&self, slave: u16) -> bool {
        self.device(slave).map(|d| d.lost).unwrap_or(false)
    }

    fn set_lost(&mut self, slave: u16, lost: bool) {
        if let Ok(device) = self.device_mut(slave) {
            device.lost = lost;
        }
    }

    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        max_len: Option<usize>,
    ) -> Result<Vec<u8>, EngineError> {
        self.live()?;
        let device = self.device(slave)?;
        let mut data = device
            .od
            .get(&(index, sub_index))
            .cloned()
            .ok_or(EngineError::SdoAbort {
                index,
                sub_index,
                abort_code: ABORT_OBJECT_MISSING,
            })?;
        if let Some(max_len) = max_len {
            data.truncate(max_len);
        }
        Ok(data)
    }

    fn sdo_write(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), EngineError> {
        self.live()?;
        self.device(slave)?;
        let count = {
            let n = self.writes_per_slave.entry(slave).or_insert(0);
            *n += 1;
            *n
        };
        let mut script = self.script();
        if script.fail_write == Some((slave, count)) {
            return Err(EngineError::SdoAbort {
                index,
                sub_index,
                abort_code: 0x0609_0030,
            });
        }
        script.sdo_writes.push(SdoWrite {
            slave,
            index,
            sub_index,
            data: data.to_vec(),
        });
        drop(script);
        self.device_mut(slave)?
            .od
            .insert((index, sub_index), data.to_vec());
        Ok(())
    }

    fn inputs(&self, slave: u16) -> Result<Vec<u8>, EngineError> {
        self.live()?;
        Ok(self.device(slave)?.inputs.clone())
    }

    fn output_len(&self, slave: u16) -> Result<usize, EngineError> {
        self.live()?;
        Ok(self.device(slave)?.output_len)
    }

    fn set_outputs(&mut self, slave: u16, data: &[u8]) -> Result<(), EngineError> {
        self.live()?;
        let device = self.device_mut(slave)?;
        if data.len() != device.output_len {
            return Err(EngineError::Io(format!(
                "output image is {} bytes, expected {}",
                data.len(),
                device.output_len
            )));
        }
        device.outputs = data.to_vec();
        Ok(())
    }
}
