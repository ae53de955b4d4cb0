// crates/ecmaster-rs-panel/src/stub.rs
//! A well-behaved in-memory engine for session and router tests.

use ecmaster_rs::{
    AdapterInfo, AdapterSource, EcState, EngineError, EngineFactory, FieldbusEngine,
    ProcessDataPort, SlaveInfo, SlaveState,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub struct StubFactory {
    slaves: u16,
    open_delay: Duration,
}

impl StubFactory {
    pub fn new(slaves: u16) -> Self {
        Self {
            slaves,
            open_delay: Duration::ZERO,
        }
    }

    /// Makes every open take `delay`.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }
}

impl AdapterSource for StubFactory {
    fn adapters(&self) -> Result<Vec<AdapterInfo>, EngineError> {
        Ok(vec![
            AdapterInfo::new("eth0", "Onboard"),
            AdapterInfo::new("lo", ""),
            AdapterInfo::new("eth1", "PCIe NIC"),
            AdapterInfo::new("wlp2s0", "Wireless"),
        ])
    }
}

impl EngineFactory for StubFactory {
    fn open(&self, _adapter: &AdapterInfo) -> Result<Box<dyn FieldbusEngine>, EngineError> {
        thread::sleep(self.open_delay);
        Ok(Box::new(StubEngine {
            present: self.slaves,
            found: 0,
            state: EcState::Init,
            outputs: vec![vec![0]; usize::from(self.slaves)],
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct StubEngine {
    present: u16,
    found: u16,
    state: EcState,
    outputs: Vec<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl StubEngine {
    fn check(&self, slave: u16) -> Result<usize, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else if slave < self.found {
            Ok(usize::from(slave))
        } else {
            Err(EngineError::NoSuchSlave(slave))
        }
    }
}

impl FieldbusEngine for StubEngine {
    fn config_init(&mut self) -> Result<u16, EngineError> {
        self.found = self.present;
        self.state = EcState::PreOp;
        Ok(self.found)
    }

    fn config_map(&mut self) -> Result<(), EngineError> {
        self.state = EcState::SafeOp;
        Ok(())
    }

    fn slave_count(&self) -> u16 {
        self.found
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
    }

    fn request_state(&mut self, target: EcState) -> Result<(), EngineError> {
        self.state = target;
        Ok(())
    }

    fn state_check(&mut self, _target: EcState, _timeout: Duration) -> Result<EcState, EngineError> {
        Ok(self.state)
    }

    fn read_state(&mut self) -> Result<EcState, EngineError> {
        Ok(self.state)
    }

    fn process_data(&self) -> Arc<dyn ProcessDataPort> {
        Arc::new(StubPort {
            wkc: self.found * 3,
            closed: Arc::clone(&self.closed),
        })
    }

    fn slave_info(&self, slave: u16) -> Result<SlaveInfo, EngineError> {
        self.check(slave)?;
        Ok(SlaveInfo {
            name: format!("STUB{slave}"),
            state: SlaveState::new(self.state),
            output_bytes: 1,
            input_bytes: 1,
            ..SlaveInfo::default()
        })
    }

    fn slave_state(&self, slave: u16) -> Result<SlaveState, EngineError> {
        self.check(slave)?;
        Ok(SlaveState::new(self.state))
    }

    fn write_slave_state(&mut self, slave: u16, _state: SlaveState) -> Result<(), EngineError> {
        self.check(slave).map(drop)
    }

    fn slave_state_check(
        &mut self,
        slave: u16,
        _target: EcState,
        _timeout: Duration,
    ) -> Result<SlaveState, EngineError> {
        self.slave_state(slave)
    }

    fn reconfigure_slave(&mut self, slave: u16, _timeout: Duration) -> Result<bool, EngineError> {
        self.check(slave).map(|_| true)
    }

    fn recover_slave(&mut self, slave: u16, _timeout: Duration) -> Result<bool, EngineError> {
        self.check(slave).map(|_| true)
    }

    fn is_lost(&self, _slave: u16) -> bool {
        false
    }

    fn set_lost(&mut self, _slave: u16, _lost: bool) {}

    fn sdo_read(
        &mut self,
        slave: u16,
        index: u16,
        sub_index: u8,
        _max_len: Option<usize>,
    ) -> Result<Vec<u8>, EngineError> {
        self.check(slave)?;
        // Only the device type object exists.
        if index == 0x1000 {
            Ok(vec![0x91, 0x01, 0x00, 0x00])
        } else {
            Err(EngineError::SdoAbort {
                index,
                sub_index,
                abort_code: 0x0602_0000,
            })
        }
    }

    fn sdo_write(
        &mut self,
        slave: u16,
        _index: u16,
        _sub_index: u8,
        _data: &[u8],
    ) -> Result<(), EngineError> {
        self.check(slave).map(drop)
    }

    fn inputs(&self, slave: u16) -> Result<Vec<u8>, EngineError> {
        self.check(slave)?;
        Ok(vec![0])
    }

    fn output_len(&self, slave: u16) -> Result<usize, EngineError> {
        let i = self.check(slave)?;
        Ok(self.outputs[i].len())
    }

    fn set_outputs(&mut self, slave: u16, data: &[u8]) -> Result<(), EngineError> {
        let i = self.check(slave)?;
        self.outputs[i] = data.to_vec();
        Ok(())
    }
}

/// Every frame comes back complete.
struct StubPort {
    wkc: u16,
    closed: Arc<AtomicBool>,
}

impl StubPort {
    fn live(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

impl ProcessDataPort for StubPort {
    fn send_processdata(&self) -> Result<(), EngineError> {
        self.live()
    }

    fn receive_processdata(&self, _timeout: Duration) -> Result<u16, EngineError> {
        self.live().map(|()| self.wkc)
    }

    fn expected_wkc(&self) -> u16 {
        self.wkc
    }
}
