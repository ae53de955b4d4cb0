// crates/ecmaster-rs/src/bus/cycle.rs
//! The loop threads of an open bus, the frame transceiver, and their
//! shutdown plumbing.

use super::Shared;
use super::counters::{BusFlags, FailureStreak};
use super::guard::guarded;
use super::recovery;
use super::slot::EngineLease;
use crate::error::EngineError;
use crate::state::EcState;
use crossbeam_channel::{
    Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use log::{debug, error, info, trace, warn};
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Receiving half of a stop signal. The sender is never used to send; dropping
/// it disconnects the channel, which wakes every waiting loop at once.
#[derive(Clone)]
pub(crate) struct StopSignal {
    rx: Receiver<()>,
}

pub(crate) fn stop_pair() -> (Sender<()>, StopSignal) {
    let (tx, rx) = bounded(0);
    (tx, StopSignal { rx })
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `period` or until stopped. Returns `true` when stopped.
    pub fn sleep(&self, period: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(period),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

struct LoopThread {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Running loop threads of one open bus, including the frame transceiver.
pub(crate) struct Workers {
    stop: Option<Sender<()>>,
    threads: Vec<LoopThread>,
}

impl Workers {
    pub fn start(shared: &Arc<Shared>) -> io::Result<Self> {
        let (stop_tx, stop) = stop_pair();
        let mut workers = Workers {
            stop: Some(stop_tx),
            threads: Vec::with_capacity(4),
        };
        if let Err(e) = workers.spawn_all(shared, stop) {
            workers.stop(shared.config.timing.join_timeout);
            return Err(e);
        }
        info!(
            "Loop threads started (frame {:?}, PDO {:?}, health {:?})",
            shared.config.timing.frame_period,
            shared.config.cycle_time,
            shared.config.timing.health_period
        );
        Ok(workers)
    }

    fn spawn_all(&mut self, shared: &Arc<Shared>, stop: StopSignal) -> io::Result<()> {
        let (job_tx, job_rx) = bounded::<()>(1);
        let (reply_tx, reply_rx) = bounded::<FrameReply>(1);
        let link = FrameLink {
            jobs: job_tx,
            replies: reply_rx,
        };

        // The transceiver ends once the frame loop drops its job sender, so
        // it is spawned, and joined, right after the frame loop.
        let (thread_shared, thread_stop) = (Arc::clone(shared), stop.clone());
        self.spawn("ecat-frame", move || frame_loop(thread_shared, thread_stop, link))?;
        let thread_shared = Arc::clone(shared);
        self.spawn("ecat-xchg", move || transceiver(thread_shared, job_rx, reply_tx))?;
        let (thread_shared, thread_stop) = (Arc::clone(shared), stop.clone());
        self.spawn("ecat-pdo", move || pdo_loop(thread_shared, thread_stop))?;
        let thread_shared = Arc::clone(shared);
        self.spawn("ecat-health", move || health_loop(thread_shared, stop))
    }

    fn spawn(&mut self, name: &'static str, body: impl FnOnce() + Send + 'static) -> io::Result<()> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| {
                error!("Failed to spawn {name} thread: {e}");
                e
            })?;
        self.threads.push(LoopThread { name, handle });
        Ok(())
    }

    /// Signals every loop and waits up to `timeout` in total for them to exit.
    /// A thread still running at the deadline is detached.
    pub fn stop(mut self, timeout: Duration) {
        self.stop.take();
        let deadline = Instant::now() + timeout;
        for thread in self.threads.drain(..) {
            join_bounded(thread, deadline);
        }
        debug!("Loop threads stopped");
    }
}

fn join_bounded(thread: LoopThread, deadline: Instant) {
    while !thread.handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    if thread.handle.is_finished() {
        if thread.handle.join().is_err() {
            error!("{} thread panicked", thread.name);
        }
    } else {
        warn!("{} thread did not stop in time; detaching it", thread.name);
    }
}

// --- Frame exchange ---

#[derive(Debug)]
enum FrameReply {
    Done { wkc: u16, expected: u16 },
    Failed(EngineError),
    /// No engine installed.
    Idle,
}

/// One send/receive on the process-data port. The engine slot is only locked
/// to fetch the port, so mailbox and state work never delay a frame.
fn exchange(shared: &Shared) -> FrameReply {
    let Some(port) = shared.engine.port() else {
        return FrameReply::Idle;
    };
    let result = port
        .send_processdata()
        .and_then(|()| port.receive_processdata(shared.config.timing.receive_timeout));
    match result {
        Ok(wkc) => FrameReply::Done {
            wkc,
            expected: port.expected_wkc(),
        },
        Err(e) => FrameReply::Failed(e),
    }
}

/// The frame loop's side of the transceiver hand-off.
struct FrameLink {
    jobs: Sender<()>,
    replies: Receiver<FrameReply>,
}

/// Performs exchanges on request so the frame loop can bound its wait even
/// when the engine does not honor its receive timeout.
fn transceiver(shared: Arc<Shared>, jobs: Receiver<()>, replies: Sender<FrameReply>) {
    while jobs.recv().is_ok() {
        if replies.send(exchange(&shared)).is_err() {
            break;
        }
    }
}

fn frame_loop(shared: Arc<Shared>, stop: StopSignal, link: FrameLink) {
    let timing = &shared.config.timing;
    let mut in_flight = false;
    while !stop.is_stopped() {
        if BusFlags::is_set(&shared.flags.reconnecting) {
            if stop.sleep(timing.reconnect_poll) {
                break;
            }
            continue;
        }

        if !in_flight {
            match link.jobs.try_send(()) {
                Ok(()) => in_flight = true,
                Err(TrySendError::Full(())) => {}
                Err(TrySendError::Disconnected(())) => break,
            }
        }

        match link.replies.recv_timeout(timing.receive_timeout) {
            Ok(reply) => {
                in_flight = false;
                match reply {
                    FrameReply::Done { wkc, expected } if wkc == expected => {
                        shared.counters.frame_ok(wkc);
                    }
                    FrameReply::Done { wkc, expected } => {
                        trace!("[PDO] Working counter {wkc}, expected {expected}");
                        shared.counters.frame_mismatch(wkc);
                        if BusFlags::is_set(&shared.flags.in_op) {
                            BusFlags::set(&shared.flags.check_requested, true);
                        }
                    }
                    FrameReply::Failed(e) => {
                        trace!("[PDO] Exchange failed: {e}");
                        shared.counters.frame_error();
                    }
                    FrameReply::Idle => {}
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                trace!("[PDO] Exchange did not complete within {:?}", timing.receive_timeout);
                shared.counters.frame_error();
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if stop.sleep(timing.frame_period) {
            break;
        }
    }
    // Dropping `link` ends the transceiver once its current exchange returns.
}

// --- PDO update ---

fn pdo_loop(shared: Arc<Shared>, stop: StopSignal) {
    let timing = &shared.config.timing;
    while !stop.is_stopped() {
        if BusFlags::is_set(&shared.flags.reconnecting) {
            if stop.sleep(timing.reconnect_poll) {
                break;
            }
            continue;
        }
        {
            let mut slaves = shared.lock_slaves();
            // `close` raises the flag before it takes this lock to stop devices.
            if BusFlags::is_set(&shared.flags.shutdown) {
                break;
            }
            shared.engine.access(|access| {
                let reconnecting = BusFlags::is_set(&shared.flags.reconnecting);
                for registered in slaves.iter_mut() {
                    let index = registered.handle.slave_index();
                    guarded(&shared.counters, index, "on_cycle", || {
                        registered.handle.on_cycle(&mut *access, reconnecting)
                    });
                }
            });
        }
        if stop.sleep(shared.config.cycle_time) {
            break;
        }
    }
}

// --- Health check ---

#[derive(Debug)]
pub(crate) enum HealthOutcome {
    /// Nothing to do, or every device was found in OP.
    Clean,
    /// At least one device was out of OP; recovery was attempted.
    Degraded,
    Error(EngineError),
}

/// One health-check pass: when the working counter is short or a check was
/// requested, refresh states and recover every device not in OP.
///
/// The engine lock is taken per primitive, so the PDO loop keeps running
/// between the steps of a slow recovery.
pub(crate) fn health_pass(shared: &Shared) -> HealthOutcome {
    if !BusFlags::is_set(&shared.flags.in_op) {
        return HealthOutcome::Clean;
    }
    match check_and_recover(shared) {
        Ok(outcome) => outcome,
        Err(e) => HealthOutcome::Error(e),
    }
}

fn check_and_recover(shared: &Shared) -> Result<HealthOutcome, EngineError> {
    let timing = &shared.config.timing;
    let (Some(mut engine), Some(port)) = (shared.engine.lease(), shared.engine.port()) else {
        return Err(EngineError::Closed);
    };
    let short = shared.counters.last_wkc() < port.expected_wkc();
    let requested = shared.flags.check_requested.swap(false, Ordering::AcqRel);
    if !short && !requested {
        return Ok(HealthOutcome::Clean);
    }

    engine.call(|e| e.read_state())?;
    let mut degraded = false;
    for index in 0..engine.lease(|e| e.slave_count())? {
        let state = engine.call(|e| e.slave_state(index))?;
        if state.is(EcState::Op) {
            continue;
        }
        degraded = true;
        debug!("Slave {index} is {state}, attempting recovery");
        recovery::recover_leased(&mut engine, index, timing)?;
        shared.counters.recovery();
    }
    if degraded {
        BusFlags::set(&shared.flags.check_requested, true);
        Ok(HealthOutcome::Degraded)
    } else {
        Ok(HealthOutcome::Clean)
    }
}

fn health_loop(shared: Arc<Shared>, stop: StopSignal) {
    let timing = &shared.config.timing;
    let mut streak = FailureStreak::new(timing.health_threshold);
    while !stop.is_stopped() {
        if BusFlags::is_set(&shared.flags.reconnecting) {
            streak.reset();
            if stop.sleep(timing.health_pause) {
                break;
            }
            continue;
        }

        match health_pass(&shared) {
            HealthOutcome::Clean => streak.reset(),
            HealthOutcome::Degraded => streak.fail(),
            HealthOutcome::Error(e) => {
                debug!("Health check failed: {e}");
                streak.fail();
            }
        }

        if BusFlags::is_set(&shared.flags.auto_reconnect)
            && !BusFlags::is_set(&shared.flags.reconnecting)
        {
            let failures = streak.count();
            if streak.check_and_reset() {
                warn!(
                    "Lost contact for {:.1}s, triggering reconnect",
                    (timing.health_period * failures).as_secs_f64()
                );
                recovery::reconnect(&shared, &stop);
            }
        }

        if stop.sleep(timing.health_period) {
            break;
        }
    }
}
