// crates/ecmaster-rs/src/bus/counters.rs
//! Counters shared between the loop threads and observers.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Communication and fault counters, updated lock-free from the loop threads.
#[derive(Debug, Default)]
pub struct BusCounters {
    frames_ok: AtomicU64,
    frames_bad: AtomicU64,
    last_wkc: AtomicU32,
    callback_faults: AtomicU64,
    recoveries: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`BusCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub frames_ok: u64,
    pub frames_bad: u64,
    pub last_wkc: u16,
    pub callback_faults: u64,
    pub recoveries: u64,
    pub reconnects: u64,
}

impl BusCounters {
    pub(crate) fn frame_ok(&self, wkc: u16) {
        self.last_wkc.store(u32::from(wkc), Ordering::Relaxed);
        self.frames_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_mismatch(&self, wkc: u16) {
        self.last_wkc.store(u32::from(wkc), Ordering::Relaxed);
        self.frames_bad.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_error(&self) {
        self.frames_bad.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn callback_fault(&self) {
        self.callback_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears the frame counters after the bus was rebuilt.
    pub(crate) fn reset_frames(&self) {
        self.frames_ok.store(0, Ordering::Relaxed);
        self.frames_bad.store(0, Ordering::Relaxed);
        self.last_wkc.store(0, Ordering::Relaxed);
    }

    pub(crate) fn last_wkc(&self) -> u16 {
        self.last_wkc.load(Ordering::Relaxed) as u16
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frames_ok: self.frames_ok.load(Ordering::Relaxed),
            frames_bad: self.frames_bad.load(Ordering::Relaxed),
            last_wkc: self.last_wkc(),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Flags read by all three loops.
#[derive(Debug, Default)]
pub(crate) struct BusFlags {
    /// A full reconnection is running; the fast loops must not touch the engine.
    pub reconnecting: AtomicBool,
    /// The bus reached OPERATIONAL and has not been torn down since.
    pub in_op: AtomicBool,
    /// The frame loop saw a working-counter mismatch while operational.
    pub check_requested: AtomicBool,
    pub auto_reconnect: AtomicBool,
    /// `close` has begun; a reconnection in flight must not install a new engine.
    pub shutdown: AtomicBool,
}

impl BusFlags {
    pub fn is_set(flag: &AtomicBool) -> bool {
        flag.load(Ordering::Acquire)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Release);
    }
}

/// Consecutive failed health checks. Unlike a threshold counter that decays,
/// a single clean pass resets it to zero.
#[derive(Debug, Default)]
pub(crate) struct FailureStreak {
    count: u32,
    threshold: u32,
}

impl FailureStreak {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    pub fn fail(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the threshold is reached. Resets the streak when it is.
    pub fn check_and_reset(&mut self) -> bool {
        if self.threshold > 0 && self.count >= self.threshold {
            self.count = 0;
            true
        } else {
            false
        }
    }
}
