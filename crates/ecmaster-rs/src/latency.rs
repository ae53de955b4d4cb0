// crates/ecmaster-rs/src/latency.rs
//! Mailbox round-trip measurement against one device of an open bus.

use crate::bus::EtherCatBus;
use crate::error::MasterError;
use crate::od;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub const DEFAULT_SAMPLES: usize = 200;

/// Below this many successful reads no statistics are reported.
const MIN_SAMPLES: usize = 10;

/// Times repeated reads of the device type object (0x1000:0).
#[derive(Debug)]
pub struct LatencyProbe {
    slave: u16,
    samples: usize,
    abort: Option<Arc<AtomicBool>>,
    latencies_ms: Vec<f64>,
    attempted: usize,
    errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub samples: Vec<f64>,
    pub count: usize,
    pub errors: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub std_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyProbe {
    pub fn new(slave: u16) -> Self {
        Self {
            slave,
            samples: DEFAULT_SAMPLES,
            abort: None,
            latencies_ms: Vec::new(),
            attempted: 0,
            errors: 0,
        }
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    /// Stops the measurement early once `flag` is set.
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Runs the reads. Each read takes the engine lock on its own so the bus
    /// keeps cycling in between.
    pub fn run(&mut self, bus: &EtherCatBus) -> Result<(), MasterError> {
        let slave = bus.with_engine(|access| access.slave(self.slave))??;
        self.latencies_ms.clear();
        self.attempted = 0;
        self.errors = 0;

        for _ in 0..self.samples {
            if self.abort.as_ref().is_some_and(|a| a.load(Ordering::Relaxed)) {
                info!("Latency measurement aborted after {} reads", self.attempted);
                return Ok(());
            }
            self.attempted += 1;
            let started = Instant::now();
            let read = bus.with_engine(|access| {
                access.sdo_read(slave, od::IDX_DEVICE_TYPE_U32, 0, None)
            })?;
            match read {
                Ok(_) => self
                    .latencies_ms
                    .push(started.elapsed().as_secs_f64() * 1000.0),
                Err(_) => self.errors += 1,
            }
        }
        if self.errors > 0 {
            warn!("{}/{} latency reads failed", self.errors, self.attempted);
        }
        Ok(())
    }

    pub fn latencies_ms(&self) -> &[f64] {
        &self.latencies_ms
    }

    /// Reads made by the last run, which is fewer than requested when aborted.
    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn analyze(&self) -> Option<LatencyReport> {
        analyze_samples(&self.latencies_ms, self.attempted)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Summary statistics over successful read times. `attempted` is the number
/// of reads tried; the difference counts as errors.
pub fn analyze_samples(samples: &[f64], attempted: usize) -> Option<LatencyReport> {
    let n = samples.len();
    if n < MIN_SAMPLES {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mean = samples.iter().sum::<f64>() / n as f64;
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    let percentile = |p: f64| sorted[((n as f64 * p) as usize).min(n - 1)];

    Some(LatencyReport {
        samples: samples.iter().copied().map(round3).collect(),
        count: n,
        errors: attempted.saturating_sub(n),
        min_ms: round3(sorted[0]),
        max_ms: round3(sorted[n - 1]),
        mean_ms: round3(mean),
        median_ms: round3(sorted[n / 2]),
        std_ms: round3(variance.sqrt()),
        p95_ms: round3(percentile(0.95)),
        p99_ms: round3(percentile(0.99)),
    })
}
