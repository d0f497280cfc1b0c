//! Per-process throughput derived from cumulative byte counters.

use crate::backends::monitor::{ByteCounters, CounterSource};
use crate::process::ProcessRecord;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Speeds and totals of one process as of the last update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSample {
    pub download_speed: u64,
    pub upload_speed: u64,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    last: u64,
    speed: u64,
    total: u64,
}

impl CounterState {
    fn first(current: u64) -> Self {
        Self {
            last: current,
            speed: 0,
            total: current,
        }
    }

    /// Fold in a new cumulative reading taken `elapsed_secs` after the last.
    fn advance(&mut self, current: u64, elapsed_secs: f64) {
        if current < self.last {
            // Counter went backwards: new baseline, nothing to account
            self.last = current;
            self.speed = 0;
            return;
        }

        let delta = current - self.last;
        self.last = current;
        self.total = self.total.saturating_add(delta);
        if elapsed_secs > 0.0 {
            self.speed = (delta as f64 / elapsed_secs) as u64;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PidState {
    rx: CounterState,
    tx: CounterState,
    sampled_at: Instant,
}

pub struct TrafficMeter {
    source: Box<dyn CounterSource>,
    states: HashMap<u32, PidState>,
}

impl TrafficMeter {
    pub fn new(source: Box<dyn CounterSource>) -> Self {
        Self {
            source,
            states: HashMap::new(),
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Sample the counter source and recompute speeds
    pub fn update(&mut self) -> Result<()> {
        let counters = self.source.counters()?;
        self.apply(counters, Instant::now());
        Ok(())
    }

    fn apply(&mut self, counters: HashMap<u32, ByteCounters>, now: Instant) {
        for (pid, reading) in counters {
            match self.states.get_mut(&pid) {
                Some(state) => {
                    // Measured per pid, never assumed from the timer period
                    let elapsed = now.saturating_duration_since(state.sampled_at).as_secs_f64();
                    state.rx.advance(reading.rx_bytes, elapsed);
                    state.tx.advance(reading.tx_bytes, elapsed);
                    state.sampled_at = now;
                }
                None => {
                    self.states.insert(
                        pid,
                        PidState {
                            rx: CounterState::first(reading.rx_bytes),
                            tx: CounterState::first(reading.tx_bytes),
                            sampled_at: now,
                        },
                    );
                }
            }
        }
    }

    pub fn sample(&self, pid: u32) -> Option<TrafficSample> {
        self.states.get(&pid).map(|state| TrafficSample {
            download_speed: state.rx.speed,
            upload_speed: state.tx.speed,
            total_downloaded: state.rx.total,
            total_uploaded: state.tx.total,
        })
    }

    /// Copy the latest speeds and totals into a process record
    pub fn annotate(&self, record: &mut ProcessRecord) {
        let sample = self.sample(record.pid).unwrap_or_default();
        record.download_speed = sample.download_speed;
        record.upload_speed = sample.upload_speed;
        record.total_downloaded = sample.total_downloaded;
        record.total_uploaded = sample.total_uploaded;
    }

    /// Drop state of processes that have exited
    pub fn retain(&mut self, live: &HashSet<u32>) {
        self.states.retain(|pid, _| live.contains(pid));
        self.source.retain_pids(live);
    }
}
