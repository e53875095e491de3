//! Per-bucket write gate
//!
//! Writers take a pass for their bucket; `pause` blocks new passes for that
//! bucket and waits until the ones already issued are dropped. Reads never
//! go through the gate.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct GateState {
    paused: HashSet<u32>,
    in_flight: HashMap<u32, usize>,
}

#[derive(Default)]
pub struct WriteGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Admission of one writer; releases on drop
pub struct GatePass<'a> {
    gate: &'a WriteGate,
    bucket: u32,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block while `bucket` is paused, then register a writer
    pub fn enter(&self, bucket: u32) -> GatePass<'_> {
        let mut state = self.state.lock();
        while state.paused.contains(&bucket) {
            self.changed.wait(&mut state);
        }
        *state.in_flight.entry(bucket).or_insert(0) += 1;
        GatePass { gate: self, bucket }
    }

    /// Stop admitting writers to `bucket` and wait for in-flight ones
    pub fn pause(&self, bucket: u32) {
        let mut state = self.state.lock();
        state.paused.insert(bucket);
        while state.in_flight.get(&bucket).copied().unwrap_or(0) > 0 {
            self.changed.wait(&mut state);
        }
    }

    pub fn resume(&self, bucket: u32) {
        let mut state = self.state.lock();
        if state.paused.remove(&bucket) {
            self.changed.notify_all();
        }
    }

    pub fn is_paused(&self, bucket: u32) -> bool {
        self.state.lock().paused.contains(&bucket)
    }

    pub fn in_flight(&self, bucket: u32) -> usize {
        self.state.lock().in_flight.get(&bucket).copied().unwrap_or(0)
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        if let Some(count) = state.in_flight.get_mut(&self.bucket) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&self.bucket);
            }
        }
        self.gate.changed.notify_all();
    }
}
