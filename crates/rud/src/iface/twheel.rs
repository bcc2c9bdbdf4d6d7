// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hashed timer wheel keyed by coarse ticks.
//!
//! One pending deadline per endpoint, slotted at `timer_tick / 4`
//! resolution. Entries carry a generation so a superseded or canceled timer
//! expires silently: the caller compares the returned generation against the
//! endpoint's current one and ignores stale hits.

use std::time::{Duration, Instant};

const NUM_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Entry {
    id: u32,
    gen: u64,
    deadline: Instant,
}

pub struct TimerWheel {
    slots: Vec<Vec<Entry>>,
    resolution: Duration,
    current: usize,
    /// Time at the boundary of the current slot.
    now: Instant,
}

impl TimerWheel {
    pub fn new(resolution: Duration, now: Instant) -> Self {
        let resolution = resolution.max(Duration::from_micros(100));
        Self {
            slots: (0..NUM_SLOTS).map(|_| Vec::new()).collect(),
            resolution,
            current: 0,
            now,
        }
    }

    #[inline]
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Arm a timer. A later `schedule` for the same id with a bumped
    /// generation supersedes this one.
    pub fn schedule(&mut self, id: u32, gen: u64, deadline: Instant) {
        let offset = deadline.saturating_duration_since(self.now);
        // Deadlines beyond the horizon park in the farthest slot and are
        // re-slotted each time the wheel passes them.
        let ticks = (offset.as_nanos() / self.resolution.as_nanos().max(1)) as usize;
        let ticks = ticks.clamp(1, NUM_SLOTS - 1);
        let slot = (self.current + ticks) % NUM_SLOTS;
        self.slots[slot].push(Entry { id, gen, deadline });
    }

    /// Advance the wheel to `now`, returning every expired `(id, gen)`.
    pub fn expire(&mut self, now: Instant) -> Vec<(u32, u64)> {
        let mut fired = Vec::new();
        while self.now + self.resolution <= now {
            self.now += self.resolution;
            self.current = (self.current + 1) % NUM_SLOTS;
            let drained = std::mem::take(&mut self.slots[self.current]);
            for e in drained {
                if e.deadline <= now {
                    fired.push((e.id, e.gen));
                } else {
                    self.schedule(e.id, e.gen, e.deadline);
                }
            }
        }
        fired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }
}
