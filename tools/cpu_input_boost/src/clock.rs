// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: monotonic time base for boost deadlines
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::time::{Duration, Instant};

/// Monotonic nanosecond clock anchored at controller start. Deadlines are
/// stored as plain `u64`s on this scale so they fit in a single atomic.
#[derive(Debug, Clone, Copy)]
pub struct BoostClock {
    epoch: Instant,
}

impl Default for BoostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl BoostClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.ns_at(Instant::now())
    }

    pub fn ns_at(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_nanos() as u64
    }

    /// Absolute deadline `delay` from now.
    pub fn deadline_after(&self, delay: Duration) -> u64 {
        self.now_ns().saturating_add(delay.as_nanos() as u64)
    }

    pub fn instant_at(&self, ns: u64) -> Instant {
        self.epoch + Duration::from_nanos(ns)
    }

    pub fn remaining(&self, deadline_ns: u64) -> Duration {
        Duration::from_nanos(deadline_ns.saturating_sub(self.now_ns()))
    }
}
