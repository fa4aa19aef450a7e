// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: boost configuration and runtime tunables
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy::RestingFloors;

pub const DEFAULT_INPUT_BOOST_FREQ_LP: u32 = 1_094_400;
pub const DEFAULT_INPUT_BOOST_FREQ_PERF: u32 = 1_401_600;
pub const DEFAULT_INPUT_BOOST_DURATION_MS: u32 = 100;
pub const DEFAULT_WAKE_BOOST_DURATION_MS: u32 = 1000;
pub const DEFAULT_WORKER_RT_PRIORITY: u32 = 99;

/// Everything the core needs at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoostConfig {
    pub input_boost_freq_lp: u32,
    pub input_boost_freq_perf: u32,
    pub input_boost_duration_ms: u32,
    pub wake_boost_duration_ms: u32,
    pub remove_input_boost_freq_lp: u32,
    pub remove_input_boost_freq_perf: u32,
    /// SCHED_FIFO priority of the notification worker, 0 keeps SCHED_OTHER.
    pub worker_rt_priority: u32,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            input_boost_freq_lp: DEFAULT_INPUT_BOOST_FREQ_LP,
            input_boost_freq_perf: DEFAULT_INPUT_BOOST_FREQ_PERF,
            input_boost_duration_ms: DEFAULT_INPUT_BOOST_DURATION_MS,
            wake_boost_duration_ms: DEFAULT_WAKE_BOOST_DURATION_MS,
            remove_input_boost_freq_lp: 0,
            remove_input_boost_freq_perf: 0,
            worker_rt_priority: DEFAULT_WORKER_RT_PRIORITY,
        }
    }
}

impl BoostConfig {
    pub fn resting_floors(&self) -> RestingFloors {
        RestingFloors {
            low_power_khz: self.remove_input_boost_freq_lp,
            performance_khz: self.remove_input_boost_freq_perf,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_boost_duration_ms == 0 {
            bail!("input boost duration must be at least 1ms");
        }
        if self.worker_rt_priority > 99 {
            bail!(
                "worker RT priority {} out of range (0-99)",
                self.worker_rt_priority
            );
        }
        Ok(())
    }
}

/// Knobs that may change while the daemon runs. Each new value is picked up
/// by the next kick; an in-flight boost keeps what it latched.
#[derive(Debug)]
pub struct Tunables {
    input_boost_freq_lp: AtomicU32,
    input_boost_freq_perf: AtomicU32,
    input_boost_duration_ms: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunableValues {
    pub input_boost_freq_lp: u32,
    pub input_boost_freq_perf: u32,
    pub input_boost_duration_ms: u32,
}

impl Tunables {
    pub fn new(config: &BoostConfig) -> Self {
        Self {
            input_boost_freq_lp: AtomicU32::new(config.input_boost_freq_lp),
            input_boost_freq_perf: AtomicU32::new(config.input_boost_freq_perf),
            input_boost_duration_ms: AtomicU32::new(config.input_boost_duration_ms),
        }
    }

    #[inline]
    pub fn input_boost_freq_lp(&self) -> u32 {
        self.input_boost_freq_lp.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn input_boost_freq_perf(&self) -> u32 {
        self.input_boost_freq_perf.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn input_boost_duration(&self) -> Duration {
        Duration::from_millis(self.input_boost_duration_ms.load(Ordering::Relaxed) as u64)
    }

    pub fn values(&self) -> TunableValues {
        TunableValues {
            input_boost_freq_lp: self.input_boost_freq_lp(),
            input_boost_freq_perf: self.input_boost_freq_perf(),
            input_boost_duration_ms: self.input_boost_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// Set a tunable by name, as exposed on the control socket.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let value: u32 = value
            .trim()
            .parse()
            .with_context(|| format!("invalid value {:?} for {}", value, key))?;
        let slot = match key {
            "input_boost_freq_lp" => &self.input_boost_freq_lp,
            "input_boost_freq_perf" | "input_boost_freq_hp" => &self.input_boost_freq_perf,
            "input_boost_duration_ms" | "input_boost_duration" => {
                if value == 0 {
                    bail!("input_boost_duration_ms must be at least 1");
                }
                &self.input_boost_duration_ms
            }
            _ => bail!("unknown tunable {:?}", key),
        };
        slot.store(value, Ordering::Relaxed);
        log::info!("tunable {} set to {}", key, value);
        Ok(())
    }
}
