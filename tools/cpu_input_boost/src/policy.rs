// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: per-core frequency floor selection
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeSet;
use std::sync::Arc;

use cpufreq_utils::{low_power_cpus, CpuFreqPolicy};
use serde::{Deserialize, Serialize};

use crate::state::{BoostFlags, BoostSnapshot, BoostState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreClass {
    LowPower,
    Performance,
}

/// Static partition of CPUs into low-power and performance cores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreClassification {
    low_power: BTreeSet<usize>,
}

impl CoreClassification {
    pub fn new<I: IntoIterator<Item = usize>>(low_power: I) -> Self {
        Self {
            low_power: low_power.into_iter().collect(),
        }
    }

    /// The slowest cluster is low-power; a homogeneous system is all
    /// performance cores.
    pub fn detect(policies: &[CpuFreqPolicy]) -> Self {
        Self::new(low_power_cpus(policies))
    }

    pub fn class_of(&self, cpu: usize) -> CoreClass {
        if self.low_power.contains(&cpu) {
            CoreClass::LowPower
        } else {
            CoreClass::Performance
        }
    }

    pub fn low_power_cpus(&self) -> impl Iterator<Item = usize> + '_ {
        self.low_power.iter().copied()
    }
}

/// What the governor proposes for one core, in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyPolicyRequest {
    pub cpu: usize,
    pub hw_min_khz: u32,
    pub hw_max_khz: u32,
    pub proposed_min_khz: u32,
    pub proposed_max_khz: u32,
}

/// Which rule decides the floor. Exactly one applies for any flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloorRule {
    ScreenOff,
    MaxBoost,
    InputBoost,
    Resting,
}

impl FloorRule {
    pub fn select(flags: BoostFlags) -> Self {
        if flags.contains(BoostFlags::SCREEN_OFF) {
            FloorRule::ScreenOff
        } else if flags.contains(BoostFlags::MAX_BOOST) {
            FloorRule::MaxBoost
        } else if flags.contains(BoostFlags::INPUT_BOOST) {
            FloorRule::InputBoost
        } else {
            FloorRule::Resting
        }
    }
}

/// Resting floors applied when no boost is active, per core class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestingFloors {
    pub low_power_khz: u32,
    pub performance_khz: u32,
}

impl RestingFloors {
    pub fn get(&self, class: CoreClass) -> u32 {
        match class {
            CoreClass::LowPower => self.low_power_khz,
            CoreClass::Performance => self.performance_khz,
        }
    }
}

pub fn floor_for(
    class: CoreClass,
    snap: &BoostSnapshot,
    req: &FrequencyPolicyRequest,
    resting: &RestingFloors,
) -> u32 {
    match FloorRule::select(snap.flags) {
        FloorRule::ScreenOff => req.hw_min_khz,
        FloorRule::MaxBoost => req.proposed_max_khz,
        FloorRule::InputBoost => req.proposed_max_khz.min(snap.boost_freq(class)),
        FloorRule::Resting => req.hw_min_khz.max(resting.get(class)),
    }
}

/// Answers "what is this core's minimum right now" for the governor. Safe to
/// call concurrently from any number of threads.
#[derive(Debug)]
pub struct PolicyAdjuster {
    state: Arc<BoostState>,
    classes: CoreClassification,
    resting: RestingFloors,
}

impl PolicyAdjuster {
    pub fn new(state: Arc<BoostState>, classes: CoreClassification, resting: RestingFloors) -> Self {
        Self {
            state,
            classes,
            resting,
        }
    }

    pub fn adjust(&self, req: &FrequencyPolicyRequest) -> u32 {
        let snap = self.state.snapshot();
        floor_for(self.classes.class_of(req.cpu), &snap, req, &self.resting)
    }

    pub fn classes(&self) -> &CoreClassification {
        &self.classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESTING: RestingFloors = RestingFloors {
        low_power_khz: 576_000,
        performance_khz: 0,
    };

    fn request(cpu: usize) -> FrequencyPolicyRequest {
        FrequencyPolicyRequest {
            cpu,
            hw_min_khz: 300_000,
            hw_max_khz: 2_800_000,
            proposed_min_khz: 300_000,
            proposed_max_khz: 2_400_000,
        }
    }

    fn snapshot(flags: BoostFlags) -> BoostSnapshot {
        BoostSnapshot {
            flags,
            boost_freq_lp: 1_000_000,
            boost_freq_perf: 1_800_000,
        }
    }

    #[test]
    fn exactly_one_rule_and_screen_off_dominates() {
        for bits in 0..=BoostFlags::all().bits() {
            let flags = BoostFlags::from_bits_truncate(bits);
            let rule = FloorRule::select(flags);
            if flags.contains(BoostFlags::SCREEN_OFF) {
                assert_eq!(rule, FloorRule::ScreenOff, "{:?}", flags);
                assert_eq!(
                    floor_for(CoreClass::Performance, &snapshot(flags), &request(4), &RESTING),
                    300_000
                );
            } else if flags.contains(BoostFlags::MAX_BOOST) {
                assert_eq!(rule, FloorRule::MaxBoost, "{:?}", flags);
            }
        }
    }

    #[test]
    fn resting_floor_respects_class_minimum() {
        let snap = snapshot(BoostFlags::empty());
        assert_eq!(floor_for(CoreClass::LowPower, &snap, &request(0), &RESTING), 576_000);
        assert_eq!(floor_for(CoreClass::Performance, &snap, &request(4), &RESTING), 300_000);
    }

    #[test]
    fn input_boost_is_capped_by_proposed_max() {
        let snap = snapshot(BoostFlags::INPUT_BOOST);
        assert_eq!(floor_for(CoreClass::Performance, &snap, &request(4), &RESTING), 1_800_000);
        assert_eq!(floor_for(CoreClass::LowPower, &snap, &request(0), &RESTING), 1_000_000);

        let mut capped = request(4);
        capped.proposed_max_khz = 1_500_000;
        assert_eq!(floor_for(CoreClass::Performance, &snap, &capped, &RESTING), 1_500_000);
    }

    #[test]
    fn max_boost_pins_to_proposed_max() {
        let snap = snapshot(BoostFlags::MAX_BOOST | BoostFlags::INPUT_BOOST | BoostFlags::WAKE_BOOST);
        assert_eq!(floor_for(CoreClass::LowPower, &snap, &request(0), &RESTING), 2_400_000);
    }

    #[test]
    fn adjuster_reads_live_state() {
        let state = Arc::new(BoostState::new());
        state.latch_boost_freqs(1_000_000, 1_800_000);
        let adjuster = PolicyAdjuster::new(
            Arc::clone(&state),
            CoreClassification::new([0, 1, 2, 3]),
            RESTING,
        );

        assert_eq!(adjuster.adjust(&request(1)), 576_000);
        state.set(BoostFlags::INPUT_BOOST);
        assert_eq!(adjuster.adjust(&request(1)), 1_000_000);
        assert_eq!(adjuster.adjust(&request(5)), 1_800_000);
        state.set(BoostFlags::SCREEN_OFF);
        assert_eq!(adjuster.adjust(&request(5)), 300_000);
    }
}
