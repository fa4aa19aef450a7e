// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: shared boost state
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::policy::CoreClass;

bitflags! {
    /// Boost conditions. Not mutually exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BoostFlags: u32 {
        /// Display is blanked. Suppresses every kind of boost.
        const SCREEN_OFF   = 1 << 0;
        const INPUT_BOOST  = 1 << 1;
        const MAX_BOOST    = 1 << 2;
        /// The current max boost was installed by a display wake. Informational
        /// only; the floor is driven by `MAX_BOOST`.
        const WAKE_BOOST   = 1 << 3;
        /// Set on the first unblank and never cleared.
        const SCREEN_AWAKE = 1 << 4;
    }
}

impl BoostFlags {
    /// The transient boost kinds cleared when the display goes off.
    pub const ALL_BOOSTS: Self = Self::INPUT_BOOST.union(Self::MAX_BOOST).union(Self::WAKE_BOOST);
}

/// Outcome of trying to push the max-boost deadline forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineUpdate {
    /// The new deadline is installed. `retries` counts lost CAS races.
    Extended { retries: u64 },
    /// A later deadline was already in place and is left untouched.
    Superseded,
}

/// A consistent-enough view of the state for one policy evaluation. The
/// flags come from a single atomic load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoostSnapshot {
    pub flags: BoostFlags,
    pub boost_freq_lp: u32,
    pub boost_freq_perf: u32,
}

impl BoostSnapshot {
    pub fn boost_freq(&self, class: CoreClass) -> u32 {
        match class {
            CoreClass::LowPower => self.boost_freq_lp,
            CoreClass::Performance => self.boost_freq_perf,
        }
    }
}

/// Lock-free boost state shared by every event path and the policy adjuster.
#[derive(Debug, Default)]
pub struct BoostState {
    flags: AtomicU32,
    /// Expiry of the max boost in `BoostClock` nanoseconds. Only meaningful
    /// while `MAX_BOOST` is set; 0 when no boost was ever installed.
    max_boost_deadline: AtomicU64,
    /// End of the current input debounce window, same scale. Pushed forward
    /// by every kick.
    input_boost_deadline: AtomicU64,
    /// Input boost frequencies latched at the last kick.
    boost_freq_lp: AtomicU32,
    boost_freq_perf: AtomicU32,
}

impl BoostState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn flags(&self) -> BoostFlags {
        BoostFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, flags: BoostFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn snapshot(&self) -> BoostSnapshot {
        BoostSnapshot {
            flags: self.flags(),
            boost_freq_lp: self.boost_freq_lp.load(Ordering::Acquire),
            boost_freq_perf: self.boost_freq_perf.load(Ordering::Acquire),
        }
    }

    /// Atomically OR `flags` in. Returns the previous flag set.
    #[inline]
    pub fn set(&self, flags: BoostFlags) -> BoostFlags {
        BoostFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Atomically clear `flags`. Clearing an already clear flag is a no-op.
    /// Returns the previous flag set.
    #[inline]
    pub fn clear(&self, flags: BoostFlags) -> BoostFlags {
        BoostFlags::from_bits_truncate(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    #[inline]
    pub fn max_boost_deadline(&self) -> u64 {
        self.max_boost_deadline.load(Ordering::Acquire)
    }

    /// Install `new_deadline` unless a strictly later one is already in
    /// place. Safe against any number of concurrent callers: the stored
    /// deadline never moves backwards.
    pub fn extend_max_boost_deadline(&self, new_deadline: u64) -> DeadlineUpdate {
        let mut current = self.max_boost_deadline.load(Ordering::Acquire);
        let mut retries = 0;
        loop {
            if current > new_deadline {
                return DeadlineUpdate::Superseded;
            }
            match self.max_boost_deadline.compare_exchange_weak(
                current,
                new_deadline,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return DeadlineUpdate::Extended { retries },
                Err(actual) => {
                    current = actual;
                    retries += 1;
                }
            }
        }
    }

    /// Forget any in-flight max boost deadline.
    pub fn reset_max_boost_deadline(&self) {
        self.max_boost_deadline.store(0, Ordering::Release);
    }

    /// Undo an extension that turned out to race with a blank. Leaves a
    /// deadline installed by someone else alone.
    pub fn retract_max_boost_deadline(&self, deadline: u64) -> bool {
        self.max_boost_deadline
            .compare_exchange(deadline, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn input_boost_deadline(&self) -> u64 {
        self.input_boost_deadline.load(Ordering::Acquire)
    }

    /// Move the input debounce deadline to `deadline` unless it is already
    /// later. Must happen before `INPUT_BOOST` is set so an expiry that
    /// clears the flag afterwards sees it.
    pub fn push_input_boost_deadline(&self, deadline: u64) {
        self.input_boost_deadline.fetch_max(deadline, Ordering::AcqRel);
    }

    pub fn reset_input_boost_deadline(&self) {
        self.input_boost_deadline.store(0, Ordering::Release);
    }

    /// Latch the input boost frequencies used until the next kick. Returns
    /// true when either value changed.
    pub fn latch_boost_freqs(&self, lp: u32, perf: u32) -> bool {
        let old_lp = self.boost_freq_lp.swap(lp, Ordering::AcqRel);
        let old_perf = self.boost_freq_perf.swap(perf, Ordering::AcqRel);
        old_lp != lp || old_perf != perf
    }
}
