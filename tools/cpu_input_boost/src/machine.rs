// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: boost state machine
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, trace};

use crate::clock::BoostClock;
use crate::config::{BoostConfig, Tunables};
use crate::notify::Notifier;
use crate::state::{BoostFlags, BoostState, DeadlineUpdate};
use crate::stats::BoostCounters;
use crate::timer::{DebounceTimer, Expiry};

/// What the input event source may do.
pub trait InputEvents: Send + Sync {
    fn kick(&self);
}

/// What the display power source may do. Calls are serialised by the
/// caller and arrive once per transition.
pub trait DisplayEvents: Send + Sync {
    fn enter_screen_off(&self);
    fn enter_screen_awake(&self);
}

/// Boost requests from other subsystems.
pub trait BoostRequests: Send + Sync {
    /// Returns true if the boost was installed or extended.
    fn request_max_boost(&self, duration_ms: u32) -> bool;
}

/// Mutates `BoostState` in response to events and keeps the debounce timers
/// in step with it. Never touches frequencies itself.
pub struct BoostStateMachine {
    state: Arc<BoostState>,
    clock: BoostClock,
    tunables: Arc<Tunables>,
    wake_boost_ms: u32,
    notifier: Notifier,
    counters: Arc<BoostCounters>,
    input_timer: DebounceTimer,
    max_timer: DebounceTimer,
    closed: AtomicBool,
}

impl BoostStateMachine {
    pub fn new(
        config: &BoostConfig,
        state: Arc<BoostState>,
        clock: BoostClock,
        tunables: Arc<Tunables>,
        notifier: Notifier,
        counters: Arc<BoostCounters>,
    ) -> Result<Self> {
        let input_timer = {
            let state = Arc::clone(&state);
            let notifier = notifier.clone();
            let counters = Arc::clone(&counters);
            DebounceTimer::spawn("input_unboost", move || {
                input_unboost(&state, &clock, &notifier, &counters)
            })?
        };

        let max_timer = {
            let state = Arc::clone(&state);
            let notifier = notifier.clone();
            let counters = Arc::clone(&counters);
            DebounceTimer::spawn("max_unboost", move || {
                max_unboost(&state, &clock, &notifier, &counters)
            })?
        };

        Ok(Self {
            state,
            clock,
            tunables,
            wake_boost_ms: config.wake_boost_duration_ms,
            notifier,
            counters,
            input_timer,
            max_timer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn clock(&self) -> BoostClock {
        self.clock
    }

    #[inline]
    fn accepting(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    /// Input activity: boost to the class input frequency until the input
    /// debounce window passes without another kick.
    pub fn kick(&self) {
        if !self.accepting() {
            return;
        }
        if self.state.contains(BoostFlags::SCREEN_OFF) {
            BoostCounters::bump(&self.counters.kicks_suppressed);
            return;
        }

        // Frequencies first so a reader that sees INPUT_BOOST sees them too.
        self.state.latch_boost_freqs(
            self.tunables.input_boost_freq_lp(),
            self.tunables.input_boost_freq_perf(),
        );
        let window = self.tunables.input_boost_duration();
        self.state
            .push_input_boost_deadline(self.clock.deadline_after(window));
        let prev = self.state.set(BoostFlags::INPUT_BOOST);
        // Lost a race with a blank that cleared the boosts before our set.
        if prev.contains(BoostFlags::SCREEN_OFF) {
            self.state.clear(BoostFlags::INPUT_BOOST);
            BoostCounters::bump(&self.counters.kicks_suppressed);
            return;
        }
        self.notifier.signal();
        self.input_timer.arm(window);
        BoostCounters::bump(&self.counters.kicks);
    }

    /// Pin every core to its maximum for `duration_ms`. A request that would
    /// end before the boost already in flight is dropped.
    pub fn kick_max(&self, duration_ms: u32) -> bool {
        if !self.accepting() {
            return false;
        }
        if self.state.contains(BoostFlags::SCREEN_OFF) {
            BoostCounters::bump(&self.counters.max_boosts_suppressed);
            return false;
        }

        let boost = Duration::from_millis(duration_ms as u64);
        let new_deadline = self.clock.deadline_after(boost);
        match self.state.extend_max_boost_deadline(new_deadline) {
            DeadlineUpdate::Superseded => {
                trace!("max boost of {}ms superseded by a longer one", duration_ms);
                BoostCounters::bump(&self.counters.max_boosts_skipped);
                false
            }
            DeadlineUpdate::Extended { retries } => {
                BoostCounters::add(&self.counters.cas_retries, retries);
                if self.state.set(BoostFlags::MAX_BOOST).contains(BoostFlags::SCREEN_OFF) {
                    self.state.clear(BoostFlags::MAX_BOOST);
                    self.state.retract_max_boost_deadline(new_deadline);
                    BoostCounters::bump(&self.counters.max_boosts_suppressed);
                    return false;
                }
                self.notifier.signal();
                self.max_timer.arm(boost);
                BoostCounters::bump(&self.counters.max_boosts);
                true
            }
        }
    }

    /// Display blanked: drop every boost and stop boosting until it wakes.
    pub fn enter_screen_off(&self) {
        self.state.set(BoostFlags::SCREEN_OFF);
        let input_pending = self.input_timer.cancel_sync();
        let max_pending = self.max_timer.cancel_sync();
        self.state.clear(BoostFlags::ALL_BOOSTS);
        self.state.reset_input_boost_deadline();
        self.state.reset_max_boost_deadline();
        self.notifier.signal();
        BoostCounters::bump(&self.counters.screen_off);
        debug!(
            "screen off (input boost pending: {}, max boost pending: {})",
            input_pending, max_pending
        );
    }

    /// Display unblanked: run at max for the wake boost duration to cover the
    /// unlock animation.
    pub fn enter_screen_awake(&self) {
        self.state.set(BoostFlags::SCREEN_AWAKE);
        self.state.clear(BoostFlags::SCREEN_OFF);
        if self.kick_max(self.wake_boost_ms) {
            self.state.set(BoostFlags::WAKE_BOOST);
        }
        self.notifier.signal();
        BoostCounters::bump(&self.counters.screen_on);
        debug!("screen awake, wake boost {}ms", self.wake_boost_ms);
    }

    /// Stop accepting events, cancel both timers and join their threads.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.input_timer.stop();
        self.max_timer.stop();
        info!("boost state machine closed");
    }
}

/// Input timer expiry. Same shape as `max_unboost`: a kick that lands while
/// this runs has already pushed the deadline, so the flag is put back.
fn input_unboost(
    state: &BoostState,
    clock: &BoostClock,
    notifier: &Notifier,
    counters: &BoostCounters,
) -> Expiry {
    let now = clock.now_ns();
    let deadline = state.input_boost_deadline();
    if deadline > now {
        return Expiry::RearmAt(clock.instant_at(deadline));
    }

    state.clear(BoostFlags::INPUT_BOOST);

    let deadline = state.input_boost_deadline();
    if deadline > now && !state.contains(BoostFlags::SCREEN_OFF) {
        state.set(BoostFlags::INPUT_BOOST);
        notifier.signal();
        return Expiry::RearmAt(clock.instant_at(deadline));
    }

    BoostCounters::bump(&counters.input_unboosts);
    notifier.signal();
    Expiry::Done
}

/// Max timer expiry. The timer may lag the deadline when a racing extension
/// armed it with a shorter delay than the one that won, so the stored
/// deadline is authoritative.
fn max_unboost(
    state: &BoostState,
    clock: &BoostClock,
    notifier: &Notifier,
    counters: &BoostCounters,
) -> Expiry {
    let now = clock.now_ns();
    let deadline = state.max_boost_deadline();
    if deadline > now {
        return Expiry::RearmAt(clock.instant_at(deadline));
    }

    state.clear(BoostFlags::MAX_BOOST | BoostFlags::WAKE_BOOST);

    // A kick_max between the check above and the clear installed a new
    // deadline and set MAX_BOOST, which we just wiped.
    let deadline = state.max_boost_deadline();
    if deadline > now && !state.contains(BoostFlags::SCREEN_OFF) {
        state.set(BoostFlags::MAX_BOOST);
        notifier.signal();
        return Expiry::RearmAt(clock.instant_at(deadline));
    }

    BoostCounters::bump(&counters.max_unboosts);
    notifier.signal();
    Expiry::Done
}

impl InputEvents for BoostStateMachine {
    fn kick(&self) {
        BoostStateMachine::kick(self)
    }
}

impl DisplayEvents for BoostStateMachine {
    fn enter_screen_off(&self) {
        BoostStateMachine::enter_screen_off(self)
    }

    fn enter_screen_awake(&self) {
        BoostStateMachine::enter_screen_awake(self)
    }
}

impl BoostRequests for BoostStateMachine {
    fn request_max_boost(&self, duration_ms: u32) -> bool {
        self.kick_max(duration_ms)
    }
}

impl Drop for BoostStateMachine {
    fn drop(&mut self) {
        self.close();
    }
}
