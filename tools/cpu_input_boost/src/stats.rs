// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: boost counters and metrics reporting
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::clock::BoostClock;
use crate::state::{BoostFlags, BoostState};

/// Event counters bumped on the hot paths. Relaxed, monotonically increasing.
#[derive(Debug, Default)]
pub struct BoostCounters {
    pub kicks: AtomicU64,
    pub kicks_suppressed: AtomicU64,
    pub max_boosts: AtomicU64,
    pub max_boosts_skipped: AtomicU64,
    pub max_boosts_suppressed: AtomicU64,
    pub cas_retries: AtomicU64,
    pub screen_off: AtomicU64,
    pub screen_on: AtomicU64,
    pub input_unboosts: AtomicU64,
    pub max_unboosts: AtomicU64,
    pub recomputes: AtomicU64,
    pub floors_written: AtomicU64,
}

impl BoostCounters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Input kicks that (re)armed the input boost.
    pub kicks: u64,
    /// Input kicks dropped because the display was off.
    pub kicks_suppressed: u64,
    /// Max boost requests that installed a new deadline.
    pub max_boosts: u64,
    /// Max boost requests superseded by a longer boost in flight.
    pub max_boosts_skipped: u64,
    /// Max boost requests dropped because the display was off.
    pub max_boosts_suppressed: u64,
    /// Lost compare-and-swap races while extending the deadline.
    pub cas_retries: u64,
    pub screen_off: u64,
    pub screen_on: u64,
    pub input_unboosts: u64,
    pub max_unboosts: u64,
    /// Policy recompute passes run by the notification worker.
    pub recomputes: u64,
    /// scaling_min_freq writes performed by the governor.
    pub floors_written: u64,

    pub screen_off_now: bool,
    pub screen_awake: bool,
    pub input_boost: bool,
    pub max_boost: bool,
    pub wake_boost: bool,
    /// Milliseconds until the current max boost expires, 0 if none.
    pub max_boost_remaining_ms: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let on = |b: bool| if b { "ON " } else { "off" };
        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ screen {}  input {}  max {} ({:>5}ms left)  wake {}",
            if self.screen_off_now { "OFF" } else { "on " },
            on(self.input_boost),
            on(self.max_boost),
            self.max_boost_remaining_ms,
            on(self.wake_boost),
        )?;
        writeln!(
            w,
            "│ kick {:>6} (supp {:>4})  max {:>5} (skip {:>4} supp {:>4})  cas-retry {:>4}",
            self.kicks,
            self.kicks_suppressed,
            self.max_boosts,
            self.max_boosts_skipped,
            self.max_boosts_suppressed,
            self.cas_retries,
        )?;
        writeln!(
            w,
            "│ unboost: in {:>5}  max {:>5}   display: off {:>3} on {:>3}   recompute {:>5}  writes {:>5}",
            self.input_unboosts,
            self.max_unboosts,
            self.screen_off,
            self.screen_on,
            self.recomputes,
            self.floors_written,
        )?;
        writeln!(w, "└─")?;
        Ok(())
    }

    /// Counters become per-interval; live state is kept as is.
    pub fn delta(&self, prev: &Self) -> Self {
        Self {
            kicks: self.kicks.saturating_sub(prev.kicks),
            kicks_suppressed: self.kicks_suppressed.saturating_sub(prev.kicks_suppressed),
            max_boosts: self.max_boosts.saturating_sub(prev.max_boosts),
            max_boosts_skipped: self.max_boosts_skipped.saturating_sub(prev.max_boosts_skipped),
            max_boosts_suppressed: self
                .max_boosts_suppressed
                .saturating_sub(prev.max_boosts_suppressed),
            cas_retries: self.cas_retries.saturating_sub(prev.cas_retries),
            screen_off: self.screen_off.saturating_sub(prev.screen_off),
            screen_on: self.screen_on.saturating_sub(prev.screen_on),
            input_unboosts: self.input_unboosts.saturating_sub(prev.input_unboosts),
            max_unboosts: self.max_unboosts.saturating_sub(prev.max_unboosts),
            recomputes: self.recomputes.saturating_sub(prev.recomputes),
            floors_written: self.floors_written.saturating_sub(prev.floors_written),
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Builds `Metrics` from the live state.
#[derive(Debug, Clone)]
pub struct MetricsSource {
    state: Arc<BoostState>,
    counters: Arc<BoostCounters>,
    clock: BoostClock,
}

impl MetricsSource {
    pub fn new(state: Arc<BoostState>, counters: Arc<BoostCounters>, clock: BoostClock) -> Self {
        Self {
            state,
            counters,
            clock,
        }
    }

    pub fn snapshot(&self) -> Metrics {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        let flags = self.state.flags();
        let max_boost = flags.contains(BoostFlags::MAX_BOOST);
        let max_boost_remaining_ms = if max_boost {
            self.clock
                .remaining(self.state.max_boost_deadline())
                .as_millis() as u64
        } else {
            0
        };

        Metrics {
            kicks: load(&c.kicks),
            kicks_suppressed: load(&c.kicks_suppressed),
            max_boosts: load(&c.max_boosts),
            max_boosts_skipped: load(&c.max_boosts_skipped),
            max_boosts_suppressed: load(&c.max_boosts_suppressed),
            cas_retries: load(&c.cas_retries),
            screen_off: load(&c.screen_off),
            screen_on: load(&c.screen_on),
            input_unboosts: load(&c.input_unboosts),
            max_unboosts: load(&c.max_unboosts),
            recomputes: load(&c.recomputes),
            floors_written: load(&c.floors_written),
            screen_off_now: flags.contains(BoostFlags::SCREEN_OFF),
            screen_awake: flags.contains(BoostFlags::SCREEN_AWAKE),
            input_boost: flags.contains(BoostFlags::INPUT_BOOST),
            max_boost,
            wake_boost: flags.contains(BoostFlags::WAKE_BOOST),
            max_boost_remaining_ms,
        }
    }
}

/// Print per-interval metrics obtained from `read` until `shutdown` is set.
pub fn monitor<F>(intv: Duration, shutdown: Arc<AtomicBool>, mut read: F) -> Result<()>
where
    F: FnMut() -> Result<Metrics>,
{
    let mut prev = read()?;
    let mut next = Instant::now() + intv;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            std::thread::sleep((next - now).min(Duration::from_millis(100)));
            continue;
        }
        next += intv;

        let cur = read()?;
        cur.delta(&prev).format(&mut std::io::stdout())?;
        prev = cur;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_numbers() {
        let m = Metrics {
            kicks: 42,
            max_boosts: 3,
            max_boost: true,
            max_boost_remaining_ms: 250,
            ..Default::default()
        };
        let mut out = Vec::new();
        m.format(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("kick     42"));
        assert!(s.contains("max ON"));
        assert!(s.contains("250ms left"));
    }

    #[test]
    fn delta_keeps_live_state() {
        let prev = Metrics {
            kicks: 10,
            recomputes: 4,
            ..Default::default()
        };
        let cur = Metrics {
            kicks: 15,
            recomputes: 4,
            input_boost: true,
            ..Default::default()
        };
        let d = cur.delta(&prev);
        assert_eq!(d.kicks, 5);
        assert_eq!(d.recomputes, 0);
        assert!(d.input_boost);
    }

    #[test]
    fn snapshot_reflects_flags_and_json_round_trips() {
        let state = Arc::new(BoostState::new());
        let counters = Arc::new(BoostCounters::default());
        let clock = BoostClock::new();
        let source = MetricsSource::new(Arc::clone(&state), Arc::clone(&counters), clock);

        BoostCounters::bump(&counters.kicks);
        state.set(BoostFlags::INPUT_BOOST | BoostFlags::MAX_BOOST);
        state.extend_max_boost_deadline(clock.deadline_after(Duration::from_secs(5)));

        let m = source.snapshot();
        assert_eq!(m.kicks, 1);
        assert!(m.input_boost && m.max_boost && !m.screen_off_now);
        assert!(m.max_boost_remaining_ms > 4000);

        let parsed: Metrics = serde_json::from_str(&m.to_json().unwrap()).unwrap();
        assert_eq!(parsed, m);
    }
}
