// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: single-shot debounce timers
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, trace};

/// What a timer callback wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Done,
    /// Fire again at the given instant, unless the timer was canceled while
    /// the callback ran.
    RearmAt(Instant),
}

#[derive(Debug, Default)]
struct TimerState {
    due: Option<Instant>,
    firing: bool,
    stopped: bool,
    /// Bumped by every cancel so an in-flight callback cannot rearm past it.
    cancel_gen: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A re-armable single-shot timer backed by a dedicated thread.
///
/// Arming replaces the pending fire time rather than stacking, so repeated
/// arms implement last-kick-wins debounce.
pub struct DebounceTimer {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DebounceTimer {
    pub fn spawn<F>(name: &str, callback: F) -> Result<Self>
    where
        F: Fn() -> Expiry + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(thread_shared, callback))
            .with_context(|| format!("failed to spawn {} timer thread", name))?;

        Ok(Self {
            name: name.to_string(),
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// (Re)arm to fire `delay` from now. Returns true if a fire was already
    /// pending.
    pub fn arm(&self, delay: Duration) -> bool {
        self.arm_at(Instant::now() + delay)
    }

    pub fn arm_at(&self, at: Instant) -> bool {
        let mut st = self.shared.lock();
        if st.stopped {
            return false;
        }
        let was_pending = st.due.replace(at).is_some();
        self.shared.cond.notify_all();
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().due.is_some()
    }

    /// Drop any pending fire and wait for a callback that is already running
    /// to return. Once this returns the callback will not run again until the
    /// timer is re-armed. Returns true if a fire was pending.
    pub fn cancel_sync(&self) -> bool {
        let mut st = self.shared.lock();
        let was_pending = st.due.take().is_some();
        st.cancel_gen = st.cancel_gen.wrapping_add(1);
        self.shared.cond.notify_all();
        while st.firing {
            st = self
                .shared
                .cond
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }
        was_pending
    }

    /// Cancel and terminate the timer thread. Idempotent.
    pub fn stop(&self) {
        self.cancel_sync();
        self.shared.lock().stopped = true;
        self.shared.cond.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("{} timer thread panicked", self.name);
            }
            debug!("{} timer stopped", self.name);
        }
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop<F>(shared: Arc<Shared>, callback: F)
where
    F: Fn() -> Expiry,
{
    let mut st = shared.lock();
    loop {
        if st.stopped {
            break;
        }
        let Some(due) = st.due else {
            st = shared.cond.wait(st).unwrap_or_else(|e| e.into_inner());
            continue;
        };

        let now = Instant::now();
        if now < due {
            st = shared
                .cond
                .wait_timeout(st, due - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            continue;
        }

        st.due = None;
        st.firing = true;
        let gen = st.cancel_gen;
        drop(st);

        trace!("timer fired");
        let expiry = callback();

        st = shared.lock();
        st.firing = false;
        if let Expiry::RearmAt(at) = expiry {
            if !st.stopped && st.cancel_gen == gen {
                st.due = Some(st.due.map_or(at, |pending| pending.max(at)));
            }
        }
        shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting_timer(name: &str) -> (DebounceTimer, Arc<AtomicU64>) {
        let fired = Arc::new(AtomicU64::new(0));
        let f = Arc::clone(&fired);
        let timer = DebounceTimer::spawn(name, move || {
            f.fetch_add(1, Ordering::SeqCst);
            Expiry::Done
        })
        .unwrap();
        (timer, fired)
    }

    #[test]
    fn fires_once_after_delay() {
        let (timer, fired) = counting_timer("t-once");
        assert!(!timer.arm(Duration::from_millis(20)));
        assert!(timer.is_pending());

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[test]
    fn rearming_does_not_stack() {
        let (timer, fired) = counting_timer("t-rearm");
        timer.arm(Duration::from_millis(150));
        thread::sleep(Duration::from_millis(50));
        // Pushes the single pending fire out instead of adding a second one.
        assert!(timer.arm(Duration::from_millis(150)));

        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_fire() {
        let (timer, fired) = counting_timer("t-cancel");
        timer.arm(Duration::from_millis(50));
        assert!(timer.cancel_sync());
        assert!(!timer.cancel_sync());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_waits_for_running_callback_and_blocks_rearm() {
        let fired = Arc::new(AtomicU64::new(0));
        let f = Arc::clone(&fired);
        let timer = DebounceTimer::spawn("t-slow", move || {
            thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
            Expiry::RearmAt(Instant::now() + Duration::from_millis(10))
        })
        .unwrap();

        timer.arm(Duration::ZERO);
        thread::sleep(Duration::from_millis(30));
        timer.cancel_sync();
        // The callback that was running has completed.
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[test]
    fn rearm_from_callback() {
        let fired = Arc::new(AtomicU64::new(0));
        let f = Arc::clone(&fired);
        let timer = DebounceTimer::spawn("t-again", move || {
            if f.fetch_add(1, Ordering::SeqCst) == 0 {
                Expiry::RearmAt(Instant::now() + Duration::from_millis(20))
            } else {
                Expiry::Done
            }
        })
        .unwrap();

        timer.arm(Duration::from_millis(10));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stopped_timer_ignores_arm() {
        let (timer, fired) = counting_timer("t-stop");
        timer.stop();
        assert!(!timer.arm(Duration::ZERO));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.stop();
    }
}
