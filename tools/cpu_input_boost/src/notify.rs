// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: state change propagation to the cpufreq governor
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use libc::{sched_param, sched_setscheduler, SCHED_FIFO};
use log::{debug, info, trace, warn};

use crate::state::{BoostSnapshot, BoostState};
use crate::stats::BoostCounters;

/// The frequency governor collaborator. Asked to re-evaluate the floor of
/// every online core, which it does by calling back into the adjuster.
pub trait Governor: Send + Sync {
    /// Returns the number of policies whose floor changed.
    fn recompute_all_active_cores(&self) -> Result<usize>;
}

/// Wakes the notification worker. Cheap and non-blocking: a pending wakeup
/// already covers any later state change, so extra signals are dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<()>,
}

impl Notifier {
    #[inline]
    pub fn signal(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => trace!("notification worker gone"),
        }
    }
}

pub fn notification_channel() -> (Notifier, Receiver<()>) {
    let (tx, rx) = channel::bounded(1);
    (Notifier { tx }, rx)
}

/// Dedicated thread that turns boost state changes into governor recompute
/// requests. Several changes that land before it runs collapse into one pass.
pub struct NotificationWorker {
    stop: Arc<AtomicBool>,
    notifier: Notifier,
    thread: Option<JoinHandle<()>>,
}

impl NotificationWorker {
    pub fn spawn(
        notifier: Notifier,
        rx: Receiver<()>,
        state: Arc<BoostState>,
        governor: Arc<dyn Governor>,
        counters: Arc<BoostCounters>,
        rt_priority: u32,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("cpu_boostd".to_string())
            .spawn(move || {
                if rt_priority > 0 {
                    set_rt_priority(rt_priority);
                }
                worker_loop(rx, thread_stop, state, governor, counters)
            })
            .context("failed to spawn notification worker")?;

        Ok(Self {
            stop,
            notifier,
            thread: Some(handle),
        })
    }

    /// Wake and join the worker. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.notifier.signal();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("notification worker panicked");
            }
            debug!("notification worker stopped");
        }
    }
}

impl Drop for NotificationWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    rx: Receiver<()>,
    stop: Arc<AtomicBool>,
    state: Arc<BoostState>,
    governor: Arc<dyn Governor>,
    counters: Arc<BoostCounters>,
) {
    // Matches the all-clear initial state, so nothing happens until the
    // first real change.
    let mut acted = BoostSnapshot::default();

    while !stop.load(Ordering::Acquire) {
        if rx.recv().is_err() {
            break;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }

        let current = state.snapshot();
        if current == acted {
            continue;
        }
        acted = current;

        trace!("boost state {:?}, recomputing policies", current.flags);
        BoostCounters::bump(&counters.recomputes);
        match governor.recompute_all_active_cores() {
            Ok(n) => BoostCounters::add(&counters.floors_written, n as u64),
            Err(e) => warn!("policy recompute failed: {:#}", e),
        }
    }
}

/// Move the calling thread to SCHED_FIFO. Boosting is latency sensitive, so
/// the worker must not queue behind normal tasks.
fn set_rt_priority(priority: u32) {
    let param = sched_param {
        sched_priority: priority.clamp(1, 99) as i32,
    };
    // SAFETY: plain syscall on the current thread with a valid sched_param.
    let result = unsafe { sched_setscheduler(0, SCHED_FIFO, &param) };
    if result != 0 {
        warn!(
            "failed to set SCHED_FIFO priority {} for notification worker: {}",
            priority,
            std::io::Error::last_os_error()
        );
    } else {
        info!("notification worker running SCHED_FIFO priority {}", priority);
    }
}
