// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: controller lifecycle
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::clock::BoostClock;
use crate::config::{BoostConfig, Tunables};
use crate::control::{ControlContext, ControlServer};
use crate::display::{DisplaySource, DisplaySourceKind};
use crate::input::InputSource;
use crate::machine::BoostStateMachine;
use crate::notify::{notification_channel, Governor, NotificationWorker};
use crate::policy::{CoreClassification, FrequencyPolicyRequest, PolicyAdjuster};
use crate::state::{BoostFlags, BoostState};
use crate::stats::{BoostCounters, MetricsSource};

/// Owns the one `BoostState` and everything that reads or writes it.
///
/// Construction order is state, adjuster, governor, worker, state machine;
/// event sources are attached afterwards. If any step fails the parts built
/// so far are dropped, which stops their threads, and no event is ever
/// delivered to a half-built controller.
pub struct BoostController {
    state: Arc<BoostState>,
    clock: BoostClock,
    tunables: Arc<Tunables>,
    counters: Arc<BoostCounters>,
    adjuster: Arc<PolicyAdjuster>,
    governor: Arc<dyn Governor>,
    worker: NotificationWorker,
    machine: Arc<BoostStateMachine>,
    control: Option<ControlServer>,
    input: Option<InputSource>,
    display: Option<DisplaySource>,
    stopped: bool,
}

impl BoostController {
    pub fn start<G>(config: &BoostConfig, classes: CoreClassification, make_governor: G) -> Result<Self>
    where
        G: FnOnce(Arc<PolicyAdjuster>) -> Result<Arc<dyn Governor>>,
    {
        config.validate()?;

        let state = Arc::new(BoostState::new());
        let clock = BoostClock::new();
        let tunables = Arc::new(Tunables::new(config));
        let counters = Arc::new(BoostCounters::default());
        state.latch_boost_freqs(tunables.input_boost_freq_lp(), tunables.input_boost_freq_perf());

        let adjuster = Arc::new(PolicyAdjuster::new(
            Arc::clone(&state),
            classes,
            config.resting_floors(),
        ));
        let governor =
            make_governor(Arc::clone(&adjuster)).context("failed to set up the governor")?;

        let (notifier, rx) = notification_channel();
        let worker = NotificationWorker::spawn(
            notifier.clone(),
            rx,
            Arc::clone(&state),
            Arc::clone(&governor),
            Arc::clone(&counters),
            config.worker_rt_priority,
        )?;

        let machine = Arc::new(BoostStateMachine::new(
            config,
            Arc::clone(&state),
            clock,
            Arc::clone(&tunables),
            notifier,
            Arc::clone(&counters),
        )?);

        // Apply resting floors before the first event.
        if let Err(e) = governor.recompute_all_active_cores() {
            warn!("initial policy recompute failed: {:#}", e);
        }

        info!(
            "controller started: input boost {}/{} kHz for {}ms, wake boost {}ms",
            config.input_boost_freq_lp,
            config.input_boost_freq_perf,
            config.input_boost_duration_ms,
            config.wake_boost_duration_ms,
        );

        Ok(Self {
            state,
            clock,
            tunables,
            counters,
            adjuster,
            governor,
            worker,
            machine,
            control: None,
            input: None,
            display: None,
            stopped: false,
        })
    }

    pub fn attach_input(&mut self, dir: &Path) -> Result<()> {
        let source = InputSource::start(dir, self.machine.clone())?;
        self.input = Some(source);
        Ok(())
    }

    /// Returns false if no display power node was found.
    pub fn attach_display(
        &mut self,
        kind: DisplaySourceKind,
        root: &Path,
        poll: Duration,
    ) -> Result<bool> {
        self.display = DisplaySource::start(kind, root, poll, self.machine.clone())?;
        Ok(self.display.is_some())
    }

    pub fn attach_control(&mut self, path: &Path) -> Result<()> {
        let ctx = ControlContext {
            requests: self.machine.clone(),
            tunables: Arc::clone(&self.tunables),
            metrics: self.metrics(),
        };
        self.control = Some(ControlServer::start(path, ctx)?);
        Ok(())
    }

    /// Floor for one core, for governors that ask rather than get told.
    pub fn adjust(&self, req: &FrequencyPolicyRequest) -> u32 {
        self.adjuster.adjust(req)
    }

    pub fn request_max_boost(&self, duration_ms: u32) -> bool {
        self.machine.kick_max(duration_ms)
    }

    pub fn machine(&self) -> &Arc<BoostStateMachine> {
        &self.machine
    }

    pub fn metrics(&self) -> MetricsSource {
        MetricsSource::new(
            Arc::clone(&self.state),
            Arc::clone(&self.counters),
            self.clock,
        )
    }

    /// Stop events, cancel the timers, join the worker, then put every
    /// policy back to its resting floor. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        self.machine.close();
        self.control = None;
        self.input = None;
        self.display = None;

        self.worker.stop();
        self.state.clear(BoostFlags::all());
        self.state.reset_input_boost_deadline();
        self.state.reset_max_boost_deadline();

        match self.governor.recompute_all_active_cores() {
            Ok(n) => info!("restored resting floors on {} policies", n),
            Err(e) => warn!("failed to restore resting floors: {:#}", e),
        }
        info!("controller stopped");
    }
}

impl Drop for BoostController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
