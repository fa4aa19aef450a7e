// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: raise the cpufreq floor on input and display wake
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

pub mod clock;
pub mod config;
pub mod control;
pub mod controller;
pub mod display;
pub mod governor;
pub mod input;
pub mod machine;
pub mod notify;
pub mod policy;
pub mod state;
pub mod stats;
pub mod timer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cpufreq_utils::{parse_cpu_list_in, read_policies};
use log::{info, warn};

use crate::config::{
    BoostConfig, DEFAULT_INPUT_BOOST_DURATION_MS, DEFAULT_INPUT_BOOST_FREQ_LP,
    DEFAULT_INPUT_BOOST_FREQ_PERF, DEFAULT_WAKE_BOOST_DURATION_MS, DEFAULT_WORKER_RT_PRIORITY,
};
use crate::controller::BoostController;
use crate::display::{DisplaySourceKind, DEFAULT_SYS_CLASS_ROOT};
use crate::governor::SysfsGovernor;
use crate::input::DEFAULT_INPUT_DIR;
use crate::notify::Governor;
use crate::policy::CoreClassification;

pub const NAME: &str = "cpu_input_boost";

/// Boost the minimum CPU frequency while the user is interacting with the
/// device, and pin it to the maximum for a moment after the display wakes.
#[derive(Debug, Parser)]
#[command(name = "cpu_input_boost", version, about)]
pub struct Opts {
    /// Input boost frequency for low-power cores, in kHz.
    #[clap(long, default_value_t = DEFAULT_INPUT_BOOST_FREQ_LP, env = "CPU_INPUT_BOOST_FREQ_LP")]
    pub input_boost_freq_lp: u32,

    /// Input boost frequency for performance cores, in kHz.
    #[clap(long, default_value_t = DEFAULT_INPUT_BOOST_FREQ_PERF, env = "CPU_INPUT_BOOST_FREQ_PERF")]
    pub input_boost_freq_perf: u32,

    /// How long an input boost lasts after the last input event, in
    /// milliseconds.
    #[clap(long, default_value_t = DEFAULT_INPUT_BOOST_DURATION_MS, env = "CPU_INPUT_BOOST_DURATION_MS")]
    pub input_boost_duration_ms: u32,

    /// Max boost applied when the display wakes, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_WAKE_BOOST_DURATION_MS)]
    pub wake_boost_duration_ms: u32,

    /// Minimum frequency of low-power cores when no boost is active, in kHz.
    /// 0 leaves the hardware minimum.
    #[clap(long, default_value = "0")]
    pub remove_input_boost_freq_lp: u32,

    /// Minimum frequency of performance cores when no boost is active, in
    /// kHz. 0 leaves the hardware minimum.
    #[clap(long, default_value = "0")]
    pub remove_input_boost_freq_perf: u32,

    /// CPUs to treat as low-power cores.
    ///
    /// Accepts a comma-separated list of CPUs or ranges (i.e., 0-3,6) or the
    /// keywords "powersave" (the slowest cluster), "performance", "turbo" and
    /// "all". By default the slowest cluster is used, or none on a
    /// homogeneous system.
    #[clap(long)]
    pub lp_cpus: Option<String>,

    /// cpufreq sysfs directory holding the policyN entries.
    #[clap(long, default_value = cpufreq_utils::DEFAULT_CPUFREQ_ROOT)]
    pub cpufreq_root: PathBuf,

    /// Where to read display power state from.
    #[clap(long, value_enum, default_value_t = DisplaySourceKind::Auto)]
    pub display_source: DisplaySourceKind,

    /// sysfs class directory used to find backlight and DRM nodes.
    #[clap(long, default_value = DEFAULT_SYS_CLASS_ROOT)]
    pub sys_class_root: PathBuf,

    /// Display power polling interval, in milliseconds.
    #[clap(long, default_value = "200")]
    pub display_poll_ms: u64,

    /// Directory of evdev nodes to watch.
    #[clap(long, default_value = DEFAULT_INPUT_DIR)]
    pub input_dir: PathBuf,

    /// Do not watch input devices.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pub no_input: bool,

    /// Control socket path. Empty disables the socket.
    #[clap(long, default_value = control::DEFAULT_CONTROL_SOCKET)]
    pub control_socket: PathBuf,

    /// SCHED_FIFO priority of the notification worker, 0 keeps it at normal
    /// priority.
    #[clap(long, default_value_t = DEFAULT_WORKER_RT_PRIORITY)]
    pub worker_rt_priority: u32,

    /// Compute floors but do not write them to sysfs.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pub dry_run: bool,

    /// Print statistics every N seconds.
    #[clap(long, value_parser = parse_stats_interval)]
    pub stats: Option<f64>,

    /// Client: ask a running daemon for a max boost of this many
    /// milliseconds.
    #[clap(long, conflicts_with_all = ["set", "status"])]
    pub boost: Option<u32>,

    /// Client: set a tunable of a running daemon, as KEY=VALUE.
    #[clap(long, conflicts_with = "status")]
    pub set: Option<String>,

    /// Client: print the metrics of a running daemon as JSON.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pub status: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Opts {
    pub fn boost_config(&self) -> BoostConfig {
        BoostConfig {
            input_boost_freq_lp: self.input_boost_freq_lp,
            input_boost_freq_perf: self.input_boost_freq_perf,
            input_boost_duration_ms: self.input_boost_duration_ms,
            wake_boost_duration_ms: self.wake_boost_duration_ms,
            remove_input_boost_freq_lp: self.remove_input_boost_freq_lp,
            remove_input_boost_freq_perf: self.remove_input_boost_freq_perf,
            worker_rt_priority: self.worker_rt_priority,
        }
    }

    /// The control request for client mode, if one was asked for.
    pub fn client_request(&self) -> Result<Option<String>> {
        if let Some(ms) = self.boost {
            return Ok(Some(format!("boost {}", ms)));
        }
        if let Some(kv) = &self.set {
            let (key, value) = kv
                .split_once('=')
                .with_context(|| format!("expected KEY=VALUE, got {:?}", kv))?;
            return Ok(Some(format!("set {} {}", key.trim(), value.trim())));
        }
        if self.status {
            return Ok(Some("status".to_string()));
        }
        Ok(None)
    }

    fn control_socket(&self) -> Option<&Path> {
        if self.control_socket.as_os_str().is_empty() {
            None
        } else {
            Some(&self.control_socket)
        }
    }
}

fn parse_stats_interval(arg: &str) -> Result<f64, String> {
    let secs: f64 = arg.trim().parse().map_err(|e| format!("{}", e))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("{} is not a positive number of seconds", arg));
    }
    Ok(secs)
}

fn core_classes(opts: &Opts) -> Result<CoreClassification> {
    let classes = match &opts.lp_cpus {
        Some(list) => CoreClassification::new(
            parse_cpu_list_in(list, &opts.cpufreq_root)
                .map_err(|e| anyhow::anyhow!("invalid --lp-cpus {:?}: {}", list, e))?,
        ),
        None => CoreClassification::detect(&read_policies(&opts.cpufreq_root)?),
    };
    let lp: Vec<usize> = classes.low_power_cpus().collect();
    if lp.is_empty() {
        info!("no low-power cores, every core uses the performance frequencies");
    } else {
        info!("low-power cores: {:?}", lp);
    }
    Ok(classes)
}

/// Run the daemon until `shutdown` is set.
pub fn run(opts: Opts, shutdown: Arc<AtomicBool>) -> Result<()> {
    info!("{} {} starting", NAME, env!("CARGO_PKG_VERSION"));

    let config = opts.boost_config();
    let classes = core_classes(&opts)?;
    let root = opts.cpufreq_root.clone();
    let dry_run = opts.dry_run;
    if dry_run {
        info!("dry run: cpufreq floors will be logged, not written");
    }

    let mut controller = BoostController::start(&config, classes, move |adjuster| {
        Ok(Arc::new(SysfsGovernor::new(&root, adjuster, dry_run)?) as Arc<dyn Governor>)
    })?;

    if let Some(path) = opts.control_socket() {
        if let Err(e) = controller.attach_control(path) {
            warn!("control socket unavailable: {:#}", e);
        }
    }
    controller.attach_display(
        opts.display_source,
        &opts.sys_class_root,
        Duration::from_millis(opts.display_poll_ms.max(1)),
    )?;
    if !opts.no_input {
        controller.attach_input(&opts.input_dir)?;
    }

    match opts.stats {
        Some(intv) => {
            let source = controller.metrics();
            let intv = Duration::try_from_secs_f64(intv.max(0.1))
                .with_context(|| format!("invalid stats interval {}", intv))?;
            stats::monitor(
                intv,
                shutdown.clone(),
                || Ok(source.snapshot()),
            )?;
        }
        None => {
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    info!("shutting down");
    controller.shutdown();
    Ok(())
}
