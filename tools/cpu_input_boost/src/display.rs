// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: display power event source
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::ValueEnum;
use log::{debug, info, trace, warn};

use crate::machine::DisplayEvents;

pub const DEFAULT_SYS_CLASS_ROOT: &str = "/sys/class";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DisplaySourceKind {
    /// Backlight if present, DRM connectors otherwise.
    Auto,
    Backlight,
    Drm,
    /// Never report display transitions.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPower {
    On,
    Off,
}

/// `bl_power` holds an FB_BLANK_* level; only 0 is unblanked.
pub fn parse_bl_power(raw: &str) -> Option<DisplayPower> {
    match raw.trim().parse::<u32>().ok()? {
        0 => Some(DisplayPower::On),
        _ => Some(DisplayPower::Off),
    }
}

pub fn parse_dpms(raw: &str) -> Option<DisplayPower> {
    match raw.trim() {
        "On" => Some(DisplayPower::On),
        "Off" | "Standby" | "Suspend" => Some(DisplayPower::Off),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct PowerNode {
    pub path: PathBuf,
    parse: fn(&str) -> Option<DisplayPower>,
}

impl PowerNode {
    pub fn read(&self) -> Option<DisplayPower> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => (self.parse)(&raw),
            Err(e) => {
                trace!("display: {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

fn backlight_nodes(root: &Path) -> Vec<PowerNode> {
    read_dir_sorted(&root.join("backlight"))
        .into_iter()
        .map(|dir| dir.join("bl_power"))
        .filter(|p| p.exists())
        .map(|path| PowerNode {
            path,
            parse: parse_bl_power,
        })
        .collect()
}

fn drm_nodes(root: &Path) -> Vec<PowerNode> {
    read_dir_sorted(&root.join("drm"))
        .into_iter()
        .filter(|dir| {
            // Connectors are named cardN-<type>-M; cardN itself is the GPU.
            dir.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("card") && n.contains('-'))
        })
        .filter(|dir| {
            std::fs::read_to_string(dir.join("status"))
                .map_or(false, |s| s.trim() == "connected")
        })
        .map(|dir| dir.join("dpms"))
        .filter(|p| p.exists())
        .map(|path| PowerNode {
            path,
            parse: parse_dpms,
        })
        .collect()
}

fn read_dir_sorted(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.flatten().map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort();
    entries
}

/// Power nodes for `kind` below a sysfs class root such as `/sys/class`.
pub fn discover(kind: DisplaySourceKind, root: &Path) -> Vec<PowerNode> {
    match kind {
        DisplaySourceKind::None => Vec::new(),
        DisplaySourceKind::Backlight => backlight_nodes(root),
        DisplaySourceKind::Drm => drm_nodes(root),
        DisplaySourceKind::Auto => {
            let nodes = backlight_nodes(root);
            if nodes.is_empty() {
                drm_nodes(root)
            } else {
                nodes
            }
        }
    }
}

/// The display counts as on while any node is on.
pub fn aggregate<I: IntoIterator<Item = DisplayPower>>(powers: I) -> Option<DisplayPower> {
    let mut seen = None;
    for p in powers {
        if p == DisplayPower::On {
            return Some(DisplayPower::On);
        }
        seen = Some(p);
    }
    seen
}

/// Turns raw readings into transitions. The display is assumed on before the
/// first reading, so only an initial "off" is reported.
#[derive(Debug, Default)]
pub struct DisplayTracker {
    last: Option<DisplayPower>,
}

impl DisplayTracker {
    pub fn observe(&mut self, power: DisplayPower) -> Option<DisplayPower> {
        let prev = self.last.replace(power);
        match prev {
            Some(prev) if prev == power => None,
            None if power == DisplayPower::On => None,
            _ => Some(power),
        }
    }
}

pub fn dispatch(sink: &dyn DisplayEvents, power: DisplayPower) {
    match power {
        DisplayPower::Off => {
            info!("display: blanked");
            sink.enter_screen_off();
        }
        DisplayPower::On => {
            info!("display: unblanked");
            sink.enter_screen_awake();
        }
    }
}

/// Polls display power nodes and forwards transitions from one thread, so
/// the sink never sees two transitions at once.
pub struct DisplaySource {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DisplaySource {
    /// Returns None when there is nothing to watch.
    pub fn start(
        kind: DisplaySourceKind,
        root: &Path,
        poll: Duration,
        sink: Arc<dyn DisplayEvents>,
    ) -> Result<Option<Self>> {
        if kind == DisplaySourceKind::None {
            info!("display: power tracking disabled");
            return Ok(None);
        }
        let nodes = discover(kind, root);
        if nodes.is_empty() {
            warn!(
                "display: no {:?} power nodes under {}, screen state will not be tracked",
                kind,
                root.display()
            );
            return Ok(None);
        }
        for node in nodes.iter() {
            info!("display: watching {}", node.path.display());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("display-power".to_string())
            .spawn(move || poll_loop(nodes, poll, sink, thread_stop))
            .context("failed to spawn display thread")?;

        Ok(Some(Self {
            stop,
            thread: Some(handle),
        }))
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("display thread panicked");
            }
            debug!("display source stopped");
        }
    }
}

impl Drop for DisplaySource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    nodes: Vec<PowerNode>,
    poll: Duration,
    sink: Arc<dyn DisplayEvents>,
    stop: Arc<AtomicBool>,
) {
    let mut tracker = DisplayTracker::default();
    let mut next = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next {
            thread::sleep((next - now).min(Duration::from_millis(100)));
            continue;
        }
        next = now + poll;

        if let Some(power) = aggregate(nodes.iter().filter_map(|n| n.read())) {
            if let Some(transition) = tracker.observe(power) {
                dispatch(sink.as_ref(), transition);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DisplayPower>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<DisplayPower> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DisplayEvents for RecordingSink {
        fn enter_screen_off(&self) {
            self.events.lock().unwrap().push(DisplayPower::Off);
        }

        fn enter_screen_awake(&self) {
            self.events.lock().unwrap().push(DisplayPower::On);
        }
    }

    fn backlight(root: &Path, name: &str, value: &str) -> PathBuf {
        let dir = root.join("backlight").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bl_power");
        std::fs::write(&path, value).unwrap();
        path
    }

    fn connector(root: &Path, name: &str, status: &str, dpms: &str) {
        let dir = root.join("drm").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("status"), format!("{}\n", status)).unwrap();
        std::fs::write(dir.join("dpms"), format!("{}\n", dpms)).unwrap();
    }

    #[test]
    fn parses_power_files() {
        assert_eq!(parse_bl_power("0\n"), Some(DisplayPower::On));
        assert_eq!(parse_bl_power("4\n"), Some(DisplayPower::Off));
        assert_eq!(parse_bl_power("junk"), None);
        assert_eq!(parse_dpms("On\n"), Some(DisplayPower::On));
        assert_eq!(parse_dpms("Standby"), Some(DisplayPower::Off));
        assert_eq!(parse_dpms(""), None);
    }

    #[test]
    fn tracker_reports_transitions_only() {
        let mut t = DisplayTracker::default();
        assert_eq!(t.observe(DisplayPower::On), None);
        assert_eq!(t.observe(DisplayPower::On), None);
        assert_eq!(t.observe(DisplayPower::Off), Some(DisplayPower::Off));
        assert_eq!(t.observe(DisplayPower::Off), None);
        assert_eq!(t.observe(DisplayPower::On), Some(DisplayPower::On));

        let mut t = DisplayTracker::default();
        assert_eq!(t.observe(DisplayPower::Off), Some(DisplayPower::Off));
    }

    #[test]
    fn any_node_on_means_on() {
        use DisplayPower::*;
        assert_eq!(aggregate([Off, On, Off]), Some(On));
        assert_eq!(aggregate([Off, Off]), Some(Off));
        assert_eq!(aggregate([]), None);
    }

    #[test]
    fn discovery() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        assert!(discover(DisplaySourceKind::Auto, root).is_empty());

        connector(root, "card0-eDP-1", "connected", "On");
        connector(root, "card0-HDMI-A-1", "disconnected", "Off");
        std::fs::create_dir_all(root.join("drm/card0")).unwrap();
        let drm = discover(DisplaySourceKind::Auto, root);
        assert_eq!(drm.len(), 1);
        assert!(drm[0].path.ends_with("card0-eDP-1/dpms"));

        backlight(root, "panel0", "0");
        let auto = discover(DisplaySourceKind::Auto, root);
        assert_eq!(auto.len(), 1);
        assert!(auto[0].path.ends_with("panel0/bl_power"));
        assert_eq!(discover(DisplaySourceKind::Drm, root).len(), 1);
        assert!(discover(DisplaySourceKind::None, root).is_empty());
    }

    #[test]
    fn polling_forwards_blank_and_unblank() {
        let tmp = tempfile::tempdir().unwrap();
        let bl = backlight(tmp.path(), "panel0", "0\n");
        let sink = Arc::new(RecordingSink::default());

        let mut source = DisplaySource::start(
            DisplaySourceKind::Backlight,
            tmp.path(),
            Duration::from_millis(10),
            sink.clone(),
        )
        .unwrap()
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        assert!(sink.events().is_empty());

        std::fs::write(&bl, "4\n").unwrap();
        thread::sleep(Duration::from_millis(100));
        std::fs::write(&bl, "0\n").unwrap();
        thread::sleep(Duration::from_millis(100));
        source.stop();

        assert_eq!(sink.events(), vec![DisplayPower::Off, DisplayPower::On]);
    }

    #[test]
    fn missing_nodes_start_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let source = DisplaySource::start(
            DisplaySourceKind::Auto,
            tmp.path(),
            Duration::from_millis(10),
            sink,
        )
        .unwrap();
        assert!(source.is_none());
    }
}
