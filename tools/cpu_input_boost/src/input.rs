// SPDX-License-Identifier: GPL-2.0
//
// cpu_input_boost: evdev input event source
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::os::fd::BorrowedFd;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use evdev::{AbsoluteAxisType, Device, EventType, Key};
use inotify::{Inotify, WatchMask};
use log::{debug, info, trace, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};

use crate::machine::InputEvents;

pub const DEFAULT_INPUT_DIR: &str = "/dev/input";

const INOTIFY_TAG: u64 = u64::MAX;
const EPOLL_TIMEOUT_MS: u16 = 100;
const MAX_EVENTS_PER_FD: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Touchscreen,
    Touchpad,
    Keypad,
}

/// The capability bits the device match table looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub ev_abs: bool,
    pub ev_key: bool,
    pub abs_mt_xy: bool,
    pub abs_xy: bool,
    pub btn_touch: bool,
}

impl DeviceCaps {
    pub fn of(dev: &Device) -> Self {
        let events = dev.supported_events();
        let abs = dev.supported_absolute_axes();
        let has_abs = |axis: AbsoluteAxisType| abs.map_or(false, |a| a.contains(axis));
        Self {
            ev_abs: events.contains(EventType::ABSOLUTE),
            ev_key: events.contains(EventType::KEY),
            abs_mt_xy: has_abs(AbsoluteAxisType::ABS_MT_POSITION_X)
                && has_abs(AbsoluteAxisType::ABS_MT_POSITION_Y),
            abs_xy: has_abs(AbsoluteAxisType::ABS_X) && has_abs(AbsoluteAxisType::ABS_Y),
            btn_touch: dev
                .supported_keys()
                .map_or(false, |k| k.contains(Key::BTN_TOUCH)),
        }
    }

    /// First matching entry of the match table, None if the device is not
    /// interesting.
    pub fn kind(&self) -> Option<DeviceKind> {
        if self.ev_abs && self.abs_mt_xy {
            Some(DeviceKind::Touchscreen)
        } else if self.btn_touch && self.abs_xy {
            Some(DeviceKind::Touchpad)
        } else if self.ev_key {
            Some(DeviceKind::Keypad)
        } else {
            None
        }
    }
}

/// True if a batch holds anything besides synchronisation reports.
pub fn is_activity<I: IntoIterator<Item = EventType>>(batch: I) -> bool {
    batch
        .into_iter()
        .take(MAX_EVENTS_PER_FD)
        .any(|t| t != EventType::SYNCHRONIZATION)
}

fn is_event_node(name: &str) -> bool {
    name.strip_prefix("event")
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

struct TrackedDevice {
    path: PathBuf,
    dev: Device,
}

struct InputMonitor {
    dir: PathBuf,
    epoll: Epoll,
    inotify: Option<Inotify>,
    devices: HashMap<i32, TrackedDevice>,
    paths: HashSet<PathBuf>,
    sink: Arc<dyn InputEvents>,
}

impl InputMonitor {
    fn new(dir: &Path, sink: Arc<dyn InputEvents>) -> Result<Self> {
        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(|e| anyhow::anyhow!(e))?;

        let inotify = match Inotify::init() {
            Ok(inotify) => match inotify
                .watches()
                .add(dir, WatchMask::CREATE | WatchMask::ATTRIB)
            {
                Ok(_) => {
                    // SAFETY: the inotify instance lives in the monitor next
                    // to the epoll set and is only dropped with it.
                    let bfd = unsafe { BorrowedFd::borrow_raw(inotify.as_raw_fd()) };
                    epoll
                        .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, INOTIFY_TAG))
                        .map_err(|e| anyhow::anyhow!(e))?;
                    Some(inotify)
                }
                Err(e) => {
                    warn!("input: cannot watch {}: {}, hotplug disabled", dir.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("input: failed to init inotify: {}, hotplug disabled", e);
                None
            }
        };

        let mut monitor = Self {
            dir: dir.to_path_buf(),
            epoll,
            inotify,
            devices: HashMap::new(),
            paths: HashSet::new(),
            sink,
        };
        monitor.scan();
        info!("input: watching {} device(s) under {}", monitor.devices.len(), dir.display());
        Ok(monitor)
    }

    fn scan(&mut self) {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("input: cannot read {}: {}", self.dir.display(), e);
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, is_event_node)
            {
                self.try_add(path);
            }
        }
    }

    fn try_add(&mut self, path: PathBuf) {
        if self.paths.contains(&path) {
            return;
        }
        let dev = match Device::open(&path) {
            Ok(dev) => dev,
            Err(e) => {
                trace!("input: cannot open {}: {}", path.display(), e);
                return;
            }
        };
        let Some(kind) = DeviceCaps::of(&dev).kind() else {
            trace!("input: ignoring {}", path.display());
            return;
        };

        let fd = dev.as_raw_fd();
        // SAFETY: fd belongs to `dev`, which is open for the whole call.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                let _ = libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        // SAFETY: the device is kept in `devices` until it is removed from
        // the epoll set in `remove`.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self
            .epoll
            .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, fd as u64))
        {
            warn!("input: failed to register {}: {}", path.display(), e);
            return;
        }

        info!(
            "input: {:?} {} ({})",
            kind,
            dev.name().unwrap_or("unknown"),
            path.display()
        );
        self.paths.insert(path.clone());
        self.devices.insert(fd, TrackedDevice { path, dev });
    }

    fn remove(&mut self, fd: i32) {
        if let Some(tracked) = self.devices.remove(&fd) {
            // SAFETY: the device is still open, it is dropped at the end of
            // this scope.
            let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = self.epoll.delete(bfd);
            self.paths.remove(&tracked.path);
            info!("input: {} removed", tracked.path.display());
        }
    }

    fn handle_hotplug(&mut self) {
        let mut buffer = [0u8; 4096];
        let mut added = Vec::new();
        if let Some(inotify) = self.inotify.as_mut() {
            match inotify.read_events(&mut buffer) {
                Ok(events) => {
                    for event in events {
                        if let Some(name) = event.name.and_then(|n| n.to_str()) {
                            if is_event_node(name) {
                                added.push(self.dir.join(name));
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("input: inotify error: {}, hotplug disabled", e);
                    self.inotify = None;
                }
            }
        }
        for path in added {
            self.try_add(path);
        }
    }

    /// Drain one device. Returns false if it is gone.
    fn drain(&mut self, fd: i32) -> bool {
        let Some(tracked) = self.devices.get_mut(&fd) else {
            return true;
        };
        match tracked.dev.fetch_events() {
            Ok(events) => {
                if is_activity(events.map(|ev| ev.event_type())) {
                    self.sink.kick();
                }
                true
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) => {
                debug!("input: {}: {}", tracked.path.display(), e);
                false
            }
        }
    }

    fn run(&mut self, stop: &AtomicBool) {
        let mut events = [EpollEvent::empty(); 64];
        while !stop.load(Ordering::Relaxed) {
            let n = match self.epoll.wait(&mut events, Some(EPOLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("input: epoll_wait failed: {}", e);
                    break;
                }
            };

            for ev in events.iter().take(n) {
                let tag = ev.data();
                if tag == INOTIFY_TAG {
                    self.handle_hotplug();
                    continue;
                }
                let fd = tag as i32;
                let flags = ev.events();
                let alive = !flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
                    && self.drain(fd);
                if !alive {
                    self.remove(fd);
                }
            }
        }
    }
}

/// Watches evdev devices and kicks the state machine on activity.
pub struct InputSource {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InputSource {
    pub fn start(dir: &Path, sink: Arc<dyn InputEvents>) -> Result<Self> {
        let mut monitor = InputMonitor::new(dir, sink)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("input-boost".to_string())
            .spawn(move || monitor.run(&thread_stop))
            .context("failed to spawn input thread")?;

        Ok(Self {
            stop,
            thread: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("input thread panicked");
            }
            debug!("input source stopped");
        }
    }
}

impl Drop for InputSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct CountingSink {
        kicks: AtomicU64,
    }

    impl InputEvents for CountingSink {
        fn kick(&self) {
            self.kicks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn match_table_order() {
        let touchscreen = DeviceCaps {
            ev_abs: true,
            ev_key: true,
            abs_mt_xy: true,
            btn_touch: true,
            abs_xy: true,
        };
        assert_eq!(touchscreen.kind(), Some(DeviceKind::Touchscreen));

        let touchpad = DeviceCaps {
            ev_abs: true,
            btn_touch: true,
            abs_xy: true,
            ..Default::default()
        };
        assert_eq!(touchpad.kind(), Some(DeviceKind::Touchpad));

        let keypad = DeviceCaps {
            ev_key: true,
            ..Default::default()
        };
        assert_eq!(keypad.kind(), Some(DeviceKind::Keypad));
    }

    #[test]
    fn unmatched_devices() {
        // Accelerometer: absolute axes but no touch.
        let accel = DeviceCaps {
            ev_abs: true,
            abs_xy: true,
            ..Default::default()
        };
        assert_eq!(accel.kind(), None);
        assert_eq!(DeviceCaps::default().kind(), None);

        // MT axes without EV_ABS advertised do not match the touchscreen row.
        let odd = DeviceCaps {
            abs_mt_xy: true,
            ..Default::default()
        };
        assert_eq!(odd.kind(), None);
    }

    #[test]
    fn sync_only_batch_is_not_activity() {
        assert!(!is_activity([EventType::SYNCHRONIZATION]));
        assert!(!is_activity(Vec::<EventType>::new()));
        assert!(is_activity([
            EventType::ABSOLUTE,
            EventType::ABSOLUTE,
            EventType::SYNCHRONIZATION
        ]));
        assert!(is_activity([EventType::SYNCHRONIZATION, EventType::KEY]));
    }

    #[test]
    fn event_node_names() {
        assert!(is_event_node("event0"));
        assert!(is_event_node("event12"));
        assert!(!is_event_node("event"));
        assert!(!is_event_node("mouse0"));
        assert!(!is_event_node("by-id"));
    }

    #[test]
    fn starts_and_stops_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let mut source = InputSource::start(dir.path(), sink.clone()).unwrap();

        // Not a device node: open fails and nothing is registered.
        std::fs::write(dir.path().join("event7"), b"").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(150));

        source.stop();
        source.stop();
        assert_eq!(sink.kicks.load(Ordering::SeqCst), 0);
    }
}
