//! Filesystem watcher.
//!
//! Watches one directory per distinct `pipe_dir` across all mappings and
//! dispatches a "name appeared" event to every bridge whose `pipe_name`
//! matches: one shared `inotify` instance, one watch per mapping directory,
//! `IN_CREATE` only, dispatch by name comparison.
//!
//! Cancellation closes the shared inotify fd to unblock the thread parked
//! in a blocking read, rather than any asynchronous-cancellation
//! primitive: the dispatch thread owns the `Inotify` value and blocks
//! inside it, a second thread closes the raw fd to unblock it, then the
//! owner joins.

use std::collections::HashMap;
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use inotify::{Inotify, WatchDescriptor, WatchMask};

use super::bridge::Bridge;
use super::error::{EngineError, Result};

/// Large enough to hold ~1024 events at the platform's worst-case
/// header+name size (`inotify_event` header plus a full `NAME_MAX` name).
const EVENT_BUFFER_LEN: usize = (size_of::<libc::c_int>() * 4 + 256) * 1024;

pub struct FsWatcherHandle {
    running: Arc<AtomicBool>,
    raw_fd: RawFd,
    thread: Option<JoinHandle<()>>,
}

impl FsWatcherHandle {
    /// Registers one watch per distinct `pipe_dir` among `bridges` and
    /// starts the dispatch thread. Fails with `WatcherFailed` if the
    /// underlying `inotify` instance cannot be created or a watch cannot be
    /// added -- both are fatal for the daemon, since losing the watcher
    /// means losing the ability to reconnect.
    pub fn start(bridges: Vec<Arc<Bridge>>) -> Result<Self> {
        let mut inotify = Inotify::init().map_err(|e| EngineError::WatcherFailed(e.to_string()))?;

        let mut by_watch: HashMap<WatchDescriptor, Vec<Arc<Bridge>>> = HashMap::new();
        let mut wd_by_dir: HashMap<std::path::PathBuf, WatchDescriptor> = HashMap::new();
        for bridge in bridges {
            let dir = bridge.pipe_dir().to_path_buf();
            let wd = match wd_by_dir.get(&dir) {
                Some(wd) => wd.clone(),
                None => {
                    let wd = inotify
                        .watches()
                        .add(&dir, WatchMask::CREATE)
                        .map_err(|e| EngineError::WatcherFailed(format!("{}: {e}", dir.display())))?;
                    wd_by_dir.insert(dir, wd.clone());
                    wd
                }
            };
            by_watch.entry(wd).or_default().push(bridge);
        }

        let raw_fd = inotify.as_raw_fd();
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name("nptpd-watcher".to_string())
            .spawn(move || dispatch_loop(inotify, by_watch, thread_running))
            .map_err(|e| EngineError::WatcherFailed(e.to_string()))?;

        Ok(Self { running, raw_fd, thread: Some(thread) })
    }

    /// Closes the shared inotify fd (unblocking the dispatch thread's
    /// pending read) and joins it.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        unsafe {
            libc::close(self.raw_fd);
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn dispatch_loop(
    mut inotify: Inotify,
    by_watch: HashMap<WatchDescriptor, Vec<Arc<Bridge>>>,
    running: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; EVENT_BUFFER_LEN];
    loop {
        let events = match inotify.read_events_blocking(&mut buffer) {
            Ok(events) => events,
            Err(_) => break,
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }
        for event in events {
            let Some(name) = event.name else { continue };
            let Some(bridges) = by_watch.get(&event.wd) else { continue };
            for bridge in bridges {
                if name.to_str() == Some(bridge.pipe_name()) {
                    bridge.on_name_appeared();
                }
            }
        }
    }
}
