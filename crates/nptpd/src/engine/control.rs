//! Control plane.
//!
//! A local datagram endpoint that accepts single-packet ASCII commands from
//! the sibling control CLI: bind, spawn an owned receive thread, `recv` in
//! a loop, dispatch (verbosity digits, `dump`, `list`, `exit`, `help`).

use std::fs;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::error::{EngineError, Result};
use super::log_state;

/// Longest datagram accepted per read; matches the per-chunk ceiling used
/// throughout the engine.
const MAX_COMMAND_LEN: usize = 4095;

/// Upcalls for commands that require supervisor-level action. Verbosity and
/// dump-flag commands are handled entirely within this module via
/// `log_state`, since they only touch process-wide atomics.
pub trait ControlCallbacks: Send + Sync + 'static {
    /// `"list"` -- emit the mapping table to stdout.
    fn on_list(&self);
    /// `"exit"` -- request orderly daemon shutdown.
    fn on_exit(&self);
}

pub struct ControlPlaneHandle {
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlPlaneHandle {
    /// Binds the control datagram socket at `socket_path`, unlinking any
    /// stale file first, and starts the receive thread.
    pub fn start(socket_path: impl AsRef<Path>, callbacks: Arc<dyn ControlCallbacks>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if let Some(dir) = socket_path.parent() {
            let _ = fs::create_dir_all(dir);
        }
        let _ = fs::remove_file(&socket_path);
        let socket = UnixDatagram::bind(&socket_path)
            .map_err(|source| EngineError::BindFailed { what: "control plane", addr: socket_path.display().to_string(), source })?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_socket = socket.try_clone().map_err(|source| EngineError::SocketFailed { what: "control plane", source })?;
        let thread = thread::Builder::new()
            .name("nptpd-control".to_string())
            .spawn(move || recv_loop(thread_socket, thread_running, callbacks))
            .map_err(|source| EngineError::SocketFailed { what: "control plane thread", source })?;

        log::info!("control socket ready at {}", socket_path.display());
        Ok(Self { socket_path, running, thread: Some(thread) })
    }

    /// Graceful shutdown: unblocks the receive thread by shutting down the
    /// socket, joins it, unlinks the path.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = UnixDatagram::unbound().and_then(|s| s.send_to(b"", &self.socket_path));
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn recv_loop(socket: UnixDatagram, running: Arc<AtomicBool>, callbacks: Arc<dyn ControlCallbacks>) {
    let mut buf = [0u8; MAX_COMMAND_LEN];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => dispatch(&buf[..n], &callbacks),
            Err(_) => break,
        }
    }
}

/// Applies one datagram's payload. Unknown payloads are ignored.
fn dispatch(payload: &[u8], callbacks: &Arc<dyn ControlCallbacks>) {
    match payload {
        b"" => {}
        b"help" => log::info!("service ready"),
        b"list" => callbacks.on_list(),
        b"exit" => callbacks.on_exit(),
        b"dump" => {
            log_state::toggle_dump_flag();
        }
        // Each digit sets a specific bit combination, not `mask = digit`.
        b"0" => log_state::set_verbosity(log_state::LOG_MASK_NONE),
        b"1" => log_state::set_verbosity(log_state::LOG_MASK_INFO),
        b"2" => log_state::set_verbosity(log_state::LOG_MASK_TRACE),
        b"3" => log_state::set_verbosity(log_state::LOG_MASK_INFO | log_state::LOG_MASK_TRACE),
        b"4" => log_state::set_verbosity(log_state::LOG_MASK_DEBUG),
        b"5" => log_state::set_verbosity(log_state::LOG_MASK_INFO | log_state::LOG_MASK_DEBUG),
        b"6" => log_state::set_verbosity(log_state::LOG_MASK_TRACE | log_state::LOG_MASK_DEBUG),
        b"7" => log_state::set_verbosity(log_state::LOG_MASK_ALL),
        _ => {}
    }
}

/// Sends one command datagram to `socket_path`, the shape used by the
/// control CLI. Exposed here (rather than duplicated in `nptpctl`) so both
/// binaries agree on the wire format.
pub fn send_command(socket_path: &Path, command: &str) -> std::io::Result<()> {
    let client = UnixDatagram::unbound()?;
    client.send_to(command.as_bytes(), socket_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        list_calls: AtomicUsize,
        exit_calls: AtomicUsize,
    }

    impl ControlCallbacks for Recorder {
        fn on_list(&self) {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn on_exit(&self) {
            self.exit_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn verbosity_digit_sets_exact_mask() {
        log_state::set_verbosity(log_state::LOG_MASK_NONE);
        let rec: Arc<dyn ControlCallbacks> = Arc::new(Recorder::default());
        dispatch(b"5", &rec);
        assert_eq!(log_state::verbosity(), log_state::LOG_MASK_INFO | log_state::LOG_MASK_DEBUG);
    }

    #[test]
    fn unknown_payload_is_ignored() {
        log_state::set_verbosity(log_state::LOG_MASK_TRACE);
        let rec: Arc<dyn ControlCallbacks> = Arc::new(Recorder::default());
        dispatch(b"not-a-command", &rec);
        assert_eq!(log_state::verbosity(), log_state::LOG_MASK_TRACE);
    }

    #[test]
    fn list_and_exit_reach_callbacks() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ctl.sock");
        let rec = Arc::new(Recorder::default());
        let handle = ControlPlaneHandle::start(&socket_path, rec.clone()).unwrap();

        send_command(&socket_path, "list").unwrap();
        send_command(&socket_path, "exit").unwrap();

        for _ in 0..200 {
            if rec.list_calls.load(Ordering::SeqCst) == 1 && rec.exit_calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rec.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rec.exit_calls.load(Ordering::SeqCst), 1);

        handle.stop();
        assert!(!socket_path.exists());
    }
}
