//! Engine supervisor.
//!
//! Loads the mapping set, brings up a [`Bridge`] per mapping, registers the
//! filesystem watcher, opens the control plane, then blocks until the
//! control plane signals shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::bridge::Bridge;
use super::config;
use super::control::{ControlCallbacks, ControlPlaneHandle};
use super::error::{EngineError, Result};
use super::watcher::FsWatcherHandle;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub config_path: PathBuf,
    pub control_socket_path: PathBuf,
    pub ipc_stream_root: String,
}

/// Runs the engine to completion: startup, dispatch until `exit`, shutdown.
/// Returns once shutdown has fully completed.
///
/// # Errors
/// Propagates `ConfigInvalid` (empty or invalid mapping set), or
/// `WatcherFailed`/`BindFailed` if the filesystem watcher or control socket
/// cannot be brought up -- both fatal for the daemon as a whole. Per-mapping
/// bind failures are logged and the mapping is skipped, not propagated,
/// unless every mapping fails to start.
pub fn run(settings: &EngineSettings) -> Result<()> {
    let mapping_configs = config::load_mappings(&settings.config_path)?;
    let total = mapping_configs.len();

    let mut bridges = Vec::with_capacity(total);
    for mapping in mapping_configs {
        let index = mapping.index;
        let bridge = Bridge::new(mapping, settings.ipc_stream_root.clone());
        match bridge.start() {
            Ok(()) => bridges.push(bridge),
            Err(err) => log::warn!("mapping {index}: failed to start, skipping: {err}"),
        }
    }
    if bridges.is_empty() {
        return Err(EngineError::ConfigInvalid(format!("all {total} mapping(s) failed to start")));
    }
    log::info!("{}/{total} mapping(s) started", bridges.len());

    let watcher = FsWatcherHandle::start(bridges.clone())?;

    let exit_signal = Arc::new((Mutex::new(false), Condvar::new()));
    let callbacks: Arc<dyn ControlCallbacks> = Arc::new(SupervisorCallbacks {
        bridges: bridges.clone(),
        exit_signal: exit_signal.clone(),
    });
    let control = ControlPlaneHandle::start(&settings.control_socket_path, callbacks)?;

    log::info!("service ready");
    wait_for_exit(&exit_signal);

    log::info!("shutdown requested");
    control.stop();
    watcher.stop();
    for bridge in &bridges {
        bridge.stop();
    }
    log::info!("service terminated");
    Ok(())
}

fn wait_for_exit(exit_signal: &Arc<(Mutex<bool>, Condvar)>) {
    let (lock, cvar) = &**exit_signal;
    let mut exited = lock.lock();
    while !*exited {
        cvar.wait(&mut exited);
    }
}

struct SupervisorCallbacks {
    bridges: Vec<Arc<Bridge>>,
    exit_signal: Arc<(Mutex<bool>, Condvar)>,
}

impl ControlCallbacks for SupervisorCallbacks {
    fn on_list(&self) {
        println!();
        for bridge in &self.bridges {
            println!("{}", bridge.list_line());
        }
        println!();
    }

    fn on_exit(&self) {
        let (lock, cvar) = &*self.exit_signal;
        *lock.lock() = true;
        cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::control::send_command;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn run_shuts_down_cleanly_on_exit_command() {
        let dir = tempfile::tempdir().unwrap();
        let pipe_dir = dir.path().to_path_buf();
        let server_path = pipe_dir.join("p0");
        let listener = std::os::unix::net::UnixListener::bind(&server_path).unwrap();
        let echo_thread = std::thread::spawn(move || {
            use std::io::Read;
            if let Ok((mut s, _)) = listener.accept() {
                let mut buf = [0u8; 16];
                while let Ok(n) = s.read(&mut buf) {
                    if n == 0 || s.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        });

        let config_path = dir.path().join("nptpd.toml");
        std::fs::write(
            &config_path,
            format!(
                "[[mapping]]\nport = 0\ndir = \"{}\"\nname = \"p0\"\ndescription = \"t\"\n",
                pipe_dir.display()
            ),
        )
        .unwrap();

        let settings = EngineSettings {
            config_path,
            control_socket_path: dir.path().join("ctl.sock"),
            ipc_stream_root: dir.path().join("stream-").to_string_lossy().to_string(),
        };

        let control_socket_path = settings.control_socket_path.clone();
        let run_thread = std::thread::spawn(move || run(&settings));

        std::thread::sleep(Duration::from_millis(200));
        send_command(&control_socket_path, "list").unwrap();
        send_command(&control_socket_path, "exit").unwrap();

        run_thread.join().unwrap().unwrap();
        let _ = std::fs::remove_file(&server_path);
        let _ = echo_thread.join();
    }
}
