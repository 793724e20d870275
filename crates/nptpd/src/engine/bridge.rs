//! The per-mapping bridge state machine.
//!
//! Each `Bridge` owns exactly one [`TcpListenerHandle`] and at most one
//! [`PipeClientHandle`] at a time, plus the `tcp_state`/`local_state` pair
//! and the currently attached TCP peer's id. All three live behind one
//! `parking_lot::Mutex`: a per-mapping mutex protecting the two state
//! fields plus the peer reference is sufficient, since nothing here ever
//! blocks while holding it.
//!
//! Callbacks from the TCP listener and the local-stream client hold only a
//! `Weak<Bridge>`, so they never keep the bridge alive past its owner's
//! teardown.

use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::error::{EngineError, Result};
use super::log_state;
use super::mapping::{LocalState, MappingConfig, TcpState};
use super::pipe_client::{self, PipeClientCallbacks, PipeClientHandle};
use super::tcp_listener::{self, PeerId, TcpListenerCallbacks, TcpListenerHandle};

struct SharedState {
    tcp_state: TcpState,
    local_state: LocalState,
    attached_peer: Option<PeerId>,
}

pub struct Bridge {
    pub config: MappingConfig,
    ipc_stream_root: String,
    state: Mutex<SharedState>,
    tcp: Mutex<Option<TcpListenerHandle>>,
    local: Mutex<Option<PipeClientHandle>>,
}

impl Bridge {
    pub fn new(config: MappingConfig, ipc_stream_root: String) -> Arc<Self> {
        Arc::new(Self {
            config,
            ipc_stream_root,
            state: Mutex::new(SharedState {
                tcp_state: TcpState::Idle,
                local_state: LocalState::Unbound,
                attached_peer: None,
            }),
            tcp: Mutex::new(None),
            local: Mutex::new(None),
        })
    }

    /// *construct*: S0 -> start TCP listener -> open local client (S1) ->
    /// attempt connect (S2 if the peer file is already present).
    ///
    /// A bind failure here is fatal for this mapping only; the caller (the
    /// supervisor) is expected to log and continue with other mappings
    /// rather than propagate.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let callbacks: Arc<dyn TcpListenerCallbacks> = Arc::new(TcpCallbacks { bridge: Arc::downgrade(self) });
        let tcp_handle = TcpListenerHandle::start(self.config.tcp_port, callbacks)?;
        self.state.lock().tcp_state = TcpState::Listening;
        *self.tcp.lock() = Some(tcp_handle);

        self.open_local();
        self.try_connect_local();
        Ok(())
    }

    pub fn tcp_state(&self) -> TcpState {
        self.state.lock().tcp_state
    }

    pub fn local_state(&self) -> LocalState {
        self.state.lock().local_state
    }

    fn open_local(self: &Arc<Self>) {
        let local_addr = self.config.local_client_addr(&self.ipc_stream_root);
        match PipeClientHandle::open(&local_addr) {
            Ok(handle) => {
                *self.local.lock() = Some(handle);
                self.state.lock().local_state = LocalState::BoundDisconnected;
            }
            Err(err) => {
                log::warn!(
                    "mapping {}: failed to open local-stream client at {}: {err}",
                    self.config.index,
                    local_addr.display()
                );
            }
        }
    }

    /// Attempts S1 -> S2 (or S3 -> S4). No-op if the peer file is absent or
    /// the local client isn't open, in which case the mapping stays where
    /// it was -- the watcher will retry on the next name-appeared event.
    fn try_connect_local(self: &Arc<Self>) {
        let peer_addr = self.config.peer_addr();
        let callbacks: Arc<dyn PipeClientCallbacks> = Arc::new(LocalCallbacks { bridge: Arc::downgrade(self) });
        let mut local = self.local.lock();
        let Some(handle) = local.as_mut() else { return };
        match handle.connect(&peer_addr, callbacks) {
            Ok(()) => {
                self.state.lock().local_state = LocalState::Connected;
                crate::engine_info!("mapping {}: local stream connected", self.config.index);
            }
            Err(EngineError::NoSuchEndpoint(_)) | Err(EngineError::Refused { .. }) => {
                // Stay in BOUND_DISCONNECTED; the watcher will fire again.
            }
            Err(err) => {
                log::warn!("mapping {}: local connect failed: {err}", self.config.index);
            }
        }
    }

    /// *Name-appears event for `pipe_name`*: the only synchronous
    /// reconnection trigger. A no-op if already CONNECTED (the watcher is
    /// at-least-once, so re-delivery while already in S2/S4 must be
    /// idempotent).
    pub fn on_name_appeared(self: &Arc<Self>) {
        let already_connected = matches!(self.state.lock().local_state, LocalState::Connected);
        if already_connected {
            return;
        }
        // Only replace the local client handle after its own disconnect
        // callback has cleared `local`, which it always has by the time we
        // get here, since `local_state` only leaves CONNECTED inside
        // `on_local_disconnect` below, *after* the old handle is dropped.
        // This keeps a reopen from ever racing a reader thread still using
        // the previous handle.
        let need_reopen = self.local.lock().is_none();
        if need_reopen {
            self.open_local();
        }
        self.try_connect_local();
    }

    /// Forwards a chunk arriving from the TCP side to the local side (S4
    /// only). Drops silently otherwise (S2: no attached peer to have sent
    /// it in the first place; can still race with a local disconnect that
    /// hasn't been processed yet, in which case the send fails and the
    /// chunk is dropped).
    fn forward_tcp_to_local(&self, chunk: &[u8]) {
        log_state::dump("tcp->local", chunk);
        let local = self.local.lock();
        if let Some(handle) = local.as_ref() {
            let _ = handle.send(chunk);
        }
    }

    /// Forwards a chunk arriving from the local side to the TCP side (S4
    /// only; dropped in S2 since there's no attached peer).
    fn forward_local_to_tcp(&self, peer: PeerId, chunk: &[u8]) {
        log_state::dump("local->tcp", chunk);
        let tcp = self.tcp.lock();
        if let Some(handle) = tcp.as_ref() {
            let _ = handle.send_to_peer(peer, chunk);
        }
    }

    fn on_tcp_accept(&self, peer: PeerId) {
        let mut guard = self.state.lock();
        if guard.tcp_state == TcpState::Attached {
            // A second concurrent client slipped past the listener's own
            // ceiling check in a race; refuse it the same way.
            return;
        }
        guard.tcp_state = TcpState::Attached;
        guard.attached_peer = Some(peer);
        crate::engine_info!("mapping {}: tcp peer attached", self.config.index);
    }

    fn on_tcp_disconnect(&self, peer: PeerId) {
        let mut guard = self.state.lock();
        if guard.attached_peer == Some(peer) {
            guard.tcp_state = TcpState::Listening;
            guard.attached_peer = None;
            crate::engine_info!("mapping {}: tcp peer disconnected", self.config.index);
        }
    }

    fn on_local_disconnect(self: &Arc<Self>) {
        {
            let mut guard = self.state.lock();
            guard.local_state = LocalState::BoundDisconnected;
        }
        // Release the dead handle and stop -- the engine does not poll or
        // retry on its own. Reopening/reconnecting happens exclusively from
        // `on_name_appeared`, the only synchronous reconnection trigger.
        *self.local.lock() = None;
        crate::engine_info!("mapping {}: local stream disconnected", self.config.index);
    }

    pub fn pipe_name(&self) -> &str {
        &self.config.pipe_name
    }

    pub fn pipe_dir(&self) -> &Path {
        &self.config.pipe_dir
    }

    /// One line of `list` output: `port:attached dir/name:connected "desc"`.
    pub fn list_line(&self) -> String {
        let guard = self.state.lock();
        format!(
            "{}:{} {}/{}:{} \"{}\"",
            self.config.tcp_port,
            if guard.tcp_state == TcpState::Attached { '*' } else { '-' },
            self.config.pipe_dir.display(),
            self.config.pipe_name,
            if guard.local_state == LocalState::Connected { '*' } else { '-' },
            self.config.description,
        )
    }

    /// *shutdown*: tear down local client, tear down TCP listener. The
    /// watcher token is released by the caller (the supervisor owns it).
    pub fn stop(&self) {
        if let Some(handle) = self.local.lock().take() {
            handle.close();
        }
        if let Some(handle) = self.tcp.lock().take() {
            handle.stop();
        }
    }
}

struct TcpCallbacks {
    bridge: Weak<Bridge>,
}

impl TcpListenerCallbacks for TcpCallbacks {
    fn on_accept(&self, peer: PeerId) {
        if let Some(b) = self.bridge.upgrade() {
            b.on_tcp_accept(peer);
        }
    }

    fn on_bytes(&self, peer: PeerId, chunk: &[u8]) {
        let _ = peer;
        if let Some(b) = self.bridge.upgrade() {
            b.forward_tcp_to_local(chunk);
        }
    }

    fn on_disconnect(&self, peer: PeerId) {
        if let Some(b) = self.bridge.upgrade() {
            b.on_tcp_disconnect(peer);
        }
    }
}

struct LocalCallbacks {
    bridge: Weak<Bridge>,
}

impl PipeClientCallbacks for LocalCallbacks {
    fn on_bytes(&self, chunk: &[u8]) {
        if let Some(b) = self.bridge.upgrade() {
            let peer = b.state.lock().attached_peer;
            if let Some(peer) = peer {
                b.forward_local_to_tcp(peer, chunk);
            }
        }
    }

    fn on_disconnect(&self) {
        if let Some(b) = self.bridge.upgrade() {
            b.on_local_disconnect();
        }
    }
}

pub const MAX_CHUNK_TCP: usize = tcp_listener::MAX_CHUNK;
pub const MAX_CHUNK_LOCAL: usize = pipe_client::MAX_CHUNK;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(f(), "condition never became true");
    }

    #[test]
    fn single_byte_roundtrip_through_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let pipe_dir = dir.path().to_path_buf();
        let pipe_name = "p0".to_string();
        let server_path = pipe_dir.join(&pipe_name);
        let listener = std::os::unix::net::UnixListener::bind(&server_path).unwrap();
        let echo_thread = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            loop {
                match s.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if s.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let config = MappingConfig {
            index: 0,
            tcp_port: 0,
            pipe_dir,
            pipe_name,
            description: "test".into(),
        };
        let ipc_root = dir.path().join("stream-").to_string_lossy().to_string();
        let bridge = Bridge::new(config, ipc_root);
        bridge.start().unwrap();

        wait_until(|| bridge.local_state() == LocalState::Connected);

        let port = bridge.tcp.lock().as_ref().unwrap().local_addr().port();
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"A").unwrap();

        let mut buf = [0u8; 1];
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"A");

        drop(client);
        wait_until(|| bridge.tcp_state() == TcpState::Listening);

        bridge.stop();
        let _ = std::fs::remove_file(&server_path);
        echo_thread.join().unwrap();
    }

    #[test]
    fn list_line_matches_format() {
        let config = MappingConfig {
            index: 0,
            tcp_port: 9000,
            pipe_dir: "/tmp/t".into(),
            pipe_name: "p0".into(),
            description: "desc".into(),
        };
        let bridge = Bridge::new(config, "/tmp/stream-".into());
        assert_eq!(bridge.list_line(), "9000:- /tmp/t/p0:- \"desc\"");
    }
}
