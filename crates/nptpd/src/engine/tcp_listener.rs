//! TCP listener.
//!
//! Accepts at most one concurrent TCP peer per mapping and forwards bytes
//! to/from it through callbacks.

use std::net::{Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};

use super::error::{EngineError, Result};

/// Reads are delivered in chunks of at most this size.
pub const MAX_CHUNK: usize = 4095;
/// Concurrent-client ceiling for bridging use.
const CONCURRENT_CLIENT_CEILING: i32 = 1;

/// Opaque identity for an accepted TCP peer.
///
/// Move-only in spirit: the only way to obtain one is via `on_accept`, and
/// it is meaningless once `on_disconnect` has fired for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

struct Peer {
    id: PeerId,
    stream: TcpStream,
}

/// Upcalls invoked by the accept/reader threads. `on_accept`, `on_bytes`
/// (zero or more times) and `on_disconnect` fire in that order for a given
/// peer; `on_disconnect` fires exactly once per accepted peer.
pub trait TcpListenerCallbacks: Send + Sync + 'static {
    fn on_accept(&self, peer: PeerId);
    fn on_bytes(&self, peer: PeerId, chunk: &[u8]);
    fn on_disconnect(&self, peer: PeerId);
}

pub struct TcpListenerHandle {
    running: Arc<AtomicBool>,
    raw_fd: RawFd,
    accept_thread: Option<JoinHandle<()>>,
    current_peer: Arc<Mutex<Option<Peer>>>,
    reader_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    local_addr: SocketAddr,
}

impl TcpListenerHandle {
    /// Binds to all local interfaces on `port` and starts the (blocking)
    /// accept loop.
    pub fn start(port: u16, callbacks: Arc<dyn TcpListenerCallbacks>) -> Result<Self> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)
            .map_err(|source| EngineError::SocketFailed { what: "tcp listener", source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| EngineError::SocketFailed { what: "tcp listener", source })?;
        socket
            .bind(&addr.into())
            .map_err(|source| EngineError::BindFailed { what: "tcp listener", addr: addr.to_string(), source })?;
        socket
            .listen((CONCURRENT_CLIENT_CEILING * 2).max(2))
            .map_err(|source| EngineError::BindFailed { what: "tcp listener", addr: addr.to_string(), source })?;
        let listener: StdTcpListener = socket.into();
        let local_addr = listener
            .local_addr()
            .map_err(|source| EngineError::SocketFailed { what: "tcp listener", source })?;
        let raw_fd = listener.as_raw_fd();

        let running = Arc::new(AtomicBool::new(true));
        let current_peer: Arc<Mutex<Option<Peer>>> = Arc::new(Mutex::new(None));
        let reader_thread: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let next_id = Arc::new(AtomicU64::new(1));

        let accept_thread = {
            let running = running.clone();
            let current_peer = current_peer.clone();
            let reader_thread = reader_thread.clone();
            thread::Builder::new()
                .name(format!("nptpd-accept-{port}"))
                .spawn(move || accept_loop(listener, running, current_peer, reader_thread, next_id, callbacks))
                .map_err(|source| EngineError::SocketFailed { what: "tcp accept thread", source })?
        };

        Ok(Self {
            running,
            raw_fd,
            accept_thread: Some(accept_thread),
            current_peer,
            reader_thread,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_attached(&self) -> bool {
        self.current_peer.lock().is_some()
    }

    /// Writes `bytes` to the currently attached peer, or fails with
    /// `PeerGone` if nobody is attached (or the attached peer no longer
    /// matches `peer`).
    pub fn send_to_peer(&self, peer: PeerId, bytes: &[u8]) -> Result<usize> {
        use std::io::Write;
        let mut guard = self.current_peer.lock();
        match guard.as_mut() {
            Some(p) if p.id == peer => {
                p.stream.write_all(bytes).map_err(|_| EngineError::PeerGone)?;
                Ok(bytes.len())
            }
            _ => Err(EngineError::PeerGone),
        }
    }

    /// Forcibly detaches whatever peer is currently attached, as if it had
    /// disconnected. Used when component C (bridge) observes the local side
    /// going away in S4 and needs A to drop back to LISTENING. Does not
    /// itself invoke `on_disconnect` -- the reader thread does that when its
    /// blocking read unblocks from the shutdown below.
    pub fn disconnect_current(&self) {
        if let Some(p) = self.current_peer.lock().as_ref() {
            let _ = p.stream.shutdown(Shutdown::Both);
        }
    }

    /// Graceful shutdown: close the listening socket's raw fd to unblock the
    /// accept thread's pending `accept()` call, detach any current peer to
    /// unblock its reader thread, then join every thread this handle owns.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        unsafe {
            libc::close(self.raw_fd);
        }
        self.disconnect_current();
        if let Some(t) = self.accept_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.reader_thread.lock().take() {
            let _ = t.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: StdTcpListener,
    running: Arc<AtomicBool>,
    current_peer: Arc<Mutex<Option<Peer>>>,
    reader_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
    callbacks: Arc<dyn TcpListenerCallbacks>,
) {
    loop {
        let (stream, _addr) = match listener.accept() {
            Ok(pair) => pair,
            // The raw fd was closed out from under us (shutdown) or the
            // listener genuinely failed; either way, stop accepting.
            Err(_) => break,
        };
        if !running.load(Ordering::SeqCst) {
            let _ = stream.shutdown(Shutdown::Both);
            break;
        }
        if current_peer.lock().is_some() {
            // Second concurrent client: refuse by immediate close, no queueing.
            let _ = stream.shutdown(Shutdown::Both);
            continue;
        }
        stream.set_nodelay(true).ok();
        // Minimize buffering: latency over throughput.
        let sock = socket2::SockRef::from(&stream);
        let _ = sock.set_send_buffer_size(MAX_CHUNK + 1);

        let id = PeerId(next_id.fetch_add(1, Ordering::Relaxed));
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => continue,
        };

        let cb = callbacks.clone();
        let current_peer_for_reader = current_peer.clone();
        let spawned = thread::Builder::new()
            .name(format!("nptpd-tcp-peer-{}", id.0))
            .spawn(move || read_peer(id, reader_stream, current_peer_for_reader, cb));
        let handle = match spawned {
            Ok(h) => h,
            Err(err) => {
                log::warn!("failed to spawn tcp peer reader thread: {err}");
                let _ = stream.shutdown(Shutdown::Both);
                continue;
            }
        };
        *current_peer.lock() = Some(Peer { id, stream });
        callbacks.on_accept(id);

        if let Some(old) = reader_thread.lock().replace(handle) {
            // Previous reader already finished by the time a new peer is accepted
            // (accept cannot happen while attached), but join defensively.
            let _ = old.join();
        }
    }
}

fn read_peer(
    id: PeerId,
    mut stream: TcpStream,
    current_peer: Arc<Mutex<Option<Peer>>>,
    callbacks: Arc<dyn TcpListenerCallbacks>,
) {
    use std::io::Read;
    let mut buf = [0u8; MAX_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => callbacks.on_bytes(id, &buf[..n]),
            Err(_) => break,
        }
    }
    let mut guard = current_peer.lock();
    if matches!(guard.as_ref(), Some(p) if p.id == id) {
        *guard = None;
    }
    drop(guard);
    callbacks.on_disconnect(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        accepted: AtomicUsize,
        disconnected: AtomicUsize,
        bytes: Mutex<Vec<u8>>,
    }

    impl TcpListenerCallbacks for Recorder {
        fn on_accept(&self, _peer: PeerId) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_bytes(&self, _peer: PeerId, chunk: &[u8]) {
            self.bytes.lock().extend_from_slice(chunk);
        }
        fn on_disconnect(&self, _peer: PeerId) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn single_client_roundtrip() {
        let rec = Arc::new(Recorder::default());
        let handle = TcpListenerHandle::start(0, rec.clone()).unwrap();
        let addr = handle.local_addr();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello").unwrap();

        // Wait for the accept + read to register.
        for _ in 0..100 {
            if rec.bytes.lock().as_slice() == b"hello" {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rec.bytes.lock().as_slice(), b"hello");
        assert_eq!(rec.accepted.load(Ordering::SeqCst), 1);

        drop(client);
        for _ in 0..100 {
            if rec.disconnected.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rec.disconnected.load(Ordering::SeqCst), 1);

        handle.stop();
    }

    #[test]
    fn second_client_is_refused_while_attached() {
        let rec = Arc::new(Recorder::default());
        let handle = TcpListenerHandle::start(0, rec.clone()).unwrap();
        let addr = handle.local_addr();

        let _first = TcpStream::connect(addr).unwrap();
        for _ in 0..100 {
            if handle.is_attached() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.is_attached());

        let mut second = TcpStream::connect(addr).unwrap();
        let mut buf = [0u8; 8];
        // The refused connection should observe EOF (or an error) quickly.
        let n = second.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
        assert!(handle.is_attached(), "first client must remain attached");

        handle.stop();
    }
}
