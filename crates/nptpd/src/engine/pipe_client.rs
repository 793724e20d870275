//! Local-stream client.
//!
//! A bidirectional byte stream over the OS's local-domain transport,
//! addressed by filesystem path. The client's own socket is bound to a
//! local path *before* connecting to the peer, so the peer's
//! `getsockname` identifies the caller -- something
//! `std::os::unix::net::UnixStream::connect` cannot express on its own,
//! since it creates, binds and connects in one call with an anonymous
//! local address. This reproduces the bind-then-connect sequence with raw
//! syscalls via `libc`.

use std::ffi::CString;
use std::fs;
use std::io::{self, Read, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::error::{EngineError, Result};

pub const MAX_CHUNK: usize = 4095;

pub trait PipeClientCallbacks: Send + Sync + 'static {
    fn on_bytes(&self, chunk: &[u8]);
    fn on_disconnect(&self);
}

/// An opened-but-not-necessarily-connected local-stream endpoint.
///
/// After `on_disconnect` fires the handle is dead: `send` returns
/// `NotConnected` and a fresh `open`+`connect` is required, matching the
/// original's lifecycle.
pub struct PipeClientHandle {
    local_addr: PathBuf,
    stream: Arc<parking_lot::Mutex<Option<UnixStream>>>,
    reader_thread: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket path too long"));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((addr, len))
}

/// Creates a fresh `AF_UNIX`/`SOCK_STREAM` socket, unbound.
fn new_unix_stream_socket() -> io::Result<RawFd> {
    let fd: RawFd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Binds an existing socket fd to `path`. Kept distinct from socket
/// creation so callers can attribute a failure here specifically to a bind
/// error, not a socket-creation error.
fn bind_unix_stream_socket(fd: RawFd, path: &Path) -> io::Result<()> {
    let (addr, len) = sockaddr_un(path)?;
    let rc = unsafe { libc::bind(fd, (&addr as *const libc::sockaddr_un).cast(), len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn connect_unix_stream_socket(stream: &UnixStream, remote_addr: &Path) -> io::Result<()> {
    let (addr, len) = sockaddr_un(remote_addr)?;
    let rc = unsafe { libc::connect(stream.as_raw_fd(), (&addr as *const libc::sockaddr_un).cast(), len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl PipeClientHandle {
    /// Creates an unbound endpoint at `local_addr`, unlinking any stale
    /// file of that name first to recover from a prior crash.
    pub fn open(local_addr: impl AsRef<Path>) -> Result<Self> {
        let local_addr = local_addr.as_ref().to_path_buf();
        let _ = fs::remove_file(&local_addr);
        let fd = new_unix_stream_socket()
            .map_err(|source| EngineError::SocketFailed { what: "local-stream client", source })?;
        if let Err(source) = bind_unix_stream_socket(fd, &local_addr) {
            unsafe { libc::close(fd) };
            return Err(EngineError::BindFailed {
                what: "local-stream client",
                addr: local_addr.display().to_string(),
                source,
            });
        }
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Ok(Self {
            local_addr,
            stream: Arc::new(parking_lot::Mutex::new(Some(stream))),
            reader_thread: None,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> &Path {
        &self.local_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connects to `remote_addr`, the peer's local-stream endpoint file.
    /// Fails with `NoSuchEndpoint` if the file is absent, or `Refused` if
    /// the connect syscall itself fails (e.g. nobody is listening yet).
    pub fn connect(&mut self, remote_addr: &Path, callbacks: Arc<dyn PipeClientCallbacks>) -> Result<()> {
        if !remote_addr.exists() {
            return Err(EngineError::NoSuchEndpoint(remote_addr.to_path_buf()));
        }
        let reader_stream = {
            let guard = self.stream.lock();
            let stream = guard.as_ref().ok_or(EngineError::NotConnected)?;
            connect_unix_stream_socket(stream, remote_addr).map_err(|source| EngineError::Refused { source })?;
            stream.try_clone().map_err(|source| EngineError::Refused { source })?
        };

        let stream_slot = self.stream.clone();
        let connected = self.connected.clone();
        let handle = thread::Builder::new()
            .name("nptpd-pipe-reader".to_string())
            .spawn(move || read_loop(reader_stream, stream_slot, connected, callbacks))
            .map_err(|source| EngineError::SocketFailed { what: "local-stream reader thread", source })?;
        self.connected.store(true, Ordering::SeqCst);
        self.reader_thread = Some(handle);
        Ok(())
    }

    /// Writes `bytes` to the connected peer, or fails with `NotConnected`.
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        let mut guard = self.stream.lock();
        match guard.as_mut() {
            Some(s) => {
                s.write_all(bytes).map_err(|_| EngineError::NotConnected)?;
                Ok(bytes.len())
            }
            None => Err(EngineError::NotConnected),
        }
    }

    /// Graceful close: unlinks the local address, shuts down the stream
    /// (unblocking the reader thread's pending `read`), and joins it.
    pub fn close(mut self) {
        self.shutdown_locked();
        if let Some(t) = self.reader_thread.take() {
            let _ = t.join();
        }
        let _ = fs::remove_file(&self.local_addr);
    }

    fn shutdown_locked(&self) {
        if let Some(s) = self.stream.lock().as_ref() {
            let _ = s.shutdown(std::net::Shutdown::Both);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn read_loop(
    mut stream: UnixStream,
    stream_slot: Arc<parking_lot::Mutex<Option<UnixStream>>>,
    connected: Arc<AtomicBool>,
    callbacks: Arc<dyn PipeClientCallbacks>,
) {
    let mut buf = [0u8; MAX_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => callbacks.on_bytes(&buf[..n]),
        }
    }
    connected.store(false, Ordering::SeqCst);
    *stream_slot.lock() = None;
    callbacks.on_disconnect();
}

/// Resolves a `CString` for diagnostics; unused in the hot path but kept
/// alongside `sockaddr_un` since both speak the same `sun_path` encoding.
#[allow(dead_code)]
fn display_path(path: &Path) -> CString {
    CString::new(path.as_os_str().as_bytes()).unwrap_or_default()
}
