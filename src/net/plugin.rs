//! Pluggable best-effort datagram transports.
//!
//! A [`Transport`] moves raw datagrams to and from named peers with no
//! ordering or reliability guarantees; `receive` never blocks. Two
//! implementations exist: the built-in [`UdpTransport`] (also the fallback
//! path) and [`DynamicTransport`], which loads a shared library exporting the
//! C factory interface (`create_plugin` / `setup` / `send` / `receive` /
//! `destroy` / `get_plugin_version`) and verifies its version string before
//! use.
//!
//! Plugin `send` returns an error code: 0 ok, 1 timeout, 2 network down.
//! Any other code, including ones future SDKs invent, classifies as
//! [`TransportError::Other`].

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::net::packet::MAX_PACKET_SIZE;

/// Reader threads owned by the built-in transport.
const NUM_IO_WORKERS: usize = 2;
/// Capacity of the received-datagram queue.
const RECEIVE_QUEUE_CAPACITY: usize = 1024;
/// Poll timeout for reader threads so they observe shutdown promptly.
const READ_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("send timed out")]
    Timeout,
    #[error("network down")]
    NetworkDown,
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Collapse an I/O error onto the retry classification. Anything we do
    /// not positively recognize is `Other`, which aborts the retry loop.
    pub fn classify_io(err: &io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            TimedOut | WouldBlock => TransportError::Timeout,
            NetworkDown | NetworkUnreachable | HostUnreachable | ConnectionRefused
            | ConnectionReset => TransportError::NetworkDown,
            _ => TransportError::Other(err.to_string()),
        }
    }
}

/// One received datagram with its source peer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub peer: String,
    pub data: Vec<u8>,
}

/// Best-effort datagram transport to named peers. Implementations run their
/// own I/O threads and must make `receive` non-blocking.
pub trait Transport: Send {
    /// Bind and start I/O workers. Failure is fatal to the primary path and
    /// triggers fallback selection.
    fn setup(&mut self, host: &str, port: u16) -> Result<(), TransportError>;

    /// Fire one datagram at `target` (a `host:port` or peer node name).
    fn send(&self, data: &[u8], target: &str) -> Result<(), TransportError>;

    /// Pop the next received datagram, or `None` immediately if there is
    /// nothing pending.
    fn receive(&self) -> Result<Option<Datagram>, TransportError>;

    /// Stop workers and release the socket. Idempotent.
    fn destroy(&mut self);

    fn version(&self) -> String;

    /// Bound local address, when the transport exposes one.
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

/// Built-in UDP transport: one socket, a small reader-thread pool, and a
/// bounded queue the connection layer drains.
pub struct UdpTransport {
    socket: Option<Arc<UdpSocket>>,
    inbound_tx: Sender<Datagram>,
    inbound_rx: Receiver<Datagram>,
    workers: Vec<thread::JoinHandle<()>>,
    running: Arc<AtomicBool>,
    mtu: usize,
}

impl UdpTransport {
    pub fn new(mtu: usize) -> Self {
        let (inbound_tx, inbound_rx) = bounded(RECEIVE_QUEUE_CAPACITY);
        Self {
            socket: None,
            inbound_tx,
            inbound_rx,
            workers: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            mtu,
        }
    }

    fn reader_loop(
        socket: Arc<UdpSocket>,
        inbound: Sender<Datagram>,
        running: Arc<AtomicBool>,
    ) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    if len == 0 {
                        continue;
                    }
                    let datagram = Datagram {
                        peer: addr.to_string(),
                        data: buf[..len].to_vec(),
                    };
                    match inbound.try_send(datagram) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(peer = %addr, "inbound queue full, dropping datagram");
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => {
                    warn!("udp receive error: {}", e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}

impl Transport for UdpTransport {
    fn setup(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let socket = UdpSocket::bind((host, port))
            .map_err(|e| TransportError::Setup(format!("bind {host}:{port}: {e}")))?;
        socket
            .set_read_timeout(Some(READ_POLL))
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        let socket = Arc::new(socket);

        self.running.store(true, Ordering::SeqCst);
        for _ in 0..NUM_IO_WORKERS {
            let socket = socket.clone();
            let inbound = self.inbound_tx.clone();
            let running = self.running.clone();
            self.workers.push(thread::spawn(move || {
                Self::reader_loop(socket, inbound, running);
            }));
        }
        self.socket = Some(socket);
        Ok(())
    }

    fn send(&self, data: &[u8], target: &str) -> Result<(), TransportError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| TransportError::Other("transport not set up".into()))?;
        if data.is_empty() || data.len() > MAX_PACKET_SIZE {
            return Err(TransportError::Other(format!(
                "datagram size {} out of range",
                data.len()
            )));
        }
        if data.len() > self.mtu {
            debug!(len = data.len(), mtu = self.mtu, "datagram exceeds mtu");
        }
        let addr = target
            .to_socket_addrs()
            .map_err(|e| TransportError::Other(format!("unresolvable target {target}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Other(format!("unresolvable target {target}")))?;
        socket
            .send_to(data, addr)
            .map_err(|e| TransportError::classify_io(&e))?;
        Ok(())
    }

    fn receive(&self) -> Result<Option<Datagram>, TransportError> {
        Ok(self.inbound_rx.try_recv().ok())
    }

    fn destroy(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.workers.is_empty() {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.socket = None;
    }

    fn version(&self) -> String {
        "builtin-udp/1.0.0".into()
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ---------------------------------------------------------------------------
// Dynamic plugin loading
// ---------------------------------------------------------------------------

type CreateFn = unsafe extern "C" fn() -> *mut c_void;
type SetupFn = unsafe extern "C" fn(*mut c_void, *const c_char, c_int) -> bool;
type SendFn = unsafe extern "C" fn(*mut c_void, *const u8, usize, *const c_char) -> c_int;
/// Fills the peer and data buffers; returns false when no datagram is ready.
type ReceiveFn = unsafe extern "C" fn(
    *mut c_void,
    *mut c_char,
    usize,
    *mut u8,
    usize,
    *mut usize,
) -> bool;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type VersionFn = unsafe extern "C" fn() -> *const c_char;

/// Supported plugin ABI major version.
const PLUGIN_VERSION_PREFIX: &str = "1.";

const PLUGIN_SEND_OK: c_int = 0;
const PLUGIN_SEND_TIMEOUT: c_int = 1;
const PLUGIN_SEND_NETWORK_DOWN: c_int = 2;

/// A transport backed by a dynamically loaded shared library. The plugin owns
/// its own I/O threads; this wrapper only marshals calls across the C ABI.
#[derive(Debug)]
pub struct DynamicTransport {
    handle: *mut c_void,
    setup_fn: SetupFn,
    send_fn: SendFn,
    receive_fn: ReceiveFn,
    destroy_fn: DestroyFn,
    version: String,
    // Keeps the shared library mapped for as long as the fn pointers live.
    _lib: libloading::Library,
}

// The plugin contract requires the instance to be callable from the transport
// worker threads; the raw handle is what makes this not auto-derivable.
unsafe impl Send for DynamicTransport {}

impl DynamicTransport {
    /// Open the library, resolve the factory symbols, verify the version
    /// string, and instantiate the plugin.
    pub fn load(path: &Path) -> Result<Self, TransportError> {
        unsafe {
            let lib = libloading::Library::new(path)
                .map_err(|e| TransportError::Setup(format!("open {}: {e}", path.display())))?;

            let create: CreateFn = *lib
                .get::<CreateFn>(b"create_plugin")
                .map_err(|e| TransportError::Setup(format!("missing create_plugin: {e}")))?;
            let setup_fn: SetupFn = *lib
                .get::<SetupFn>(b"setup")
                .map_err(|e| TransportError::Setup(format!("missing setup: {e}")))?;
            let send_fn: SendFn = *lib
                .get::<SendFn>(b"send")
                .map_err(|e| TransportError::Setup(format!("missing send: {e}")))?;
            let receive_fn: ReceiveFn = *lib
                .get::<ReceiveFn>(b"receive")
                .map_err(|e| TransportError::Setup(format!("missing receive: {e}")))?;
            let destroy_fn: DestroyFn = *lib
                .get::<DestroyFn>(b"destroy")
                .map_err(|e| TransportError::Setup(format!("missing destroy: {e}")))?;
            let version_fn: VersionFn = *lib
                .get::<VersionFn>(b"get_plugin_version")
                .map_err(|e| TransportError::Setup(format!("missing get_plugin_version: {e}")))?;

            let version_ptr = version_fn();
            if version_ptr.is_null() {
                return Err(TransportError::Setup("plugin returned null version".into()));
            }
            let version = CStr::from_ptr(version_ptr).to_string_lossy().into_owned();
            if !version.starts_with(PLUGIN_VERSION_PREFIX) {
                return Err(TransportError::Setup(format!(
                    "unsupported plugin version '{version}' (want {PLUGIN_VERSION_PREFIX}x)"
                )));
            }

            let handle = create();
            if handle.is_null() {
                return Err(TransportError::Setup("plugin factory returned null".into()));
            }

            Ok(Self {
                handle,
                setup_fn,
                send_fn,
                receive_fn,
                destroy_fn,
                version,
                _lib: lib,
            })
        }
    }
}

impl Transport for DynamicTransport {
    fn setup(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let host_c = CString::new(host)
            .map_err(|_| TransportError::Setup("host contains NUL".into()))?;
        let ok = unsafe { (self.setup_fn)(self.handle, host_c.as_ptr(), c_int::from(port)) };
        if ok {
            Ok(())
        } else {
            Err(TransportError::Setup(format!(
                "plugin refused to bind {host}:{port}"
            )))
        }
    }

    fn send(&self, data: &[u8], target: &str) -> Result<(), TransportError> {
        let target_c = CString::new(target)
            .map_err(|_| TransportError::Other("target contains NUL".into()))?;
        let code = unsafe { (self.send_fn)(self.handle, data.as_ptr(), data.len(), target_c.as_ptr()) };
        match code {
            PLUGIN_SEND_OK => Ok(()),
            PLUGIN_SEND_TIMEOUT => Err(TransportError::Timeout),
            PLUGIN_SEND_NETWORK_DOWN => Err(TransportError::NetworkDown),
            other => Err(TransportError::Other(format!("plugin send code {other}"))),
        }
    }

    fn receive(&self) -> Result<Option<Datagram>, TransportError> {
        let mut peer_buf = [0 as c_char; 128];
        let mut data_buf = vec![0u8; MAX_PACKET_SIZE];
        let mut len: usize = 0;
        let got = unsafe {
            (self.receive_fn)(
                self.handle,
                peer_buf.as_mut_ptr(),
                peer_buf.len(),
                data_buf.as_mut_ptr(),
                data_buf.len(),
                &mut len,
            )
        };
        if !got {
            return Ok(None);
        }
        if len == 0 || len > data_buf.len() {
            return Err(TransportError::Other(format!(
                "plugin reported datagram length {len}"
            )));
        }
        data_buf.truncate(len);
        let peer = unsafe { CStr::from_ptr(peer_buf.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok(Some(Datagram { peer, data: data_buf }))
    }

    fn destroy(&mut self) {
        if !self.handle.is_null() {
            unsafe { (self.destroy_fn)(self.handle) };
            self.handle = std::ptr::null_mut();
        }
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}

impl Drop for DynamicTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Resolve the configured primary transport: a dynamic plugin when one is
/// configured, the built-in UDP transport when selected by name. Anything
/// else is a setup failure, which the connection layer answers with fallback.
pub fn open_primary(config: &crate::config::NetworkConfig) -> Result<Box<dyn Transport>, TransportError> {
    if let Some(path) = &config.plugins.transport {
        let mut plugin = DynamicTransport::load(path)?;
        plugin.setup(&config.host, config.port)?;
        debug!(version = %plugin.version(), "loaded transport plugin");
        return Ok(Box::new(plugin));
    }
    match config.transport.as_str() {
        "udp" => {
            let mut udp = UdpTransport::new(config.network_settings.mtu);
            udp.setup(&config.host, config.port)?;
            Ok(Box::new(udp))
        }
        other => Err(TransportError::Setup(format!(
            "no built-in transport named '{other}' and no plugin configured"
        ))),
    }
}

/// The fallback path is always the classic UDP listener on the same port.
pub fn open_fallback(config: &crate::config::NetworkConfig) -> Result<UdpTransport, TransportError> {
    if config.fallback_transport != "udp" {
        return Err(TransportError::Setup(format!(
            "unsupported fallback transport '{}'",
            config.fallback_transport
        )));
    }
    let mut udp = UdpTransport::new(config.network_settings.mtu);
    udp.setup(&config.host, config.port)?;
    Ok(udp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_transport() -> UdpTransport {
        let mut t = UdpTransport::new(1400);
        t.setup("127.0.0.1", 0).unwrap();
        t
    }

    #[test]
    fn test_udp_setup_and_destroy_idempotent() {
        let mut t = loopback_transport();
        assert!(t.local_addr().is_some());
        t.destroy();
        t.destroy();
    }

    #[test]
    fn test_udp_send_receive() {
        let a = loopback_transport();
        let b = loopback_transport();
        let target = b.local_addr().unwrap().to_string();

        a.send(&[1, 2, 3], &target).unwrap();

        // Reader threads deliver asynchronously.
        let mut got = None;
        for _ in 0..50 {
            if let Some(d) = b.receive().unwrap() {
                got = Some(d);
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let datagram = got.expect("datagram not delivered");
        assert_eq!(datagram.data, vec![1, 2, 3]);
        assert_eq!(datagram.peer, a.local_addr().unwrap().to_string());
    }

    #[test]
    fn test_udp_receive_is_non_blocking() {
        let t = loopback_transport();
        assert!(t.receive().unwrap().is_none());
    }

    #[test]
    fn test_udp_send_bad_target() {
        let t = loopback_transport();
        assert!(matches!(
            t.send(&[1], "not-an-address"),
            Err(TransportError::Other(_))
        ));
    }

    #[test]
    fn test_udp_oversized_datagram_rejected() {
        let t = loopback_transport();
        let big = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(t.send(&big, "127.0.0.1:9").is_err());
    }

    #[test]
    fn test_dynamic_load_missing_library() {
        let err = DynamicTransport::load(Path::new("/nonexistent/libplugin.so")).unwrap_err();
        assert!(matches!(err, TransportError::Setup(_)));
    }

    #[test]
    fn test_open_primary_unknown_builtin_fails_setup() {
        let config = crate::config::NetworkConfig {
            node_id: "n".into(),
            transport: "gRPC".into(),
            ..Default::default()
        };
        assert!(matches!(
            open_primary(&config),
            Err(TransportError::Setup(_))
        ));
    }

    #[test]
    fn test_classify_io() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "t");
        assert!(matches!(
            TransportError::classify_io(&timeout),
            TransportError::Timeout
        ));
        let down = io::Error::new(io::ErrorKind::NetworkDown, "d");
        assert!(matches!(
            TransportError::classify_io(&down),
            TransportError::NetworkDown
        ));
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "p");
        assert!(matches!(
            TransportError::classify_io(&other),
            TransportError::Other(_)
        ));
    }
}
