//! Raw non-blocking socket plus retrying I/O
//!
//! An [`Endpoint`] wraps one connected `mio` stream. It never blocks: the
//! "complete" operations turn short non-blocking transfers into
//! all-or-nothing ones.
//!
//! - [`Endpoint::read_exact`] makes `1 + limit / 64` read attempts and fails
//!   with [`NioError::WeakNetwork`] rather than hand back a short buffer.
//! - [`Endpoint::write_buf`] keeps writing until the buffer drains. Stalls
//!   are absorbed by yielding, then by 1ms sleeps, and fail once no byte
//!   has moved for the configured write timeout.
//!
//! Any I/O failure flips the endpoint to *ended* for good. Every attempt,
//! including those inside the retry loops, checks that flag first.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};
use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::error::{NioError, Result};
use crate::event_loop::{SelectionKey, SelectorLoop};
use crate::raw;

/// Extra read attempts granted per 64 requested bytes.
const READ_BUDGET_UNIT: usize = 64;
/// Consecutive write stalls absorbed with `yield_now` before sleeping.
const WRITE_SPIN_LIMIT: u32 = 64;
const WRITE_BACKOFF: Duration = Duration::from_millis(1);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

struct Socket {
    stream: Option<TcpStream>,
    key: Option<SelectionKey>,
}

pub struct Endpoint {
    socket: Mutex<Socket>,
    local: OnceLock<SocketAddr>,
    remote: OnceLock<SocketAddr>,
    max_idle_time: Option<Duration>,
    write_timeout: Duration,
    closed: AtomicBool,
    ended: AtomicBool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local", &self.local.get())
            .field("remote", &self.remote.get())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("ended", &self.ended.load(Ordering::Relaxed))
            .finish()
    }
}

impl Endpoint {
    /// Wraps a connected stream. `key` is its registration, if any.
    ///
    /// The idle time is read once from the socket's receive timeout.
    pub fn new(stream: TcpStream, key: Option<SelectionKey>) -> Result<Self> {
        let max_idle_time = raw::recv_timeout(raw::os_socket(&stream))?;
        Ok(Self {
            socket: Mutex::new(Socket { stream: Some(stream), key }),
            local: OnceLock::new(),
            remote: OnceLock::new(),
            max_idle_time,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            closed: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        })
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Endpoints only ever hold non-blocking sockets.
    pub fn is_blocking(&self) -> bool {
        false
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Local address, memoized after the first successful lookup.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.local.get() {
            return Some(*addr);
        }
        let addr = self.socket.lock().stream.as_ref()?.local_addr().ok()?;
        Some(*self.local.get_or_init(|| addr))
    }

    /// Remote address, memoized after the first successful lookup.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        if let Some(addr) = self.remote.get() {
            return Some(*addr);
        }
        let addr = self.socket.lock().stream.as_ref()?.peer_addr().ok()?;
        Some(*self.remote.get_or_init(|| addr))
    }

    /// Loop owning this endpoint's registration, if it is still alive.
    pub fn selector(&self) -> Option<Arc<SelectorLoop>> {
        self.socket.lock().key.as_ref().and_then(SelectionKey::selector)
    }

    /// One non-blocking read attempt
    ///
    /// `Ok(0)` is end of stream. An empty socket surfaces as a `WouldBlock`
    /// [`NioError::Io`] and leaves the endpoint usable.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_live()?;
        loop {
            match self.attempt(|s| s.read(buf)) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(e.into()),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Reads exactly `limit` bytes within the retry budget
    pub fn read_exact(&self, limit: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(limit);
        let budget = 1 + limit / READ_BUDGET_UNIT;
        let mut filled = 0;
        let mut attempts = 0;
        while filled < limit && attempts < budget {
            self.ensure_live()?;
            attempts += 1;
            match self.attempt(|s| s.read(&mut buf[filled..])) {
                Ok(0) => {
                    return Err(self.fail(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("peer closed after {} of {} bytes", filled, limit),
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        if filled < limit {
            debug!("read of {} bytes gave up after {} attempts with {}", limit, attempts, filled);
            return Err(NioError::WeakNetwork { op: "read", transferred: filled, expected: limit });
        }
        Ok(buf.freeze())
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.write_buf(&mut &bytes[..])
    }

    pub fn write_byte(&self, b: u8) -> Result<()> {
        self.write(&[b])
    }

    /// Writes `length` bytes of `bytes` starting at `offset`
    pub fn write_slice(&self, bytes: &[u8], offset: usize, length: usize) -> Result<()> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| NioError::config(format!("range {}+{} outside {} bytes", offset, length, bytes.len())))?;
        self.write(&bytes[offset..end])
    }

    /// Drains `buf` into the socket
    pub fn write_buf<B: Buf>(&self, buf: &mut B) -> Result<()> {
        let expected = buf.remaining();
        let mut stalls = 0u32;
        let mut last_progress = Instant::now();
        while buf.has_remaining() {
            self.ensure_live()?;
            match self.attempt(|s| s.write(buf.chunk())) {
                Ok(0) => return Err(self.fail(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => {
                    buf.advance(n);
                    stalls = 0;
                    last_progress = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if last_progress.elapsed() >= self.write_timeout {
                        let transferred = expected - buf.remaining();
                        warn!("write stalled for {:?} after {} of {} bytes", self.write_timeout, transferred, expected);
                        self.ended.store(true, Ordering::Release);
                        return Err(NioError::WeakNetwork { op: "write", transferred, expected });
                    }
                    stalls += 1;
                    if stalls <= WRITE_SPIN_LIMIT {
                        thread::yield_now();
                    } else {
                        thread::sleep(WRITE_BACKOFF);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        trace!("wrote {} bytes", expected);
        Ok(())
    }

    /// Cancels the registration and closes the socket. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ended.store(true, Ordering::Release);
        let mut socket = self.socket.lock();
        let Some(mut stream) = socket.stream.take() else {
            return Ok(());
        };
        let cancelled = match socket.key.take() {
            Some(key) => key.cancel(&mut stream),
            None => Ok(()),
        };
        drop(socket);
        let shutdown = match stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        };
        cancelled.and(shutdown).map_err(NioError::from)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_ended() {
            return Err(NioError::Ended);
        }
        Ok(())
    }

    fn attempt<T>(&self, op: impl FnOnce(&mut TcpStream) -> io::Result<T>) -> io::Result<T> {
        let mut socket = self.socket.lock();
        match socket.stream.as_mut() {
            Some(stream) => op(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn fail(&self, e: io::Error) -> NioError {
        if !self.ended.swap(true, Ordering::AcqRel) {
            debug!("endpoint ended: {}", e);
        }
        NioError::Io(e)
    }
}

/// Single non-blocking attempts, for engines that drive their own loop
impl Read for &Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Endpoint::read(*self, buf).map_err(into_io)
    }
}

impl Write for &Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_live().map_err(into_io)?;
        self.attempt(|s| s.write(buf)).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => e,
            _ => into_io(self.fail(e)),
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn into_io(e: NioError) -> io::Error {
    match e {
        NioError::Io(e) => e,
        NioError::Ended => io::Error::new(io::ErrorKind::NotConnected, NioError::Ended),
        other => io::Error::other(other),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mio::{Events, Interest, Poll, Token};

    /// Two connected endpoints over loopback, unregistered.
    pub(crate) fn endpoint_pair() -> (Endpoint, Endpoint) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (
            Endpoint::new(TcpStream::from_std(client), None).unwrap(),
            Endpoint::new(TcpStream::from_std(server), None).unwrap(),
        )
    }

    /// Pulls the socket out of its loop's poller behind the key's back.
    pub(crate) fn deregister_behind_key(endpoint: &Endpoint) -> io::Result<()> {
        let mut socket = endpoint.socket.lock();
        let selector = socket.key.as_ref().and_then(SelectionKey::selector).ok_or(io::ErrorKind::NotFound)?;
        let stream = socket.stream.as_mut().ok_or(io::ErrorKind::NotConnected)?;
        selector.deregister_only(stream)
    }

    /// Blocks until `endpoint` has readable data (or the test times out).
    pub(crate) fn wait_readable(endpoint: &Endpoint) {
        let mut poll = Poll::new().unwrap();
        let mut socket = endpoint.socket.lock();
        let stream = socket.stream.as_mut().unwrap();
        poll.registry().register(stream, Token(1), Interest::READABLE).unwrap();
        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        poll.registry().deregister(stream).unwrap();
        drop(socket);
        // Let the remaining segments of a multi-write burst land.
        thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn test_write_overloads_roundtrip() {
        let (a, b) = endpoint_pair();
        a.write_byte(b'x').unwrap();
        a.write(b"hello").unwrap();
        a.write_slice(b"--world--", 2, 5).unwrap();
        a.write_buf(&mut Bytes::from_static(b"!")).unwrap();

        wait_readable(&b);
        let got = b.read_exact(12).unwrap();
        assert_eq!(&got[..], b"xhelloworld!");
    }

    #[test]
    fn test_read_exact_large_payload() {
        let (a, b) = endpoint_pair();
        let payload: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        a.write(&payload).unwrap();

        wait_readable(&b);
        let got = b.read_exact(payload.len()).unwrap();
        assert_eq!(got.len(), payload.len());
        assert_eq!(&got[..], &payload[..]);
    }

    #[test]
    fn test_read_exact_short_is_weak_network() {
        let (a, b) = endpoint_pair();
        a.write(&[7u8; 10]).unwrap();
        wait_readable(&b);

        match b.read_exact(1000) {
            Err(NioError::WeakNetwork { op, transferred, expected }) => {
                assert_eq!(op, "read");
                assert_eq!(transferred, 10);
                assert_eq!(expected, 1000);
            }
            other => panic!("expected weak network, got {:?}", other.map(|b| b.len())),
        }
        assert!(!b.is_ended());
    }

    #[test]
    fn test_read_exact_zero() {
        let (_a, b) = endpoint_pair();
        assert!(b.read_exact(0).unwrap().is_empty());
    }

    #[test]
    fn test_read_would_block_keeps_endpoint_alive() {
        let (_a, b) = endpoint_pair();
        let mut buf = [0u8; 16];
        let err = b.read(&mut buf).unwrap_err();
        assert!(err.is_would_block());
        assert!(!b.is_ended());
    }

    #[test]
    fn test_peer_close_ends_endpoint() {
        let (a, b) = endpoint_pair();
        a.write(b"abc").unwrap();
        a.close().unwrap();
        wait_readable(&b);

        assert_eq!(&b.read_exact(3).unwrap()[..], b"abc");
        let err = b.read_exact(8).unwrap_err();
        assert!(matches!(err, NioError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert!(b.is_ended());
        assert!(matches!(b.read_exact(1), Err(NioError::Ended)));
        assert!(matches!(b.write(b"x"), Err(NioError::Ended)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, _b) = endpoint_pair();
        let remote = a.remote_addr().unwrap();
        assert!(a.is_open());
        a.close().unwrap();
        a.close().unwrap();
        assert!(!a.is_open());
        assert!(a.is_ended());
        // Memoized before close.
        assert_eq!(a.remote_addr(), Some(remote));
        assert!(matches!(a.write_byte(1), Err(NioError::Ended)));
    }

    #[test]
    fn test_closed_before_lookup_has_no_address() {
        let (a, _b) = endpoint_pair();
        a.close().unwrap();
        assert_eq!(a.remote_addr(), None);
        assert_eq!(a.local_addr(), None);
    }

    #[test]
    fn test_write_slice_out_of_range() {
        let (a, _b) = endpoint_pair();
        assert!(matches!(a.write_slice(b"abc", 2, 5), Err(NioError::Config(_))));
        assert!(matches!(a.write_slice(b"abc", usize::MAX, 2), Err(NioError::Config(_))));
        assert!(!a.is_ended());
    }

    #[test]
    fn test_stalled_write_times_out() {
        let (a, _b) = endpoint_pair();
        let a = a.with_write_timeout(Duration::from_millis(200));
        // Nobody reads on the other side, so the socket buffers fill up.
        let chunk = vec![0u8; 64 * 1024 * 1024];
        match a.write(&chunk) {
            Err(NioError::WeakNetwork { op: "write", transferred, expected }) => {
                assert!(transferred < expected);
            }
            other => panic!("expected stalled write, got {:?}", other),
        }
        assert!(a.is_ended());
    }

    #[test]
    fn test_idle_time_from_receive_timeout() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.set_nonblocking(true).unwrap();
        let endpoint = Endpoint::new(TcpStream::from_std(client), None).unwrap();
        assert_eq!(endpoint.max_idle_time(), Some(Duration::from_secs(5)));
        assert!(!endpoint.is_blocking());
    }
}
