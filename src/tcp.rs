//! Tuned TCP socket construction
//!
//! Sockets are created through [`crate::raw`] so that [`NetConfig`] options
//! land before `bind`/`connect`, then handed to `mio` for selector
//! registration.
//!
//! # Examples
//!
//! ```rust,no_run
//! use baseio::{NetConfig, tcp};
//! use std::time::Duration;
//!
//! let config = NetConfig::default();
//! let listener = tcp::bind("127.0.0.1:0".parse()?, &config)?;
//! let stream = tcp::connect(listener.local_addr()?, &config, Duration::from_secs(3))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::trace;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::config::{NetConfig, apply_socket_options};
use crate::raw as r;

/// Binds a non-blocking listener with `cfg` applied
///
/// The listen backlog comes from `cfg.tcp_backlog` (1024 when unset).
pub fn bind(addr: SocketAddr, cfg: &NetConfig) -> io::Result<TcpListener> {
    let (domain, sa, len) = r::to_sockaddr(addr);
    let os = r::socket(domain)?;
    // Owned from here on so every early return closes the handle.
    let std = unsafe { r::tcp_listener_from_os(os) };
    r::set_nonblocking(os, true)?;
    apply_socket_options(os, domain, cfg)?;
    if cfg.reuse_port {
        r::set_reuse_port(os, true)?;
    }
    unsafe {
        r::bind_raw(os, &sa, len)?;
    }
    r::listen_raw(os, cfg.tcp_backlog.unwrap_or(1024))?;
    Ok(TcpListener::from_std(std))
}

/// Opens a connection to `addr`, failing after `timeout`
///
/// The connect itself is non-blocking; completion is awaited on a private
/// poll so that the caller's selector never sees a half-open socket.
pub fn connect(addr: SocketAddr, cfg: &NetConfig, timeout: Duration) -> io::Result<TcpStream> {
    let (domain, sa, len) = r::to_sockaddr(addr);
    let os = r::socket(domain)?;
    let std = unsafe { r::tcp_stream_from_os(os) };
    r::set_nonblocking(os, true)?;
    apply_socket_options(os, domain, cfg)?;
    unsafe {
        r::connect_raw(os, &sa, len)?;
    }
    let mut stream = TcpStream::from_std(std);

    let mut poll = Poll::new()?;
    poll.registry().register(&mut stream, Token(0), Interest::WRITABLE)?;
    let mut events = Events::with_capacity(4);
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)));
        }
        match poll.poll(&mut events, Some(deadline - now)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        if events.is_empty() {
            continue;
        }
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => break,
            // Spurious wake-up before the handshake finished.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                trace!("connect to {} still in progress", addr);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    poll.registry().deregister(&mut stream)?;
    Ok(stream)
}
