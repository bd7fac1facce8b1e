//! OS-level socket helpers for Unix and Windows
//!
//! Everything above this module works with `std`/`mio` socket types. This
//! module is the only place that talks to `libc`/WinSock directly: it creates
//! TCP sockets, flips them to non-blocking, starts non-blocking connects and
//! reads or writes the handful of socket options the framework tunes.
//!
//! # Safety
//!
//! The raw calls are wrapped so that callers only ever see `io::Result`. The
//! `*_raw` and `*_from_os` functions stay `unsafe` because they trust the
//! caller to pass a live handle that matches the given address family.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// IP protocol family of a socket
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    Ipv4,
    Ipv6,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
        pub type OsSocket = RawFd;

        /// Platform socket address storage
        #[derive(Debug)]
        pub enum SockAddr {
            V4(libc::sockaddr_in),
            V6(libc::sockaddr_in6),
        }

        impl SockAddr {
            fn as_ptr(&self) -> *const libc::sockaddr {
                match self {
                    SockAddr::V4(s) => s as *const _ as *const libc::sockaddr,
                    SockAddr::V6(s) => s as *const _ as *const libc::sockaddr,
                }
            }
        }

        pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, libc::socklen_t) {
            match addr {
                SocketAddr::V4(a) => {
                    let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                    s.sin_family = libc::AF_INET as _;
                    s.sin_port = a.port().to_be();
                    s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
                    (Domain::Ipv4, SockAddr::V4(s), std::mem::size_of::<libc::sockaddr_in>() as _)
                }
                SocketAddr::V6(a) => {
                    let mut s: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                    s.sin6_family = libc::AF_INET6 as _;
                    s.sin6_port = a.port().to_be();
                    s.sin6_flowinfo = a.flowinfo();
                    s.sin6_scope_id = a.scope_id();
                    s.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                    (Domain::Ipv6, SockAddr::V6(s), std::mem::size_of::<libc::sockaddr_in6>() as _)
                }
            }
        }

        /// Raw handle of any socket type
        pub fn os_socket<S: AsRawFd>(s: &S) -> OsSocket {
            s.as_raw_fd()
        }

        /// Create a TCP socket for `domain`, close-on-exec where supported
        pub fn socket(domain: Domain) -> io::Result<OsSocket> {
            let d = match domain { Domain::Ipv4 => libc::AF_INET, Domain::Ipv6 => libc::AF_INET6 };
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let ty = libc::SOCK_STREAM;
            let fd = unsafe { libc::socket(d, ty, libc::IPPROTO_TCP) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            Ok(fd)
        }

        /// # Safety
        /// `os` must be a live socket of the same family as `sa`.
        pub unsafe fn bind_raw(os: OsSocket, sa: &SockAddr, len: libc::socklen_t) -> io::Result<()> {
            if unsafe { libc::bind(os, sa.as_ptr(), len) } != 0 { return Err(io::Error::last_os_error()); }
            Ok(())
        }

        /// Start a connect; on a non-blocking socket an in-progress connect is `Ok`.
        ///
        /// # Safety
        /// `os` must be a live socket of the same family as `sa`.
        pub unsafe fn connect_raw(os: OsSocket, sa: &SockAddr, len: libc::socklen_t) -> io::Result<()> {
            if unsafe { libc::connect(os, sa.as_ptr(), len) } != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINPROGRESS) {
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
            unsafe {
                let flags = libc::fcntl(os, libc::F_GETFL);
                if flags < 0 { return Err(io::Error::last_os_error()); }
                let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
                if libc::fcntl(os, libc::F_SETFL, nb) != 0 { return Err(io::Error::last_os_error()); }
                Ok(())
            }
        }

        pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { libc::listen(os, backlog) } != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
        pub fn set_reuse_port(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as i32) }
        pub fn set_tos_v4(os: OsSocket, tos: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IP, libc::IP_TOS, tos) }
        pub fn set_tos_v6(os: OsSocket, tc: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tc) }
        pub fn set_ipv6_only(os: OsSocket, only: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, only as i32) }
        pub fn set_ipv6_hop_limit(os: OsSocket, hops: i32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, hops) }
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32) }
        /// TCP_QUICKACK (Linux value 12)
        pub fn set_tcp_quickack(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, 12, on as i32) }
        /// SO_BUSY_POLL (Linux value 46)
        pub fn set_busy_poll(os: OsSocket, usec: u32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, 46, usec as i32) }

        /// SO_RCVTIMEO; `None` when the socket has no receive timeout.
        pub fn recv_timeout(os: OsSocket) -> io::Result<Option<Duration>> {
            let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(os, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &mut tv as *mut _ as *mut libc::c_void, &mut len)
            };
            if rc != 0 { return Err(io::Error::last_os_error()); }
            if tv.tv_sec == 0 && tv.tv_usec == 0 {
                return Ok(None);
            }
            Ok(Some(Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1_000)))
        }

        fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let v = val as libc::c_int;
            let rc = unsafe { libc::setsockopt(fd, level, opt, &v as *const _ as _, std::mem::size_of::<libc::c_int>() as _) };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        /// # Safety
        /// Takes ownership of `fd`; it must not be closed elsewhere.
        pub unsafe fn tcp_listener_from_os(fd: RawFd) -> std::net::TcpListener { unsafe { std::net::TcpListener::from_raw_fd(fd) } }
        /// # Safety
        /// Takes ownership of `fd`; it must not be closed elsewhere.
        pub unsafe fn tcp_stream_from_os(fd: RawFd) -> std::net::TcpStream { unsafe { std::net::TcpStream::from_raw_fd(fd) } }

    } else {
        use std::sync::Once;
        use windows_sys::Win32::Networking::WinSock::*;
        use std::os::windows::io::{AsRawSocket, FromRawSocket, RawSocket};
        pub type OsSocket = RawSocket;

        static START: Once = Once::new();
        fn ensure_wsa() {
            START.call_once(|| unsafe {
                let mut data: WSADATA = std::mem::zeroed();
                let rc = WSAStartup(0x202, &mut data);
                if rc != 0 { panic!("WSAStartup failed: {}", rc); }
            });
        }

        fn last_error() -> io::Error {
            io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
        }

        /// Platform socket address storage
        #[allow(missing_debug_implementations)]
        pub enum SockAddr {
            V4(SOCKADDR_IN),
            V6(SOCKADDR_IN6),
        }

        impl SockAddr {
            fn as_ptr(&self) -> *const SOCKADDR {
                match self {
                    SockAddr::V4(s) => s as *const _ as *const SOCKADDR,
                    SockAddr::V6(s) => s as *const _ as *const SOCKADDR,
                }
            }
        }

        pub fn to_sockaddr(addr: SocketAddr) -> (Domain, SockAddr, i32) {
            match addr {
                SocketAddr::V4(a) => {
                    let mut s: SOCKADDR_IN = unsafe { std::mem::zeroed() };
                    s.sin_family = AF_INET as _;
                    s.sin_port = a.port().to_be();
                    s.sin_addr = IN_ADDR { S_un: IN_ADDR_0 { S_addr: u32::from_ne_bytes(a.ip().octets()) } };
                    (Domain::Ipv4, SockAddr::V4(s), std::mem::size_of::<SOCKADDR_IN>() as _)
                }
                SocketAddr::V6(a) => {
                    let mut s: SOCKADDR_IN6 = unsafe { std::mem::zeroed() };
                    s.sin6_family = AF_INET6 as _;
                    s.sin6_port = a.port().to_be();
                    s.sin6_flowinfo = a.flowinfo();
                    s.Anonymous.sin6_scope_id = a.scope_id();
                    s.sin6_addr = IN6_ADDR { u: IN6_ADDR_0 { Byte: a.ip().octets() } };
                    (Domain::Ipv6, SockAddr::V6(s), std::mem::size_of::<SOCKADDR_IN6>() as _)
                }
            }
        }

        pub fn os_socket<S: AsRawSocket>(s: &S) -> OsSocket {
            s.as_raw_socket()
        }

        pub fn socket(domain: Domain) -> io::Result<OsSocket> {
            ensure_wsa();
            let d = match domain { Domain::Ipv4 => AF_INET, Domain::Ipv6 => AF_INET6 } as i32;
            let s = unsafe { WSASocketW(d, SOCK_STREAM as i32, IPPROTO_TCP as i32, std::ptr::null_mut(), 0, WSA_FLAG_OVERLAPPED) };
            if s == INVALID_SOCKET { return Err(last_error()); }
            Ok(s as _)
        }

        /// # Safety
        /// `os` must be a live socket of the same family as `sa`.
        pub unsafe fn bind_raw(os: OsSocket, sa: &SockAddr, len: i32) -> io::Result<()> {
            if unsafe { bind(os as usize, sa.as_ptr(), len) } != 0 { return Err(last_error()); }
            Ok(())
        }

        /// # Safety
        /// `os` must be a live socket of the same family as `sa`.
        pub unsafe fn connect_raw(os: OsSocket, sa: &SockAddr, len: i32) -> io::Result<()> {
            if unsafe { connect(os as usize, sa.as_ptr(), len) } != 0 {
                let err = last_error();
                if err.raw_os_error() != Some(WSAEWOULDBLOCK as i32) {
                    return Err(err);
                }
            }
            Ok(())
        }

        pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
            let mut nb: u32 = if on { 1 } else { 0 };
            if unsafe { ioctlsocket(os as usize, FIONBIO, &mut nb) } != 0 { return Err(last_error()); }
            Ok(())
        }

        pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { listen(os as usize, backlog) } != 0 { Err(last_error()) } else { Ok(()) }
        }

        fn setsockopt_int(socket: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let rc = unsafe { setsockopt(socket as usize, level, opt, &val as *const _ as _, std::mem::size_of::<i32>() as _) };
            if rc != 0 { Err(last_error()) } else { Ok(()) }
        }
        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_RCVBUF as _, sz) }
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_SNDBUF as _, sz) }
        pub fn set_tos_v4(os: OsSocket, tos: i32) -> io::Result<()> { setsockopt_int(os, IPPROTO_IP as _, IP_TOS as _, tos) }
        pub fn set_tos_v6(os: OsSocket, tc: i32) -> io::Result<()> { setsockopt_int(os, IPPROTO_IPV6 as _, IPV6_TCLASS as _, tc) }
        pub fn set_ipv6_only(os: OsSocket, only: bool) -> io::Result<()> { setsockopt_int(os, IPPROTO_IPV6 as _, IPV6_V6ONLY as _, only as i32) }
        pub fn set_ipv6_hop_limit(os: OsSocket, hops: i32) -> io::Result<()> { setsockopt_int(os, IPPROTO_IPV6 as _, IPV6_UNICAST_HOPS as _, hops) }
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, IPPROTO_TCP as _, TCP_NODELAY as _, on as i32) }
        pub fn set_tcp_quickack(_os: OsSocket, _on: bool) -> io::Result<()> { Ok(()) }
        pub fn set_reuse_port(_os: OsSocket, _on: bool) -> io::Result<()> { Ok(()) }
        pub fn set_busy_poll(_os: OsSocket, _usec: u32) -> io::Result<()> { Ok(()) }

        /// SO_RCVTIMEO as a millisecond DWORD; `None` when unset.
        pub fn recv_timeout(os: OsSocket) -> io::Result<Option<Duration>> {
            let mut ms: u32 = 0;
            let mut len = std::mem::size_of::<u32>() as i32;
            let rc = unsafe { getsockopt(os as usize, SOL_SOCKET as _, SO_RCVTIMEO as _, &mut ms as *mut _ as _, &mut len) };
            if rc != 0 { return Err(last_error()); }
            Ok((ms != 0).then(|| Duration::from_millis(ms as u64)))
        }

        /// # Safety
        /// Takes ownership of `s`; it must not be closed elsewhere.
        pub unsafe fn tcp_listener_from_os(s: OsSocket) -> std::net::TcpListener { unsafe { std::net::TcpListener::from_raw_socket(s) } }
        /// # Safety
        /// Takes ownership of `s`; it must not be closed elsewhere.
        pub unsafe fn tcp_stream_from_os(s: OsSocket) -> std::net::TcpStream { unsafe { std::net::TcpStream::from_raw_socket(s) } }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_domain() {
        let (d4, _, _) = to_sockaddr("127.0.0.1:80".parse().unwrap());
        let (d6, _, _) = to_sockaddr("[::1]:80".parse().unwrap());
        assert_eq!(d4, Domain::Ipv4);
        assert_eq!(d6, Domain::Ipv6);
    }

    #[test]
    fn test_recv_timeout_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        assert_eq!(recv_timeout(os_socket(&stream)).unwrap(), None);

        stream.set_read_timeout(Some(Duration::from_millis(1500))).unwrap();
        assert_eq!(recv_timeout(os_socket(&stream)).unwrap(), Some(Duration::from_millis(1500)));
    }
}
