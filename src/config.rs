//! Service and socket configuration
//!
//! Two layers live here:
//!
//! - [`ServerConfiguration`] carries what a context needs to run: the target
//!   host and port, how many selector loops to start, the session idle time
//!   and the write stall timeout.
//! - [`NetConfig`] carries socket tuning applied to every listener and
//!   outbound socket the framework creates.
//!
//! # Examples
//!
//! ```rust
//! use baseio::config::{NetConfig, ServerConfiguration};
//! use std::time::Duration;
//!
//! let config = ServerConfiguration {
//!     server_host: "127.0.0.1".into(),
//!     server_port: 9000,
//!     session_idle_time: Duration::from_secs(60),
//!     net: NetConfig::low_latency(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::error::{NioError, Result};
use crate::raw;

/// Socket tuning options
///
/// Platform-specific options are ignored where the OS does not support them.
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// TCP_NODELAY on every stream. **Default**: `true`
    pub tcp_nodelay: bool,

    /// TCP_QUICKACK (Linux only). **Default**: `true`
    pub tcp_quickack: bool,

    /// SO_REUSEPORT on listeners (Linux/BSD). **Default**: `false`
    pub reuse_port: bool,

    /// SO_BUSY_POLL in microseconds (Linux only). **Default**: `None`
    pub busy_poll: Option<u32>,

    /// SO_RCVBUF in bytes; the kernel may round it. **Default**: `Some(1 MiB)`
    pub recv_buf: Option<usize>,

    /// SO_SNDBUF in bytes. **Default**: `Some(1 MiB)`
    pub send_buf: Option<usize>,

    /// IP TOS / IPv6 traffic class. **Default**: `None`
    pub tos: Option<u32>,

    /// IPV6_V6ONLY; `None` keeps the system default. **Default**: `Some(false)`
    pub ipv6_only: Option<bool>,

    /// IPv6 unicast hop limit. **Default**: `None`
    pub hop_limit: Option<i32>,

    /// Listen backlog. **Default**: `Some(1024)`
    pub tcp_backlog: Option<i32>,

    /// Upper bound a selector loop waits in one poll, in milliseconds.
    /// Also bounds how late a queued task or shutdown request is noticed
    /// when a wake-up is missed. **Default**: `Some(10)`
    pub poll_timeout_ms: Option<u64>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: true,
            reuse_port: false,
            busy_poll: None,
            recv_buf: Some(1 << 20),
            send_buf: Some(1 << 20),
            tos: None,
            ipv6_only: Some(false),
            hop_limit: None,
            tcp_backlog: Some(1024),
            poll_timeout_ms: Some(10),
        }
    }
}

impl NetConfig {
    /// Small buffers, busy polling and a 1ms poll timeout.
    ///
    /// Trades CPU for latency; not a good fit for shared hosts.
    pub fn low_latency() -> Self {
        Self {
            busy_poll: Some(50),
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            tos: Some(0x10),
            tcp_backlog: Some(512),
            poll_timeout_ms: Some(1),
            ..Self::default()
        }
    }

    /// Large buffers with Nagle and delayed ACKs left on, for bulk transfer.
    pub fn high_throughput() -> Self {
        Self {
            tcp_nodelay: false,
            tcp_quickack: false,
            recv_buf: Some(16 << 20),
            send_buf: Some(16 << 20),
            tos: Some(0x08),
            tcp_backlog: Some(2048),
            poll_timeout_ms: Some(50),
            ..Self::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.unwrap_or(10))
    }
}

/// Applies `cfg` to a freshly created TCP socket
///
/// Must run before the handle is converted into a `std`/`mio` type so that
/// buffer sizes take effect before the handshake. Best-effort options
/// (busy poll, quick ack) never fail the call.
pub fn apply_socket_options(os: raw::OsSocket, domain: raw::Domain, cfg: &NetConfig) -> io::Result<()> {
    use crate::raw as r;

    if let Some(sz) = cfg.recv_buf { r::set_recv_buffer(os, sz as i32)?; }
    if let Some(sz) = cfg.send_buf { r::set_send_buffer(os, sz as i32)?; }

    if let Some(tos) = cfg.tos {
        match domain {
            r::Domain::Ipv4 => r::set_tos_v4(os, tos as i32)?,
            r::Domain::Ipv6 => r::set_tos_v6(os, tos as i32)?,
        }
    }

    if let r::Domain::Ipv6 = domain {
        if let Some(only) = cfg.ipv6_only { r::set_ipv6_only(os, only)?; }
        if let Some(hops) = cfg.hop_limit { r::set_ipv6_hop_limit(os, hops)?; }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Some(us) = cfg.busy_poll {
            let _ = r::set_busy_poll(os, us);
        }
        if cfg.tcp_quickack {
            let _ = r::set_tcp_quickack(os, true);
        }
    }

    if cfg.tcp_nodelay {
        r::set_tcp_nodelay(os, true)?;
    }

    Ok(())
}

/// Settings a context reads when it starts loops and opens channels
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfiguration {
    /// Host the connector dials or the acceptor binds. **Default**: `"127.0.0.1"`
    pub server_host: String,

    /// Port the connector dials or the acceptor binds (0 = ephemeral for
    /// acceptors, invalid for connectors). **Default**: `0`
    pub server_port: u16,

    /// Number of selector loop threads. Connectors force this to 1.
    /// **Default**: available parallelism
    pub server_core_size: usize,

    /// Grace period before a new channel may be considered idle.
    /// **Default**: 30s
    pub session_idle_time: Duration,

    /// Events fetched per poll call. **Default**: 1024
    pub event_capacity: usize,

    /// How long a write may make no progress before it fails as a weak
    /// network. **Default**: 30s
    pub write_timeout: Duration,

    pub net: NetConfig,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            server_core_size: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            session_idle_time: Duration::from_secs(30),
            event_capacity: 1024,
            write_timeout: Duration::from_secs(30),
            net: NetConfig::default(),
        }
    }
}

impl ServerConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(NioError::config("server host is empty"));
        }
        if self.server_core_size == 0 {
            return Err(NioError::config("server core size must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(NioError::config("event capacity must be at least 1"));
        }
        if self.write_timeout.is_zero() {
            return Err(NioError::config("write timeout must be non-zero"));
        }
        Ok(())
    }

    /// Resolves `server_host:server_port`, first address wins.
    pub fn server_address(&self) -> Result<SocketAddr> {
        (self.server_host.as_str(), self.server_port)
            .to_socket_addrs()
            .map_err(|e| NioError::config(format!("cannot resolve {}:{}: {}", self.server_host, self.server_port, e)))?
            .next()
            .ok_or_else(|| NioError::config(format!("no address for {}:{}", self.server_host, self.server_port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfiguration::default();
        assert_eq!(config.server_host, "127.0.0.1");
        assert!(config.server_core_size >= 1);
        assert_eq!(config.net.tcp_backlog, Some(1024));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let low = NetConfig::low_latency();
        assert_eq!(low.busy_poll, Some(50));
        assert_eq!(low.poll_timeout(), Duration::from_millis(1));
        assert!(low.tcp_nodelay);

        let bulk = NetConfig::high_throughput();
        assert!(!bulk.tcp_nodelay);
        assert_eq!(bulk.recv_buf, Some(16 << 20));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ServerConfiguration { server_core_size: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(NioError::Config(_))));

        let config = ServerConfiguration { server_host: " ".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(NioError::Config(_))));

        let config = ServerConfiguration { write_timeout: Duration::ZERO, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_address_resolution() {
        let config = ServerConfiguration { server_port: 9000, ..Default::default() };
        assert_eq!(config.server_address().unwrap(), "127.0.0.1:9000".parse().unwrap());

        let config = ServerConfiguration { server_host: "not a host".into(), ..Default::default() };
        assert!(matches!(config.server_address(), Err(NioError::Config(_))));
    }
}
