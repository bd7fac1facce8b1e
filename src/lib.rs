#![deny(unsafe_op_in_unsafe_fn)]
//! Non-blocking socket channels multiplexed over mio selector loops
//!
//! - [`endpoint`]: one non-blocking socket with all-or-nothing reads and
//!   writes that fail as a weak network instead of returning short.
//! - [`channel`] / [`session`]: identity, timestamps and notifications on
//!   top of an endpoint.
//! - [`connector`] / [`acceptor`]: client and server sides.
//! - [`ssl`]: ALPN negotiation over rustls (feature `tls`).

pub mod error;
pub mod config;
pub mod raw; // OS-Level socket helpers (Linux/Windows)
pub mod tcp;
pub mod event_loop;
pub mod context;
pub mod builder;
pub mod endpoint;
pub mod channel;
pub mod session;
pub mod connector;
pub mod acceptor;

cfg_if::cfg_if! {
    if #[cfg(feature = "tls")] {
        pub mod ssl;
    }
}

/// Convenience re-exports
pub use acceptor::SocketChannelAcceptor;
pub use builder::ContextBuilder;
pub use channel::Channel;
pub use config::{NetConfig, ServerConfiguration};
pub use connector::SocketChannelConnector;
pub use context::{BaseContext, LifeCycleListener};
pub use endpoint::Endpoint;
pub use error::{NioError, Result};
pub use event_loop::{EventLoop, SelectorLoop};
pub use session::{Session, SessionEventListener};
