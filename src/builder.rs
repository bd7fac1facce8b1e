//! Consuming builder for a [`BaseContext`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use baseio::builder::ContextBuilder;
//! use baseio::connector::SocketChannelConnector;
//! use std::time::Duration;
//!
//! let context = ContextBuilder::new()
//!     .host("127.0.0.1")
//!     .port(9000)
//!     .idle_time(Duration::from_secs(60))
//!     .low_latency()
//!     .build()?;
//! let connector = SocketChannelConnector::new(context);
//! let session = connector.connect()?;
//! session.channel().endpoint().write(b"hello")?;
//! connector.close();
//! # Ok::<(), baseio::NioError>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::{NetConfig, ServerConfiguration};
use crate::context::{BaseContext, LifeCycleListener, NoopSessionListener};
use crate::error::Result;
use crate::session::SessionEventListener;

/// Collects settings and listeners, validated once in [`build`](Self::build)
///
/// Every setter consumes the builder and returns it, so a chain reads top
/// to bottom and nothing is shared until the context exists.
pub struct ContextBuilder {
    config: ServerConfiguration,
    listener: Arc<dyn SessionEventListener>,
    lifecycle: Vec<Arc<dyn LifeCycleListener>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::from_configuration(ServerConfiguration::default())
    }

    pub fn from_configuration(config: ServerConfiguration) -> Self {
        Self { config, listener: Arc::new(NoopSessionListener), lifecycle: Vec::new() }
    }

    /// Host the connector dials or the acceptor binds
    ///
    /// **Default**: `"127.0.0.1"`
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.server_host = host.into();
        self
    }

    /// **Default**: `0` (ephemeral for acceptors)
    pub fn port(mut self, port: u16) -> Self {
        self.config.server_port = port;
        self
    }

    /// Number of selector loops. Connectors override this to 1.
    pub fn core_size(mut self, size: usize) -> Self {
        self.config.server_core_size = size;
        self
    }

    pub fn idle_time(mut self, idle: Duration) -> Self {
        self.config.session_idle_time = idle;
        self
    }

    /// How long a write may stall before failing as a weak network
    ///
    /// **Default**: 30s
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn net(mut self, net: NetConfig) -> Self {
        self.config.net = net;
        self
    }

    /// Shorthand for `net(NetConfig::low_latency())`.
    pub fn low_latency(self) -> Self {
        self.net(NetConfig::low_latency())
    }

    pub fn high_throughput(self) -> Self {
        self.net(NetConfig::high_throughput())
    }

    pub fn listener(mut self, listener: Arc<dyn SessionEventListener>) -> Self {
        self.listener = listener;
        self
    }

    /// May be called repeatedly; listeners are notified in order.
    pub fn lifecycle_listener(mut self, listener: Arc<dyn LifeCycleListener>) -> Self {
        self.lifecycle.push(listener);
        self
    }

    pub fn build(self) -> Result<Arc<BaseContext>> {
        self.config.validate()?;
        let context = BaseContext::with_listener(self.config, self.listener);
        for l in self.lifecycle {
            context.add_lifecycle_listener(l);
        }
        Ok(Arc::new(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::CountingLifecycle;
    use crate::error::NioError;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_builder_chain() {
        let context = ContextBuilder::new()
            .host("localhost")
            .port(9000)
            .core_size(3)
            .idle_time(Duration::from_secs(5))
            .write_timeout(Duration::from_secs(2))
            .event_capacity(256)
            .high_throughput()
            .build()
            .unwrap();

        let config = context.configuration();
        assert_eq!(config.server_host, "localhost");
        assert_eq!(config.server_port, 9000);
        assert_eq!(config.server_core_size, 3);
        assert_eq!(config.session_idle_time, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.net, NetConfig::high_throughput());
        assert!(!context.is_running());
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        assert!(matches!(ContextBuilder::new().core_size(0).build(), Err(NioError::Config(_))));
        assert!(matches!(ContextBuilder::new().host("").build(), Err(NioError::Config(_))));
    }

    #[test]
    fn test_lifecycle_listeners_registered() {
        let counter = Arc::new(CountingLifecycle::default());
        let context = ContextBuilder::new().core_size(1).lifecycle_listener(counter.clone()).build().unwrap();
        context.start().unwrap();
        context.stop();
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stopped.load(Ordering::SeqCst), 1);
    }
}
