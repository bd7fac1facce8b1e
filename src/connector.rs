//! Client-side connect/close state machine
//!
//! A [`SocketChannelConnector`] holds at most one live [`Session`]. All of
//! its transitions happen under one mutex:
//!
//! ```text
//!   inactive --connect()--> active(session)
//!      ^                        |
//!      +--- do_physical_close --+   (close(), peer gone, loop shutdown)
//! ```
//!
//! Closing a loop-bound session from another thread submits the teardown to
//! the loop and returns at once, so `is_active` may briefly stay `true`
//! after `close()` returns.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use mio::Interest;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::context::BaseContext;
use crate::endpoint::Endpoint;
use crate::error::{NioError, Result};
use crate::event_loop::EventLoop;
use crate::session::Session;
use crate::tcp;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug)]
struct ConnectorState {
    active: bool,
    server_address: Option<SocketAddr>,
    session: Option<Arc<Session>>,
    timeout: Duration,
}

struct ConnectorShared {
    context: Option<Arc<BaseContext>>,
    state: Mutex<ConnectorState>,
}

#[derive(Clone)]
pub struct SocketChannelConnector {
    shared: Arc<ConnectorShared>,
}

impl std::fmt::Debug for SocketChannelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketChannelConnector").field("state", &*self.shared.state.lock()).finish()
    }
}

impl SocketChannelConnector {
    pub fn new(context: impl Into<Option<Arc<BaseContext>>>) -> Self {
        Self {
            shared: Arc::new(ConnectorShared {
                context: context.into(),
                state: Mutex::new(ConnectorState {
                    active: false,
                    server_address: None,
                    session: None,
                    timeout: DEFAULT_CONNECT_TIMEOUT,
                }),
            }),
        }
    }

    pub fn context(&self) -> Option<&Arc<BaseContext>> {
        self.shared.context.as_ref()
    }

    /// Opens the session, or returns the live one
    ///
    /// Forces the context down to a single selector loop. On failure nothing
    /// is retained and a context started by this call is stopped again.
    pub fn connect(&self) -> Result<Arc<Session>> {
        let mut state = self.shared.state.lock();
        if let Some(session) = &state.session {
            if state.active && session.is_open() {
                return Ok(Arc::clone(session));
            }
        }
        if let Some(stale) = state.session.take() {
            debug!("dropping stale session {}", stale);
            // A retired session no longer owns the connector; its hook, if
            // already running, only closes its own channel.
            stale.retire();
            if let Err(e) = stale.channel().close() {
                warn!("failed to close stale session {}: {}", stale, e);
            }
            state.active = false;
        }

        let context = self.shared.context.clone().ok_or_else(|| NioError::config("null nio context"))?;
        context.update_configuration(|c| c.server_core_size = 1);
        let config = context.configuration();
        if config.server_port == 0 {
            return Err(NioError::config("server port is not set"));
        }
        let address = config.server_address()?;

        let started = context.start()?;
        let opened = Self::open_session(&self.shared, &context, address, state.timeout);
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                if started {
                    context.stop();
                }
                warn!("connect to {} failed: {}", address, e);
                return Err(e);
            }
        };

        state.server_address = Some(address);
        state.session = Some(Arc::clone(&session));
        state.active = true;
        drop(state);

        info!("connected to {} as {}", address, session);
        session.fire_opened();
        Ok(session)
    }

    fn open_session(
        shared: &Arc<ConnectorShared>,
        context: &Arc<BaseContext>,
        address: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<Session>> {
        let config = context.configuration();
        let stream = tcp::connect(address, &config.net, timeout)?;
        let event_loop = context.next_event_loop()?;
        let owner = Arc::downgrade(shared);
        event_loop.bind(stream, Interest::READABLE, |stream, key| {
            let endpoint = Endpoint::new(stream, Some(key))?.with_write_timeout(config.write_timeout);
            let channel = Channel::new(Arc::clone(context), endpoint, "TCP");
            let session = Session::new(channel).with_close_hook(move |session| close_session(&owner, session));
            Ok(Arc::new(session))
        })
    }

    /// Graceful close. Never fails; a connector without a session still
    /// releases its context.
    pub fn close(&self) {
        let session = self.shared.state.lock().session.clone();
        match session {
            Some(session) => session.close(),
            None => self.shared.physical_close(None),
        }
    }

    /// Tears down the current session, if any, and stops the context.
    pub fn physical_close(&self) {
        let session = self.shared.state.lock().session.clone();
        self.shared.physical_close(session);
    }

    pub fn is_active(&self) -> bool {
        let state = self.shared.state.lock();
        state.active && state.session.as_ref().is_some_and(|s| s.is_open())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.shared.state.lock().session.clone()
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.shared.state.lock().server_address
    }

    pub fn timeout(&self) -> Duration {
        self.shared.state.lock().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.state.lock().timeout = timeout;
    }
}

fn close_session(owner: &Weak<ConnectorShared>, session: &Arc<Session>) {
    match owner.upgrade() {
        Some(shared) => shared.physical_close(Some(Arc::clone(session))),
        None => {
            if let Err(e) = session.channel().close() {
                warn!("failed to close {}: {}", session, e);
            }
        }
    }
}

impl ConnectorShared {
    /// Routes teardown of `target` to its loop when called from elsewhere
    ///
    /// `None` stands for "whatever session is current".
    fn physical_close(self: &Arc<Self>, target: Option<Arc<Session>>) {
        let event_loop = target.as_ref().and_then(|s| s.channel().event_loop());
        match event_loop {
            Some(lp) if !lp.in_event_loop() => {
                let shared = Arc::clone(self);
                let queued = target.clone();
                if let Err(e) = lp.execute(Box::new(move || shared.do_physical_close(queued))) {
                    debug!("loop refused close task ({}), closing inline", e);
                    self.do_physical_close(target);
                }
            }
            _ => self.do_physical_close(target),
        }
    }

    /// Closes `target`; resets the connector only if `target` is current
    fn do_physical_close(&self, target: Option<Arc<Session>>) {
        let mut state = self.state.lock();
        let current = match &target {
            None => true,
            Some(t) => state.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, t)),
        };
        if !current {
            drop(state);
            if let Some(stale) = target {
                debug!("closing superseded session {}", stale);
                if let Err(e) = stale.channel().close() {
                    warn!("failed to close {}: {}", stale, e);
                }
            }
            return;
        }
        if let Some(session) = state.session.take() {
            if let Err(e) = session.channel().close() {
                warn!("failed to close {}: {}", session, e);
            }
        }
        state.active = false;
        drop(state);
        if let Some(context) = &self.context {
            context.stop();
        }
    }
}
