//! Server side: listen, accept, open a session per connection

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use mio::event::Event;
use mio::net::TcpListener;
use mio::Interest;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::context::BaseContext;
use crate::endpoint::Endpoint;
use crate::error::{NioError, Result};
use crate::event_loop::{EventLoop, Selectable, SelectionKey, SelectorLoop};
use crate::session::Session;
use crate::tcp;

struct Listening {
    listener: TcpListener,
    key: Option<SelectionKey>,
}

/// Registered listener; accepts on the loop it was bound to.
struct AcceptTarget {
    context: Arc<BaseContext>,
    local: SocketAddr,
    socket: Mutex<Option<Listening>>,
}

impl AcceptTarget {
    fn accept_all(&self) {
        loop {
            let accepted = match self.socket.lock().as_ref() {
                Some(l) => l.listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.open(stream) {
                        warn!("dropping connection from {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                ) => continue,
                Err(e) => {
                    error!("accept on {} failed: {}", self.local, e);
                    return;
                }
            }
        }
    }

    fn open(&self, stream: mio::net::TcpStream) -> Result<()> {
        let config = self.context.configuration();
        if config.net.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        let event_loop = self.context.next_event_loop()?;
        let context = Arc::clone(&self.context);
        let session = event_loop.bind(stream, Interest::READABLE, move |stream, key| {
            let endpoint = Endpoint::new(stream, Some(key))?.with_write_timeout(config.write_timeout);
            Ok(Arc::new(Session::new(Channel::new(context, endpoint, "TCP"))))
        })?;
        session.fire_opened();
        Ok(())
    }

    fn selector(&self) -> Option<Arc<SelectorLoop>> {
        self.socket.lock().as_ref()?.key.as_ref()?.selector()
    }

    fn close(&self) -> io::Result<()> {
        let Some(mut listening) = self.socket.lock().take() else {
            return Ok(());
        };
        match listening.key.take() {
            Some(key) => key.cancel(&mut listening.listener),
            None => Ok(()),
        }
    }
}

impl Selectable for AcceptTarget {
    fn ready(self: Arc<Self>, event: &Event) {
        if event.is_readable() {
            self.accept_all();
        }
    }

    fn shutdown(self: Arc<Self>) {
        debug!("acceptor on {} released by its loop", self.local);
        let _ = self.close();
    }
}

/// Listens on the context's host and port
///
/// Each accepted socket becomes a [`Session`] on the next selector loop of
/// the context and is announced through its session listener.
pub struct SocketChannelAcceptor {
    context: Arc<BaseContext>,
    target: Mutex<Option<Arc<AcceptTarget>>>,
}

impl SocketChannelAcceptor {
    pub fn new(context: Arc<BaseContext>) -> Self {
        Self { context, target: Mutex::new(None) }
    }

    pub fn context(&self) -> &Arc<BaseContext> {
        &self.context
    }

    /// Starts the context and begins accepting. Idempotent.
    pub fn bind(&self) -> Result<SocketAddr> {
        let mut target = self.target.lock();
        if let Some(t) = target.as_ref() {
            return Ok(t.local);
        }
        let config = self.context.configuration();
        let address = config.server_address()?;
        let started = self.context.start()?;
        let bound = self.listen(address);
        match bound {
            Ok(t) => {
                info!("acceptor listening on {}", t.local);
                let local = t.local;
                *target = Some(t);
                Ok(local)
            }
            Err(e) => {
                if started {
                    self.context.stop();
                }
                Err(e)
            }
        }
    }

    fn listen(&self, address: SocketAddr) -> Result<Arc<AcceptTarget>> {
        let config = self.context.configuration();
        let listener = tcp::bind(address, &config.net)?;
        let local = listener.local_addr()?;
        let event_loop = self.context.next_event_loop()?;
        let context = Arc::clone(&self.context);
        event_loop.bind(listener, Interest::READABLE, move |listener, key| {
            Ok(Arc::new(AcceptTarget {
                context,
                local,
                socket: Mutex::new(Some(Listening { listener, key: Some(key) })),
            }))
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.target.lock().as_ref().map(|t| t.local)
    }

    pub fn is_bound(&self) -> bool {
        self.target.lock().is_some()
    }

    /// Stops accepting and stops the context
    ///
    /// From a foreign thread the listener is closed on its loop and a close
    /// failure is only logged; the returned error covers inline closes.
    pub fn unbind(&self) -> Result<()> {
        let Some(target) = self.target.lock().take() else {
            return Ok(());
        };
        let closed = match target.selector() {
            Some(lp) if !lp.in_event_loop() => {
                let queued = Arc::clone(&target);
                let task = Box::new(move || {
                    if let Err(e) = queued.close() {
                        warn!("failed to close listener on {}: {}", queued.local, e);
                    }
                });
                match lp.execute(task) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        debug!("loop refused unbind ({}), closing inline", e);
                        target.close().map_err(NioError::from)
                    }
                }
            }
            _ => target.close().map_err(NioError::from),
        };
        info!("acceptor on {} unbound", target.local);
        self.context.stop();
        closed
    }
}

impl Drop for SocketChannelAcceptor {
    fn drop(&mut self) {
        if let Err(e) = self.unbind() {
            warn!("failed to unbind acceptor: {}", e);
        }
    }
}
