//! Event-facing wrapper of a [`Channel`]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use mio::event::Event;

use crate::channel::Channel;
use crate::event_loop::{EventLoop, Selectable};

/// Session notifications, all no-ops by default
///
/// `session_readable` runs on the owning selector loop. The other two run
/// on whichever thread opened or closed the session.
pub trait SessionEventListener: Send + Sync {
    fn session_opened(&self, _session: &Arc<Session>) {}

    fn session_readable(&self, _session: &Arc<Session>) {}

    fn session_closed(&self, _session: &Arc<Session>) {}
}

type CloseHook = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

pub struct Session {
    channel: Channel,
    closing: AtomicBool,
    close_hook: Option<CloseHook>,
}

impl Session {
    pub fn new(channel: Channel) -> Self {
        Self { channel, closing: AtomicBool::new(false), close_hook: None }
    }

    /// Replaces the physical close with `hook`, which then owns teardown.
    /// The hook receives the session being closed.
    pub fn with_close_hook<F: Fn(&Arc<Session>) + Send + Sync + 'static>(mut self, hook: F) -> Self {
        self.close_hook = Some(Box::new(hook));
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn id(&self) -> u32 {
        self.channel.id()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open() && !self.channel.endpoint().is_ended()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn fire_opened(self: &Arc<Self>) {
        info!("session opened {}", self.channel);
        self.channel.context().session_listener().session_opened(self);
    }

    /// Graceful close: notify, then tear down once
    ///
    /// Loop-bound channels are closed on their loop when the caller is
    /// elsewhere. Never fails; teardown errors are logged.
    pub fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("session closing {}", self.channel);
        self.channel.context().session_listener().session_closed(self);
        if let Some(hook) = &self.close_hook {
            hook(self);
            return;
        }
        match self.channel.event_loop() {
            Some(lp) if !lp.in_event_loop() => {
                let session = Arc::clone(self);
                if let Err(e) = lp.execute(Box::new(move || session.physical_close())) {
                    warn!("close task rejected ({}), closing {} inline", e, self.channel);
                    self.physical_close();
                }
            }
            _ => self.physical_close(),
        }
    }

    /// Marks the session closing without notifying or running the hook.
    /// Returns `false` if a close was already under way.
    pub(crate) fn retire(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    fn physical_close(&self) {
        if let Err(e) = self.channel.close() {
            warn!("failed to close {}: {}", self.channel, e);
        }
    }
}

impl Selectable for Session {
    fn ready(self: Arc<Self>, event: &Event) {
        if event.is_readable() {
            self.channel.active();
            self.channel.context().session_listener().session_readable(&self);
        }
        if event.is_read_closed() || event.is_error() || self.channel.endpoint().is_ended() {
            self.close();
        }
    }

    fn shutdown(self: Arc<Self>) {
        self.close();
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.channel, f)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .field("closing", &self.is_closing())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::ServerConfiguration;
    use crate::context::BaseContext;
    use crate::endpoint::tests::endpoint_pair;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Records every notification as `"<event>:<id>"`.
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        pub(crate) fn count(&self, event: &str) -> usize {
            self.events.lock().iter().filter(|e| e.starts_with(event)).count()
        }
    }

    impl SessionEventListener for RecordingListener {
        fn session_opened(&self, session: &Arc<Session>) {
            self.events.lock().push(format!("opened:{}", session.id()));
        }

        fn session_readable(&self, session: &Arc<Session>) {
            self.events.lock().push(format!("readable:{}", session.id()));
        }

        fn session_closed(&self, session: &Arc<Session>) {
            self.events.lock().push(format!("closed:{}", session.id()));
        }
    }

    fn session_with(listener: Arc<RecordingListener>) -> (Arc<Session>, crate::endpoint::Endpoint) {
        let context = Arc::new(BaseContext::with_listener(ServerConfiguration::default(), listener));
        let (a, b) = endpoint_pair();
        (Arc::new(Session::new(Channel::new(context, a, "TCP"))), b)
    }

    #[test]
    fn test_open_then_close_notifies_once() {
        let listener = Arc::new(RecordingListener::default());
        let (session, _peer) = session_with(listener.clone());

        session.fire_opened();
        assert!(session.is_open());
        session.close();
        session.close();

        assert!(!session.is_open());
        assert!(session.is_closing());
        let id = session.id();
        assert_eq!(*listener.events.lock(), vec![format!("opened:{}", id), format!("closed:{}", id)]);
    }

    #[test]
    fn test_close_hook_replaces_teardown() {
        let listener = Arc::new(RecordingListener::default());
        let context = Arc::new(BaseContext::with_listener(ServerConfiguration::default(), listener.clone()));
        let (a, _b) = endpoint_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let session = Arc::new(
            Session::new(Channel::new(context, a, "TCP")).with_close_hook(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        session.close();
        session.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The hook owns teardown; the socket is still there.
        assert!(session.channel().is_open());
        assert_eq!(listener.count("closed"), 1);
    }

    #[test]
    fn test_retired_session_never_runs_hook() {
        let listener = Arc::new(RecordingListener::default());
        let context = Arc::new(BaseContext::with_listener(ServerConfiguration::default(), listener.clone()));
        let (a, _b) = endpoint_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let session = Arc::new(Session::new(Channel::new(context, a, "TCP")).with_close_hook(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(session.retire());
        assert!(!session.retire());
        session.close();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(listener.count("closed"), 0);
    }
}
