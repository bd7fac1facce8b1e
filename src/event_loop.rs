//! Mio-backed selector loops
//!
//! Each [`SelectorLoop`] owns one `mio::Poll` on a dedicated thread and the
//! set of sources registered with it. Other threads interact with a loop in
//! two ways only:
//!
//! - registering a source through [`SelectorLoop::bind`], which hands back a
//!   [`SelectionKey`] the owner later cancels;
//! - submitting a [`Task`] through [`EventLoop::execute`]; tasks run on the
//!   loop thread after the current batch of readiness events.
//!
//! The poll maps to epoll on Linux, kqueue on macOS/BSD and IOCP on Windows.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, error, trace};
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::config::ServerConfiguration;
use crate::error::{NioError, Result};

const WAKER: Token = Token(usize::MAX);

/// Unit of work executed on a loop thread
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// What the core needs from an event loop
pub trait EventLoop: Send + Sync {
    /// `true` when called from the loop's own thread.
    fn in_event_loop(&self) -> bool;

    /// Queues `task` for the loop thread. Never runs it inline.
    fn execute(&self, task: Task) -> Result<()>;
}

/// A registered source's view of readiness
pub(crate) trait Selectable: Send + Sync {
    fn ready(self: Arc<Self>, event: &Event);

    /// The loop is exiting with this source still registered.
    fn shutdown(self: Arc<Self>);
}

/// One selector thread
pub struct SelectorLoop {
    name: String,
    registry: Registry,
    waker: Waker,
    tasks: Mutex<VecDeque<Task>>,
    selectables: Mutex<Slab<Arc<dyn Selectable>>>,
    thread: std::sync::OnceLock<ThreadId>,
    running: AtomicBool,
}

impl std::fmt::Debug for SelectorLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SelectorLoop {
    /// Spawns a loop thread named `name`
    pub fn spawn(name: String, event_capacity: usize, poll_timeout: Duration) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let lp = Arc::new(Self {
            name: name.clone(),
            registry,
            waker,
            tasks: Mutex::new(VecDeque::new()),
            selectables: Mutex::new(Slab::new()),
            thread: std::sync::OnceLock::new(),
            running: AtomicBool::new(true),
        });
        let runner = Arc::clone(&lp);
        thread::Builder::new()
            .name(name)
            .spawn(move || runner.run(poll, Events::with_capacity(event_capacity), poll_timeout))?;
        Ok(lp)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Asks the loop to exit after its current iteration. Does not wait.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("selector loop {} shutting down", self.name);
            let _ = self.waker.wake();
        }
    }

    /// Registers `source` and builds its owner from the issued key
    ///
    /// The slab slot is reserved before registration so the token is known
    /// up front; if `build` fails nothing is left behind in the slab.
    pub(crate) fn bind<S, T, F>(self: &Arc<Self>, mut source: S, interest: Interest, build: F) -> Result<Arc<T>>
    where
        S: Source,
        T: Selectable + 'static,
        F: FnOnce(S, SelectionKey) -> Result<Arc<T>>,
    {
        if !self.is_running() {
            return Err(NioError::NotRunning("selector loop"));
        }
        let mut table = self.selectables.lock();
        let entry = table.vacant_entry();
        let token = Token(entry.key());
        self.registry.register(&mut source, token, interest)?;
        let key = SelectionKey { token, selector: Arc::downgrade(self) };
        let target = build(source, key)?;
        entry.insert(target.clone() as Arc<dyn Selectable>);
        trace!("{} bound token {}", self.name, token.0);
        Ok(target)
    }

    fn cancel<S: Source + ?Sized>(&self, token: Token, source: &mut S) -> io::Result<()> {
        self.selectables.lock().try_remove(token.0);
        self.registry.deregister(source)
    }

    fn run(self: Arc<Self>, mut poll: Poll, mut events: Events, timeout: Duration) {
        let _ = self.thread.set(thread::current().id());
        debug!("selector loop {} started", self.name);
        while self.is_running() {
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("selector loop {} poll failed: {}", self.name, e);
                self.running.store(false, Ordering::Release);
                break;
            }
            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                let target = self.selectables.lock().get(event.token().0).cloned();
                if let Some(target) = target {
                    target.ready(event);
                }
            }
            self.run_tasks();
        }

        self.run_tasks();
        let remaining: Vec<_> = self.selectables.lock().drain().collect();
        for target in remaining {
            target.shutdown();
        }
        debug!("selector loop {} exited", self.name);
    }

    fn run_tasks(&self) {
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                return;
            }
            for task in batch {
                task();
            }
        }
    }
}

impl EventLoop for SelectorLoop {
    fn in_event_loop(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    fn execute(&self, task: Task) -> Result<()> {
        if !self.is_running() {
            return Err(NioError::NotRunning("selector loop"));
        }
        self.tasks.lock().push_back(task);
        self.waker.wake()?;
        Ok(())
    }
}

/// Registration of one source with one selector loop
///
/// Cancelling deregisters the source and forgets its owner; the key is
/// consumed so it can only happen once.
#[derive(Debug)]
pub struct SelectionKey {
    token: Token,
    selector: Weak<SelectorLoop>,
}

impl SelectionKey {
    pub fn token(&self) -> Token {
        self.token
    }

    /// The owning loop, while it is still alive.
    pub fn selector(&self) -> Option<Arc<SelectorLoop>> {
        self.selector.upgrade()
    }

    pub(crate) fn cancel<S: Source + ?Sized>(self, source: &mut S) -> io::Result<()> {
        match self.selector.upgrade() {
            Some(selector) => selector.cancel(self.token, source),
            None => Ok(()),
        }
    }
}

/// The selector loops of one context, handed out round-robin
#[derive(Debug)]
pub struct SelectorLoopGroup {
    loops: Vec<Arc<SelectorLoop>>,
    next: AtomicUsize,
}

impl SelectorLoopGroup {
    pub fn start(config: &ServerConfiguration) -> io::Result<Self> {
        let mut loops = Vec::with_capacity(config.server_core_size);
        for i in 0..config.server_core_size {
            match SelectorLoop::spawn(format!("selector-loop-{}", i), config.event_capacity, config.net.poll_timeout()) {
                Ok(lp) => loops.push(lp),
                Err(e) => {
                    loops.iter().for_each(|lp| lp.shutdown());
                    return Err(e);
                }
            }
        }
        Ok(Self { loops, next: AtomicUsize::new(0) })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn next(&self) -> Arc<SelectorLoop> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[i])
    }

    pub fn shutdown(&self) {
        self.loops.iter().for_each(|lp| lp.shutdown());
    }
}

#[cfg(test)]
impl SelectorLoop {
    /// Deregisters `source` but leaves its slab slot, so a later cancel fails.
    pub(crate) fn deregister_only<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.registry.deregister(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn spawn_loop() -> Arc<SelectorLoop> {
        SelectorLoop::spawn("test-loop".into(), 64, Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_execute_runs_on_loop_thread() {
        let lp = spawn_loop();
        assert!(!lp.in_event_loop());

        let (tx, rx) = mpsc::channel();
        let owner = Arc::clone(&lp);
        lp.execute(Box::new(move || {
            tx.send(owner.in_event_loop()).unwrap();
        }))
        .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        lp.shutdown();
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let lp = spawn_loop();
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            lp.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        let seen: Vec<i32> = (0..16).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        lp.shutdown();
    }

    #[test]
    fn test_execute_after_shutdown_is_rejected() {
        let lp = spawn_loop();
        lp.shutdown();
        assert!(!lp.is_running());
        let err = lp.execute(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, NioError::NotRunning(_)));
    }

    #[test]
    fn test_group_round_robin() {
        let config = ServerConfiguration { server_core_size: 2, ..Default::default() };
        let group = SelectorLoopGroup::start(&config).unwrap();
        assert_eq!(group.len(), 2);
        let a = group.next();
        let b = group.next();
        let c = group.next();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        group.shutdown();
    }
}
