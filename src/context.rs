//! Shared state for one client or server
//!
//! A [`BaseContext`] owns the configuration, the channel id sequence, the
//! listeners and, while running, the [`SelectorLoopGroup`]. Start and stop
//! are idempotent; lifecycle listeners see each transition once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::ServerConfiguration;
use crate::error::{NioError, Result};
use crate::event_loop::{SelectorLoop, SelectorLoopGroup};
use crate::session::SessionEventListener;

/// Monotonic channel id source
#[derive(Debug, Default)]
pub struct Sequence {
    next: AtomicU32,
}

impl Sequence {
    pub fn new(start: u32) -> Self {
        Self { next: AtomicU32::new(start) }
    }

    /// Next id. Wraps after `u32::MAX`, with a warning.
    pub fn next_id(&self) -> u32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == u32::MAX {
            warn!("id sequence exhausted, restarting at 0");
        }
        id
    }
}

/// Observer of context start/stop
pub trait LifeCycleListener: Send + Sync {
    fn lifecycle_started(&self, _context: &BaseContext) {}

    fn lifecycle_stopped(&self, _context: &BaseContext) {}

    fn lifecycle_failure(&self, _context: &BaseContext, _error: &NioError) {}
}

/// Listener used when none is configured.
#[derive(Debug, Default)]
pub struct NoopSessionListener;

impl SessionEventListener for NoopSessionListener {}

pub struct BaseContext {
    config: RwLock<ServerConfiguration>,
    sequence: Sequence,
    listener: Arc<dyn SessionEventListener>,
    lifecycle: Mutex<Vec<Arc<dyn LifeCycleListener>>>,
    group: Mutex<Option<SelectorLoopGroup>>,
}

impl std::fmt::Debug for BaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseContext")
            .field("config", &*self.config.read())
            .field("running", &self.is_running())
            .finish()
    }
}

impl BaseContext {
    pub fn new(config: ServerConfiguration) -> Self {
        Self::with_listener(config, Arc::new(NoopSessionListener))
    }

    pub fn with_listener(config: ServerConfiguration, listener: Arc<dyn SessionEventListener>) -> Self {
        Self {
            config: RwLock::new(config),
            sequence: Sequence::default(),
            listener,
            lifecycle: Mutex::new(Vec::new()),
            group: Mutex::new(None),
        }
    }

    /// Snapshot of the current configuration.
    pub fn configuration(&self) -> ServerConfiguration {
        self.config.read().clone()
    }

    /// Mutates the configuration. Takes effect on the next start.
    pub fn update_configuration<F: FnOnce(&mut ServerConfiguration)>(&self, f: F) {
        f(&mut self.config.write());
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn session_listener(&self) -> &Arc<dyn SessionEventListener> {
        &self.listener
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifeCycleListener>) {
        self.lifecycle.lock().push(listener);
    }

    pub fn is_running(&self) -> bool {
        self.group.lock().is_some()
    }

    /// Starts the selector loops. Returns `Ok(false)` if already running.
    pub fn start(&self) -> Result<bool> {
        let mut group = self.group.lock();
        if group.is_some() {
            return Ok(false);
        }
        let config = self.configuration();
        let started = config
            .validate()
            .and_then(|_| SelectorLoopGroup::start(&config).map_err(NioError::from));
        match started {
            Ok(loops) => {
                info!("context started with {} selector loop(s)", loops.len());
                *group = Some(loops);
                drop(group);
                self.notify(|l| l.lifecycle_started(self));
                Ok(true)
            }
            Err(e) => {
                drop(group);
                error!("context failed to start: {}", e);
                self.notify(|l| l.lifecycle_failure(self, &e));
                Err(e)
            }
        }
    }

    /// Signals every loop to exit without waiting for it
    ///
    /// Safe to call from a loop thread. Returns `false` if not running.
    pub fn stop(&self) -> bool {
        let Some(loops) = self.group.lock().take() else {
            return false;
        };
        loops.shutdown();
        info!("context stopped");
        self.notify(|l| l.lifecycle_stopped(self));
        true
    }

    /// Loop for the next channel, round-robin.
    pub fn next_event_loop(&self) -> Result<Arc<SelectorLoop>> {
        self.group
            .lock()
            .as_ref()
            .map(SelectorLoopGroup::next)
            .ok_or(NioError::NotRunning("context"))
    }

    fn notify<F: Fn(&dyn LifeCycleListener)>(&self, f: F) {
        let listeners = self.lifecycle.lock().clone();
        for l in &listeners {
            f(l.as_ref());
        }
    }
}

impl Drop for BaseContext {
    fn drop(&mut self) {
        if let Some(loops) = self.group.get_mut().take() {
            loops.shutdown();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct CountingLifecycle {
        pub started: AtomicUsize,
        pub stopped: AtomicUsize,
        pub failed: AtomicUsize,
    }

    impl LifeCycleListener for CountingLifecycle {
        fn lifecycle_started(&self, _: &BaseContext) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn lifecycle_stopped(&self, _: &BaseContext) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }

        fn lifecycle_failure(&self, _: &BaseContext, _: &NioError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn small_config() -> ServerConfiguration {
        ServerConfiguration { server_core_size: 2, ..Default::default() }
    }

    #[test]
    fn test_sequence_wraps_to_zero() {
        let sequence = Sequence::new(u32::MAX - 1);
        assert_eq!(sequence.next_id(), u32::MAX - 1);
        assert_eq!(sequence.next_id(), u32::MAX);
        assert_eq!(sequence.next_id(), 0);
        assert_eq!(sequence.next_id(), 1);
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let seq = Sequence::default();
        let ids: Vec<u32> = (0..100).map(|_| seq.next_id()).collect();
        assert_eq!(ids[0], 0);
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_sequence_unique_across_threads() {
        let seq = Arc::new(Sequence::new(10));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || (0..250).map(|_| seq.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(all[0], 10);
    }

    #[test]
    fn test_start_stop_notifies_once() {
        let context = BaseContext::new(small_config());
        let counter = Arc::new(CountingLifecycle::default());
        context.add_lifecycle_listener(counter.clone());

        assert!(context.start().unwrap());
        assert!(!context.start().unwrap());
        assert!(context.is_running());
        assert!(context.next_event_loop().is_ok());

        assert!(context.stop());
        assert!(!context.stop());
        assert!(!context.is_running());
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert_eq!(counter.stopped.load(Ordering::SeqCst), 1);
        assert!(matches!(context.next_event_loop(), Err(NioError::NotRunning(_))));
    }

    #[test]
    fn test_invalid_configuration_fails_start() {
        let context = BaseContext::new(ServerConfiguration { server_core_size: 0, ..Default::default() });
        let counter = Arc::new(CountingLifecycle::default());
        context.add_lifecycle_listener(counter.clone());

        assert!(matches!(context.start(), Err(NioError::Config(_))));
        assert!(!context.is_running());
        assert_eq!(counter.failed.load(Ordering::SeqCst), 1);
        assert_eq!(counter.started.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let context = BaseContext::new(small_config());
        context.start().unwrap();
        context.stop();
        context.update_configuration(|c| c.server_core_size = 1);
        assert!(context.start().unwrap());
        assert_eq!(context.configuration().server_core_size, 1);
        context.stop();
    }
}
