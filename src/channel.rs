//! Managed connection identity over an [`Endpoint`]

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};

use crate::context::BaseContext;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::event_loop::{EventLoop, SelectorLoop};

/// Opaque per-channel user data.
pub type Attachment = Arc<dyn Any + Send + Sync>;

const UNKNOWN_LOCAL: &str = "127.0.0.1";
const UNKNOWN_REMOTE: &str = "closed";

/// One connection: identity, timestamps, attachment and a user lock
///
/// The id comes from the context's [`Sequence`](crate::context::Sequence),
/// so ids are unique per context. `last_access_time` starts at creation
/// plus the session idle time and never moves backwards.
pub struct Channel {
    id: u32,
    prefix: &'static str,
    context: Arc<BaseContext>,
    endpoint: Endpoint,
    creation_time: u64,
    last_access: AtomicU64,
    attachment: Mutex<Option<Attachment>>,
    channel_lock: Mutex<()>,
    description: OnceLock<String>,
}

impl Channel {
    pub fn new(context: Arc<BaseContext>, endpoint: Endpoint, prefix: &'static str) -> Self {
        let id = context.sequence().next_id();
        let idle = context.configuration().session_idle_time;
        let creation_time = now_millis();
        Self {
            id,
            prefix,
            last_access: AtomicU64::new(creation_time.saturating_add(idle.as_millis() as u64)),
            creation_time,
            context,
            endpoint,
            attachment: Mutex::new(None),
            channel_lock: Mutex::new(()),
            description: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn context(&self) -> &Arc<BaseContext> {
        &self.context
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Creation time in ms since the epoch.
    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn last_access_time(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    /// Records activity now.
    pub fn active(&self) {
        self.last_access.fetch_max(now_millis(), Ordering::AcqRel);
    }

    pub fn is_open(&self) -> bool {
        self.endpoint.is_open()
    }

    pub fn close(&self) -> Result<()> {
        self.endpoint.close()
    }

    pub fn local_addr(&self) -> String {
        self.endpoint
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_LOCAL.to_string())
    }

    pub fn local_port(&self) -> Option<u16> {
        self.endpoint.local_addr().map(|a| a.port())
    }

    pub fn remote_addr(&self) -> String {
        self.endpoint
            .remote_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_REMOTE.to_string())
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.endpoint.remote_addr().map(|a| a.port())
    }

    /// The user lock. Not re-entrant.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.channel_lock.lock()
    }

    pub fn attachment(&self) -> Option<Attachment> {
        self.attachment.lock().clone()
    }

    pub fn set_attachment(&self, attachment: Attachment) -> Option<Attachment> {
        self.attachment.lock().replace(attachment)
    }

    pub fn take_attachment(&self) -> Option<Attachment> {
        self.attachment.lock().take()
    }

    pub fn event_loop(&self) -> Option<Arc<SelectorLoop>> {
        self.endpoint.selector()
    }

    pub fn is_loop_bound(&self) -> bool {
        self.event_loop().is_some()
    }

    /// `true` when the caller runs on the loop that owns this channel.
    pub fn in_event_loop(&self) -> bool {
        self.event_loop().is_some_and(|lp| lp.in_event_loop())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.description.get_or_init(|| {
            let port = self.remote_port().map(i32::from).unwrap_or(-1);
            format!("[{}(id:0x{:08x}) remote /{}:{}]", self.prefix, self.id, self.remote_addr(), port)
        });
        f.write_str(text)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfiguration;
    use crate::endpoint::tests::endpoint_pair;
    use std::time::Duration;

    fn context(idle: Duration) -> Arc<BaseContext> {
        Arc::new(BaseContext::new(ServerConfiguration {
            session_idle_time: idle,
            server_core_size: 1,
            ..Default::default()
        }))
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let ctx = context(Duration::ZERO);
        let channels: Vec<Channel> = (0..5)
            .map(|_| {
                let (a, _b) = endpoint_pair();
                Channel::new(ctx.clone(), a, "TCP")
            })
            .collect();
        assert!(channels.windows(2).all(|w| w[1].id() > w[0].id()));
    }

    #[test]
    fn test_descriptor_format() {
        let ctx = context(Duration::ZERO);
        let (a, _b) = endpoint_pair();
        let remote = a.remote_addr().unwrap();
        let channel = Channel::new(ctx, a, "TCP");

        let expected = format!("[TCP(id:0x{:08x}) remote /127.0.0.1:{}]", channel.id(), remote.port());
        assert_eq!(channel.to_string(), expected);
        // Cached: unchanged once the socket is gone.
        channel.close().unwrap();
        assert_eq!(channel.to_string(), expected);
    }

    #[test]
    fn test_descriptor_of_closed_channel() {
        let ctx = context(Duration::ZERO);
        let (a, _b) = endpoint_pair();
        let channel = Channel::new(ctx, a, "TCP");
        channel.close().unwrap();

        assert_eq!(channel.remote_addr(), "closed");
        assert_eq!(channel.remote_port(), None);
        assert_eq!(channel.local_addr(), "127.0.0.1");
        assert_eq!(channel.to_string(), format!("[TCP(id:0x{:08x}) remote /closed:-1]", channel.id()));
    }

    #[test]
    fn test_last_access_never_regresses() {
        let ctx = context(Duration::from_secs(60));
        let (a, _b) = endpoint_pair();
        let channel = Channel::new(ctx, a, "TCP");

        let initial = channel.last_access_time();
        assert!(initial >= channel.creation_time() + 60_000);
        channel.active();
        assert_eq!(channel.last_access_time(), initial);
    }

    #[test]
    fn test_active_advances_without_idle_grace() {
        let ctx = context(Duration::ZERO);
        let (a, _b) = endpoint_pair();
        let channel = Channel::new(ctx, a, "TCP");

        let before = channel.last_access_time();
        std::thread::sleep(Duration::from_millis(5));
        channel.active();
        assert!(channel.last_access_time() > before);
    }

    #[test]
    fn test_attachment() {
        let ctx = context(Duration::ZERO);
        let (a, _b) = endpoint_pair();
        let channel = Channel::new(ctx, a, "TCP");

        assert!(channel.attachment().is_none());
        channel.set_attachment(Arc::new(42u32));
        let value = channel.attachment().unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&42));
        assert!(channel.take_attachment().is_some());
        assert!(channel.attachment().is_none());
    }

    #[test]
    fn test_unbound_channel() {
        let ctx = context(Duration::ZERO);
        let (a, _b) = endpoint_pair();
        let channel = Channel::new(ctx, a, "TCP");
        assert!(!channel.is_loop_bound());
        assert!(!channel.in_event_loop());
        let _guard = channel.lock();
        assert!(channel.channel_lock.try_lock().is_none());
    }
}
