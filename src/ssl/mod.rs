//! Application protocol negotiation over rustls
//!
//! An [`ApplicationProtocolNegotiator`] combines three things:
//!
//! - an ordered candidate list, most preferred first;
//! - a selector strategy, run by the side that picks the protocol;
//! - a selection listener strategy, run by the side that is told the pick.
//!
//! With ALPN the server selects from the client's offer and the client
//! listens. With NPN the roles are swapped. Each strategy comes in a
//! variant that aborts the handshake when nothing matches and one that
//! lets it finish with no protocol.
//!
//! rustls implements ALPN only. NPN negotiators therefore fail when they
//! are built, not when a handshake runs.
//!
//! # Examples
//!
//! ```rust,no_run
//! use baseio::ssl::ApplicationProtocolNegotiator;
//!
//! let negotiator = ApplicationProtocolNegotiator::alpn_with(true, false, ["h2", "http/1.1"])?;
//! assert_eq!(negotiator.protocols().len(), 2);
//! # Ok::<(), baseio::NioError>(())
//! ```

mod engine;

use std::fmt;
use std::sync::Arc;

use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};

use crate::error::{NioError, Result};

pub use engine::{HandshakeEngine, NegotiatingClientEngine, NegotiatingServerEngine, drive_handshake};

/// Protocol identifier as sent on the wire.
pub type Protocol = Vec<u8>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mechanism {
    Npn,
    Alpn,
}

impl Mechanism {
    pub fn is_available(self) -> bool {
        matches!(self, Mechanism::Alpn)
    }

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::Npn => "NPN",
            Mechanism::Alpn => "ALPN",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Picks one protocol from what the peer offered
pub trait ProtocolSelector: Send {
    /// `Ok(None)` completes the handshake without a protocol; `Err` aborts it.
    fn select(&mut self, offered: &[Protocol]) -> Result<Option<Protocol>>;

    /// The peer offered nothing at all.
    fn unsupported(&mut self) -> Result<()>;
}

/// Validates the protocol the peer picked
pub trait ProtocolSelectionListener: Send {
    fn selected(&mut self, protocol: &[u8]) -> Result<()>;

    /// The peer picked nothing at all.
    fn unsupported(&mut self) -> Result<()>;
}

pub trait ProtocolSelectorFactory: Send + Sync {
    fn new_selector(&self, supported: &[Protocol]) -> Box<dyn ProtocolSelector>;
}

pub trait ProtocolSelectionListenerFactory: Send + Sync {
    fn new_listener(&self, supported: &[Protocol]) -> Box<dyn ProtocolSelectionListener>;
}

/// First local candidate the peer also offered.
#[derive(Debug, Clone)]
pub struct PreferenceSelector {
    supported: Vec<Protocol>,
    fail_if_no_match: bool,
}

impl PreferenceSelector {
    pub fn new(supported: Vec<Protocol>, fail_if_no_match: bool) -> Self {
        Self { supported, fail_if_no_match }
    }
}

impl ProtocolSelector for PreferenceSelector {
    fn select(&mut self, offered: &[Protocol]) -> Result<Option<Protocol>> {
        if let Some(p) = self.supported.iter().find(|p| offered.contains(p)) {
            return Ok(Some(p.clone()));
        }
        if self.fail_if_no_match {
            return Err(NioError::Negotiation(format!(
                "no common protocol: offered {}, supported {}",
                display_list(offered),
                display_list(&self.supported)
            )));
        }
        debug!("no common protocol in {}, continuing without one", display_list(offered));
        Ok(None)
    }

    fn unsupported(&mut self) -> Result<()> {
        if self.fail_if_no_match {
            return Err(NioError::Negotiation("peer offered no protocols".into()));
        }
        Ok(())
    }
}

/// Accepts the peer's pick only if it is a local candidate.
#[derive(Debug, Clone)]
pub struct MatchingSelectionListener {
    supported: Vec<Protocol>,
    fail_if_no_match: bool,
}

impl MatchingSelectionListener {
    pub fn new(supported: Vec<Protocol>, fail_if_no_match: bool) -> Self {
        Self { supported, fail_if_no_match }
    }
}

impl ProtocolSelectionListener for MatchingSelectionListener {
    fn selected(&mut self, protocol: &[u8]) -> Result<()> {
        if self.supported.iter().any(|p| p == protocol) || !self.fail_if_no_match {
            return Ok(());
        }
        Err(NioError::Negotiation(format!(
            "peer selected {} which is not one of {}",
            String::from_utf8_lossy(protocol),
            display_list(&self.supported)
        )))
    }

    fn unsupported(&mut self) -> Result<()> {
        if self.fail_if_no_match {
            return Err(NioError::Negotiation("peer selected no protocol".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreferenceSelectorFactory {
    pub fail_if_no_match: bool,
}

impl ProtocolSelectorFactory for PreferenceSelectorFactory {
    fn new_selector(&self, supported: &[Protocol]) -> Box<dyn ProtocolSelector> {
        Box::new(PreferenceSelector::new(supported.to_vec(), self.fail_if_no_match))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchingListenerFactory {
    pub fail_if_no_match: bool,
}

impl ProtocolSelectionListenerFactory for MatchingListenerFactory {
    fn new_listener(&self, supported: &[Protocol]) -> Box<dyn ProtocolSelectionListener> {
        Box::new(MatchingSelectionListener::new(supported.to_vec(), self.fail_if_no_match))
    }
}

/// Builds negotiating engines for one mechanism
pub trait EngineWrapperFactory: Send + Sync {
    fn mechanism(&self) -> Mechanism;

    fn wrap_server(
        &self,
        config: Arc<ServerConfig>,
        negotiator: &ApplicationProtocolNegotiator,
    ) -> Result<Box<dyn HandshakeEngine>>;

    fn wrap_client(
        &self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        negotiator: &ApplicationProtocolNegotiator,
    ) -> Result<Box<dyn HandshakeEngine>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlpnWrapperFactory;

impl EngineWrapperFactory for AlpnWrapperFactory {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Alpn
    }

    fn wrap_server(
        &self,
        config: Arc<ServerConfig>,
        negotiator: &ApplicationProtocolNegotiator,
    ) -> Result<Box<dyn HandshakeEngine>> {
        let selector = negotiator.selector_factory.new_selector(&negotiator.protocols);
        Ok(Box::new(NegotiatingServerEngine::new(config, selector, negotiator.protocols.clone())))
    }

    fn wrap_client(
        &self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        negotiator: &ApplicationProtocolNegotiator,
    ) -> Result<Box<dyn HandshakeEngine>> {
        let listener = negotiator.listener_factory.new_listener(&negotiator.protocols);
        let engine = NegotiatingClientEngine::new(config, server_name, listener, negotiator.protocols.clone())?;
        Ok(Box::new(engine))
    }
}

/// Checks NPN availability; there is no NPN engine to wrap.
#[derive(Debug)]
pub struct NpnWrapperFactory {
    _private: (),
}

impl NpnWrapperFactory {
    pub fn new() -> Result<Self> {
        if !Mechanism::Npn.is_available() {
            return Err(NioError::Unsupported("NPN".into()));
        }
        Ok(Self { _private: () })
    }
}

impl EngineWrapperFactory for NpnWrapperFactory {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Npn
    }

    fn wrap_server(&self, _: Arc<ServerConfig>, _: &ApplicationProtocolNegotiator) -> Result<Box<dyn HandshakeEngine>> {
        Err(NioError::Unsupported("NPN".into()))
    }

    fn wrap_client(
        &self,
        _: Arc<ClientConfig>,
        _: ServerName<'static>,
        _: &ApplicationProtocolNegotiator,
    ) -> Result<Box<dyn HandshakeEngine>> {
        Err(NioError::Unsupported("NPN".into()))
    }
}

#[derive(Clone)]
pub struct ApplicationProtocolNegotiator {
    wrapper: Arc<dyn EngineWrapperFactory>,
    selector_factory: Arc<dyn ProtocolSelectorFactory>,
    listener_factory: Arc<dyn ProtocolSelectionListenerFactory>,
    protocols: Vec<Protocol>,
}

impl fmt::Debug for ApplicationProtocolNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationProtocolNegotiator")
            .field("mechanism", &self.wrapper.mechanism())
            .field("protocols", &display_list(&self.protocols))
            .finish()
    }
}

impl ApplicationProtocolNegotiator {
    /// ALPN that completes without a protocol when nothing matches.
    pub fn alpn<I, P>(protocols: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self::alpn_with(false, false, protocols)
    }

    /// ALPN with per-side fail flags
    ///
    /// The server runs the selector, so `server_fail` governs it;
    /// `client_fail` governs the client's listener.
    pub fn alpn_with<I, P>(client_fail: bool, server_fail: bool, protocols: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self::with_factories(
            Arc::new(AlpnWrapperFactory),
            Arc::new(PreferenceSelectorFactory { fail_if_no_match: server_fail }),
            Arc::new(MatchingListenerFactory { fail_if_no_match: client_fail }),
            protocols,
        )
    }

    pub fn npn<I, P>(protocols: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        Self::npn_with(false, false, protocols)
    }

    /// NPN with per-side fail flags. The client selects, the server listens.
    pub fn npn_with<I, P>(client_fail: bool, server_fail: bool, protocols: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let wrapper = NpnWrapperFactory::new()?;
        Self::with_factories(
            Arc::new(wrapper),
            Arc::new(PreferenceSelectorFactory { fail_if_no_match: client_fail }),
            Arc::new(MatchingListenerFactory { fail_if_no_match: server_fail }),
            protocols,
        )
    }

    pub fn with_factories<I, P>(
        wrapper: Arc<dyn EngineWrapperFactory>,
        selector_factory: Arc<dyn ProtocolSelectorFactory>,
        listener_factory: Arc<dyn ProtocolSelectionListenerFactory>,
        protocols: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mechanism = wrapper.mechanism();
        if !mechanism.is_available() {
            return Err(NioError::Unsupported(mechanism.name().into()));
        }
        let protocols: Vec<Protocol> = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        if protocols.is_empty() {
            return Err(NioError::config("protocol list is empty"));
        }
        if let Some(p) = protocols.iter().find(|p| p.is_empty() || p.len() > 255) {
            return Err(NioError::config(format!("invalid protocol id {:?}", String::from_utf8_lossy(p))));
        }
        Ok(Self { wrapper, selector_factory, listener_factory, protocols })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.wrapper.mechanism()
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn selector_factory(&self) -> &Arc<dyn ProtocolSelectorFactory> {
        &self.selector_factory
    }

    pub fn listener_factory(&self) -> &Arc<dyn ProtocolSelectionListenerFactory> {
        &self.listener_factory
    }

    pub fn wrapper_factory(&self) -> &Arc<dyn EngineWrapperFactory> {
        &self.wrapper
    }

    pub fn server_engine(&self, config: Arc<ServerConfig>) -> Result<Box<dyn HandshakeEngine>> {
        self.wrapper.wrap_server(config, self)
    }

    pub fn client_engine(
        &self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Box<dyn HandshakeEngine>> {
        self.wrapper.wrap_client(config, server_name, self)
    }
}

fn display_list(protocols: &[Protocol]) -> String {
    let names: Vec<_> = protocols.iter().map(|p| String::from_utf8_lossy(p)).collect();
    format!("[{}]", names.join(", "))
}
