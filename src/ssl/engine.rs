use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rustls::pki_types::ServerName;
use rustls::server::{Accepted, Acceptor};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use super::{Protocol, ProtocolSelectionListener, ProtocolSelector, Side};
use crate::endpoint::Endpoint;
use crate::error::{NioError, Result};

const HANDSHAKE_BACKOFF: Duration = Duration::from_millis(1);

/// Plaintext TLS record carrying a fatal `no_application_protocol` (120) alert.
const NO_APPLICATION_PROTOCOL_ALERT: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 120];

/// Handshake surface shared by the negotiating engines
///
/// Mirrors the rustls connection calls so engines can be pumped over any
/// byte transport, an [`Endpoint`] included.
pub trait HandshakeEngine: Send {
    fn side(&self) -> Side;

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize>;

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize>;

    /// Processes buffered records; runs protocol negotiation when the
    /// relevant handshake message arrives.
    fn process_new_packets(&mut self) -> Result<()>;

    fn is_handshaking(&self) -> bool;

    fn wants_write(&self) -> bool;

    fn negotiated_protocol(&self) -> Option<&[u8]>;

    /// The established connection, for application data.
    fn into_connection(self: Box<Self>) -> Option<Connection>;
}

enum ServerState {
    Accepting(Acceptor),
    Connected(ServerConnection),
    Failed,
}

/// Server engine that picks the protocol from the ClientHello
pub struct NegotiatingServerEngine {
    state: ServerState,
    config: Arc<ServerConfig>,
    selector: Box<dyn ProtocolSelector>,
    supported: Vec<Protocol>,
    // Alert bytes queued by a rejected ClientHello.
    pending: Vec<u8>,
}

impl NegotiatingServerEngine {
    pub fn new(config: Arc<ServerConfig>, selector: Box<dyn ProtocolSelector>, supported: Vec<Protocol>) -> Self {
        Self {
            state: ServerState::Accepting(Acceptor::default()),
            config,
            selector,
            supported,
            pending: Vec::new(),
        }
    }

    fn accept(&mut self, accepted: Accepted) -> Result<()> {
        let offered: Option<Vec<Protocol>> = accepted.client_hello().alpn().map(|list| list.map(<[u8]>::to_vec).collect());
        let chosen = match &offered {
            Some(list) if !list.is_empty() => self.selector.select(list),
            _ => self.selector.unsupported().map(|_| None),
        };

        let mut config = (*self.config).clone();
        let failure = match chosen {
            Ok(Some(protocol)) => {
                trace!("server selected {}", String::from_utf8_lossy(&protocol));
                config.alpn_protocols = vec![protocol];
                None
            }
            Ok(None) => {
                config.alpn_protocols.clear();
                None
            }
            Err(e) => {
                // The full local list has no overlap with the offer, so the
                // handshake below fails with no_application_protocol.
                config.alpn_protocols = self.supported.clone();
                Some(e)
            }
        };

        match accepted.into_connection(Arc::new(config)) {
            Ok(conn) if failure.is_none() => {
                self.state = ServerState::Connected(conn);
                Ok(())
            }
            Ok(_) => {
                // rustls took the hello, so it raises no alert of its own.
                self.state = ServerState::Failed;
                self.pending.extend_from_slice(&NO_APPLICATION_PROTOCOL_ALERT);
                debug!("aborting handshake with no_application_protocol");
                Err(failure.unwrap_or_else(|| NioError::Negotiation("rejected".into())))
            }
            Err((err, mut alert)) => {
                self.state = ServerState::Failed;
                while alert.write(&mut self.pending)? > 0 {}
                debug!("ClientHello rejected: {}", err);
                Err(failure.unwrap_or(NioError::Tls(err)))
            }
        }
    }
}

impl HandshakeEngine for NegotiatingServerEngine {
    fn side(&self) -> Side {
        Side::Server
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match &mut self.state {
            ServerState::Accepting(acceptor) => acceptor.read_tls(rd),
            ServerState::Connected(conn) => conn.read_tls(rd),
            ServerState::Failed => Err(io::Error::other("handshake has failed")),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = wr.write(&self.pending)?;
            self.pending.drain(..n);
            return Ok(n);
        }
        match &mut self.state {
            ServerState::Connected(conn) => conn.write_tls(wr),
            _ => Ok(0),
        }
    }

    fn process_new_packets(&mut self) -> Result<()> {
        match &mut self.state {
            ServerState::Accepting(acceptor) => match acceptor.accept() {
                Ok(None) => Ok(()),
                Ok(Some(accepted)) => self.accept(accepted),
                Err((err, mut alert)) => {
                    self.state = ServerState::Failed;
                    while alert.write(&mut self.pending)? > 0 {}
                    Err(err.into())
                }
            },
            ServerState::Connected(conn) => {
                conn.process_new_packets()?;
                Ok(())
            }
            ServerState::Failed => Err(NioError::Negotiation("handshake has failed".into())),
        }
    }

    fn is_handshaking(&self) -> bool {
        match &self.state {
            ServerState::Accepting(_) => true,
            ServerState::Connected(conn) => conn.is_handshaking(),
            ServerState::Failed => false,
        }
    }

    fn wants_write(&self) -> bool {
        !self.pending.is_empty() || matches!(&self.state, ServerState::Connected(conn) if conn.wants_write())
    }

    fn negotiated_protocol(&self) -> Option<&[u8]> {
        match &self.state {
            ServerState::Connected(conn) => conn.alpn_protocol(),
            _ => None,
        }
    }

    fn into_connection(self: Box<Self>) -> Option<Connection> {
        match self.state {
            ServerState::Connected(conn) => Some(conn.into()),
            _ => None,
        }
    }
}

/// Client engine that offers the candidates and vets the server's pick
pub struct NegotiatingClientEngine {
    conn: ClientConnection,
    listener: Box<dyn ProtocolSelectionListener>,
    verified: bool,
}

impl NegotiatingClientEngine {
    pub fn new(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        listener: Box<dyn ProtocolSelectionListener>,
        protocols: Vec<Protocol>,
    ) -> Result<Self> {
        let mut config = (*config).clone();
        config.alpn_protocols = protocols;
        let conn = ClientConnection::new(Arc::new(config), server_name)?;
        Ok(Self { conn, listener, verified: false })
    }
}

impl HandshakeEngine for NegotiatingClientEngine {
    fn side(&self) -> Side {
        Side::Client
    }

    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        self.conn.read_tls(rd)
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        self.conn.write_tls(wr)
    }

    fn process_new_packets(&mut self) -> Result<()> {
        self.conn.process_new_packets()?;
        if self.verified || self.conn.is_handshaking() {
            return Ok(());
        }
        self.verified = true;
        let outcome = match self.conn.alpn_protocol() {
            Some(protocol) => self.listener.selected(protocol),
            None => self.listener.unsupported(),
        };
        if let Err(e) = outcome {
            warn!("closing handshake: {}", e);
            self.conn.send_close_notify();
            return Err(e);
        }
        Ok(())
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn negotiated_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    fn into_connection(self: Box<Self>) -> Option<Connection> {
        Some(self.conn.into())
    }
}

/// Runs `engine`'s handshake over `endpoint`
///
/// Returns the negotiated protocol, `None` when the handshake completed
/// without one. On failure any queued alert is flushed before returning.
pub fn drive_handshake(engine: &mut dyn HandshakeEngine, endpoint: &Endpoint, timeout: Duration) -> Result<Option<Protocol>> {
    let deadline = Instant::now() + timeout;
    let mut transport = endpoint;
    loop {
        while engine.wants_write() {
            match engine.write_tls(&mut transport) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => backoff(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !engine.is_handshaking() {
            break;
        }
        match engine.read_tls(&mut transport) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed during handshake").into());
            }
            Ok(_) => {
                if let Err(e) = engine.process_new_packets() {
                    flush_alert(engine, transport);
                    return Err(e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => backoff(deadline)?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let protocol = engine.negotiated_protocol().map(<[u8]>::to_vec);
    debug!(
        "{:?} handshake complete, protocol {:?}",
        engine.side(),
        protocol.as_deref().map(String::from_utf8_lossy)
    );
    Ok(protocol)
}

fn backoff(deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out").into());
    }
    thread::sleep(HANDSHAKE_BACKOFF);
    Ok(())
}

fn flush_alert(engine: &mut dyn HandshakeEngine, mut transport: &Endpoint) {
    while engine.wants_write() {
        match engine.write_tls(&mut transport) {
            Ok(n) if n > 0 => {}
            _ => return,
        }
    }
}
