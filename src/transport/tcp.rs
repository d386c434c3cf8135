//! TCP protocol adapter.
//!
//! [`TcpProtocol`] owns one [`ListenerPool`] and one [`ConnectionPool`] and
//! wires them together:
//!
//! - `listen` binds a socket and registers it with the listener pool
//! - the bridge moves every accepted connection into the connection pool
//! - `send` resolves the target, reuses a pooled connection or dials a new
//!   one, and writes the message
//!
//! # Lifecycle
//!
//! 1. [`TcpProtocol::new`] - build both pools (bridge idle)
//! 2. [`TcpProtocol::start`] - spawn the bridge
//! 3. Cancel the token passed at construction
//! 4. [`Protocol::done`] - wait for the connection pool to drain
//! 5. [`TcpProtocol::join`] - wait for the bridge to exit
//!
//! [`TcpProtocol::spawn`] combines steps 1 and 2.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::{Error as IoError, ErrorKind};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionKey, ListenerKey, ProtocolId};
use crate::message::{IncomingMessage, Message};
use crate::options::TransportOptions;

use super::connection::Connection;
use super::connection_pool::ConnectionPool;
use super::handoff::{self, HandoffReceiver};
use super::listener_pool::ListenerPool;
use super::target::{Network, Target};
use super::{ErrorSender, Protocol};

// ============================================================================
// Types
// ============================================================================

/// State of the bridging task.
enum Bridge {
    /// Built but not started; holds the handoff receiver.
    Idle(HandoffReceiver<Connection>),
    /// Running.
    Running(JoinHandle<()>),
    /// Joined or being joined.
    Finished,
}

/// Per-address dial locks.
type DialLocks = FxHashMap<ConnectionKey, Arc<tokio::sync::Mutex<()>>>;

/// One caller's share of a per-address dial lock.
///
/// Dropping the last share removes the map entry, also when the owning
/// send is cancelled mid-dial.
struct DialLock<'a> {
    locks: &'a Mutex<DialLocks>,
    key: ConnectionKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> DialLock<'a> {
    fn join(locks: &'a Mutex<DialLocks>, key: ConnectionKey) -> Self {
        let lock = Arc::clone(locks.lock().entry(key.clone()).or_default());
        Self { locks, key, lock }
    }
}

impl Drop for DialLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // The map and this share hold the only references when nobody waits.
        if locks.get(&self.key).is_some_and(|current| {
            Arc::ptr_eq(current, &self.lock) && Arc::strong_count(current) == 2
        }) {
            locks.remove(&self.key);
        }
    }
}

// ============================================================================
// TcpProtocol
// ============================================================================

/// Stream transport over TCP with connection reuse.
///
/// # Example
///
/// ```ignore
/// let (output, mut inbound) = mpsc::channel(64);
/// let (errs, _errors) = mpsc::unbounded_channel();
/// let cancel = CancellationToken::new();
///
/// let tcp = TcpProtocol::spawn(output, errs, cancel.clone(), TransportOptions::new());
/// tcp.listen(&Target::port(5060)).await?;
/// tcp.send(&Target::new("203.0.113.5", 5060), &RawMessage::new(text)).await?;
/// ```
pub struct TcpProtocol {
    id: ProtocolId,
    options: TransportOptions,
    listeners: Arc<ListenerPool>,
    connections: Arc<ConnectionPool>,
    bridge: Mutex<Bridge>,
    dial_locks: Mutex<DialLocks>,
    span: Span,
}

// ============================================================================
// TcpProtocol - Constructors
// ============================================================================

impl TcpProtocol {
    /// Creates the protocol and both pools without starting the bridge.
    ///
    /// Inbound messages framed by the connection pool go to `output`;
    /// asynchronous pool failures go to `errs`. Cancelling `cancel` shuts
    /// both pools down. Must be called within a Tokio runtime.
    ///
    /// `options` are used as given. Use [`try_new`](Self::try_new) to
    /// validate them first.
    pub fn new(
        output: mpsc::Sender<IncomingMessage>,
        errs: ErrorSender,
        cancel: CancellationToken,
        options: TransportOptions,
    ) -> Self {
        let (conns_tx, conns_rx) = handoff::channel();
        let id = ProtocolId::generate();
        let network = Network::Tcp;

        let span = info_span!(
            "transport.Protocol",
            protocol_id = %id,
            protocol_network = %network,
        );

        let listeners = ListenerPool::new(conns_tx, errs.clone(), cancel.clone());
        let connections = ConnectionPool::with_limits(
            output,
            errs,
            cancel,
            options.max_message_size,
            options.read_buffer_size,
        );

        Self {
            id,
            options,
            listeners,
            connections,
            bridge: Mutex::new(Bridge::Idle(conns_rx)),
            dial_locks: Mutex::new(FxHashMap::default()),
            span,
        }
    }

    /// Validates `options`, then creates the protocol like [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options fail
    /// [`TransportOptions::validate`].
    pub fn try_new(
        output: mpsc::Sender<IncomingMessage>,
        errs: ErrorSender,
        cancel: CancellationToken,
        options: TransportOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self::new(output, errs, cancel, options))
    }

    /// Validates `options`, then creates and starts the protocol.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options fail
    /// [`TransportOptions::validate`].
    pub fn try_spawn(
        output: mpsc::Sender<IncomingMessage>,
        errs: ErrorSender,
        cancel: CancellationToken,
        options: TransportOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self::spawn(output, errs, cancel, options))
    }

    /// Creates the protocol and starts the bridge.
    ///
    /// `options` are used as given, as with [`new`](Self::new).
    pub fn spawn(
        output: mpsc::Sender<IncomingMessage>,
        errs: ErrorSender,
        cancel: CancellationToken,
        options: TransportOptions,
    ) -> Self {
        let protocol = Self::new(output, errs, cancel, options);
        {
            let mut bridge = protocol.bridge.lock();
            if let Bridge::Idle(conns) = mem::replace(&mut *bridge, Bridge::Finished) {
                *bridge = Bridge::Running(protocol.launch_bridge(conns));
            }
        }
        protocol
    }
}

// ============================================================================
// TcpProtocol - Lifecycle
// ============================================================================

impl TcpProtocol {
    /// Spawns the bridge between the listener and connection pools.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the bridge was started before.
    pub fn start(&self) -> Result<()> {
        let mut bridge = self.bridge.lock();

        match mem::replace(&mut *bridge, Bridge::Finished) {
            Bridge::Idle(conns) => {
                *bridge = Bridge::Running(self.launch_bridge(conns));
                Ok(())
            }
            previous => {
                *bridge = previous;
                Err(Error::AlreadyStarted)
            }
        }
    }

    /// Waits for the bridge to exit.
    ///
    /// The bridge exits once the listener pool has stopped. Returns
    /// immediately if the bridge was never started or was already joined.
    pub async fn join(&self) {
        let handle = {
            let mut bridge = self.bridge.lock();
            match mem::replace(&mut *bridge, Bridge::Finished) {
                Bridge::Running(handle) => Some(handle),
                previous => {
                    *bridge = previous;
                    None
                }
            }
        };

        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(parent: &self.span, error = %e, "Pipe pools task failed");
        }
    }

    fn launch_bridge(&self, conns: HandoffReceiver<Connection>) -> JoinHandle<()> {
        tokio::spawn(
            pipe_pools(
                Arc::clone(&self.listeners),
                Arc::clone(&self.connections),
                conns,
                self.options.connection_ttl,
            )
            .instrument(self.span.clone()),
        )
    }
}

// ============================================================================
// TcpProtocol - Accessors
// ============================================================================

impl TcpProtocol {
    /// Returns this instance's unique ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ProtocolId {
        self.id
    }

    /// Returns the options this instance was built with.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Returns the listener pool.
    #[inline]
    #[must_use]
    pub fn listener_pool(&self) -> &Arc<ListenerPool> {
        &self.listeners
    }

    /// Returns the connection pool.
    #[inline]
    #[must_use]
    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }
}

// ============================================================================
// TcpProtocol - Listen / Send
// ============================================================================

impl TcpProtocol {
    async fn listen_on(&self, target: &Target) -> Result<SocketAddr> {
        let target = target
            .clone()
            .with_default_host(&self.options.listen_host)
            .with_default_port(self.network());

        let laddr = self.resolve_target(&target).await?;

        let listener = TcpListener::bind(laddr).await.map_err(|e| {
            Error::listen(
                e,
                format!("listen on {} {laddr} address", self.network()),
                self.to_string(),
            )
        })?;
        let bound = listener.local_addr()?;

        info!(%bound, "Begin listening");

        // Keyed by port alone so the listener is found whatever interface it is on.
        let key = ListenerKey::for_port(bound.port());
        self.listeners.put(key, listener)?;

        Ok(bound)
    }

    async fn send_to(&self, target: &Target, msg: &dyn Message) -> Result<()> {
        let target = target.clone().with_default_port(self.network());

        if !target.has_host() {
            return Err(Error::invalid_target(
                "empty remote target host",
                format!("fill remote target {target}"),
                self.to_string(),
            ));
        }

        let raddr = self.resolve_target(&target).await?;
        let conn = self.get_or_create_connection(raddr).await?;

        info!(sip_message = %msg.short(), %raddr, "Writing SIP message");

        let data = msg.wire_text();
        if let Err(e) = conn.write(data.as_bytes()).await {
            if self.options.evict_on_write_error && self.connections.evict(&conn).await {
                warn!(protocol_connection = %conn, error = %e, "Evicted connection after failed write");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn resolve_target(&self, target: &Target) -> Result<SocketAddr> {
        let operation = || format!("resolve target {target} address");

        let mut addrs = lookup_host(target.addr())
            .await
            .map_err(|e| Error::resolve(e, operation(), self.to_string()))?;

        addrs.next().ok_or_else(|| {
            Error::resolve(
                IoError::new(ErrorKind::AddrNotAvailable, "no addresses found"),
                operation(),
                self.to_string(),
            )
        })
    }
}

// ============================================================================
// TcpProtocol - Connection Reuse
// ============================================================================

impl TcpProtocol {
    async fn get_or_create_connection(&self, raddr: SocketAddr) -> Result<Connection> {
        let key = ConnectionKey::from(raddr);

        if !self.options.serialize_dials {
            return self.lookup_or_dial(raddr, &key).await;
        }

        let dial_lock = DialLock::join(&self.dial_locks, key.clone());
        let _serialized = dial_lock.lock.lock().await;
        self.lookup_or_dial(raddr, &key).await
    }

    async fn lookup_or_dial(&self, raddr: SocketAddr, key: &ConnectionKey) -> Result<Connection> {
        let ttl = self.options.connection_ttl;

        if let Ok(conn) = self.connections.get(key) {
            if self.options.refresh_ttl_on_reuse {
                self.connections.refresh(key, ttl);
            }
            return Ok(conn);
        }

        debug!(%raddr, "Connection for remote address not found, create a new one");

        let stream = TcpStream::connect(raddr).await.map_err(|e| {
            Error::dial(
                e,
                format!("connect to {} {raddr} address", self.network()),
                self.to_string(),
            )
        })?;

        let conn = Connection::new(stream)?;
        if let Err(e) = self.connections.put(conn.key(), conn.clone(), ttl) {
            conn.close().await;
            return Err(e);
        }

        Ok(conn)
    }
}

// ============================================================================
// Protocol Implementation
// ============================================================================

#[async_trait]
impl Protocol for TcpProtocol {
    fn network(&self) -> Network {
        Network::Tcp
    }

    fn reliable(&self) -> bool {
        true
    }

    fn streamed(&self) -> bool {
        true
    }

    async fn listen(&self, target: &Target) -> Result<SocketAddr> {
        self.listen_on(target).instrument(self.span.clone()).await
    }

    async fn send(&self, target: &Target, msg: &dyn Message) -> Result<()> {
        self.send_to(target, msg).instrument(self.span.clone()).await
    }

    async fn done(&self) {
        self.connections.done().await;
    }
}

impl fmt::Display for TcpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} protocol {}", self.network(), self.id)
    }
}

impl fmt::Debug for TcpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProtocol")
            .field("id", &self.id)
            .field("listeners", &self.listeners.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Moves accepted connections into the connection pool until the listener
/// pool stops.
async fn pipe_pools(
    listeners: Arc<ListenerPool>,
    connections: Arc<ConnectionPool>,
    mut conns: HandoffReceiver<Connection>,
    ttl: Duration,
) {
    debug!("Start pipe pools");

    loop {
        tokio::select! {
            biased;
            _ = listeners.done() => break,
            conn = conns.recv() => {
                let Some(conn) = conn else { break };

                // Accepted connections are opportunistic: a rejected put is
                // logged, never propagated.
                if let Err(e) = connections.put(conn.key(), conn.clone(), ttl) {
                    error!(protocol_connection = %conn, error = %e, "Put new TCP connection failed");
                }
            }
        }
    }

    conns.close();
    debug!("Stop pipe pools");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpSocket;
    use tokio::time::{sleep, timeout};

    use crate::message::RawMessage;

    const OPTIONS_MSG: &str = "OPTIONS sip:bob@127.0.0.1 SIP/2.0\r\n\
                               Via: SIP/2.0/TCP 127.0.0.1:5060\r\n\
                               Content-Length: 0\r\n\
                               \r\n";

    struct Fixture {
        tcp: TcpProtocol,
        inbound: mpsc::Receiver<IncomingMessage>,
        _errors: mpsc::UnboundedReceiver<Error>,
        cancel: CancellationToken,
    }

    fn fixture(options: TransportOptions) -> Fixture {
        let (output, inbound) = mpsc::channel(16);
        let (errs, errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tcp = TcpProtocol::spawn(output, errs, cancel.clone(), options);
        Fixture {
            tcp,
            inbound,
            _errors: errors,
            cancel,
        }
    }

    async fn wait_pooled(tcp: &TcpProtocol, key: &ConnectionKey) -> Connection {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(conn) = tcp.connection_pool().get(key) {
                    return conn;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should be pooled")
    }

    #[tokio::test]
    async fn test_static_capabilities() {
        let fx = fixture(TransportOptions::new());
        assert_eq!(fx.tcp.network(), Network::Tcp);
        assert!(fx.tcp.reliable());
        assert!(fx.tcp.streamed());
        assert!(fx.tcp.to_string().starts_with("tcp protocol "));
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_empty_host_is_validation_error() {
        let fx = fixture(TransportOptions::new());
        let msg = RawMessage::new(OPTIONS_MSG);

        let err = fx.tcp.send(&Target::port(5060), &msg).await.unwrap_err();
        assert!(err.is_validation_error());

        let (operation, protocol) = err.protocol_info().expect("protocol info");
        assert_eq!(operation, "fill remote target :5060");
        assert_eq!(protocol, fx.tcp.to_string());
        assert!(fx.tcp.connection_pool().is_empty());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_listen_defaults_to_wildcard_key() {
        let fx = fixture(TransportOptions::new());

        let bound = fx.tcp.listen(&Target::port(0)).await.expect("listen");
        assert!(bound.ip().is_unspecified());

        let key = ListenerKey::for_port(bound.port());
        assert_eq!(key.as_str(), format!("0.0.0.0:{}", bound.port()));
        assert!(fx.tcp.listener_pool().contains(&key));

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_listen_on_interface_still_keyed_by_port() {
        let fx = fixture(TransportOptions::new());

        let bound = fx
            .tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .expect("listen");
        assert_eq!(bound.ip().to_string(), "127.0.0.1");
        assert!(
            fx.tcp
                .listener_pool()
                .contains(&ListenerKey::for_port(bound.port()))
        );

        let err = fx
            .tcp
            .listen(&Target::new("127.0.0.2", bound.port()))
            .await;
        // Either the bind or the duplicate key stops a second listener on the port.
        assert!(err.is_err());
        assert_eq!(fx.tcp.listener_pool().len(), 1);

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_accepted_connection_is_pooled() {
        let fx = fixture(TransportOptions::new());
        let bound = fx
            .tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .expect("listen");

        let client = TcpStream::connect(bound).await.expect("connect");
        let key = ConnectionKey::from(client.local_addr().unwrap());

        let pooled = wait_pooled(&fx.tcp, &key).await;
        assert_eq!(pooled.remote_addr(), client.local_addr().unwrap());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_inbound_message_reaches_output() {
        let mut fx = fixture(TransportOptions::new());
        let bound = fx
            .tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .expect("listen");

        let mut client = TcpStream::connect(bound).await.expect("connect");
        client
            .write_all(OPTIONS_MSG.as_bytes())
            .await
            .expect("write");

        let incoming = timeout(Duration::from_secs(2), fx.inbound.recv())
            .await
            .expect("message in time")
            .expect("channel open");
        assert_eq!(incoming.text, OPTIONS_MSG);
        assert_eq!(incoming.source, client.local_addr().unwrap());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_dials_then_reuses() {
        let fx = fixture(TransportOptions::new());
        let peer = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let peer_addr = peer.local_addr().unwrap();
        let target = Target::new("127.0.0.1", peer_addr.port());
        let msg = RawMessage::new(OPTIONS_MSG);

        fx.tcp.send(&target, &msg).await.expect("first send");

        let (mut stream, _) = timeout(Duration::from_secs(2), peer.accept())
            .await
            .expect("dial in time")
            .expect("accept");
        let mut buf = vec![0u8; OPTIONS_MSG.len()];
        stream.read_exact(&mut buf).await.expect("read first");
        assert_eq!(buf, OPTIONS_MSG.as_bytes());

        let key = ConnectionKey::from(peer_addr);
        let first = fx.tcp.connection_pool().get(&key).expect("pooled");

        fx.tcp.send(&target, &msg).await.expect("second send");
        stream.read_exact(&mut buf).await.expect("read second");
        assert_eq!(buf, OPTIONS_MSG.as_bytes());

        let second = fx.tcp.connection_pool().get(&key).expect("still pooled");
        assert!(first.same_as(&second));
        assert!(
            timeout(Duration::from_millis(200), peer.accept())
                .await
                .is_err(),
            "second send must not dial again"
        );

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_dial_failure() {
        let fx = fixture(TransportOptions::new());
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            probe.local_addr().unwrap().port()
        };

        let err = fx
            .tcp
            .send(&Target::new("127.0.0.1", port), &RawMessage::new(OPTIONS_MSG))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Dial { .. }));
        let (operation, _) = err.protocol_info().unwrap();
        assert_eq!(operation, format!("connect to tcp 127.0.0.1:{port} address"));
        assert!(fx.tcp.connection_pool().is_empty());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_resolve_failure() {
        let fx = fixture(TransportOptions::new());

        let err = fx
            .tcp
            .send(&Target::new("host.invalid", 5060), &RawMessage::new(OPTIONS_MSG))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Resolve { .. }));
        assert!(
            err.to_string()
                .contains("resolve target host.invalid:5060 address")
        );

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_listen_bind_failure_registers_nothing() {
        let fx = fixture(TransportOptions::new());
        let occupied = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = occupied.local_addr().unwrap().port();

        let err = fx
            .tcp
            .listen(&Target::new("127.0.0.1", port))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Listen { .. }));
        let (operation, protocol) = err.protocol_info().unwrap();
        assert_eq!(operation, format!("listen on tcp 127.0.0.1:{port} address"));
        assert_eq!(protocol, fx.tcp.to_string());
        assert!(fx.tcp.listener_pool().is_empty());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_bridge_survives_duplicate_key() {
        let fx = fixture(TransportOptions::new());
        let bound = fx
            .tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .expect("listen");

        // Reserve the client's source address so its pool key is known up front.
        let socket = TcpSocket::new_v4().expect("socket");
        socket.bind("127.0.0.1:0".parse().unwrap()).expect("bind client");
        let clashing_key = ConnectionKey::from(socket.local_addr().unwrap());

        let squatter_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let (squatter, _squatter_peer) = tokio::join!(
            TcpStream::connect(squatter_listener.local_addr().unwrap()),
            squatter_listener.accept()
        );
        let squatter = Connection::new(squatter.expect("connect")).expect("wrap");
        fx.tcp
            .connection_pool()
            .put(clashing_key.clone(), squatter.clone(), Duration::from_secs(60))
            .expect("pre-insert");

        let _rejected = socket.connect(bound).await.expect("connect clashing");
        sleep(Duration::from_millis(100)).await;
        assert!(
            fx.tcp
                .connection_pool()
                .get(&clashing_key)
                .unwrap()
                .same_as(&squatter)
        );

        let next = TcpStream::connect(bound).await.expect("connect next");
        wait_pooled(&fx.tcp, &ConnectionKey::from(next.local_addr().unwrap())).await;

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_serialized_concurrent_sends_dial_once() {
        let fx = fixture(TransportOptions::new().with_serialize_dials());
        let peer = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let target = Target::new("127.0.0.1", peer.local_addr().unwrap().port());
        let msg = RawMessage::new(OPTIONS_MSG);

        let accepts = tokio::spawn(async move {
            let mut accepted = Vec::new();
            while let Ok(Ok((stream, _))) =
                timeout(Duration::from_millis(300), peer.accept()).await
            {
                accepted.push(stream);
            }
            accepted
        });

        let sends = (0..8).map(|_| fx.tcp.send(&target, &msg));
        let results = futures_util::future::join_all(sends).await;
        assert!(results.iter().all(|result| result.is_ok()));

        let accepted = accepts.await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(fx.tcp.connection_pool().len(), 1);
        assert!(fx.tcp.dial_locks.lock().is_empty());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_reuse_refreshes_ttl_when_enabled() {
        let options = TransportOptions::new()
            .with_connection_ttl(Duration::from_millis(300))
            .with_refresh_ttl_on_reuse();
        let fx = fixture(options);
        let peer = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let peer_addr = peer.local_addr().unwrap();
        let target = Target::new("127.0.0.1", peer_addr.port());
        let msg = RawMessage::new(OPTIONS_MSG);
        let key = ConnectionKey::from(peer_addr);

        fx.tcp.send(&target, &msg).await.expect("first send");
        let (_stream, _) = peer.accept().await.expect("accept");
        let first = fx.tcp.connection_pool().get(&key).expect("pooled");

        sleep(Duration::from_millis(200)).await;
        fx.tcp.send(&target, &msg).await.expect("reuse");

        sleep(Duration::from_millis(200)).await;
        let still = fx.tcp.connection_pool().get(&key).expect("ttl refreshed");
        assert!(still.same_as(&first));

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (output, _inbound) = mpsc::channel(1);
        let (errs, _errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tcp = TcpProtocol::new(output, errs, cancel.clone(), TransportOptions::new());

        tcp.start().expect("first start");
        assert!(matches!(tcp.start(), Err(Error::AlreadyStarted)));

        cancel.cancel();
        timeout(Duration::from_secs(2), tcp.join())
            .await
            .expect("bridge should exit");
        assert!(matches!(tcp.start(), Err(Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_done_follows_cancellation() {
        let fx = fixture(TransportOptions::new());
        fx.tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .expect("listen");

        fx.cancel.cancel();
        timeout(Duration::from_secs(2), fx.tcp.done())
            .await
            .expect("connection pool should stop");
        timeout(Duration::from_secs(2), fx.tcp.join())
            .await
            .expect("bridge should stop");

        assert!(fx.tcp.listener_pool().is_done());
        let err = fx
            .tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolClosed { .. }));
    }

    #[tokio::test]
    async fn test_try_new_rejects_invalid_options() {
        let (output, _inbound) = mpsc::channel(1);
        let (errs, _errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let zero_ttl = TransportOptions::new().with_connection_ttl(Duration::ZERO);
        let err = TcpProtocol::try_spawn(output.clone(), errs.clone(), cancel.clone(), zero_ttl)
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let tcp = TcpProtocol::try_new(output, errs, cancel.clone(), TransportOptions::new())
            .expect("defaults are valid");
        tcp.start().expect("start");

        cancel.cancel();
        timeout(Duration::from_secs(2), tcp.join())
            .await
            .expect("bridge should stop");
    }

    #[tokio::test]
    async fn test_full_output_does_not_block_done() {
        let (output, _unread) = mpsc::channel(1);
        let (errs, _errors) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tcp = TcpProtocol::spawn(output, errs, cancel.clone(), TransportOptions::new());

        let bound = tcp
            .listen(&Target::new("127.0.0.1", 0))
            .await
            .expect("listen");
        let mut client = TcpStream::connect(bound).await.expect("connect");
        client
            .write_all(OPTIONS_MSG.repeat(3).as_bytes())
            .await
            .expect("write");
        sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        timeout(Duration::from_secs(3), tcp.done())
            .await
            .expect("connection pool should stop with nobody reading output");
        timeout(Duration::from_secs(2), tcp.join())
            .await
            .expect("bridge should stop");
    }

    async fn pooled_peer(fx: &Fixture) -> (Target, ConnectionKey, TcpStream, Connection) {
        let peer = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let peer_addr = peer.local_addr().unwrap();
        let target = Target::new("127.0.0.1", peer_addr.port());

        fx.tcp
            .send(&target, &RawMessage::new(OPTIONS_MSG))
            .await
            .expect("first send");
        let (stream, _) = peer.accept().await.expect("accept");

        let key = ConnectionKey::from(peer_addr);
        let conn = fx.tcp.connection_pool().get(&key).expect("pooled");
        (target, key, stream, conn)
    }

    #[tokio::test]
    async fn test_write_error_keeps_entry_by_default() {
        let fx = fixture(TransportOptions::new());
        let (target, key, _stream, conn) = pooled_peer(&fx).await;

        conn.shutdown_write().await.expect("shutdown write");
        let err = fx
            .tcp
            .send(&target, &RawMessage::new(OPTIONS_MSG))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(!err.is_protocol_error());
        let still = fx.tcp.connection_pool().get(&key).expect("entry kept");
        assert!(still.same_as(&conn));

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_write_error_evicts_when_enabled() {
        let fx = fixture(TransportOptions::new().with_evict_on_write_error());
        let (target, key, _stream, conn) = pooled_peer(&fx).await;

        // Another connection to a different peer must survive the eviction.
        let (_other_target, other_key, _other_stream, other) = pooled_peer(&fx).await;

        conn.shutdown_write().await.expect("shutdown write");
        let err = fx
            .tcp
            .send(&target, &RawMessage::new(OPTIONS_MSG))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(fx.tcp.connection_pool().get(&key).is_err());
        assert!(conn.is_closed());
        assert!(
            fx.tcp
                .connection_pool()
                .get(&other_key)
                .expect("other entry kept")
                .same_as(&other)
        );

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unserialized_first_sends_race() {
        let fx = fixture(TransportOptions::new());
        let peer = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let peer_addr = peer.local_addr().unwrap();
        let target = Target::new("127.0.0.1", peer_addr.port());
        let msg = RawMessage::new(OPTIONS_MSG);

        let accepts = tokio::spawn(async move {
            let mut accepted = Vec::new();
            while let Ok(Ok((stream, _))) =
                timeout(Duration::from_millis(300), peer.accept()).await
            {
                accepted.push(stream);
            }
            accepted
        });

        let sends = (0..4).map(|_| fx.tcp.send(&target, &msg));
        let results = futures_util::future::join_all(sends).await;

        let winners = results.iter().filter(|result| result.is_ok()).count();
        let losers = results
            .iter()
            .filter(|result| matches!(result, Err(Error::ConnectionExists { .. })))
            .count();
        assert_eq!(winners + losers, results.len());
        assert!(winners >= 1);
        assert!(losers >= 1, "every send dials before any insert");

        assert_eq!(fx.tcp.connection_pool().len(), 1);
        let pooled = fx
            .tcp
            .connection_pool()
            .get(&ConnectionKey::from(peer_addr))
            .expect("one entry");

        // Every losing socket is closed; the peer reads EOF on it.
        let mut accepted = accepts.await.unwrap();
        assert_eq!(accepted.len(), results.len());
        let mut closed = 0;
        for stream in &mut accepted {
            let mut buf = [0u8; 1];
            if let Ok(Ok(0)) = timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
                closed += 1;
            }
        }
        assert_eq!(closed, losers);
        assert!(!pooled.is_closed());

        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancelled_send_releases_dial_lock() {
        let fx = fixture(TransportOptions::new().with_serialize_dials());
        let peer = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
        let peer_addr = peer.local_addr().unwrap();
        let target = Target::new("127.0.0.1", peer_addr.port());
        let msg = RawMessage::new(OPTIONS_MSG);
        let key = ConnectionKey::from(peer_addr);

        // Hold the address's dial lock so the send parks waiting for it.
        let holder = DialLock::join(&fx.tcp.dial_locks, key.clone());
        let held = holder.lock.lock().await;

        let mut send = fx.tcp.send(&target, &msg);
        assert!(futures_util::FutureExt::now_or_never(&mut send).is_none());

        // The holder leaves first while the send still waits, then the
        // send is dropped before it runs again.
        drop(held);
        drop(holder);
        assert_eq!(fx.tcp.dial_locks.lock().len(), 1);
        drop(send);

        assert!(fx.tcp.dial_locks.lock().is_empty());
        assert!(fx.tcp.connection_pool().is_empty());

        fx.cancel.cancel();
    }
}
