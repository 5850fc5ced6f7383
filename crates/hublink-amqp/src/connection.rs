//! The AMQP connection state machine.
//!
//! One `AmqpConnection` owns one engine connection, one session, and one
//! sender/receiver link pair. Engine events are handled on the reactor thread
//! through a single dispatch function; the public `open`/`close`/
//! `send_message` calls run on caller threads and block with a bounded
//! timeout where the contract requires it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::{
    DeliveryOutcome, Engine, EngineEvent, LinkRole, TlsContext, AMQP_PORT, AMQP_WEB_SOCKET_PORT,
    WEB_SOCKET_PATH, WEB_SOCKET_SUB_PROTOCOL,
};
use crate::error::{AmqpError, Result};
use crate::link::LinkOperations;
use crate::message::AmqpMessage;
use crate::reactor::{PumpFlow, ReactorPump};
use crate::sasl::{SaslHandler, SaslNegotiator};
use crate::sync::Gate;

const DEFAULT_OPEN_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const INITIAL_ENCODE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Result of a sent delivery as reported by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Failed(String),
}

/// Callbacks invoked from the reactor thread. Implementations must not call
/// back into the connection; hand work off to another thread instead.
pub trait AmqpListener: Send + Sync {
    fn connection_established(&self);
    fn connection_lost(&self);
    fn message_received(&self, message: AmqpMessage);
    fn message_sent(&self, delivery_tag: &str, outcome: &SendOutcome);
}

struct Shared {
    state: ConnectionState,
    link_credit: i32,
    next_tag: i64,
}

struct Core {
    hostname: String,
    full_host_address: String,
    use_websocket: bool,
    tls: TlsContext,
    shared: Mutex<Shared>,
    engine: Mutex<Box<dyn Engine>>,
    links: Mutex<LinkOperations>,
    sasl: Option<Mutex<SaslNegotiator>>,
    listener: Mutex<Option<Arc<dyn AmqpListener>>>,
    open_gate: Gate,
    close_gate: Gate,
}

/// One logical AMQP connection to the hub.
pub struct AmqpConnection {
    core: Arc<Core>,
    pump: Mutex<Option<ReactorPump>>,
    open_timeout: Duration,
    shutdown_grace: Duration,
}

impl AmqpConnection {
    /// Creates the connection wrapper. No network activity happens until
    /// [`AmqpConnection::open`].
    ///
    /// `sasl_handler` may be `None` when no SASL frames will be exchanged
    /// (certificate-based authentication).
    ///
    /// # Errors
    ///
    /// Returns an argument error for an empty hostname.
    pub fn new(
        hostname: &str,
        links: LinkOperations,
        engine: Box<dyn Engine>,
        tls: TlsContext,
        sasl_handler: Option<Box<dyn SaslHandler>>,
        use_websocket: bool,
    ) -> Result<Self> {
        if hostname.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "the hostname cannot be empty".to_string(),
            ));
        }

        let port = if use_websocket {
            AMQP_WEB_SOCKET_PORT
        } else {
            AMQP_PORT
        };

        let core = Core {
            hostname: hostname.to_string(),
            full_host_address: format!("{hostname}:{port}"),
            use_websocket,
            tls,
            shared: Mutex::new(Shared {
                state: ConnectionState::Idle,
                link_credit: -1,
                next_tag: 0,
            }),
            engine: Mutex::new(engine),
            links: Mutex::new(links),
            sasl: sasl_handler.map(|handler| Mutex::new(SaslNegotiator::new(handler))),
            listener: Mutex::new(None),
            open_gate: Gate::new(),
            close_gate: Gate::new(),
        };

        Ok(Self {
            core: Arc::new(core),
            pump: Mutex::new(None),
            open_timeout: DEFAULT_OPEN_CLOSE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn set_listener(&self, listener: Arc<dyn AmqpListener>) {
        *self.core.listener.lock() = Some(listener);
    }

    /// Whether the connection is currently open.
    ///
    /// # Errors
    ///
    /// Raises the saved SASL negotiation error, if one was captured.
    pub fn is_connected(&self) -> Result<bool> {
        if let Some(saved) = self.saved_sasl_error() {
            return Err(saved);
        }
        Ok(self.core.shared.lock().state.is_open())
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.shared.lock().state
    }

    #[must_use]
    pub fn link_credit(&self) -> i32 {
        self.core.shared.lock().link_credit
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.core.hostname
    }

    #[must_use]
    pub fn full_host_address(&self) -> &str {
        &self.core.full_host_address
    }

    #[must_use]
    pub fn sender_tag(&self) -> String {
        self.core.links.lock().sender_tag().to_string()
    }

    #[must_use]
    pub fn receiver_tag(&self) -> String {
        self.core.links.lock().receiver_tag().to_string()
    }

    /// Opens the connection, parking the calling thread until the receiver
    /// link is remotely open or the ceiling elapses.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the open did not complete within the ceiling;
    /// the half-open connection is torn down first.
    pub fn open(&self) -> Result<()> {
        if self.core.shared.lock().state.is_open() {
            return Ok(());
        }

        self.core.open_gate.reset();
        self.core.close_gate.reset();
        self.core.shared.lock().state = ConnectionState::Opening;

        let events = self.core.engine.lock().start()?;
        let core = Arc::clone(&self.core);
        let pump = ReactorPump::spawn("hublink-amqp-reactor", events, move |event| {
            core.handle_event(event)
        })?;
        *self.pump.lock() = Some(pump);

        let released = self.core.open_gate.wait_timeout(self.open_timeout);
        if !self.core.shared.lock().state.is_open() {
            warn!(released, "connection did not reach the open state; tearing down");
            let _ = self.close();
            if released {
                return Err(AmqpError::Io("failed to open the connection".to_string()));
            }
            return Err(AmqpError::Io(
                "timed out waiting for the connection to open".to_string(),
            ));
        }

        info!(address = %self.core.full_host_address, "amqp connection open");
        Ok(())
    }

    /// Closes the connection: links, session, connection, then the engine.
    /// Blocks until the reactor reports finality, bounded by the same ceiling
    /// as `open`, then joins the pump thread within the shutdown grace
    /// period. Idempotent; never fails for "already closed".
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for engines that
    /// report close failures.
    pub fn close(&self) -> Result<()> {
        let pump = self.pump.lock().take();
        let Some(pump) = pump else {
            self.core.shared.lock().state = ConnectionState::Closed;
            return Ok(());
        };

        self.core.shared.lock().state = ConnectionState::Closing;

        {
            let mut engine = self.core.engine.lock();
            self.core.links.lock().close_links(&mut **engine);
            engine.close_session();
            engine.close_connection();
            engine.stop();
        }

        if !self.core.close_gate.wait_timeout(self.open_timeout) {
            warn!("timed out waiting for the reactor to report finality");
        }
        pump.join_with_grace(self.shutdown_grace);

        self.core.shared.lock().state = ConnectionState::Closed;
        debug!("amqp connection closed");
        Ok(())
    }

    /// Sends an application message on the sender link.
    ///
    /// Returns `Ok(false)`, without any I/O, when the connection is not
    /// open or the message encoded to nothing; `Ok(true)` once the transfer
    /// was handed to the link layer.
    ///
    /// # Errors
    ///
    /// Raises the saved SASL error if negotiation failed, or a link error if
    /// the transfer itself is rejected by the engine.
    pub fn send_message(&self, message: &AmqpMessage) -> Result<bool> {
        Ok(self.send_message_with_tag(message)?.is_some())
    }

    /// Same as [`AmqpConnection::send_message`], but yields the delivery tag
    /// assigned to the transfer so callers can correlate the later
    /// acknowledgment.
    ///
    /// # Errors
    ///
    /// See [`AmqpConnection::send_message`].
    pub fn send_message_with_tag(&self, message: &AmqpMessage) -> Result<Option<String>> {
        if let Some(saved) = self.saved_sasl_error() {
            return Err(saved);
        }
        if !self.core.shared.lock().state.is_open() {
            return Ok(None);
        }

        // The encode buffer grows by doubling until the message fits; an
        // undersized buffer is a fitting adjustment, not an error.
        let mut buffer = BytesMut::zeroed(INITIAL_ENCODE_BUFFER_SIZE);
        let length = loop {
            let encoded = self.core.engine.lock().encode_message(message, &mut buffer);
            match encoded {
                Ok(length) => break length,
                Err(_) => {
                    let grown = buffer.len() * 2;
                    buffer = BytesMut::zeroed(grown);
                }
            }
        };

        if length == 0 {
            return Ok(None);
        }

        let tag = self.next_delivery_tag();
        {
            let mut engine = self.core.engine.lock();
            self.core.links.lock().send_message(
                &mut **engine,
                tag.as_bytes(),
                &buffer[..length],
                length,
                0,
            )?;
        }
        Ok(Some(tag))
    }

    /// Delivery tags are monotonically increasing and wrap to 0 strictly
    /// before the maximum representable value; -1 is the engine's designated
    /// failure sentinel and is never produced here.
    fn next_delivery_tag(&self) -> String {
        let mut shared = self.core.shared.lock();
        if shared.next_tag == i64::MAX || shared.next_tag < 0 {
            shared.next_tag = 0;
        }
        let tag = shared.next_tag;
        shared.next_tag += 1;
        tag.to_string()
    }

    fn saved_sasl_error(&self) -> Option<AmqpError> {
        self.core
            .sasl
            .as_ref()
            .and_then(|negotiator| negotiator.lock().saved_error())
    }

    #[cfg(test)]
    fn set_next_tag(&self, value: i64) {
        self.core.shared.lock().next_tag = value;
    }
}

impl Core {
    /// The single event dispatch, invoked serially on the reactor thread.
    fn handle_event(&self, event: EngineEvent) -> PumpFlow {
        debug!(?event, "reactor event");
        match event {
            EngineEvent::ReactorInit => {
                let port = if self.use_websocket {
                    AMQP_WEB_SOCKET_PORT
                } else {
                    AMQP_PORT
                };
                if let Err(e) = self.engine.lock().connect_to_host(&self.hostname, port) {
                    warn!(error = %e, "could not start the connection to the host");
                }
            }
            EngineEvent::ReactorFinal => {
                self.close_gate.open();
                return PumpFlow::Stop;
            }
            EngineEvent::ConnectionBound => self.on_connection_bound(),
            EngineEvent::ConnectionInit => self.on_connection_init(),
            EngineEvent::ConnectionUnbound => {
                self.shared.lock().state = ConnectionState::Closed;
            }
            EngineEvent::LinkInit { name } => {
                let mut engine = self.engine.lock();
                if let Err(e) = self.links.lock().init_link(&mut **engine, &name) {
                    warn!(link = %name, error = %e, "link initialization failed");
                }
            }
            EngineEvent::LinkRemoteOpen { name } => self.on_link_remote_open(&name),
            EngineEvent::LinkRemoteClose { name } => {
                // Sender and receiver close together; the dispatch layer owns
                // any reconnection, so this is informational only.
                debug!(link = %name, "remote peer closed a link");
            }
            EngineEvent::LinkFlow { name, credit } => {
                debug!(link = %name, credit, "link flow");
                self.shared.lock().link_credit = credit;
            }
            EngineEvent::Delivery { name } => self.on_delivery(&name),
            EngineEvent::TransportError { condition } => {
                warn!(condition = %condition, "transport error; connection is closed");
                self.shared.lock().state = ConnectionState::Closed;
                if let Some(listener) = self.listener() {
                    listener.connection_lost();
                }
            }
            EngineEvent::TransportHeadClosed => {
                // Lets a blocked open() observe the failure promptly.
                self.open_gate.open();
            }
            EngineEvent::SaslMechanisms => {
                self.with_sasl(|negotiator, frames| negotiator.on_mechanisms(frames));
            }
            EngineEvent::SaslChallenge => {
                self.with_sasl(|negotiator, frames| negotiator.on_challenge(frames));
            }
            EngineEvent::SaslOutcome => {
                self.with_sasl(|negotiator, frames| negotiator.on_outcome(frames));
            }
        }
        PumpFlow::Continue
    }

    fn on_connection_bound(&self) {
        let mut engine = self.engine.lock();
        if self.use_websocket {
            if let Err(e) =
                engine.bind_websocket(&self.hostname, WEB_SOCKET_PATH, WEB_SOCKET_SUB_PROTOCOL)
            {
                warn!(error = %e, "could not attach the websocket layer");
            }
        }
        if let Err(e) = engine.bind_tls(&self.tls) {
            warn!(error = %e, "could not attach the tls layer");
        }
    }

    fn on_connection_init(&self) {
        let mut engine = self.engine.lock();
        if let Err(e) = engine.open_connection(&self.full_host_address) {
            warn!(error = %e, "could not open the connection");
            return;
        }
        if let Err(e) = engine.open_session() {
            warn!(error = %e, "could not open the session");
            return;
        }
        if let Err(e) = self.links.lock().open_links(&mut **engine) {
            warn!(error = %e, "could not open the links");
        }
    }

    fn on_link_remote_open(&self, name: &str) {
        let is_receiver = {
            let mut links = self.links.lock();
            links.mark_remote_open(name);
            links.is_receiver_tag(name)
        };

        // The receiver link opens last; only then is the connection usable.
        if is_receiver {
            self.shared.lock().state = ConnectionState::Open;
            if let Some(listener) = self.listener() {
                listener.connection_established();
            }
            self.open_gate.open();
        }
    }

    fn on_delivery(&self, name: &str) {
        let decoded = {
            let mut engine = self.engine.lock();
            self.links
                .lock()
                .receiver_message_from_link(&mut **engine, name)
        };

        match decoded {
            Ok(Some(message)) => {
                if let Some(listener) = self.listener() {
                    listener.message_received(message);
                } else {
                    debug!("inbound message dropped; no listener registered");
                }
            }
            Ok(None) => self.on_sender_disposition(name),
            Err(e) => {
                warn!(link = %name, error = %e, "failed to read an inbound delivery");
            }
        }
    }

    /// Sender-side half of the delivery event: classify the remote state and
    /// settle. The delivery is settled exactly once, so a re-entered event
    /// for the same delivery finds nothing unsettled and is a no-op.
    fn on_sender_disposition(&self, name: &str) {
        let settled = {
            let mut engine = self.engine.lock();
            if engine.link_role(name) != Some(LinkRole::Sender) {
                None
            } else if let Some((tag, outcome)) = engine.remote_delivery_outcome(name) {
                engine.settle_delivery(name);
                Some((tag, outcome))
            } else {
                None
            }
        };

        let Some((tag, outcome)) = settled else {
            debug!(link = %name, "no readable delivery on the link");
            return;
        };

        let Some(listener) = self.listener() else {
            return;
        };
        if outcome == DeliveryOutcome::Accepted {
            listener.message_sent(&tag, &SendOutcome::Accepted);
        } else {
            let reason = format!("message was not accepted by the remote peer: {outcome}");
            listener.message_sent(&tag, &SendOutcome::Failed(reason));
        }
    }

    fn with_sasl(&self, f: impl FnOnce(&mut SaslNegotiator, &mut dyn crate::engine::SaslFrames)) {
        let Some(negotiator) = self.sasl.as_ref() else {
            debug!("sasl event received but no handler is configured");
            return;
        };
        let mut engine = self.engine.lock();
        let Some(frames) = engine.sasl() else {
            warn!("sasl event received but the engine has no sasl layer");
            return;
        };
        f(&mut negotiator.lock(), frames);
    }

    fn listener(&self) -> Option<Arc<dyn AmqpListener>> {
        self.listener.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LinkProperties, SaslResult};
    use crate::testing::{wait_until, MockEngine, MockEngineHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingListener {
        established: AtomicUsize,
        lost: AtomicUsize,
        received: Mutex<Vec<AmqpMessage>>,
        sent: Mutex<Vec<(String, SendOutcome)>>,
    }

    impl AmqpListener for RecordingListener {
        fn connection_established(&self) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        fn message_received(&self, message: AmqpMessage) {
            self.received.lock().push(message);
        }

        fn message_sent(&self, delivery_tag: &str, outcome: &SendOutcome) {
            self.sent
                .lock()
                .push((delivery_tag.to_string(), outcome.clone()));
        }
    }

    fn link_pair() -> LinkOperations {
        LinkOperations::new(
            "dev-1",
            "/devices/dev-1/messages/events",
            "/devices/dev-1/messages/devicebound",
            LinkProperties::new(),
        )
    }

    fn connection(use_websocket: bool) -> (AmqpConnection, MockEngineHandle) {
        let engine = MockEngine::new();
        let handle = engine.handle();
        let conn = AmqpConnection::new(
            "hub.example.test",
            link_pair(),
            Box::new(engine),
            TlsContext::platform(),
            None,
            use_websocket,
        )
        .unwrap()
        .with_open_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_secs(5));
        (conn, handle)
    }

    fn script_successful_open(conn: &AmqpConnection, handle: &MockEngineHandle) {
        handle.push_event(EngineEvent::ConnectionBound);
        handle.push_event(EngineEvent::ConnectionInit);
        handle.push_event(EngineEvent::LinkInit {
            name: conn.receiver_tag(),
        });
        handle.push_event(EngineEvent::LinkInit {
            name: conn.sender_tag(),
        });
        handle.push_event(EngineEvent::LinkRemoteOpen {
            name: conn.sender_tag(),
        });
        handle.push_event(EngineEvent::LinkRemoteOpen {
            name: conn.receiver_tag(),
        });
    }

    #[test]
    fn test_empty_hostname_fails_before_any_network_activity() {
        let engine = MockEngine::new();
        let handle = engine.handle();
        let result = AmqpConnection::new(
            "",
            link_pair(),
            Box::new(engine),
            TlsContext::platform(),
            None,
            false,
        );
        assert!(matches!(result, Err(AmqpError::InvalidArgument(_))));
        assert!(handle.connect_requests().is_empty());
    }

    #[test]
    fn test_full_host_address_depends_on_websocket() {
        let (plain, _) = connection(false);
        assert_eq!(plain.full_host_address(), "hub.example.test:5671");
        let (ws, _) = connection(true);
        assert_eq!(ws.full_host_address(), "hub.example.test:443");
    }

    #[test]
    fn test_open_reaches_the_open_state() {
        let (conn, handle) = connection(false);
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(listener.clone());

        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        assert!(conn.is_connected().unwrap());
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(listener.established.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.connect_requests(),
            vec![("hub.example.test".to_string(), AMQP_PORT)]
        );
        assert_eq!(
            handle.opened_connection().as_deref(),
            Some("hub.example.test:5671")
        );
        assert!(handle.tls_bound());
        assert!(handle.websocket_binding().is_none());

        conn.close().unwrap();
    }

    #[test]
    fn test_open_over_websocket_binds_the_framing_layer() {
        let (conn, handle) = connection(true);
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        assert_eq!(
            handle.connect_requests(),
            vec![("hub.example.test".to_string(), AMQP_WEB_SOCKET_PORT)]
        );
        assert_eq!(
            handle.websocket_binding(),
            Some((
                "hub.example.test".to_string(),
                WEB_SOCKET_PATH.to_string(),
                WEB_SOCKET_SUB_PROTOCOL.to_string()
            ))
        );

        conn.close().unwrap();
    }

    #[test]
    fn test_open_times_out_and_tears_down() {
        let (conn, handle) = connection(false);
        let conn = conn.with_open_timeout(Duration::from_millis(50));

        // Bound and initialized, but the receiver link never remote-opens.
        handle.push_event(EngineEvent::ConnectionBound);
        handle.push_event(EngineEvent::ConnectionInit);

        let result = conn.open();
        assert!(matches!(result, Err(AmqpError::Io(_))));
        assert!(!conn.is_connected().unwrap());
        assert!(handle.stopped());
    }

    #[test]
    fn test_transport_head_closed_releases_a_blocked_open() {
        let (conn, handle) = connection(false);
        handle.push_event(EngineEvent::TransportError {
            condition: "amqp:connection:framing-error".to_string(),
        });
        handle.push_event(EngineEvent::TransportHeadClosed);

        let started = std::time::Instant::now();
        let result = conn.open();
        assert!(result.is_err());
        // The gate released early; we did not ride out the full ceiling.
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_send_while_not_connected_returns_false_without_io() {
        let (conn, handle) = connection(false);
        let sent = conn.send_message(&AmqpMessage::new(b"hello".to_vec())).unwrap();
        assert!(!sent);
        assert!(handle.sent_deliveries().is_empty());
    }

    #[test]
    fn test_send_assigns_monotonic_tags() {
        let (conn, handle) = connection(false);
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        assert!(conn.send_message(&AmqpMessage::new(b"one".to_vec())).unwrap());
        assert!(conn.send_message(&AmqpMessage::new(b"two".to_vec())).unwrap());

        let deliveries = handle.sent_deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].0, "0");
        assert_eq!(deliveries[1].0, "1");

        conn.close().unwrap();
    }

    #[test]
    fn test_delivery_tags_wrap_before_the_maximum_and_never_go_negative() {
        let (conn, handle) = connection(false);
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        conn.set_next_tag(i64::MAX);
        assert!(conn.send_message(&AmqpMessage::new(b"a".to_vec())).unwrap());
        conn.set_next_tag(-5);
        assert!(conn.send_message(&AmqpMessage::new(b"b".to_vec())).unwrap());

        let tags: Vec<String> = handle.sent_deliveries().into_iter().map(|d| d.0).collect();
        assert_eq!(tags, vec!["0".to_string(), "0".to_string()]);

        conn.close().unwrap();
    }

    #[test]
    fn test_send_grows_the_encode_buffer_for_large_messages() {
        let (conn, handle) = connection(false);
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        let body = vec![7u8; 8 * INITIAL_ENCODE_BUFFER_SIZE];
        let message = AmqpMessage::new(body.clone());
        assert!(conn.send_message(&message).unwrap());

        let deliveries = handle.sent_deliveries();
        assert_eq!(deliveries.len(), 1);
        let decoded = handle.decode(&deliveries[0].1);
        assert_eq!(decoded.body(), body.as_slice());

        conn.close().unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, handle) = connection(false);
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        conn.close().unwrap();
        conn.close().unwrap();
        conn.close().unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(handle.stop_count(), 1);
        assert_eq!(handle.closed_links().len(), 2);
    }

    #[test]
    fn test_close_before_open_is_safe() {
        let (conn, handle) = connection(false);
        conn.close().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(handle.stop_count(), 0);
    }

    #[test]
    fn test_transport_error_closes_and_notifies() {
        let (conn, handle) = connection(false);
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(listener.clone());
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        handle.push_event(EngineEvent::TransportError {
            condition: "amqp:connection:forced".to_string(),
        });
        wait_until(|| listener.lost.load(Ordering::SeqCst) == 1);

        assert!(!conn.is_connected().unwrap());
        assert!(!conn.send_message(&AmqpMessage::new(b"x".to_vec())).unwrap());

        conn.close().unwrap();
    }

    #[test]
    fn test_inbound_delivery_reaches_the_listener() {
        let (conn, handle) = connection(false);
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(listener.clone());
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        let inbound = AmqpMessage::new(b"cloud-to-device".to_vec()).with_message_id("c2d-1");
        handle.queue_inbound(&conn.receiver_tag(), &inbound);
        handle.push_event(EngineEvent::Delivery {
            name: conn.receiver_tag(),
        });

        wait_until(|| !listener.received.lock().is_empty());
        let received = listener.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body(), b"cloud-to-device");
        drop(received);

        conn.close().unwrap();
    }

    #[test]
    fn test_partial_inbound_delivery_is_ignored() {
        let (conn, handle) = connection(false);
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(listener.clone());
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        handle.queue_partial_delivery(&conn.receiver_tag(), b"fragment".to_vec());
        handle.push_event(EngineEvent::Delivery {
            name: conn.receiver_tag(),
        });
        // Give the reactor a moment; nothing should arrive.
        std::thread::sleep(Duration::from_millis(50));
        assert!(listener.received.lock().is_empty());

        conn.close().unwrap();
    }

    #[test]
    fn test_rejected_delivery_reports_exactly_one_failure() {
        let (conn, handle) = connection(false);
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(listener.clone());
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        assert!(conn.send_message(&AmqpMessage::new(b"doomed".to_vec())).unwrap());
        handle.set_remote_outcome(
            &conn.sender_tag(),
            DeliveryOutcome::Rejected("amqp:resource-limit-exceeded".to_string()),
        );

        // The same delivery event re-enters; the second pass must find the
        // delivery already settled.
        handle.push_event(EngineEvent::Delivery {
            name: conn.sender_tag(),
        });
        handle.push_event(EngineEvent::Delivery {
            name: conn.sender_tag(),
        });

        wait_until(|| !listener.sent.lock().is_empty());
        std::thread::sleep(Duration::from_millis(50));

        let sent = listener.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "0");
        match &sent[0].1 {
            SendOutcome::Failed(reason) => {
                assert!(reason.contains("not accepted"));
                assert!(reason.contains("amqp:resource-limit-exceeded"));
            }
            SendOutcome::Accepted => panic!("a rejected delivery must not report acceptance"),
        }
        drop(sent);
        assert_eq!(handle.settle_count(&conn.sender_tag()), 1);

        conn.close().unwrap();
    }

    #[test]
    fn test_accepted_delivery_reports_success() {
        let (conn, handle) = connection(false);
        let listener = Arc::new(RecordingListener::default());
        conn.set_listener(listener.clone());
        script_successful_open(&conn, &handle);
        conn.open().unwrap();

        assert!(conn.send_message(&AmqpMessage::new(b"ok".to_vec())).unwrap());
        handle.set_remote_outcome(&conn.sender_tag(), DeliveryOutcome::Accepted);
        handle.push_event(EngineEvent::Delivery {
            name: conn.sender_tag(),
        });

        wait_until(|| !listener.sent.lock().is_empty());
        let sent = listener.sent.lock();
        assert_eq!(sent[0], ("0".to_string(), SendOutcome::Accepted));
        drop(sent);

        conn.close().unwrap();
    }

    #[test]
    fn test_link_flow_updates_the_credit() {
        let (conn, handle) = connection(false);
        script_successful_open(&conn, &handle);
        conn.open().unwrap();
        assert_eq!(conn.link_credit(), -1);

        handle.push_event(EngineEvent::LinkFlow {
            name: conn.sender_tag(),
            credit: 500,
        });
        wait_until(|| conn.link_credit() == 500);

        conn.close().unwrap();
    }

    struct StaticPlainHandler;

    impl SaslHandler for StaticPlainHandler {
        fn choose_mechanism(&mut self, offered: &[String]) -> Result<String> {
            offered
                .iter()
                .find(|m| m.as_str() == "PLAIN")
                .cloned()
                .ok_or_else(|| AmqpError::Sasl("no PLAIN mechanism offered".to_string()))
        }

        fn init_payload(&mut self, _mechanism: &str) -> Result<Vec<u8>> {
            Ok(b"\0user\0secret".to_vec())
        }

        fn handle_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
            Err(AmqpError::Sasl("unexpected challenge".to_string()))
        }

        fn handle_outcome(&mut self, _outcome: crate::sasl::SaslOutcome) {}
    }

    fn sasl_connection() -> (AmqpConnection, MockEngineHandle) {
        let engine = MockEngine::with_sasl(vec!["PLAIN".to_string()]);
        let handle = engine.handle();
        let conn = AmqpConnection::new(
            "hub.example.test",
            link_pair(),
            Box::new(engine),
            TlsContext::platform(),
            Some(Box::new(StaticPlainHandler)),
            false,
        )
        .unwrap()
        .with_open_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_secs(5));
        (conn, handle)
    }

    #[test]
    fn test_sasl_negotiation_sends_the_init_payload() {
        let (conn, handle) = sasl_connection();
        handle.push_event(EngineEvent::SaslMechanisms);
        handle.set_sasl_outcome(SaslResult::Ok);
        handle.push_event(EngineEvent::SaslOutcome);
        script_successful_open(&conn, &handle);

        conn.open().unwrap();
        assert!(conn.is_connected().unwrap());
        assert_eq!(handle.sasl_sent(), vec![b"\0user\0secret".to_vec()]);
        assert_eq!(handle.sasl_mechanism(), Some("PLAIN".to_string()));

        conn.close().unwrap();
    }

    #[test]
    fn test_sasl_failure_is_raised_on_the_next_status_poll() {
        let (conn, handle) = sasl_connection();
        handle.push_event(EngineEvent::SaslMechanisms);
        handle.set_sasl_outcome(SaslResult::Auth);
        handle.push_event(EngineEvent::SaslOutcome);
        handle.push_event(EngineEvent::TransportHeadClosed);

        let result = conn.open();
        assert!(result.is_err());
        assert!(matches!(conn.is_connected(), Err(AmqpError::Sasl(_))));
        assert!(matches!(
            conn.send_message(&AmqpMessage::new(b"x".to_vec())),
            Err(AmqpError::Sasl(_))
        ));
    }
}
