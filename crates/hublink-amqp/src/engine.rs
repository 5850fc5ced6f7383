//! The seam to the underlying AMQP 1.0 protocol engine.
//!
//! Wire framing, SASL frame exchange, and the TLS/WebSocket transport layers
//! live behind [`Engine`]. The connection state machine only consumes the
//! engine's event stream and drives its imperative surface, so the legal
//! transition set stays checkable without any particular event-loop library.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use crate::error::Result;
use crate::message::AmqpMessage;

pub const AMQP_PORT: u16 = 5671;
pub const AMQP_WEB_SOCKET_PORT: u16 = 443;
pub const WEB_SOCKET_PATH: &str = "/$iothub/websocket";
pub const WEB_SOCKET_SUB_PROTOCOL: &str = "AMQPWSB10";

/// Events surfaced by the engine, in the order the engine produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ReactorInit,
    ReactorFinal,
    ConnectionBound,
    ConnectionInit,
    ConnectionUnbound,
    LinkInit { name: String },
    LinkRemoteOpen { name: String },
    LinkRemoteClose { name: String },
    LinkFlow { name: String, credit: i32 },
    Delivery { name: String },
    TransportError { condition: String },
    TransportHeadClosed,
    SaslMechanisms,
    SaslChallenge,
    SaslOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    /// Deliveries are settled locally at send time; no acknowledgment.
    Settled,
    /// The remote peer must report a terminal delivery state.
    Unsettled,
}

/// Snapshot of the delivery currently at the head of a link.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryView {
    pub readable: bool,
    pub partial: bool,
    pub pending: usize,
}

/// Terminal state reported by the remote peer for a sent delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected(String),
    Released,
    Modified,
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "Accepted"),
            Self::Rejected(description) => write!(f, "Rejected ({description})"),
            Self::Released => write!(f, "Released"),
            Self::Modified => write!(f, "Modified"),
        }
    }
}

/// Raw negotiation result codes as the engine reports them. `Pending` means
/// the negotiation has not finished; it is never a valid terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaslResult {
    Ok,
    Auth,
    Sys,
    SysTemp,
    SysPerm,
    Skipped,
    #[default]
    Pending,
}

/// Signals that an encode buffer was too small for the message; the caller
/// grows the buffer and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTooSmall;

pub type LinkProperties = HashMap<String, String>;

/// TLS configuration handed to the engine at connection-bound time. The core
/// never builds a TLS session itself.
#[derive(Clone, Default)]
pub struct TlsContext {
    client_config: Option<Arc<rustls::ClientConfig>>,
}

impl TlsContext {
    /// Platform trust roots; the engine picks its default client setup.
    #[must_use]
    pub fn platform() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client_config(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            client_config: Some(client_config),
        }
    }

    #[must_use]
    pub fn client_config(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.client_config.as_ref()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("custom_client_config", &self.client_config.is_some())
            .finish()
    }
}

/// The engine's SASL frame surface, valid while negotiation is in progress.
pub trait SaslFrames {
    fn remote_mechanisms(&self) -> Vec<String>;
    fn set_mechanism(&mut self, mechanism: &str);
    /// Number of challenge bytes waiting to be read.
    fn pending(&self) -> usize;
    fn recv(&mut self, buf: &mut [u8]) -> usize;
    fn send(&mut self, data: &[u8]);
    fn outcome(&self) -> SaslResult;
}

/// Imperative surface of the protocol engine.
///
/// Contract: `start` hands back the event stream and guarantees that
/// `ReactorInit` is the first event delivered; `stop` guarantees a terminal
/// `ReactorFinal` so the reactor pump always winds down without polling.
pub trait Engine: Send {
    fn start(&mut self) -> Result<Receiver<EngineEvent>>;
    fn stop(&mut self);

    fn connect_to_host(&mut self, host: &str, port: u16) -> Result<()>;
    fn bind_tls(&mut self, tls: &TlsContext) -> Result<()>;
    fn bind_websocket(&mut self, host: &str, path: &str, sub_protocol: &str) -> Result<()>;

    fn open_connection(&mut self, container_address: &str) -> Result<()>;
    fn open_session(&mut self) -> Result<()>;
    fn has_session(&self) -> bool;
    fn close_session(&mut self);
    fn close_connection(&mut self);

    fn attach_link(&mut self, role: LinkRole, name: &str, properties: &LinkProperties)
        -> Result<()>;
    fn set_target_address(&mut self, name: &str, address: &str) -> Result<()>;
    fn set_source_address(&mut self, name: &str, address: &str) -> Result<()>;
    fn set_sender_settle_mode(&mut self, name: &str, mode: SettleMode) -> Result<()>;
    fn open_link(&mut self, name: &str) -> Result<()>;
    fn close_link(&mut self, name: &str);
    fn link_role(&self, name: &str) -> Option<LinkRole>;

    fn new_delivery(&mut self, link: &str, tag: &[u8]) -> Result<()>;
    fn send_bytes(&mut self, link: &str, data: &[u8]) -> Result<()>;
    fn advance(&mut self, link: &str);
    fn current_delivery(&self, link: &str) -> Option<DeliveryView>;
    fn recv_bytes(&mut self, link: &str, buf: &mut [u8]) -> Result<usize>;
    /// Tag and remote state of the oldest unsettled sender delivery, if any.
    fn remote_delivery_outcome(&self, link: &str) -> Option<(String, DeliveryOutcome)>;
    fn settle_delivery(&mut self, link: &str);

    /// The SASL frame surface, present only when a SASL layer was negotiated.
    fn sasl(&mut self) -> Option<&mut dyn SaslFrames>;

    fn encode_message(
        &self,
        message: &AmqpMessage,
        buf: &mut [u8],
    ) -> std::result::Result<usize, BufferTooSmall>;
    fn decode_message(&self, data: &[u8]) -> Result<AmqpMessage>;
}
