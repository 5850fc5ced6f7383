//! The protocol-agnostic transport layer: queueing, worker scheduling, and
//! reconnection above whichever protocol connection is active.

pub mod amqp;
mod dispatch;

use std::sync::Arc;

use crate::error::TransportError;
use crate::message::TransportMessage;
use crate::status::HubStatusCode;

pub use dispatch::{ConnectionFactory, DeviceTransport, SendCallback};

/// Connection status as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// The connection dropped and the reconnect worker is driving re-open
    /// attempts.
    DisconnectedRetrying,
    Disconnected,
}

/// Why the connection status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChangeReason {
    ConnectionOk,
    NoNetwork,
    BadCredential,
    RetryExpired,
    CommunicationError,
    ClientClose,
}

/// Callbacks every protocol connection raises into the dispatch layer.
///
/// Implementations must be cheap and non-blocking: they run on the protocol's
/// own callback thread and only move work onto the dispatch queues.
pub trait TransportListener: Send + Sync {
    fn on_connection_established(&self);
    fn on_connection_lost(&self, cause: TransportError);
    fn on_message_received(&self, message: Result<TransportMessage, TransportError>);
    /// The service acknowledged (or refused) a sent message.
    fn on_message_sent(&self, message_id: &str, error: Option<TransportError>);
}

/// One protocol connection to the hub (AMQP here; MQTT and HTTPS clients
/// implement the same contract).
pub trait HubConnection: Send {
    /// # Errors
    ///
    /// Returns the classified failure when the connection cannot be
    /// established.
    fn open(&mut self) -> Result<(), TransportError>;

    /// # Errors
    ///
    /// Returns the classified failure when teardown fails; the connection is
    /// unusable either way.
    fn close(&mut self) -> Result<(), TransportError>;

    /// # Errors
    ///
    /// Returns the classified failure when the message could not be handed to
    /// the wire.
    fn send_message(&mut self, message: &TransportMessage)
        -> Result<HubStatusCode, TransportError>;

    /// Polls for one received message. Only poll-based protocols return
    /// anything here; push-based protocols deliver through the listener.
    ///
    /// # Errors
    ///
    /// Returns the classified failure when the poll itself fails.
    fn receive_message(&mut self) -> Result<Option<TransportMessage>, TransportError> {
        Ok(None)
    }

    fn set_listener(&mut self, listener: Arc<dyn TransportListener>);
}
