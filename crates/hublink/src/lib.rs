//! Device client core for an IoT hub: the protocol-agnostic transport
//! dispatch layer (queueing, three cooperating workers, reconnection policy),
//! the transport message envelope, exception classification, and the AMQP
//! protocol bridge over `hublink-amqp`.
//!
//! The dispatch layer talks to every protocol through the same two
//! contracts, [`transport::HubConnection`] downward and
//! [`transport::TransportListener`] upward, so AMQP, MQTT, and HTTPS clients
//! are interchangeable behind it.

pub mod auth;
pub mod classify;
pub mod config;
pub mod error;
pub mod message;
pub mod retry;
pub mod status;
pub mod testing;
pub mod transport;
pub mod twin;
pub mod wake;

pub use config::{ClientConfig, SasAuth};
pub use error::{ErrorKind, TransportError};
pub use message::{Message, OperationType, Protocol, TransportMessage};
pub use retry::{ExponentialBackoffRetry, NoRetry, RetryDecision, RetryPolicy};
pub use status::HubStatusCode;
pub use transport::{
    ConnectionStatus, DeviceTransport, HubConnection, StatusChangeReason, TransportListener,
};
