//! AMQP 1.0 transport core for the hublink device SDK.
//!
//! This crate owns the hard parts of talking AMQP to an IoT hub: the
//! connection state machine with its blocking open/close contract, the
//! sender/receiver link pair, SASL negotiation, and the reactor pump thread
//! that drains the protocol engine's events. The wire-level codec, TLS, and
//! WebSocket framing are delegated to an [`engine::Engine`] implementation;
//! everything in this crate is written against that seam.
//!
//! The layer above (queueing, reconnection, per-protocol dispatch) lives in
//! the `hublink` crate.

pub mod connection;
pub mod engine;
pub mod error;
pub mod link;
pub mod message;
pub mod reactor;
pub mod sasl;
pub mod sync;
pub mod testing;

pub use connection::{AmqpConnection, AmqpListener, ConnectionState, SendOutcome};
pub use engine::{
    DeliveryOutcome, Engine, EngineEvent, LinkProperties, LinkRole, SaslResult, TlsContext,
};
pub use error::{AmqpError, Result};
pub use link::LinkOperations;
pub use message::AmqpMessage;
pub use sasl::{SaslHandler, SaslNegotiator, SaslOutcome};
