//! The AMQP implementation of the dispatch layer's connection contract.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use hublink_amqp::engine::Engine;
use hublink_amqp::{
    AmqpConnection, AmqpListener, AmqpMessage, LinkOperations, LinkProperties, SendOutcome,
};

use crate::auth::{SasPlainHandler, SasToken};
use crate::classify::classify_amqp_error;
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::message::{Message, OperationType, TransportMessage};
use crate::status::HubStatusCode;
use crate::transport::{ConnectionFactory, HubConnection, TransportListener};

/// Builds a fresh protocol engine per connection attempt.
pub type EngineFactory = Box<dyn Fn() -> Box<dyn Engine> + Send + Sync>;

const CLIENT_VERSION_PROPERTY: &str = "client-version";
const OPERATION_PROPERTY: &str = "operation-type";
const CONNECTION_DEVICE_ID_PROPERTY: &str = "connection-device-id";

type SharedListener = Arc<Mutex<Option<Arc<dyn TransportListener>>>>;
type TagIndex = Arc<Mutex<HashMap<String, String>>>;

/// One AMQP connection scoped to one device, exposed through the
/// protocol-agnostic [`HubConnection`] contract.
pub struct AmqpHubConnection {
    connection: AmqpConnection,
    listener: SharedListener,
    /// Delivery tag to message id, for correlating acknowledgments.
    tags: TagIndex,
}

impl AmqpHubConnection {
    /// # Errors
    ///
    /// Fails on invalid configuration or when the SAS token cannot be
    /// generated.
    pub fn new(config: &ClientConfig, engine: Box<dyn Engine>) -> Result<Self, TransportError> {
        let mut properties = LinkProperties::new();
        properties.insert(
            CLIENT_VERSION_PROPERTY.to_string(),
            config.client_version().to_string(),
        );

        let device_id = config.device_id();
        let (entity, sender_address, receiver_address) = match config.module_id() {
            Some(module_id) => (
                format!("{device_id}/{module_id}"),
                format!("/devices/{device_id}/modules/{module_id}/messages/events"),
                format!("/devices/{device_id}/modules/{module_id}/messages/devicebound"),
            ),
            None => (
                device_id.to_string(),
                format!("/devices/{device_id}/messages/events"),
                format!("/devices/{device_id}/messages/devicebound"),
            ),
        };
        let links = LinkOperations::new(&entity, sender_address, receiver_address, properties);

        let sasl_handler = match config.sas_auth() {
            Some(sas) => {
                let token =
                    SasToken::generate(&config.sas_resource_uri(), &sas.device_key, sas.token_ttl)?;
                Some(Box::new(SasPlainHandler::new(
                    config.sas_username(),
                    token.as_str(),
                )) as Box<dyn hublink_amqp::SaslHandler>)
            }
            None => None,
        };

        let connection = AmqpConnection::new(
            config.hostname(),
            links,
            engine,
            config.tls().clone(),
            sasl_handler,
            config.protocol().uses_websocket(),
        )
        .map_err(|e| classify_amqp_error(&e))?
        .with_open_timeout(config.open_timeout());

        let listener: SharedListener = Arc::new(Mutex::new(None));
        let tags: TagIndex = Arc::new(Mutex::new(HashMap::new()));
        connection.set_listener(Arc::new(AmqpListenerAdapter {
            listener: Arc::clone(&listener),
            tags: Arc::clone(&tags),
        }));

        Ok(Self {
            connection,
            listener,
            tags,
        })
    }

    /// A [`ConnectionFactory`] producing one fresh AMQP connection per call,
    /// for the dispatch layer's open and reconnect paths.
    #[must_use]
    pub fn factory(config: ClientConfig, engine_factory: EngineFactory) -> ConnectionFactory {
        Box::new(move || {
            let connection = AmqpHubConnection::new(&config, engine_factory())?;
            Ok(Box::new(connection) as Box<dyn HubConnection>)
        })
    }
}

impl HubConnection for AmqpHubConnection {
    fn open(&mut self) -> Result<(), TransportError> {
        self.connection.open().map_err(|e| classify_amqp_error(&e))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.connection.close().map_err(|e| classify_amqp_error(&e))
    }

    fn send_message(
        &mut self,
        message: &TransportMessage,
    ) -> Result<HubStatusCode, TransportError> {
        let amqp_message = to_amqp_message(message);
        match self.connection.send_message_with_tag(&amqp_message) {
            Ok(Some(tag)) => {
                self.tags
                    .lock()
                    .insert(tag, message.message().message_id().to_string());
                Ok(HubStatusCode::Ok)
            }
            Ok(None) => Err(TransportError::io("the amqp connection is not open")),
            Err(e) => Err(classify_amqp_error(&e)),
        }
    }

    fn set_listener(&mut self, listener: Arc<dyn TransportListener>) {
        *self.listener.lock() = Some(listener);
    }
}

/// Adapts the AMQP connection's reactor-thread callbacks onto the transport
/// listener contract.
struct AmqpListenerAdapter {
    listener: SharedListener,
    tags: TagIndex,
}

impl AmqpListenerAdapter {
    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.lock().clone()
    }
}

impl AmqpListener for AmqpListenerAdapter {
    fn connection_established(&self) {
        if let Some(listener) = self.listener() {
            listener.on_connection_established();
        }
    }

    fn connection_lost(&self) {
        if let Some(listener) = self.listener() {
            listener.on_connection_lost(TransportError::io("the amqp connection was lost"));
        }
    }

    fn message_received(&self, message: AmqpMessage) {
        let Some(listener) = self.listener() else {
            debug!("inbound message dropped; no transport listener registered");
            return;
        };
        listener.on_message_received(Ok(from_amqp_message(&message)));
    }

    fn message_sent(&self, delivery_tag: &str, outcome: &SendOutcome) {
        let Some(listener) = self.listener() else {
            return;
        };
        let Some(message_id) = self.tags.lock().remove(delivery_tag) else {
            warn!(
                delivery_tag,
                "a delivery was settled that no sent message was tracked for"
            );
            return;
        };
        match outcome {
            SendOutcome::Accepted => listener.on_message_sent(&message_id, None),
            SendOutcome::Failed(reason) => {
                listener.on_message_sent(&message_id, Some(TransportError::other(reason.clone())));
            }
        }
    }
}

fn to_amqp_message(transport_message: &TransportMessage) -> AmqpMessage {
    let message = transport_message.message();
    let mut amqp = AmqpMessage::new(message.body().to_vec()).with_message_id(message.message_id());
    if let Some(correlation_id) = message.correlation_id() {
        amqp = amqp.with_correlation_id(correlation_id);
    }
    if let Some(content_type) = message.content_type() {
        amqp = amqp.with_content_type(content_type);
    }
    if let Some(content_encoding) = message.content_encoding() {
        amqp = amqp.with_content_encoding(content_encoding);
    }
    for (key, value) in message.properties() {
        amqp.set_application_property(key.clone(), value.clone());
    }
    amqp.set_application_property(OPERATION_PROPERTY, transport_message.operation().as_str());
    if let Some(device_id) = transport_message.device_id() {
        amqp.set_application_property(CONNECTION_DEVICE_ID_PROPERTY, device_id);
    }
    amqp
}

fn from_amqp_message(amqp: &AmqpMessage) -> TransportMessage {
    let mut message = Message::new(amqp.body().to_vec());
    if let Some(message_id) = amqp.message_id() {
        message = message.with_message_id(message_id);
    }
    if let Some(correlation_id) = amqp.correlation_id() {
        message = message.with_correlation_id(correlation_id);
    }
    if let Some(content_type) = amqp.content_type() {
        message = message.with_content_type(content_type);
    }
    if let Some(content_encoding) = amqp.content_encoding() {
        message = message.with_content_encoding(content_encoding);
    }

    let mut operation = OperationType::Unknown;
    let mut device_id = None;
    for (key, value) in amqp.application_properties() {
        match key.as_str() {
            OPERATION_PROPERTY => operation = OperationType::from_str_tag(value),
            CONNECTION_DEVICE_ID_PROPERTY => device_id = Some(value.clone()),
            _ => message.set_property(key.clone(), value.clone()),
        }
    }

    let mut transport_message = TransportMessage::new(message, operation);
    if let Some(device_id) = device_id {
        transport_message = transport_message.with_device_id(device_id);
    }
    transport_message
}
