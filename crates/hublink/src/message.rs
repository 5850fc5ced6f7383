//! The transport-level message envelope.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// The protocol a connection speaks to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Amqps,
    AmqpsWs,
    Mqtt,
    MqttWs,
    Https,
}

impl Protocol {
    /// Poll-based protocols have no server push; received messages must be
    /// actively requested.
    #[must_use]
    pub fn is_poll_based(self) -> bool {
        matches!(self, Self::Https)
    }

    #[must_use]
    pub fn uses_websocket(self) -> bool {
        matches!(self, Self::AmqpsWs | Self::MqttWs)
    }
}

/// What a transport message asks the hub to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    /// Device-to-cloud telemetry.
    Telemetry,
    TwinGetRequest,
    TwinUpdateReportedRequest,
    TwinSubscribeToDesired,
    TwinUnsubscribeFromDesired,
    MethodSubscribe,
    MethodResponse,
    Unknown,
}

impl OperationType {
    /// Subscription-style operations are handled synchronously by the MQTT
    /// client and never produce a service acknowledgment.
    #[must_use]
    fn is_subscription(self) -> bool {
        matches!(
            self,
            Self::TwinSubscribeToDesired | Self::TwinUnsubscribeFromDesired | Self::MethodSubscribe
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Telemetry => "telemetry",
            Self::TwinGetRequest => "twin-get",
            Self::TwinUpdateReportedRequest => "twin-update-reported",
            Self::TwinSubscribeToDesired => "twin-subscribe-desired",
            Self::TwinUnsubscribeFromDesired => "twin-unsubscribe-desired",
            Self::MethodSubscribe => "method-subscribe",
            Self::MethodResponse => "method-response",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn from_str_tag(tag: &str) -> Self {
        match tag {
            "telemetry" => Self::Telemetry,
            "twin-get" => Self::TwinGetRequest,
            "twin-update-reported" => Self::TwinUpdateReportedRequest,
            "twin-subscribe-desired" => Self::TwinSubscribeToDesired,
            "twin-unsubscribe-desired" => Self::TwinUnsubscribeFromDesired,
            "method-subscribe" => Self::MethodSubscribe,
            "method-response" => Self::MethodResponse,
            _ => Self::Unknown,
        }
    }
}

/// The application payload plus its addressable identity.
#[derive(Debug, Clone)]
pub struct Message {
    body: Vec<u8>,
    message_id: String,
    correlation_id: Option<String>,
    content_type: Option<String>,
    content_encoding: Option<String>,
    properties: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl Message {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            content_type: None,
            content_encoding: None,
            properties: HashMap::new(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    /// Marks the message invalid after the given time to live.
    #[must_use]
    pub fn with_expiry(mut self, time_to_live: Duration) -> Self {
        self.expires_at = Some(Instant::now() + time_to_live);
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    #[must_use]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// A [`Message`] tagged with the transport metadata the dispatch layer needs:
/// the owning device, the operation, and the per-protocol ack rule.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    message: Message,
    device_id: Option<String>,
    operation: OperationType,
}

impl TransportMessage {
    #[must_use]
    pub fn new(message: Message, operation: OperationType) -> Self {
        Self {
            message,
            device_id: None,
            operation,
        }
    }

    #[must_use]
    pub fn telemetry(message: Message) -> Self {
        Self::new(message, OperationType::Telemetry)
    }

    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    #[must_use]
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Whether this message, sent over the given protocol, expects a service
    /// acknowledgment before its callback fires.
    #[must_use]
    pub fn ack_needed(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Mqtt | Protocol::MqttWs => !self.operation.is_subscription(),
            Protocol::Amqps | Protocol::AmqpsWs | Protocol::Https => true,
        }
    }
}
