//! Sender/receiver link pair: naming, addressing, and the message paths.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{Engine, LinkProperties, LinkRole, SettleMode};
use crate::error::{AmqpError, Result};
use crate::message::AmqpMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Closed,
    Opening,
    Opened,
}

/// Owns the connection's one sender and one receiver link.
///
/// Tags are fixed at construction (prefix + entity id + UUID suffix) and the
/// link addresses are set exactly once, when the engine signals link
/// initialization. A link is never rebound to a different address.
#[derive(Debug)]
pub struct LinkOperations {
    sender_tag: String,
    receiver_tag: String,
    sender_address: String,
    receiver_address: String,
    properties: LinkProperties,
    sender_state: LinkState,
    receiver_state: LinkState,
}

impl LinkOperations {
    #[must_use]
    pub fn new(
        entity_id: &str,
        sender_address: impl Into<String>,
        receiver_address: impl Into<String>,
        properties: LinkProperties,
    ) -> Self {
        let suffix = Uuid::new_v4().to_string();
        Self {
            sender_tag: format!("sender-{entity_id}-{suffix}"),
            receiver_tag: format!("receiver-{entity_id}-{suffix}"),
            sender_address: sender_address.into(),
            receiver_address: receiver_address.into(),
            properties,
            sender_state: LinkState::Closed,
            receiver_state: LinkState::Closed,
        }
    }

    /// Creates the receiver then the sender link on the engine's open session,
    /// applies the configured link properties to both, and opens both.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the engine has no open session or rejects link
    /// creation.
    pub fn open_links(&mut self, engine: &mut dyn Engine) -> Result<()> {
        if !engine.has_session() {
            return Err(AmqpError::Io(
                "cannot open links without an open session".to_string(),
            ));
        }

        if self.receiver_state == LinkState::Closed {
            engine
                .attach_link(LinkRole::Receiver, &self.receiver_tag, &self.properties)
                .map_err(|e| AmqpError::Io(format!("failed to create the receiver link: {e}")))?;
            engine
                .open_link(&self.receiver_tag)
                .map_err(|e| AmqpError::Io(format!("failed to open the receiver link: {e}")))?;
            self.receiver_state = LinkState::Opening;
        }

        if self.sender_state == LinkState::Closed {
            engine
                .attach_link(LinkRole::Sender, &self.sender_tag, &self.properties)
                .map_err(|e| AmqpError::Io(format!("failed to create the sender link: {e}")))?;
            engine
                .open_link(&self.sender_tag)
                .map_err(|e| AmqpError::Io(format!("failed to open the sender link: {e}")))?;
            self.sender_state = LinkState::Opening;
        }

        Ok(())
    }

    /// Called once per link when the engine signals link initialization: sets
    /// the target address on the sender or the source address on the receiver,
    /// and requires acknowledgment for sender deliveries.
    ///
    /// # Errors
    ///
    /// Returns an argument error for an empty link name, an IO error if the
    /// engine rejects the address or settle mode.
    pub fn init_link(&mut self, engine: &mut dyn Engine, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "the link name cannot be empty".to_string(),
            ));
        }

        if name == self.sender_tag {
            engine
                .set_target_address(name, &self.sender_address)
                .map_err(|e| AmqpError::Io(e.to_string()))?;
            engine
                .set_sender_settle_mode(name, SettleMode::Unsettled)
                .map_err(|e| AmqpError::Io(e.to_string()))?;
        } else if name == self.receiver_tag {
            engine
                .set_source_address(name, &self.receiver_address)
                .map_err(|e| AmqpError::Io(e.to_string()))?;
        } else {
            debug!(link = name, "ignoring init for a link this pair does not own");
        }

        Ok(())
    }

    /// Reads and decodes the current delivery on the receiver link.
    ///
    /// Yields `None` (never an error) unless the name matches the receiver
    /// tag, a delivery is current, and it is fully readable (not partial).
    ///
    /// # Errors
    ///
    /// Returns an error only if reading or decoding a complete delivery fails.
    pub fn receiver_message_from_link(
        &mut self,
        engine: &mut dyn Engine,
        name: &str,
    ) -> Result<Option<AmqpMessage>> {
        if name.is_empty() || name != self.receiver_tag {
            return Ok(None);
        }

        let Some(view) = engine.current_delivery(name) else {
            return Ok(None);
        };
        if !view.readable || view.partial {
            // A partial delivery is a normal "no message yet" condition.
            return Ok(None);
        }

        let mut buffer = vec![0u8; view.pending];
        let read = engine.recv_bytes(name, &mut buffer)?;
        engine.advance(name);

        let message = engine.decode_message(&buffer[..read])?;
        Ok(Some(message))
    }

    /// Creates a delivery with the given tag on the sender link, writes the
    /// payload bytes, and advances the link. Encode success must have been
    /// checked by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender link was never created, the tag is
    /// empty, or the engine rejects the transfer. A failed transfer is
    /// advanced past and settled so the link stays usable.
    pub fn send_message(
        &mut self,
        engine: &mut dyn Engine,
        tag: &[u8],
        data: &[u8],
        length: usize,
        offset: usize,
    ) -> Result<()> {
        if self.sender_state == LinkState::Closed {
            return Err(AmqpError::LinkError(
                "trying to send but the sender link is not initialized".to_string(),
            ));
        }
        if tag.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "the delivery tag cannot be empty".to_string(),
            ));
        }

        engine.new_delivery(&self.sender_tag, tag)?;
        if let Err(e) = engine.send_bytes(&self.sender_tag, &data[offset..offset + length]) {
            warn!(error = %e, "transfer failed; releasing the delivery");
            engine.advance(&self.sender_tag);
            engine.settle_delivery(&self.sender_tag);
            return Err(e);
        }
        engine.advance(&self.sender_tag);
        Ok(())
    }

    /// Closes the receiver then the sender link. Safe to call multiple times
    /// or before the links were ever opened.
    pub fn close_links(&mut self, engine: &mut dyn Engine) {
        if self.receiver_state != LinkState::Closed {
            engine.close_link(&self.receiver_tag);
            self.receiver_state = LinkState::Closed;
        }
        if self.sender_state != LinkState::Closed {
            engine.close_link(&self.sender_tag);
            self.sender_state = LinkState::Closed;
        }
    }

    /// Records that the remote peer confirmed the named link open.
    pub fn mark_remote_open(&mut self, name: &str) {
        if name == self.sender_tag {
            self.sender_state = LinkState::Opened;
        } else if name == self.receiver_tag {
            self.receiver_state = LinkState::Opened;
        }
    }

    #[must_use]
    pub fn links_opened(&self) -> bool {
        self.sender_state == LinkState::Opened && self.receiver_state == LinkState::Opened
    }

    #[must_use]
    pub fn is_sender_tag(&self, name: &str) -> bool {
        name == self.sender_tag
    }

    #[must_use]
    pub fn is_receiver_tag(&self, name: &str) -> bool {
        name == self.receiver_tag
    }

    #[must_use]
    pub fn sender_tag(&self) -> &str {
        &self.sender_tag
    }

    #[must_use]
    pub fn receiver_tag(&self) -> &str {
        &self.receiver_tag
    }

    #[must_use]
    pub fn sender_address(&self) -> &str {
        &self.sender_address
    }

    #[must_use]
    pub fn receiver_address(&self) -> &str {
        &self.receiver_address
    }

    #[must_use]
    pub fn properties(&self) -> &LinkProperties {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;

    fn link_pair() -> LinkOperations {
        LinkOperations::new(
            "device-1",
            "/devices/device-1/messages/events",
            "/devices/device-1/messages/devicebound",
            LinkProperties::new(),
        )
    }

    #[test]
    fn test_tags_are_unique_per_instance() {
        let a = link_pair();
        let b = link_pair();
        assert_ne!(a.sender_tag(), b.sender_tag());
        assert_ne!(a.receiver_tag(), b.receiver_tag());
        assert!(a.sender_tag().starts_with("sender-device-1-"));
        assert!(a.receiver_tag().starts_with("receiver-device-1-"));
    }

    #[test]
    fn test_open_links_without_session_fails() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        let result = links.open_links(&mut engine);
        assert!(matches!(result, Err(AmqpError::Io(_))));
    }

    #[test]
    fn test_open_links_creates_receiver_then_sender() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();

        let attached = engine.handle().attached_links();
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[0], (LinkRole::Receiver, links.receiver_tag().to_string()));
        assert_eq!(attached[1], (LinkRole::Sender, links.sender_tag().to_string()));
    }

    #[test]
    fn test_init_link_empty_name_is_argument_error() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        let result = links.init_link(&mut engine, "");
        assert!(matches!(result, Err(AmqpError::InvalidArgument(_))));
    }

    #[test]
    fn test_init_link_sets_sender_target_and_settle_mode() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();

        let sender = links.sender_tag().to_string();
        links.init_link(&mut engine, &sender).unwrap();

        let handle = engine.handle();
        assert_eq!(
            handle.link_target(&sender).as_deref(),
            Some("/devices/device-1/messages/events")
        );
        assert_eq!(handle.link_settle_mode(&sender), Some(SettleMode::Unsettled));
    }

    #[test]
    fn test_init_link_sets_receiver_source() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();

        let receiver = links.receiver_tag().to_string();
        links.init_link(&mut engine, &receiver).unwrap();
        assert_eq!(
            engine.handle().link_source(&receiver).as_deref(),
            Some("/devices/device-1/messages/devicebound")
        );
    }

    #[test]
    fn test_receiver_message_from_link_empty_name_is_none() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        assert!(links
            .receiver_message_from_link(&mut engine, "")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_receiver_message_from_link_ignores_foreign_names() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        assert!(links
            .receiver_message_from_link(&mut engine, "someone-else")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_partial_delivery_yields_no_message_and_no_error() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();

        let receiver = links.receiver_tag().to_string();
        engine
            .handle()
            .queue_partial_delivery(&receiver, b"half of a mess".to_vec());

        let result = links.receiver_message_from_link(&mut engine, &receiver);
        assert!(result.unwrap().is_none());
    }

    #[test]
    fn test_round_trip_preserves_body() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();

        let body = vec![0u8, 1, 2, 250, 255];
        let message = AmqpMessage::new(body.clone()).with_message_id("m-7");
        engine.handle().queue_inbound(links.receiver_tag(), &message);

        let receiver = links.receiver_tag().to_string();
        let decoded = links
            .receiver_message_from_link(&mut engine, &receiver)
            .unwrap()
            .expect("a complete delivery should decode");
        assert_eq!(decoded.body(), body.as_slice());
        assert_eq!(decoded.message_id(), Some("m-7"));
    }

    #[test]
    fn test_send_message_requires_initialized_sender() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        let result = links.send_message(&mut engine, b"0", b"data", 4, 0);
        assert!(matches!(result, Err(AmqpError::LinkError(_))));
    }

    #[test]
    fn test_send_message_rejects_empty_tag() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();
        let result = links.send_message(&mut engine, b"", b"data", 4, 0);
        assert!(matches!(result, Err(AmqpError::InvalidArgument(_))));
    }

    #[test]
    fn test_close_links_is_idempotent() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();

        // Safe before open.
        links.close_links(&mut engine);
        assert!(engine.handle().closed_links().is_empty());

        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();
        links.close_links(&mut engine);
        links.close_links(&mut engine);

        // Receiver first, sender second, exactly once each.
        let closed = engine.handle().closed_links();
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0], links.receiver_tag());
        assert_eq!(closed[1], links.sender_tag());
    }

    #[test]
    fn test_links_opened_tracks_remote_opens() {
        let mut links = link_pair();
        let mut engine = MockEngine::new();
        engine.open_session().unwrap();
        links.open_links(&mut engine).unwrap();
        assert!(!links.links_opened());

        let sender = links.sender_tag().to_string();
        let receiver = links.receiver_tag().to_string();
        links.mark_remote_open(&sender);
        assert!(!links.links_opened());
        links.mark_remote_open(&receiver);
        assert!(links.links_opened());
    }
}
