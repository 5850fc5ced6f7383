//! Test support: a scripted engine and SASL frame surface.
//!
//! `MockEngine` implements [`Engine`](crate::engine::Engine) over an
//! in-memory event feed and records every imperative call, so connection and
//! dispatch behavior can be driven deterministically without a network or a
//! real protocol engine.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{
    BufferTooSmall, DeliveryOutcome, DeliveryView, Engine, EngineEvent, LinkProperties, LinkRole,
    SaslFrames, SaslResult, SettleMode, TlsContext,
};
use crate::error::{AmqpError, Result};
use crate::message::AmqpMessage;

/// Spins until `cond` holds; panics if it never does. For asserting on work
/// that happens on the reactor thread.
pub fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition was not reached within the timeout");
}

#[derive(Debug)]
struct InboundDelivery {
    data: Vec<u8>,
    partial: bool,
}

#[derive(Debug)]
struct OutboundDelivery {
    tag: String,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MockLink {
    role: LinkRole,
    target: Option<String>,
    source: Option<String>,
    settle_mode: Option<SettleMode>,
    open: bool,
    inbound: VecDeque<InboundDelivery>,
    current_outbound: Option<OutboundDelivery>,
    unsettled: VecDeque<(String, Option<DeliveryOutcome>)>,
    settle_count: usize,
}

impl MockLink {
    fn new(role: LinkRole) -> Self {
        Self {
            role,
            target: None,
            source: None,
            settle_mode: None,
            open: false,
            inbound: VecDeque::new(),
            current_outbound: None,
            unsettled: VecDeque::new(),
            settle_count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    started: bool,
    stop_count: usize,
    pre_start: Vec<EngineEvent>,
    connect_requests: Vec<(String, u16)>,
    tls_bound: bool,
    websocket_binding: Option<(String, String, String)>,
    opened_connection: Option<String>,
    session_open: bool,
    links: HashMap<String, MockLink>,
    attach_order: Vec<(LinkRole, String)>,
    closed_links: Vec<String>,
    sent_deliveries: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct SaslState {
    mechanisms: Vec<String>,
    mechanism: Option<String>,
    challenge: Option<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    outcome: SaslResult,
}

/// Standalone SASL frame surface for negotiator tests, also embedded in
/// [`MockEngine`].
#[derive(Debug, Clone, Default)]
pub struct MockSasl {
    state: Arc<Mutex<SaslState>>,
}

impl MockSasl {
    #[must_use]
    pub fn new(mechanisms: Vec<String>) -> Self {
        let sasl = Self::default();
        sasl.state.lock().mechanisms = mechanisms;
        sasl
    }

    pub fn set_challenge(&self, challenge: Vec<u8>) {
        self.state.lock().challenge = Some(challenge);
    }

    pub fn set_outcome(&self, outcome: SaslResult) {
        self.state.lock().outcome = outcome;
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().sent.clone()
    }

    #[must_use]
    pub fn mechanism(&self) -> Option<String> {
        self.state.lock().mechanism.clone()
    }
}

impl SaslFrames for MockSasl {
    fn remote_mechanisms(&self) -> Vec<String> {
        self.state.lock().mechanisms.clone()
    }

    fn set_mechanism(&mut self, mechanism: &str) {
        self.state.lock().mechanism = Some(mechanism.to_string());
    }

    fn pending(&self) -> usize {
        self.state.lock().challenge.as_ref().map_or(0, Vec::len)
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let state = self.state.lock();
        let Some(challenge) = state.challenge.as_ref() else {
            return 0;
        };
        let n = challenge.len().min(buf.len());
        buf[..n].copy_from_slice(&challenge[..n]);
        n
    }

    fn send(&mut self, data: &[u8]) {
        self.state.lock().sent.push(data.to_vec());
    }

    fn outcome(&self) -> SaslResult {
        self.state.lock().outcome
    }
}

/// Scripted engine: tests queue events through the handle and inspect the
/// recorded imperative calls afterwards.
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    sasl: Option<MockSasl>,
    event_tx: Sender<EngineEvent>,
    event_rx: Option<Receiver<EngineEvent>>,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            sasl: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// An engine with a SASL layer offering the given mechanisms.
    #[must_use]
    pub fn with_sasl(mechanisms: Vec<String>) -> Self {
        let mut engine = Self::new();
        engine.sasl = Some(MockSasl::new(mechanisms));
        engine
    }

    /// A handle usable after the engine has been moved into a connection.
    #[must_use]
    pub fn handle(&self) -> MockEngineHandle {
        MockEngineHandle {
            state: Arc::clone(&self.state),
            sasl: self.sasl.clone(),
            event_tx: self.event_tx.clone(),
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for MockEngine {
    fn start(&mut self) -> Result<Receiver<EngineEvent>> {
        let rx = self
            .event_rx
            .take()
            .ok_or_else(|| AmqpError::Io("the engine was already started".to_string()))?;
        let mut state = self.state.lock();
        state.started = true;
        let _ = self.event_tx.send(EngineEvent::ReactorInit);
        for event in state.pre_start.drain(..) {
            let _ = self.event_tx.send(event);
        }
        Ok(rx)
    }

    fn stop(&mut self) {
        self.state.lock().stop_count += 1;
        let _ = self.event_tx.send(EngineEvent::ReactorFinal);
    }

    fn connect_to_host(&mut self, host: &str, port: u16) -> Result<()> {
        self.state
            .lock()
            .connect_requests
            .push((host.to_string(), port));
        Ok(())
    }

    fn bind_tls(&mut self, _tls: &TlsContext) -> Result<()> {
        self.state.lock().tls_bound = true;
        Ok(())
    }

    fn bind_websocket(&mut self, host: &str, path: &str, sub_protocol: &str) -> Result<()> {
        self.state.lock().websocket_binding = Some((
            host.to_string(),
            path.to_string(),
            sub_protocol.to_string(),
        ));
        Ok(())
    }

    fn open_connection(&mut self, container_address: &str) -> Result<()> {
        self.state.lock().opened_connection = Some(container_address.to_string());
        Ok(())
    }

    fn open_session(&mut self) -> Result<()> {
        self.state.lock().session_open = true;
        Ok(())
    }

    fn has_session(&self) -> bool {
        self.state.lock().session_open
    }

    fn close_session(&mut self) {
        self.state.lock().session_open = false;
    }

    fn close_connection(&mut self) {
        self.state.lock().opened_connection = None;
    }

    fn attach_link(
        &mut self,
        role: LinkRole,
        name: &str,
        _properties: &LinkProperties,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.session_open {
            return Err(AmqpError::ConnectionError(
                "no session to attach the link to".to_string(),
            ));
        }
        state.links.insert(name.to_string(), MockLink::new(role));
        state.attach_order.push((role, name.to_string()));
        Ok(())
    }

    fn set_target_address(&mut self, name: &str, address: &str) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| AmqpError::LinkError(format!("unknown link: {name}")))?;
        link.target = Some(address.to_string());
        Ok(())
    }

    fn set_source_address(&mut self, name: &str, address: &str) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| AmqpError::LinkError(format!("unknown link: {name}")))?;
        link.source = Some(address.to_string());
        Ok(())
    }

    fn set_sender_settle_mode(&mut self, name: &str, mode: SettleMode) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| AmqpError::LinkError(format!("unknown link: {name}")))?;
        link.settle_mode = Some(mode);
        Ok(())
    }

    fn open_link(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| AmqpError::LinkError(format!("unknown link: {name}")))?;
        link.open = true;
        Ok(())
    }

    fn close_link(&mut self, name: &str) {
        let mut state = self.state.lock();
        if let Some(link) = state.links.get_mut(name) {
            link.open = false;
        }
        state.closed_links.push(name.to_string());
    }

    fn link_role(&self, name: &str) -> Option<LinkRole> {
        self.state.lock().links.get(name).map(|link| link.role)
    }

    fn new_delivery(&mut self, link: &str, tag: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(link)
            .ok_or_else(|| AmqpError::LinkError("unknown sender link".to_string()))?;
        link.current_outbound = Some(OutboundDelivery {
            tag: String::from_utf8_lossy(tag).into_owned(),
            data: Vec::new(),
        });
        Ok(())
    }

    fn send_bytes(&mut self, link: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(link)
            .ok_or_else(|| AmqpError::LinkError("unknown sender link".to_string()))?;
        let delivery = link
            .current_outbound
            .as_mut()
            .ok_or_else(|| AmqpError::LinkError("no delivery in progress".to_string()))?;
        delivery.data.extend_from_slice(data);
        Ok(())
    }

    fn advance(&mut self, link: &str) {
        let mut state = self.state.lock();
        let Some(entry) = state.links.get_mut(link) else {
            return;
        };
        match entry.role {
            LinkRole::Sender => {
                if let Some(delivery) = entry.current_outbound.take() {
                    entry.unsettled.push_back((delivery.tag.clone(), None));
                    state.sent_deliveries.push((delivery.tag, delivery.data));
                }
            }
            LinkRole::Receiver => {
                entry.inbound.pop_front();
            }
        }
    }

    fn current_delivery(&self, link: &str) -> Option<DeliveryView> {
        let state = self.state.lock();
        let entry = state.links.get(link)?;
        if !entry.open {
            return None;
        }
        let delivery = entry.inbound.front()?;
        Some(DeliveryView {
            readable: true,
            partial: delivery.partial,
            pending: delivery.data.len(),
        })
    }

    fn recv_bytes(&mut self, link: &str, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let entry = state
            .links
            .get(link)
            .ok_or_else(|| AmqpError::LinkError("unknown receiver link".to_string()))?;
        let delivery = entry
            .inbound
            .front()
            .ok_or_else(|| AmqpError::LinkError("no delivery to read".to_string()))?;
        let n = delivery.data.len().min(buf.len());
        buf[..n].copy_from_slice(&delivery.data[..n]);
        Ok(n)
    }

    fn remote_delivery_outcome(&self, link: &str) -> Option<(String, DeliveryOutcome)> {
        let state = self.state.lock();
        let entry = state.links.get(link)?;
        entry
            .unsettled
            .front()
            .and_then(|(tag, outcome)| outcome.clone().map(|o| (tag.clone(), o)))
    }

    fn settle_delivery(&mut self, link: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.links.get_mut(link) {
            if entry.unsettled.pop_front().is_some() {
                entry.settle_count += 1;
            }
        }
    }

    fn sasl(&mut self) -> Option<&mut dyn SaslFrames> {
        self.sasl.as_mut().map(|s| s as &mut dyn SaslFrames)
    }

    fn encode_message(
        &self,
        message: &AmqpMessage,
        buf: &mut [u8],
    ) -> std::result::Result<usize, BufferTooSmall> {
        let encoded = serde_json::to_vec(message).unwrap_or_default();
        if encoded.len() > buf.len() {
            return Err(BufferTooSmall);
        }
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(encoded.len())
    }

    fn decode_message(&self, data: &[u8]) -> Result<AmqpMessage> {
        serde_json::from_slice(data).map_err(|e| AmqpError::Decode(e.to_string()))
    }
}

/// Inspection and scripting surface over a [`MockEngine`] that has been moved
/// into a connection.
#[derive(Clone)]
pub struct MockEngineHandle {
    state: Arc<Mutex<MockState>>,
    sasl: Option<MockSasl>,
    event_tx: Sender<EngineEvent>,
}

impl MockEngineHandle {
    /// Queues an event: delivered immediately when the engine is running,
    /// otherwise replayed right after `ReactorInit` on start.
    pub fn push_event(&self, event: EngineEvent) {
        let mut state = self.state.lock();
        if state.started {
            let _ = self.event_tx.send(event);
        } else {
            state.pre_start.push(event);
        }
    }

    /// Queues a complete inbound delivery on the named receiver link.
    pub fn queue_inbound(&self, link: &str, message: &AmqpMessage) {
        let data = serde_json::to_vec(message).unwrap_or_default();
        let mut state = self.state.lock();
        let entry = state
            .links
            .entry(link.to_string())
            .or_insert_with(|| MockLink::new(LinkRole::Receiver));
        entry.inbound.push_back(InboundDelivery {
            data,
            partial: false,
        });
    }

    /// Queues a partial inbound delivery: visible on the link but not yet
    /// fully transferred.
    pub fn queue_partial_delivery(&self, link: &str, data: Vec<u8>) {
        let mut state = self.state.lock();
        let entry = state
            .links
            .entry(link.to_string())
            .or_insert_with(|| MockLink::new(LinkRole::Receiver));
        entry.inbound.push_back(InboundDelivery {
            data,
            partial: true,
        });
    }

    /// Records the remote peer's terminal state for the oldest unsettled
    /// delivery on the named sender link.
    pub fn set_remote_outcome(&self, link: &str, outcome: DeliveryOutcome) {
        let mut state = self.state.lock();
        if let Some(entry) = state.links.get_mut(link) {
            if let Some(slot) = entry
                .unsettled
                .iter_mut()
                .find(|(_, existing)| existing.is_none())
            {
                slot.1 = Some(outcome);
            }
        }
    }

    pub fn set_sasl_outcome(&self, outcome: SaslResult) {
        if let Some(sasl) = &self.sasl {
            sasl.set_outcome(outcome);
        }
    }

    #[must_use]
    pub fn sasl_sent(&self) -> Vec<Vec<u8>> {
        self.sasl.as_ref().map(MockSasl::sent).unwrap_or_default()
    }

    #[must_use]
    pub fn sasl_mechanism(&self) -> Option<String> {
        self.sasl.as_ref().and_then(MockSasl::mechanism)
    }

    #[must_use]
    pub fn connect_requests(&self) -> Vec<(String, u16)> {
        self.state.lock().connect_requests.clone()
    }

    #[must_use]
    pub fn opened_connection(&self) -> Option<String> {
        self.state.lock().opened_connection.clone()
    }

    #[must_use]
    pub fn tls_bound(&self) -> bool {
        self.state.lock().tls_bound
    }

    #[must_use]
    pub fn websocket_binding(&self) -> Option<(String, String, String)> {
        self.state.lock().websocket_binding.clone()
    }

    #[must_use]
    pub fn attached_links(&self) -> Vec<(LinkRole, String)> {
        self.state.lock().attach_order.clone()
    }

    #[must_use]
    pub fn closed_links(&self) -> Vec<String> {
        self.state.lock().closed_links.clone()
    }

    #[must_use]
    pub fn link_target(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .links
            .get(name)
            .and_then(|link| link.target.clone())
    }

    #[must_use]
    pub fn link_source(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .links
            .get(name)
            .and_then(|link| link.source.clone())
    }

    #[must_use]
    pub fn link_settle_mode(&self, name: &str) -> Option<SettleMode> {
        self.state
            .lock()
            .links
            .get(name)
            .and_then(|link| link.settle_mode)
    }

    /// Finalized transfers as (delivery tag, encoded bytes) pairs.
    #[must_use]
    pub fn sent_deliveries(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().sent_deliveries.clone()
    }

    #[must_use]
    pub fn settle_count(&self, link: &str) -> usize {
        self.state
            .lock()
            .links
            .get(link)
            .map_or(0, |entry| entry.settle_count)
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }

    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stop_count() > 0
    }

    /// Decodes bytes with the same framing the mock codec uses to encode.
    #[must_use]
    pub fn decode(&self, data: &[u8]) -> AmqpMessage {
        serde_json::from_slice(data).unwrap_or_default()
    }
}
