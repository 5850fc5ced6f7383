//! Test support: a scripted protocol connection and a recording listener.

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use parking_lot::Mutex;

pub use hublink_amqp::testing::wait_until;

use crate::error::TransportError;
use crate::message::TransportMessage;
use crate::status::HubStatusCode;
use crate::transport::{ConnectionFactory, HubConnection, TransportListener};

type OnSendHook = Arc<dyn Fn(&TransportMessage) + Send + Sync>;
type OpenErrorFactory = Arc<dyn Fn() -> TransportError + Send + Sync>;

#[derive(Default)]
struct MockConnState {
    listener: Option<Arc<dyn TransportListener>>,
    sent: Vec<TransportMessage>,
    open_count: usize,
    close_count: usize,
    open_fail_remaining: usize,
    open_error_factory: Option<OpenErrorFactory>,
    poll_messages: VecDeque<TransportMessage>,
    on_send: Option<OnSendHook>,
}

/// A scripted [`HubConnection`]. All instances produced by one
/// [`MockConnection::factory`] share their state, so reconnection attempts
/// stay observable through a single handle.
pub struct MockConnection {
    state: Arc<Mutex<MockConnState>>,
}

impl MockConnection {
    /// A connection factory plus the handle observing every instance it
    /// produces.
    #[must_use]
    pub fn factory() -> (ConnectionFactory, MockConnectionHandle) {
        let state = Arc::new(Mutex::new(MockConnState::default()));
        let handle = MockConnectionHandle {
            state: Arc::clone(&state),
        };
        let factory: ConnectionFactory = Box::new(move || {
            Ok(Box::new(MockConnection {
                state: Arc::clone(&state),
            }) as Box<dyn HubConnection>)
        });
        (factory, handle)
    }
}

impl HubConnection for MockConnection {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open_count += 1;
        if state.open_fail_remaining > 0 {
            state.open_fail_remaining -= 1;
            let error = state
                .open_error_factory
                .as_ref()
                .map_or_else(|| TransportError::io("scripted open failure"), |f| f());
            return Err(error);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().close_count += 1;
        Ok(())
    }

    fn send_message(
        &mut self,
        message: &TransportMessage,
    ) -> Result<HubStatusCode, TransportError> {
        let hook = {
            let mut state = self.state.lock();
            state.sent.push(message.clone());
            state.on_send.clone()
        };
        if let Some(hook) = hook {
            hook(message);
        }
        Ok(HubStatusCode::OkEmpty)
    }

    fn receive_message(&mut self) -> Result<Option<TransportMessage>, TransportError> {
        Ok(self.state.lock().poll_messages.pop_front())
    }

    fn set_listener(&mut self, listener: Arc<dyn TransportListener>) {
        self.state.lock().listener = Some(listener);
    }
}

/// Observation and scripting surface shared by every connection a factory
/// produced.
#[derive(Clone)]
pub struct MockConnectionHandle {
    state: Arc<Mutex<MockConnState>>,
}

impl MockConnectionHandle {
    /// The listener the dispatch layer registered on the latest connection.
    ///
    /// # Panics
    ///
    /// Panics if no connection has been opened yet.
    #[must_use]
    pub fn listener(&self) -> Arc<dyn TransportListener> {
        self.state
            .lock()
            .listener
            .clone()
            .expect("no listener was registered yet")
    }

    #[must_use]
    pub fn sent(&self) -> Vec<TransportMessage> {
        self.state.lock().sent.clone()
    }

    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Makes the next `count` open attempts fail with errors built by `make`.
    pub fn fail_next_opens(
        &self,
        count: usize,
        make: impl Fn() -> TransportError + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock();
        state.open_fail_remaining = count;
        state.open_error_factory = Some(Arc::new(make));
    }

    /// Queues a message returned from the next poll (`receive_message`).
    pub fn queue_poll_message(&self, message: TransportMessage) {
        self.state.lock().poll_messages.push_back(message);
    }

    /// Invoked inside every `send_message`, while the dispatch layer's send
    /// cycle is mid-drain.
    pub fn set_on_send(&self, hook: impl Fn(&TransportMessage) + Send + Sync + 'static) {
        self.state.lock().on_send = Some(Arc::new(hook));
    }
}

/// Records every transport listener callback for assertions.
#[derive(Default)]
pub struct RecordingTransportListener {
    pub established: AtomicUsize,
    pub lost: Mutex<Vec<TransportError>>,
    pub received: Mutex<Vec<Result<TransportMessage, TransportError>>>,
    pub sent: Mutex<Vec<(String, Option<TransportError>)>>,
}

impl TransportListener for RecordingTransportListener {
    fn on_connection_established(&self) {
        self.established
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn on_connection_lost(&self, cause: TransportError) {
        self.lost.lock().push(cause);
    }

    fn on_message_received(&self, message: Result<TransportMessage, TransportError>) {
        self.received.lock().push(message);
    }

    fn on_message_sent(&self, message_id: &str, error: Option<TransportError>) {
        self.sent.lock().push((message_id.to_string(), error));
    }
}
