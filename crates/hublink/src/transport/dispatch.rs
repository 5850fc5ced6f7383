//! The transport dispatcher: four queues, three cooperating workers, and the
//! reconnection procedure.
//!
//! Each worker owns one single-cycle function that handles exactly the work
//! visible at the moment it wakes; the runner threads just invoke the cycle
//! in a loop. Workers park on doorbells rung by the dispatch layer, so an
//! idle transport costs nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use hublink_amqp::sync::Gate;

use crate::error::{ErrorKind, TransportError};
use crate::message::{Protocol, TransportMessage};
use crate::retry::RetryPolicy;
use crate::status::HubStatusCode;
use crate::wake::Doorbell;

use super::{ConnectionStatus, HubConnection, StatusChangeReason, TransportListener};

/// Completion callback for one queued message.
pub type SendCallback = Box<dyn FnOnce(HubStatusCode) + Send>;

/// Builds a fresh protocol connection; invoked on open and on every
/// reconnection attempt.
pub type ConnectionFactory =
    Box<dyn Fn() -> Result<Box<dyn HubConnection>, TransportError> + Send + Sync>;

type MessageHandler = Arc<dyn Fn(TransportMessage) + Send + Sync>;
type StatusCallback = Arc<dyn Fn(ConnectionStatus, StatusChangeReason) + Send + Sync>;

struct OutboundPacket {
    message: TransportMessage,
    callback: Option<SendCallback>,
}

struct CallbackPacket {
    status: HubStatusCode,
    callback: SendCallback,
}

struct Core {
    protocol: Protocol,
    receive_poll_period: Mutex<Duration>,
    credentials_renewable: AtomicBool,

    status: Mutex<ConnectionStatus>,
    closed: AtomicBool,
    shutdown_gate: Gate,

    /* Messages waiting to be sent to the hub. */
    waiting: Mutex<VecDeque<OutboundPacket>>,
    /* Messages on the wire whose acknowledgment is still outstanding. */
    in_progress: Mutex<HashMap<String, OutboundPacket>>,
    /* Messages received from the hub, waiting to be handled. */
    received: Mutex<VecDeque<TransportMessage>>,
    /* Completion callbacks waiting to be invoked. */
    callbacks: Mutex<VecDeque<CallbackPacket>>,

    send_signal: Doorbell,
    receive_signal: Doorbell,
    reconnect_signal: Doorbell,

    connection: Mutex<Option<Box<dyn HubConnection>>>,
    connection_factory: ConnectionFactory,
    retry_policy: Mutex<Box<dyn RetryPolicy>>,
    disconnect_cause: Mutex<Option<TransportError>>,

    message_handler: Mutex<Option<MessageHandler>>,
    status_callback: Mutex<Option<StatusCallback>>,
}

/// The protocol-agnostic device transport.
pub struct DeviceTransport {
    core: Arc<Core>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceTransport {
    #[must_use]
    pub fn new(
        protocol: Protocol,
        connection_factory: ConnectionFactory,
        retry_policy: Box<dyn RetryPolicy>,
    ) -> Self {
        let core = Core {
            protocol,
            receive_poll_period: Mutex::new(Duration::from_secs(25)),
            credentials_renewable: AtomicBool::new(false),
            status: Mutex::new(ConnectionStatus::Disconnected),
            closed: AtomicBool::new(true),
            shutdown_gate: Gate::new(),
            waiting: Mutex::new(VecDeque::new()),
            in_progress: Mutex::new(HashMap::new()),
            received: Mutex::new(VecDeque::new()),
            callbacks: Mutex::new(VecDeque::new()),
            send_signal: Doorbell::new(),
            receive_signal: Doorbell::new(),
            reconnect_signal: Doorbell::new(),
            connection: Mutex::new(None),
            connection_factory,
            retry_policy: Mutex::new(retry_policy),
            disconnect_cause: Mutex::new(None),
            message_handler: Mutex::new(None),
            status_callback: Mutex::new(None),
        };
        Self {
            core: Arc::new(core),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_receive_poll_period(self, period: Duration) -> Self {
        *self.core.receive_poll_period.lock() = period;
        self
    }

    /// Marks the credentials renewable: authorization failures become
    /// retryable because a fresh token is minted on re-open.
    #[must_use]
    pub fn with_renewable_credentials(self, renewable: bool) -> Self {
        self.core
            .credentials_renewable
            .store(renewable, Ordering::SeqCst);
        self
    }

    pub fn set_message_handler(
        &self,
        handler: impl Fn(TransportMessage) + Send + Sync + 'static,
    ) {
        *self.core.message_handler.lock() = Some(Arc::new(handler));
    }

    pub fn set_status_callback(
        &self,
        callback: impl Fn(ConnectionStatus, StatusChangeReason) + Send + Sync + 'static,
    ) {
        *self.core.status_callback.lock() = Some(Arc::new(callback));
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.core.status.lock()
    }

    /// Opens the protocol connection and starts the three workers. Does
    /// nothing if already connected.
    ///
    /// # Errors
    ///
    /// Returns the classified open failure, or a retryable IO error when a
    /// reconnection is currently in progress.
    pub fn open(&self) -> Result<(), TransportError> {
        {
            let status = *self.core.status.lock();
            if status == ConnectionStatus::Connected {
                return Ok(());
            }
            if status == ConnectionStatus::DisconnectedRetrying {
                return Err(TransportError::io(
                    "cannot open while a reconnection is in progress",
                ));
            }
        }

        self.core.closed.store(false, Ordering::SeqCst);
        self.core.shutdown_gate.reset();
        Core::open_connection(&self.core)?;
        self.core
            .update_status(ConnectionStatus::Connected, StatusChangeReason::ConnectionOk);
        self.spawn_workers()?;
        Ok(())
    }

    /// Closes the transport: queued and in-flight messages complete with
    /// `MessageCancelledOnClose`, the connection closes, and all workers are
    /// woken and joined. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the protocol connection's close failure, after the transport
    /// has been marked closed either way.
    pub fn close(&self) -> Result<(), TransportError> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing the transport");
        self.core.shutdown_gate.open();

        // Every worker is woken once more so it observes the closed flag;
        // cancellation happens only after they are quiescent, so no message
        // can slip between the queues mid-shutdown.
        self.core.send_signal.ring();
        self.core.receive_signal.ring();
        self.core.reconnect_signal.ring();
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }

        self.core.cancel_pending();
        self.core.invoke_callbacks();

        let connection = self.core.connection.lock().take();
        let result = match connection {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        };

        self.core
            .update_status(ConnectionStatus::Disconnected, StatusChangeReason::ClientClose);

        result
    }

    /// Queues a message; its callback fires exactly once with the terminal
    /// status.
    ///
    /// # Errors
    ///
    /// Refused when the transport is closed.
    pub fn send_message(
        &self,
        message: TransportMessage,
        callback: SendCallback,
    ) -> Result<(), TransportError> {
        if *self.core.status.lock() == ConnectionStatus::Disconnected {
            return Err(TransportError::other(
                "cannot add a message when the transport is closed",
            ));
        }
        self.core.waiting.lock().push_back(OutboundPacket {
            message,
            callback: Some(callback),
        });
        self.core.send_signal.ring();
        Ok(())
    }

    fn spawn_workers(&self) -> Result<(), TransportError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }

        let send_core = Arc::clone(&self.core);
        workers.push(spawn_worker("hublink-send-worker", move || {
            while !send_core.closed.load(Ordering::SeqCst) {
                send_core.send_cycle();
            }
            debug!("send worker stopped");
        })?);

        let receive_core = Arc::clone(&self.core);
        workers.push(spawn_worker("hublink-receive-worker", move || {
            let poll_based = receive_core.protocol.is_poll_based();
            let poll_period = *receive_core.receive_poll_period.lock();
            while !receive_core.closed.load(Ordering::SeqCst) {
                receive_core.receive_cycle();
                if poll_based {
                    // Poll-based protocols are paced by the runner; the cycle
                    // itself never waits.
                    receive_core.receive_signal.wait_timeout(poll_period);
                }
            }
            debug!("receive worker stopped");
        })?);

        let reconnect_core = Arc::clone(&self.core);
        workers.push(spawn_worker("hublink-reconnect-worker", move || {
            while !reconnect_core.closed.load(Ordering::SeqCst) {
                Core::reconnect_cycle(&reconnect_core);
            }
            debug!("reconnect worker stopped");
        })?);

        Ok(())
    }
}

fn spawn_worker(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, TransportError> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| TransportError::io(format!("could not spawn {name}: {e}")))
}

impl Core {
    /// One send wake: drain the outbound snapshot, then invoke the callback
    /// snapshot. Sends queued while this cycle runs wait for the next wake.
    fn send_cycle(&self) {
        self.send_signal.wait();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.drain_outbound();
        self.invoke_callbacks();
    }

    fn drain_outbound(&self) {
        if *self.status.lock() != ConnectionStatus::Connected {
            return;
        }
        let batch: Vec<OutboundPacket> = self.waiting.lock().drain(..).collect();
        for packet in batch {
            self.send_packet(packet);
        }
    }

    fn send_packet(&self, packet: OutboundPacket) {
        if packet.message.message().is_expired() {
            debug!(
                message_id = packet.message.message().message_id(),
                "message expired before it could be sent"
            );
            self.queue_callback(packet, HubStatusCode::MessageExpired);
            return;
        }

        let ack_needed = packet.message.ack_needed(self.protocol);
        let message = packet.message.clone();
        let message_id = message.message().message_id().to_string();

        if ack_needed {
            // In flight until the service acknowledges; never present in both
            // the outbound queue and the in-flight map.
            self.in_progress.lock().insert(message_id.clone(), packet);
            let result = self.send_on_connection(&message);
            if let Err(error) = result {
                if let Some(packet) = self.in_progress.lock().remove(&message_id) {
                    self.handle_message_error(packet, &error);
                }
            }
        } else {
            match self.send_on_connection(&message) {
                Ok(status) => self.queue_callback(packet, status),
                Err(error) => self.handle_message_error(packet, &error),
            }
        }
    }

    fn send_on_connection(
        &self,
        message: &TransportMessage,
    ) -> Result<HubStatusCode, TransportError> {
        let mut connection = self.connection.lock();
        match connection.as_mut() {
            Some(connection) => connection.send_message(message),
            None => Err(TransportError::io("no connection is currently open")),
        }
    }

    fn handle_message_error(&self, packet: OutboundPacket, error: &TransportError) {
        if error.is_retryable() {
            debug!(
                message_id = packet.message.message().message_id(),
                error = %error,
                "send failed; the message will be retried"
            );
            self.waiting.lock().push_back(packet);
        } else {
            self.queue_callback(packet, error.status_code());
        }
    }

    fn queue_callback(&self, packet: OutboundPacket, status: HubStatusCode) {
        if let Some(callback) = packet.callback {
            self.callbacks
                .lock()
                .push_back(CallbackPacket { status, callback });
        }
    }

    fn invoke_callbacks(&self) {
        let batch: Vec<CallbackPacket> = self.callbacks.lock().drain(..).collect();
        for packet in batch {
            (packet.callback)(packet.status);
        }
    }

    /// One receive wake. Push protocols park until a received message was
    /// flagged ready; poll protocols ask the connection directly on every
    /// invocation.
    fn receive_cycle(&self) {
        if self.protocol.is_poll_based() {
            let polled = {
                let mut connection = self.connection.lock();
                connection.as_mut().map(|connection| connection.receive_message())
            };
            match polled {
                Some(Ok(Some(message))) => self.received.lock().push_back(message),
                Some(Err(error)) => warn!(error = %error, "polling for messages failed"),
                _ => {}
            }
        } else {
            self.receive_signal.wait();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
        }

        // Exactly one batch: what was ready at this wake.
        let batch: Vec<TransportMessage> = self.received.lock().drain(..).collect();
        if batch.is_empty() {
            return;
        }
        let handler = self.message_handler.lock().clone();
        match handler {
            Some(handler) => {
                for message in batch {
                    handler(message);
                }
            }
            None => debug!(
                count = batch.len(),
                "received messages dropped; no handler registered"
            ),
        }
    }

    /// One reconnect wake: run the reconnection procedure for the recorded
    /// disconnection cause. A shutdown during the wait or the procedure is an
    /// ordinary exit, never an error.
    fn reconnect_cycle(this: &Arc<Self>) {
        this.reconnect_signal.wait();
        if this.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(cause) = this.disconnect_cause.lock().take() else {
            return;
        };
        Self::reconnect(this, cause);
    }

    fn reconnect(this: &Arc<Self>, mut cause: TransportError) {
        info!(error = %cause, "🔄 connection lost; starting reconnection");
        if this.credentials_renewable.load(Ordering::SeqCst)
            && cause.kind() == ErrorKind::Unauthorized
        {
            // A fresh token is minted on re-open.
            cause.set_retryable(true);
        }

        this.update_status(
            ConnectionStatus::DisconnectedRetrying,
            disconnect_reason(&cause),
        );

        // In-flight messages may never have reached the wire; send them again.
        {
            let mut in_progress = this.in_progress.lock();
            let mut waiting = this.waiting.lock();
            for (_, packet) in in_progress.drain() {
                waiting.push_back(packet);
            }
        }

        let mut attempt: u32 = 0;
        let gave_up = loop {
            if this.closed.load(Ordering::SeqCst) {
                return;
            }
            let stale = this.connection.lock().take();
            if let Some(mut connection) = stale {
                let _ = connection.close();
            }

            let decision = this.retry_policy.lock().should_retry(attempt, &cause);
            if !decision.should_retry {
                break true;
            }
            // A bounded, interruptible backoff: close() opens the gate.
            if this.shutdown_gate.wait_timeout(decision.delay) {
                return;
            }

            attempt += 1;
            match Self::open_connection(this) {
                Ok(()) => break false,
                Err(error) => {
                    warn!(error = %error, attempt, "reconnection attempt failed");
                    cause = error;
                    if this.credentials_renewable.load(Ordering::SeqCst)
                        && cause.kind() == ErrorKind::Unauthorized
                    {
                        cause.set_retryable(true);
                    }
                }
            }
        };

        if gave_up {
            warn!(error = %cause, "reconnection abandoned");
            let reason = if cause.is_retryable() {
                StatusChangeReason::RetryExpired
            } else {
                disconnect_reason(&cause)
            };
            this.update_status(ConnectionStatus::Disconnected, reason);
            this.cancel_pending();
            this.invoke_callbacks();
        } else {
            info!(attempt, "🔄 connection re-established");
            this.update_status(ConnectionStatus::Connected, StatusChangeReason::ConnectionOk);
            this.send_signal.ring();
            this.receive_signal.ring();
        }
    }

    fn open_connection(this: &Arc<Self>) -> Result<(), TransportError> {
        let mut connection = (this.connection_factory)()?;
        connection.set_listener(Arc::new(DispatchListener {
            core: Arc::downgrade(this),
        }));
        connection.open()?;
        *this.connection.lock() = Some(connection);
        Ok(())
    }

    /// Completes every queued and in-flight message with
    /// `MessageCancelledOnClose`.
    fn cancel_pending(&self) {
        let mut cancelled: Vec<OutboundPacket> = Vec::new();
        cancelled.extend(self.waiting.lock().drain(..));
        cancelled.extend(self.in_progress.lock().drain().map(|(_, packet)| packet));
        for packet in cancelled {
            self.queue_callback(packet, HubStatusCode::MessageCancelledOnClose);
        }
    }

    fn update_status(&self, status: ConnectionStatus, reason: StatusChangeReason) {
        let changed = {
            let mut current = self.status.lock();
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        };
        if changed {
            info!(?status, ?reason, "connection status changed");
            let callback = self.status_callback.lock().clone();
            if let Some(callback) = callback {
                callback(status, reason);
            }
        }
    }
}

fn disconnect_reason(error: &TransportError) -> StatusChangeReason {
    if error.kind() == ErrorKind::Unauthorized {
        StatusChangeReason::BadCredential
    } else if error.is_retryable() {
        StatusChangeReason::NoNetwork
    } else {
        StatusChangeReason::CommunicationError
    }
}

/// The listener every protocol connection reports into. Holds the core
/// weakly: a connection outliving its transport must not keep the queues
/// alive.
struct DispatchListener {
    core: Weak<Core>,
}

impl TransportListener for DispatchListener {
    fn on_connection_established(&self) {
        debug!("protocol connection established");
    }

    fn on_connection_lost(&self, cause: TransportError) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        if *core.status.lock() != ConnectionStatus::Connected {
            // Already closing or mid-reconnect; nothing new to record.
            return;
        }
        *core.disconnect_cause.lock() = Some(cause);
        core.reconnect_signal.ring();
    }

    fn on_message_received(&self, message: Result<TransportMessage, TransportError>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match message {
            Ok(message) => {
                core.received.lock().push_back(message);
                core.receive_signal.ring();
            }
            Err(error) => warn!(error = %error, "receiving a message failed"),
        }
    }

    fn on_message_sent(&self, message_id: &str, error: Option<TransportError>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let packet = core.in_progress.lock().remove(message_id);
        let Some(packet) = packet else {
            warn!(
                message_id,
                "an acknowledgment arrived for a message that was never tracked"
            );
            return;
        };
        match error {
            None => core.queue_callback(packet, HubStatusCode::Ok),
            Some(error) => core.handle_message_error(packet, &error),
        }
        core.send_signal.ring();
    }
}
