//! End-to-end connection lifecycle against the scripted engine, driven
//! entirely through the crate's public surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use hublink_amqp::engine::DeliveryOutcome;
use hublink_amqp::testing::{wait_until, MockEngine, MockEngineHandle};
use hublink_amqp::{
    AmqpConnection, AmqpListener, AmqpMessage, EngineEvent, LinkOperations, LinkProperties,
    SendOutcome, TlsContext,
};

#[derive(Default)]
struct CountingListener {
    established: AtomicUsize,
    lost: AtomicUsize,
    received: Mutex<Vec<AmqpMessage>>,
    sent: Mutex<Vec<(String, SendOutcome)>>,
}

impl AmqpListener for CountingListener {
    fn connection_established(&self) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_lost(&self) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn message_received(&self, message: AmqpMessage) {
        self.received.lock().push(message);
    }

    fn message_sent(&self, delivery_tag: &str, outcome: &SendOutcome) {
        self.sent
            .lock()
            .push((delivery_tag.to_string(), outcome.clone()));
    }
}

fn open_connection() -> (AmqpConnection, MockEngineHandle, Arc<CountingListener>) {
    let engine = MockEngine::new();
    let handle = engine.handle();

    let mut properties = LinkProperties::new();
    properties.insert("client-version".to_string(), "hublink/0.1.0".to_string());
    let links = LinkOperations::new(
        "device-9",
        "/devices/device-9/messages/events",
        "/devices/device-9/messages/devicebound",
        properties,
    );

    let connection = AmqpConnection::new(
        "hub.example.test",
        links,
        Box::new(engine),
        TlsContext::platform(),
        None,
        false,
    )
    .unwrap()
    .with_open_timeout(Duration::from_secs(5))
    .with_shutdown_grace(Duration::from_secs(5));

    let listener = Arc::new(CountingListener::default());
    connection.set_listener(listener.clone());

    handle.push_event(EngineEvent::ConnectionBound);
    handle.push_event(EngineEvent::ConnectionInit);
    handle.push_event(EngineEvent::LinkInit {
        name: connection.receiver_tag(),
    });
    handle.push_event(EngineEvent::LinkInit {
        name: connection.sender_tag(),
    });
    handle.push_event(EngineEvent::LinkRemoteOpen {
        name: connection.sender_tag(),
    });
    handle.push_event(EngineEvent::LinkRemoteOpen {
        name: connection.receiver_tag(),
    });

    connection.open().unwrap();
    (connection, handle, listener)
}

#[test]
fn open_send_acknowledge_receive_close() {
    let (connection, handle, listener) = open_connection();
    assert!(connection.is_connected().unwrap());
    assert_eq!(listener.established.load(Ordering::SeqCst), 1);

    // Device-to-cloud: the message is handed to the link layer and the remote
    // peer accepts the delivery.
    let outbound = AmqpMessage::new(b"temperature: 21.4".to_vec()).with_message_id("d2c-1");
    assert!(connection.send_message(&outbound).unwrap());
    assert_eq!(handle.sent_deliveries().len(), 1);

    handle.set_remote_outcome(&connection.sender_tag(), DeliveryOutcome::Accepted);
    handle.push_event(EngineEvent::Delivery {
        name: connection.sender_tag(),
    });
    wait_until(|| !listener.sent.lock().is_empty());
    assert_eq!(
        listener.sent.lock()[0],
        ("0".to_string(), SendOutcome::Accepted)
    );

    // Cloud-to-device: a complete delivery decodes and reaches the listener
    // with its body intact.
    let inbound = AmqpMessage::new(vec![1, 2, 3, 255]).with_correlation_id("c2d-7");
    handle.queue_inbound(&connection.receiver_tag(), &inbound);
    handle.push_event(EngineEvent::Delivery {
        name: connection.receiver_tag(),
    });
    wait_until(|| !listener.received.lock().is_empty());
    {
        let received = listener.received.lock();
        assert_eq!(received[0].body(), &[1, 2, 3, 255]);
        assert_eq!(received[0].correlation_id(), Some("c2d-7"));
    }

    connection.close().unwrap();
    connection.close().unwrap();
    assert!(!connection.is_connected().unwrap());
    assert_eq!(handle.stop_count(), 1);
}

#[test]
fn transport_error_closes_without_reconnecting() {
    let (connection, handle, listener) = open_connection();

    handle.push_event(EngineEvent::TransportError {
        condition: "amqp:connection:forced".to_string(),
    });
    wait_until(|| listener.lost.load(Ordering::SeqCst) == 1);

    // The connection records the closure; acting on it is the dispatch
    // layer's job, so the engine was not asked to do anything else.
    assert!(!connection.is_connected().unwrap());
    assert_eq!(handle.connect_requests().len(), 1);

    connection.close().unwrap();
}
