//! Boundary classifiers: raw protocol failures become [`TransportError`]
//! values at the point where they are first observed.

use hublink_amqp::AmqpError;

use crate::error::TransportError;

/// Classifies an AMQP error condition reported by the remote peer.
#[must_use]
pub fn classify_amqp_condition(condition: &str, description: &str) -> TransportError {
    let message = if description.is_empty() {
        condition.to_string()
    } else {
        format!("{condition}: {description}")
    };

    match condition {
        "amqp:unauthorized-access" => TransportError::unauthorized(message),
        "amqp:resource-limit-exceeded" => TransportError::throttled(message),
        "amqp:internal-error" => TransportError::internal(message),
        "amqp:resource-locked" | "amqp:link:stolen" => TransportError::server_busy(message),
        "amqp:link:message-size-exceeded" | "amqp:frame-size-too-small" => {
            TransportError::too_large(message)
        }
        "amqp:not-found" | "amqp:not-implemented" | "amqp:not-allowed"
        | "amqp:precondition-failed" | "amqp:decode-error" | "amqp:invalid-field" => {
            TransportError::protocol(message)
        }
        "amqp:connection:forced"
        | "amqp:connection:framing-error"
        | "amqp:connection:redirect"
        | "amqp:session:window-violation"
        | "amqp:session:errant-link"
        | "amqp:session:handle-in-use"
        | "amqp:session:unattached-handle"
        | "amqp:link:detach-forced"
        | "amqp:link:transfer-limit-exceeded"
        | "amqp:link:redirect" => TransportError::io(message),
        _ => TransportError::io(message),
    }
}

/// Classifies a local AMQP client error.
#[must_use]
pub fn classify_amqp_error(error: &AmqpError) -> TransportError {
    match error {
        AmqpError::Sasl(msg) => TransportError::unauthorized(msg.clone()),
        AmqpError::Io(msg) | AmqpError::ConnectionError(msg) | AmqpError::LinkError(msg) => {
            TransportError::io(msg.clone())
        }
        AmqpError::Decode(msg) => TransportError::protocol(msg.clone()),
        AmqpError::InvalidArgument(msg) => TransportError::other(msg.clone()),
    }
}

/// Classifies an MQTT CONNACK return code (3.1.1 numbering).
#[must_use]
pub fn classify_mqtt_connect_code(code: u8) -> TransportError {
    match code {
        1 => TransportError::protocol("connection refused: unacceptable protocol version"),
        2 => TransportError::protocol("connection refused: identifier rejected"),
        3 => TransportError::server_busy("connection refused: server unavailable"),
        4 => TransportError::unauthorized("connection refused: bad user name or password"),
        5 => TransportError::unauthorized("connection refused: not authorized"),
        _ => TransportError::other(format!("connection refused: unknown return code {code}")),
    }
}

/// Classifies a failing HTTP response status; `None` for success statuses.
#[must_use]
pub fn classify_http_status(status: u16) -> Option<TransportError> {
    if (200..300).contains(&status) {
        return None;
    }
    let message = format!("request failed with status {status}");
    Some(match status {
        401 | 403 => TransportError::unauthorized(message),
        413 => TransportError::too_large(message),
        429 => TransportError::throttled(message),
        503 => TransportError::server_busy(message),
        500..=599 => TransportError::internal(message),
        _ => TransportError::other(message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_amqp_condition_classification() {
        let error = classify_amqp_condition("amqp:unauthorized-access", "bad token");
        assert_eq!(error.kind(), ErrorKind::Unauthorized);
        assert!(!error.is_retryable());
        assert!(error.message().contains("bad token"));

        let error = classify_amqp_condition("amqp:resource-limit-exceeded", "");
        assert_eq!(error.kind(), ErrorKind::Throttled);
        assert!(error.is_retryable());

        let error = classify_amqp_condition("amqp:internal-error", "");
        assert_eq!(error.kind(), ErrorKind::InternalServerError);
        assert!(error.is_retryable());

        let error = classify_amqp_condition("amqp:connection:forced", "");
        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.is_retryable());

        let error = classify_amqp_condition("amqp:decode-error", "");
        assert_eq!(error.kind(), ErrorKind::Protocol);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_unknown_amqp_condition_defaults_to_retryable_io() {
        let error = classify_amqp_condition("amqp:something-new", "");
        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_local_amqp_error_classification() {
        let error = classify_amqp_error(&AmqpError::Sasl("rejected".to_string()));
        assert_eq!(error.kind(), ErrorKind::Unauthorized);

        let error = classify_amqp_error(&AmqpError::Io("reset".to_string()));
        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.is_retryable());

        let error = classify_amqp_error(&AmqpError::InvalidArgument("empty".to_string()));
        assert_eq!(error.kind(), ErrorKind::Other);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_mqtt_connect_code_classification() {
        assert_eq!(classify_mqtt_connect_code(1).kind(), ErrorKind::Protocol);
        assert_eq!(classify_mqtt_connect_code(2).kind(), ErrorKind::Protocol);
        assert_eq!(classify_mqtt_connect_code(3).kind(), ErrorKind::ServerBusy);
        assert!(classify_mqtt_connect_code(3).is_retryable());
        assert_eq!(classify_mqtt_connect_code(4).kind(), ErrorKind::Unauthorized);
        assert_eq!(classify_mqtt_connect_code(5).kind(), ErrorKind::Unauthorized);
        assert!(!classify_mqtt_connect_code(5).is_retryable());
        assert_eq!(classify_mqtt_connect_code(77).kind(), ErrorKind::Other);
    }

    #[test]
    fn test_http_status_classification() {
        assert!(classify_http_status(200).is_none());
        assert!(classify_http_status(204).is_none());
        assert_eq!(
            classify_http_status(401).unwrap().kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            classify_http_status(413).unwrap().kind(),
            ErrorKind::RequestEntityTooLarge
        );
        assert_eq!(
            classify_http_status(429).unwrap().kind(),
            ErrorKind::Throttled
        );
        assert_eq!(
            classify_http_status(503).unwrap().kind(),
            ErrorKind::ServerBusy
        );
        assert_eq!(
            classify_http_status(500).unwrap().kind(),
            ErrorKind::InternalServerError
        );
        assert_eq!(classify_http_status(404).unwrap().kind(), ErrorKind::Other);
    }
}
