//! Shared-access-signature authentication and its SASL PLAIN handler.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use hublink_amqp::error::{AmqpError, Result as AmqpResult};
use hublink_amqp::sasl::{SaslHandler, SaslOutcome};

use crate::error::TransportError;

type HmacSha256 = Hmac<Sha256>;

const PLAIN_MECHANISM: &str = "PLAIN";

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn encode_uri_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// A shared access signature scoped to one resource URI.
#[derive(Debug, Clone)]
pub struct SasToken {
    token: String,
    expires_at: u64,
}

impl SasToken {
    /// Signs `resource_uri` with the base64 device key, valid for
    /// `time_to_live` from now.
    ///
    /// # Errors
    ///
    /// Returns an error if the device key is not valid base64.
    pub fn generate(
        resource_uri: &str,
        device_key_base64: &str,
        time_to_live: Duration,
    ) -> Result<Self, TransportError> {
        let key = BASE64
            .decode(device_key_base64)
            .map_err(|e| TransportError::other(format!("the device key is not valid base64: {e}")))?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TransportError::other(format!("system clock is before the epoch: {e}")))?
            .as_secs();
        let expires_at = now + time_to_live.as_secs();

        let encoded_uri = encode_uri_component(resource_uri);
        let to_sign = format!("{encoded_uri}\n{expires_at}");

        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| TransportError::other(format!("invalid hmac key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let token = format!(
            "SharedAccessSignature sr={encoded_uri}&sig={}&se={expires_at}",
            encode_uri_component(&signature)
        );
        Ok(Self { token, expires_at })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Expiry as seconds since the epoch.
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|now| now.as_secs() >= self.expires_at)
            .unwrap_or(true)
    }
}

/// SASL PLAIN over a shared access signature: the token is the password, the
/// hub-scoped identity is the authentication id.
pub struct SasPlainHandler {
    username: String,
    token: String,
    outcome: Option<SaslOutcome>,
}

impl SasPlainHandler {
    /// `username` is the hub-scoped identity, e.g. `device-1@sas.hub-name`.
    #[must_use]
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
            outcome: None,
        }
    }

    #[must_use]
    pub fn outcome(&self) -> Option<SaslOutcome> {
        self.outcome
    }
}

impl SaslHandler for SasPlainHandler {
    fn choose_mechanism(&mut self, offered: &[String]) -> AmqpResult<String> {
        if offered.iter().any(|m| m == PLAIN_MECHANISM) {
            Ok(PLAIN_MECHANISM.to_string())
        } else {
            Err(AmqpError::Sasl(format!(
                "the remote peer offered no supported mechanism (offered: {})",
                offered.join(", ")
            )))
        }
    }

    fn init_payload(&mut self, mechanism: &str) -> AmqpResult<Vec<u8>> {
        if mechanism != PLAIN_MECHANISM {
            return Err(AmqpError::Sasl(format!(
                "cannot build an init payload for mechanism {mechanism}"
            )));
        }
        // PLAIN: authzid NUL authcid NUL passwd, with an empty authzid.
        let mut payload = Vec::with_capacity(2 + self.username.len() + self.token.len());
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.token.as_bytes());
        Ok(payload)
    }

    fn handle_challenge(&mut self, _challenge: &[u8]) -> AmqpResult<Vec<u8>> {
        // PLAIN is a single round trip.
        Err(AmqpError::Sasl(
            "unexpected challenge during PLAIN negotiation".to_string(),
        ))
    }

    fn handle_outcome(&mut self, outcome: SaslOutcome) {
        self.outcome = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "c2VjcmV0LWRldmljZS1rZXk="; // "secret-device-key"

    #[test]
    fn test_token_shape() {
        let token =
            SasToken::generate("hub.example.test/devices/d1", TEST_KEY, Duration::from_secs(3600))
                .unwrap();
        let rendered = token.as_str();
        assert!(rendered.starts_with("SharedAccessSignature sr=hub.example.test%2Fdevices%2Fd1"));
        assert!(rendered.contains("&sig="));
        assert!(rendered.ends_with(&format!("&se={}", token.expires_at())));
        assert!(!token.is_expired());
    }

    #[test]
    fn test_bad_key_is_rejected() {
        let result = SasToken::generate("r", "not-base64!!!", Duration::from_secs(60));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_ttl_token_is_expired() {
        let token = SasToken::generate("r", TEST_KEY, Duration::from_secs(0)).unwrap();
        assert!(token.is_expired());
    }

    #[test]
    fn test_uri_component_encoding() {
        assert_eq!(encode_uri_component("abc-123_~."), "abc-123_~.");
        assert_eq!(encode_uri_component("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_uri_component("k=v&x"), "k%3Dv%26x");
    }

    #[test]
    fn test_plain_handler_chooses_plain() {
        let mut handler = SasPlainHandler::new("d1@sas.hub", "token");
        let offered = vec!["ANONYMOUS".to_string(), "PLAIN".to_string()];
        assert_eq!(handler.choose_mechanism(&offered).unwrap(), "PLAIN");
    }

    #[test]
    fn test_plain_handler_rejects_unsupported_sets() {
        let mut handler = SasPlainHandler::new("d1@sas.hub", "token");
        let offered = vec!["SCRAM-SHA-256".to_string()];
        assert!(handler.choose_mechanism(&offered).is_err());
    }

    #[test]
    fn test_plain_init_payload_layout() {
        let mut handler = SasPlainHandler::new("user", "pass");
        let payload = handler.init_payload("PLAIN").unwrap();
        assert_eq!(payload, b"\0user\0pass");
    }

    #[test]
    fn test_plain_rejects_challenges() {
        let mut handler = SasPlainHandler::new("user", "pass");
        assert!(handler.handle_challenge(b"challenge").is_err());
    }

    #[test]
    fn test_outcome_is_recorded() {
        let mut handler = SasPlainHandler::new("user", "pass");
        assert!(handler.outcome().is_none());
        handler.handle_outcome(SaslOutcome::Ok);
        assert_eq!(handler.outcome(), Some(SaslOutcome::Ok));
    }
}
