//! Client configuration consumed by the transport layers.

use std::sync::Arc;
use std::time::Duration;

use hublink_amqp::TlsContext;

use crate::error::TransportError;
use crate::message::Protocol;

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_RECEIVE_POLL_PERIOD: Duration = Duration::from_secs(25);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Shared-access-signature credentials for token-based authentication.
#[derive(Clone)]
pub struct SasAuth {
    /// The device's base64 symmetric key.
    pub device_key: String,
    /// Lifetime of each generated token.
    pub token_ttl: Duration,
}

impl SasAuth {
    #[must_use]
    pub fn new(device_key: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

impl std::fmt::Debug for SasAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasAuth")
            .field("device_key", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

/// Everything a protocol connection needs to reach the hub for one device.
///
/// The client version string is an explicitly constructed value carried in
/// the configuration; nothing here is process-global.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    hostname: String,
    device_id: String,
    module_id: Option<String>,
    protocol: Protocol,
    tls: TlsContext,
    sas: Option<SasAuth>,
    client_version: String,
    open_timeout: Duration,
    receive_poll_period: Duration,
}

impl ClientConfig {
    /// # Errors
    ///
    /// Fails fast, before any I/O, when the hostname or device id is empty.
    pub fn new(
        hostname: impl Into<String>,
        device_id: impl Into<String>,
        protocol: Protocol,
    ) -> Result<Self, TransportError> {
        let hostname = hostname.into();
        let device_id = device_id.into();
        if hostname.is_empty() {
            return Err(TransportError::other("the hostname cannot be empty"));
        }
        if device_id.is_empty() {
            return Err(TransportError::other("the device id cannot be empty"));
        }

        Ok(Self {
            hostname,
            device_id,
            module_id: None,
            protocol,
            tls: TlsContext::platform(),
            sas: None,
            client_version: format!("hublink/{}", env!("CARGO_PKG_VERSION")),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            receive_poll_period: DEFAULT_RECEIVE_POLL_PERIOD,
        })
    }

    #[must_use]
    pub fn with_module_id(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    #[must_use]
    pub fn with_tls(mut self, client_config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = TlsContext::with_client_config(client_config);
        self
    }

    /// Absence of SAS credentials implies certificate-based authentication:
    /// no SASL frames are exchanged on the AMQP connection.
    #[must_use]
    pub fn with_sas_auth(mut self, sas: SasAuth) -> Self {
        self.sas = Some(sas);
        self
    }

    #[must_use]
    pub fn with_client_version(mut self, client_version: impl Into<String>) -> Self {
        self.client_version = client_version.into();
        self
    }

    #[must_use]
    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    #[must_use]
    pub fn with_receive_poll_period(mut self, period: Duration) -> Self {
        self.receive_poll_period = period;
        self
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn tls(&self) -> &TlsContext {
        &self.tls
    }

    #[must_use]
    pub fn sas_auth(&self) -> Option<&SasAuth> {
        self.sas.as_ref()
    }

    /// Whether the credentials can be renewed on reconnect, which makes an
    /// authorization failure worth retrying.
    #[must_use]
    pub fn credentials_renewable(&self) -> bool {
        self.sas.is_some()
    }

    #[must_use]
    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    #[must_use]
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    #[must_use]
    pub fn receive_poll_period(&self) -> Duration {
        self.receive_poll_period
    }

    /// The hub-scoped identity used as the SASL authentication id.
    #[must_use]
    pub fn sas_username(&self) -> String {
        match &self.module_id {
            Some(module_id) => {
                format!("{}/{}@sas.{}", self.device_id, module_id, self.hostname)
            }
            None => format!("{}@sas.{}", self.device_id, self.hostname),
        }
    }

    /// The token-signing scope for this device.
    #[must_use]
    pub fn sas_resource_uri(&self) -> String {
        format!("{}/devices/{}", self.hostname, self.device_id)
    }
}
