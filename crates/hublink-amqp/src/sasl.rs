//! SASL negotiation: the pluggable handler contract and the listener that
//! drives challenge/response inside the engine's callback dispatch.

use tracing::{debug, error};

use crate::engine::{SaslFrames, SaslResult};
use crate::error::{AmqpError, Result};

/// Terminal outcome of a negotiation, as handed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslOutcome {
    /// Authentication succeeded.
    Ok,
    /// Authentication failed due to bad credentials.
    Auth,
    /// A system error occurred.
    Sys,
    /// A permanent system error occurred.
    SysPerm,
    /// A transient system error occurred; retrying may succeed.
    SysTemp,
}

/// The pluggable mechanism handler consumed by [`SaslNegotiator`].
pub trait SaslHandler: Send {
    /// Picks one mechanism out of the set the remote peer offered.
    ///
    /// # Errors
    ///
    /// Returns an error if no offered mechanism is acceptable.
    fn choose_mechanism(&mut self, offered: &[String]) -> Result<String>;

    /// Builds the init payload for the chosen mechanism.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be constructed.
    fn init_payload(&mut self, mechanism: &str) -> Result<Vec<u8>>;

    /// Computes the response to a server challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge is unexpected or malformed.
    fn handle_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    fn handle_outcome(&mut self, outcome: SaslOutcome);
}

/// Drives one connection's negotiation over the engine's SASL frames.
///
/// The negotiator runs inside the engine's callback dispatch and has no way to
/// surface errors synchronously, so every failure is captured as a saved
/// error; callers poll [`SaslNegotiator::saved_error`] after each step.
pub struct SaslNegotiator {
    handler: Box<dyn SaslHandler>,
    chosen_mechanism: Option<String>,
    saved_error: Option<AmqpError>,
}

impl SaslNegotiator {
    #[must_use]
    pub fn new(handler: Box<dyn SaslHandler>) -> Self {
        Self {
            handler,
            chosen_mechanism: None,
            saved_error: None,
        }
    }

    /// Mechanisms offered: choose one, set it on the engine, send the init
    /// payload. On a handler error nothing is sent.
    pub fn on_mechanisms(&mut self, sasl: &mut dyn SaslFrames) {
        let offered = sasl.remote_mechanisms();
        debug!(?offered, "remote sasl mechanisms offered");

        let mechanism = match self.handler.choose_mechanism(&offered) {
            Ok(mechanism) => mechanism,
            Err(e) => {
                self.saved_error = Some(e);
                return;
            }
        };
        sasl.set_mechanism(&mechanism);

        match self.handler.init_payload(&mechanism) {
            Ok(payload) => {
                sasl.send(&payload);
                self.chosen_mechanism = Some(mechanism);
            }
            Err(e) => {
                self.saved_error = Some(e);
            }
        }
    }

    /// Challenge received: read it, compute the response, send it. On a
    /// handler error no response is sent.
    pub fn on_challenge(&mut self, sasl: &mut dyn SaslFrames) {
        let mut challenge = vec![0u8; sasl.pending()];
        let read = sasl.recv(&mut challenge);
        challenge.truncate(read);

        match self.handler.handle_challenge(&challenge) {
            Ok(response) => sasl.send(&response),
            Err(e) => {
                self.saved_error = Some(e);
            }
        }
    }

    /// Outcome received: map the engine's result code and hand it to the
    /// handler. Every non-`Ok` terminal outcome is also captured as a saved
    /// error so the connection can raise it on the next status poll.
    pub fn on_outcome(&mut self, sasl: &mut dyn SaslFrames) {
        let outcome = match sasl.outcome() {
            SaslResult::Ok => SaslOutcome::Ok,
            SaslResult::Auth => SaslOutcome::Auth,
            SaslResult::Sys | SaslResult::Skipped => SaslOutcome::Sys,
            SaslResult::SysTemp => SaslOutcome::SysTemp,
            SaslResult::SysPerm => SaslOutcome::SysPerm,
            SaslResult::Pending => {
                // The engine must not report an outcome before negotiation
                // finishes; this path indicates a protocol violation.
                error!("sasl outcome event arrived before negotiation finished");
                self.saved_error = Some(AmqpError::Sasl(
                    "negotiation reported an outcome before it finished".to_string(),
                ));
                return;
            }
        };

        match outcome {
            SaslOutcome::Ok => {}
            SaslOutcome::Auth => {
                self.saved_error = Some(AmqpError::Sasl(
                    "the credentials were rejected by the remote peer".to_string(),
                ));
            }
            SaslOutcome::Sys | SaslOutcome::SysPerm => {
                self.saved_error = Some(AmqpError::Sasl(
                    "negotiation failed with a system error".to_string(),
                ));
            }
            SaslOutcome::SysTemp => {
                self.saved_error = Some(AmqpError::Sasl(
                    "negotiation failed with a transient system error".to_string(),
                ));
            }
        }

        self.handler.handle_outcome(outcome);
    }

    /// The last captured negotiation error, if any.
    #[must_use]
    pub fn saved_error(&self) -> Option<AmqpError> {
        self.saved_error.clone()
    }

    #[must_use]
    pub fn chosen_mechanism(&self) -> Option<&str> {
        self.chosen_mechanism.as_deref()
    }
}
