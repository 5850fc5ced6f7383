//! Device twin and direct-method payload DTOs.
//!
//! These are the serialize/deserialize contracts the transport core hands to
//! its collaborators; the dispatch layer itself only moves their encoded
//! bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;

/// A property bag, as either half of a twin document.
pub type TwinCollection = BTreeMap<String, Value>;

/// The twin document exchanged with the hub: service-set desired properties
/// and device-reported properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinState {
    #[serde(default, skip_serializing_if = "TwinCollection::is_empty")]
    pub desired: TwinCollection,
    #[serde(default, skip_serializing_if = "TwinCollection::is_empty")]
    pub reported: TwinCollection,
    #[serde(rename = "$version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl TwinState {
    /// # Errors
    ///
    /// Returns a protocol error when the payload is not a valid twin
    /// document.
    pub fn from_json(payload: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(payload)
            .map_err(|e| TransportError::protocol(format!("malformed twin document: {e}")))
    }

    /// # Errors
    ///
    /// Returns a protocol error when the document cannot be serialized.
    pub fn to_json(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self)
            .map_err(|e| TransportError::protocol(format!("could not serialize the twin: {e}")))
    }
}

/// An invocation of a direct method on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMethodRequest {
    #[serde(rename = "methodName")]
    pub method_name: String,
    #[serde(rename = "responseTimeoutInSeconds", skip_serializing_if = "Option::is_none")]
    pub response_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// The device's answer to a direct method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMethodResponse {
    pub status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl DirectMethodResponse {
    #[must_use]
    pub fn new(status: i32, payload: Option<Value>) -> Self {
        Self { status, payload }
    }
}
