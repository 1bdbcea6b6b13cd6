//! Job envelope codec.
//!
//! The envelope freezes everything a worker needs at enqueue time: the
//! destination's endpoint and credentials, the transformed payload and the
//! event identity. Workers decode it once after taking the lock and never
//! look at live destination configuration.

use hookrelay_core::models::{Destination, DestinationId, EventIdentity};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeliveryError, Result};

/// Destination fields captured at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSnapshot {
    /// Destination identifier.
    pub id: DestinationId,
    /// Display name.
    pub name: String,
    /// URL the payload is posted to.
    pub endpoint_url: String,
    /// `Authorization` header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
}

impl From<&Destination> for DestinationSnapshot {
    fn from(destination: &Destination) -> Self {
        Self {
            id: destination.id,
            name: destination.name.clone(),
            endpoint_url: destination.endpoint_url.clone(),
            auth_header: destination.auth_header.clone(),
        }
    }
}

/// Immutable snapshot stored in a queue job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Where to deliver.
    pub destination: DestinationSnapshot,
    /// Transformed payload, sent as the request body.
    pub payload: Value,
    /// Payload before transformation.
    #[serde(default)]
    pub original_payload: Option<Value>,
    /// Whether a transformation was applied.
    #[serde(default)]
    pub mapping_applied: bool,
    /// Identity shared with the other destinations of the same firing.
    pub event: EventIdentity,
}

impl JobEnvelope {
    /// Serializes the envelope for storage.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Encoding` if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DeliveryError::encoding(e.to_string()))
    }

    /// Parses a stored envelope.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::MalformedEnvelope` for invalid JSON or missing
    /// fields.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| DeliveryError::malformed_envelope(e.to_string()))
    }

    /// Request body sent to the destination.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Encoding` if serialization fails.
    pub fn body(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.payload).map_err(|e| DeliveryError::encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn envelope() -> JobEnvelope {
        let destination = Destination::new("crm", "https://example.com/hook", ["wp_login"])
            .with_auth_header("Bearer secret");
        JobEnvelope {
            destination: DestinationSnapshot::from(&destination),
            payload: json!({"hook": "wp_login"}),
            original_payload: None,
            mapping_applied: false,
            event: EventIdentity::new(Utc::now()),
        }
    }

    #[test]
    fn decode_reads_what_encode_wrote() {
        let envelope = envelope();

        let decoded = JobEnvelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.destination.auth_header.as_deref(), Some("Bearer secret"));
    }

    #[test]
    fn invalid_json_is_malformed() {
        let error = JobEnvelope::decode("{not json").unwrap_err();
        assert!(matches!(error, DeliveryError::MalformedEnvelope { .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn missing_payload_is_malformed() {
        let mut value = serde_json::to_value(envelope()).unwrap();
        value.as_object_mut().unwrap().remove("payload");

        let error = JobEnvelope::decode(&value.to_string()).unwrap_err();

        assert!(error.to_string().starts_with("Invalid job payload"));
    }
}
