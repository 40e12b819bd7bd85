//! # Request-scoped types shared by the gateway and the worker
//!
//! - [`CorrelationId`] ties the gateway's and the worker's provisional
//!   records to the same logical request.
//! - [`ProvisionalRecord`] is the row each service writes inside its local
//!   transaction.
//! - [`CORRELATION_ID_METADATA`] is the out-of-band metadata key carrying the
//!   correlation id on the downstream call.

use crate::Error;
use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tonic::metadata::{MetadataMap, MetadataValue};

/// Metadata key used to carry the correlation id on the gateway -> worker
/// call.
pub const CORRELATION_ID_METADATA: &str = "x-correlation-id";

/// Maximum accepted length of a caller supplied correlation id.
pub const MAX_CORRELATION_ID_LEN: usize = 128;

/// Opaque identifier of one logical request, threaded unchanged through both
/// services.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Validates a caller supplied id.
    ///
    /// The id must be non-empty, at most [`MAX_CORRELATION_ID_LEN`] bytes and
    /// representable as an ASCII metadata value.
    pub fn parse(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(Error::InvalidRequest {
                reason: "correlation id must not be empty".to_string(),
            });
        }
        if raw.len() > MAX_CORRELATION_ID_LEN {
            return Err(Error::InvalidRequest {
                reason: format!(
                    "correlation id exceeds {MAX_CORRELATION_ID_LEN} bytes ({})",
                    raw.len()
                ),
            });
        }
        if !raw.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidRequest {
                reason: "correlation id must be printable ASCII without spaces".to_string(),
            });
        }
        Ok(Self(raw))
    }

    /// Generates a fresh id of the form `req-<unix millis hex>-<random hex>`.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self(format!("req-{millis:x}-{:08x}", rand::random::<u32>()))
    }

    /// Uses the supplied id when present, otherwise generates one.
    pub fn supplied_or_generate(raw: Option<String>) -> Result<Self, Error> {
        match raw {
            Some(raw) if !raw.is_empty() => Self::parse(raw),
            _ => Ok(Self::generate()),
        }
    }

    /// Reads the id from inbound gRPC metadata, if present and valid.
    pub fn from_metadata(metadata: &MetadataMap) -> Option<Self> {
        metadata
            .get(CORRELATION_ID_METADATA)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| Self::parse(raw).ok())
    }

    /// Attaches the id to outbound gRPC metadata.
    pub fn attach(&self, metadata: &mut MetadataMap) -> Result<(), Error> {
        let value = MetadataValue::try_from(self.0.as_str()).map_err(|e| Error::InvalidRequest {
            reason: format!("correlation id is not valid metadata: {e}"),
        })?;
        metadata.insert(CORRELATION_ID_METADATA, value);
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The row a service records inside its local transaction.
///
/// It stays invisible to everyone but the owning transaction until commit and
/// is discarded on rollback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionalRecord {
    pub correlation_id: CorrelationId,
    pub payload: String,
    pub inserted_at: SystemTime,
}

impl ProvisionalRecord {
    pub fn new(correlation_id: CorrelationId, payload: impl Into<String>) -> Self {
        Self {
            correlation_id,
            payload: payload.into(),
            inserted_at: SystemTime::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req-"));
        assert_eq!(CorrelationId::parse(a.as_str()).unwrap(), a);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(CorrelationId::parse("").is_err());
        assert!(CorrelationId::parse("has space").is_err());
        assert!(CorrelationId::parse("x".repeat(MAX_CORRELATION_ID_LEN + 1)).is_err());
        assert!(CorrelationId::parse("cancelled-request-001").is_ok());
    }

    #[test]
    fn empty_supplied_id_falls_back_to_generated() {
        let id = CorrelationId::supplied_or_generate(Some(String::new())).unwrap();
        assert!(id.as_str().starts_with("req-"));

        let id = CorrelationId::supplied_or_generate(Some("abc".into())).unwrap();
        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn metadata_round_trip() {
        let id = CorrelationId::parse("successful-request-001").unwrap();
        let mut metadata = MetadataMap::new();
        id.attach(&mut metadata).unwrap();
        assert_eq!(CorrelationId::from_metadata(&metadata), Some(id));
        assert_eq!(CorrelationId::from_metadata(&MetadataMap::new()), None);
    }
}
