use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Version reserved for values that no schema governs.
pub const CODEC_VERSION: u32 = 0;

/// The `{version, payload}` wrapper around every stored value.
///
/// Persisted format (a compatibility surface, do not change):
/// ```text
/// {"version":<int>,"payload":<value>}
/// ```
///
/// At version 0 the payload is a JSON string produced by a [`Codec`]; at
/// any other version it is the structured value itself.
///
/// # Example
///
/// ```
/// use tabstore_schema::Envelope;
/// use serde_json::json;
///
/// let raw = Envelope::wrap(1, json!({"n": 9})).unwrap();
/// assert_eq!(raw, r#"{"version":1,"payload":{"n":9}}"#);
///
/// let decoded = Envelope::unwrap(&raw).unwrap();
/// assert_eq!(decoded.version, 1);
/// assert_eq!(decoded.payload, json!({"n": 9}));
/// ```
///
/// [`Codec`]: crate::Codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Schema version of the payload.
    pub version: u32,
    /// Codec text (version 0) or structured value.
    pub payload: Value,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: u32,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(version: u32, payload: Value) -> Self {
        Self { version, payload }
    }

    /// Serialize `(version, payload)` to the persisted string.
    pub fn wrap(version: u32, payload: Value) -> Result<String> {
        Self::new(version, payload).to_raw()
    }

    /// Parse a persisted string. Never coerces malformed input.
    pub fn unwrap(raw: &str) -> Result<Self> {
        let envelope: Self =
            serde_json::from_str(raw).map_err(|e| Error::InvalidEnvelope(e.to_string()))?;
        if envelope.version == CODEC_VERSION && !envelope.payload.is_string() {
            return Err(Error::InvalidEnvelope(
                "version 0 payload must be codec text".into(),
            ));
        }
        Ok(envelope)
    }

    /// Serialize this envelope.
    pub fn to_raw(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidEnvelope(e.to_string()))
    }

    /// Read the version without keeping the payload.
    pub fn peek_version(raw: &str) -> Result<u32> {
        serde_json::from_str::<VersionOnly>(raw)
            .map(|v| v.version)
            .map_err(|e| Error::InvalidEnvelope(e.to_string()))
    }

    /// Whether `raw` parses as an envelope.
    pub fn is_enveloped(raw: &str) -> bool {
        Self::unwrap(raw).is_ok()
    }

    /// Codec text of a version-0 envelope.
    pub fn codec_text(&self) -> Option<&str> {
        if self.version == CODEC_VERSION {
            self.payload.as_str()
        } else {
            None
        }
    }
}
