//! Codecs for values that no schema governs (envelope version 0).

use serde_json::Value;

use crate::error::{Error, Result};

/// Turns a structured value into the text carried by a version-0 envelope.
pub trait Codec: Send + Sync {
    /// Short identifier used in error messages.
    fn name(&self) -> &'static str;
    /// Encode a value to text.
    fn encode(&self, value: &Value) -> Result<String>;
    /// Decode text back to a value.
    fn decode(&self, text: &str) -> Result<Value>;
}

/// JSON text codec. `7` is stored as `"7"`, `{"a":1}` as `"{\"a\":1}"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<String> {
        serde_json::to_string(value).map_err(|e| Error::CodecError {
            codec: self.name(),
            message: e.to_string(),
        })
    }

    fn decode(&self, text: &str) -> Result<Value> {
        serde_json::from_str(text).map_err(|e| Error::CodecError {
            codec: self.name(),
            message: e.to_string(),
        })
    }
}

/// Verbatim string codec. Only accepts string values.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    fn name(&self) -> &'static str {
        "string"
    }

    fn encode(&self, value: &Value) -> Result<String> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(Error::CodecError {
                codec: self.name(),
                message: format!("expected a string, found {}", crate::validator::JsonType::of(other)),
            }),
        }
    }

    fn decode(&self, text: &str) -> Result<Value> {
        Ok(Value::String(text.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_codec_encodes_numbers_as_text() {
        assert_eq!(JsonCodec.encode(&json!(7)).unwrap(), "7");
        assert_eq!(JsonCodec.decode("7").unwrap(), json!(7));
    }

    #[test]
    fn json_codec_rejects_garbage() {
        let err = JsonCodec.decode("{nope").unwrap_err();
        assert!(matches!(err, Error::CodecError { codec: "json", .. }));
    }

    #[test]
    fn string_codec_is_verbatim() {
        assert_eq!(StringCodec.encode(&json!("hi \"x\"")).unwrap(), "hi \"x\"");
        assert_eq!(StringCodec.decode("{nope").unwrap(), json!("{nope"));
    }

    #[test]
    fn string_codec_rejects_non_strings() {
        let err = StringCodec.encode(&json!(1)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "codec `string` failed: expected a string, found number"
        );
    }
}
