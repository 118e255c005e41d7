//! Wire headers for worker communication.
//!
//! Every message is a JSON header line optionally followed by `bytes` bytes
//! of raw body. Host-to-worker headers are built here; worker-to-host headers
//! are parsed leniently because the reply schema is loose (the version
//! handshake carries no `bytes` field at all).

use crate::md5::Md5;
use serde::Deserialize;
use serde_json::{json, Value};

/// Reply message type for a successful compilation.
pub const TYPE_HHAS: &str = "hhas";
/// Reply message type for a structured compile error.
pub const TYPE_ERROR: &str = "error";

/// Header for a config frame. Sent twice after the handshake, once per
/// config kind; the writer stamps `bytes`.
pub fn config_header() -> Value {
    json!({ "type": "config" })
}

/// Header for a code frame carrying one compilation request.
pub fn code_header(md5: &Md5, filename: &str, is_systemlib: bool) -> Value {
    json!({
        "type": "code",
        "md5": md5.to_hex(),
        "file": filename,
        "is_systemlib": is_systemlib,
    })
}

/// Parsed worker-to-host header. Unknown fields are ignored; missing `type`
/// reads as `""` and missing `bytes` as 0.
#[derive(Debug, Deserialize)]
pub struct ReplyHeader {
    /// Message type the caller dispatches on.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Body length following the header line.
    #[serde(default)]
    pub bytes: usize,
    /// Error message, present on `error` replies.
    #[serde(default)]
    pub error: Option<String>,
    /// Compiler version, present on the handshake line.
    #[serde(default)]
    pub version: Option<String>,
}

impl ReplyHeader {
    /// The error message of an `error` reply, with the documented fallback
    /// when the field is absent.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "[no 'error' field]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_header_fields() {
        let md5 = "deadbeefdeadbeefdeadbeefdeadbeef".parse::<Md5>().unwrap();
        let header = code_header(&md5, "a.hh", true);
        assert_eq!(header["type"], "code");
        assert_eq!(header["md5"], "deadbeefdeadbeefdeadbeefdeadbeef");
        assert_eq!(header["file"], "a.hh");
        assert_eq!(header["is_systemlib"], true);
    }

    #[test]
    fn test_is_systemlib_roundtrips_as_bool() {
        let md5 = "00000000000000000000000000000000".parse::<Md5>().unwrap();
        for flag in [true, false] {
            let line = code_header(&md5, "f.hh", flag).to_string();
            let parsed: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(parsed["is_systemlib"], Value::Bool(flag));
        }
    }

    #[test]
    fn test_reply_header_defaults() {
        let header: ReplyHeader = serde_json::from_str("{}").unwrap();
        assert_eq!(header.kind, "");
        assert_eq!(header.bytes, 0);
        assert!(header.error.is_none());
        assert!(header.version.is_none());
    }

    #[test]
    fn test_reply_header_error() {
        let header: ReplyHeader =
            serde_json::from_str(r#"{"type":"error","bytes":0,"error":"syntax error"}"#).unwrap();
        assert_eq!(header.kind, TYPE_ERROR);
        assert_eq!(header.error_message(), "syntax error");
    }

    #[test]
    fn test_reply_header_error_fallback() {
        let header: ReplyHeader = serde_json::from_str(r#"{"type":"error","bytes":0}"#).unwrap();
        assert_eq!(header.error_message(), "[no 'error' field]");
    }

    #[test]
    fn test_reply_header_version_without_bytes() {
        let header: ReplyHeader = serde_json::from_str(r#"{"version":"1.2.3"}"#).unwrap();
        assert_eq!(header.version.as_deref(), Some("1.2.3"));
        assert_eq!(header.bytes, 0);
    }

    #[test]
    fn test_reply_header_unknown_type_preserved() {
        let header: ReplyHeader =
            serde_json::from_str(r#"{"type":"banana","bytes":0}"#).unwrap();
        assert_eq!(header.kind, "banana");
    }
}
