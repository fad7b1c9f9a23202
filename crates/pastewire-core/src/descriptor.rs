//! Session descriptor wire format.
//!
//! Descriptors are exchanged out-of-band as a flat JSON object with exactly two
//! keys:
//!
//! ```json
//! {"type":"offer","sdp":"v=0\r\n..."}
//! ```
//!
//! The `sdp` body belongs to the engine. It is carried verbatim and never
//! inspected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the offer/answer exchange a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    /// Wire literal (`"offer"` or `"answer"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(kind, body)` pair as produced by the engine and relayed by the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionDescriptor {
    #[serde(rename = "type")]
    kind: SdpKind,
    #[serde(rename = "sdp")]
    body: String,
}

impl SessionDescriptor {
    pub fn new(kind: SdpKind, body: impl Into<String>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    pub fn offer(body: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, body)
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, body)
    }

    pub fn kind(&self) -> SdpKind {
        self.kind
    }

    /// The opaque engine-produced SDP text.
    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> String {
        self.body
    }

    /// Serialize to the wire format. Key order is fixed: `type`, then `sdp`.
    pub fn encode(&self) -> String {
        let body = serde_json::Value::String(self.body.clone());
        format!(r#"{{"type":"{}","sdp":{}}}"#, self.kind, body)
    }

    /// Parse the wire format.
    ///
    /// Invalid JSON, a missing key, an unknown key or an unknown `type` value
    /// are all rejected; there is no partial result.
    pub fn decode(text: &str) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(text.trim())?)
    }

    /// Parse and require a specific kind.
    pub fn decode_expecting(text: &str, expected: SdpKind) -> Result<Self, DescriptorError> {
        let descriptor = Self::decode(text)?;
        if descriptor.kind != expected {
            return Err(DescriptorError::UnexpectedKind {
                expected,
                actual: descriptor.kind,
            });
        }
        Ok(descriptor)
    }
}

impl fmt::Display for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Error decoding a session descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("malformed session descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected {expected} descriptor, got {actual}")]
    UnexpectedKind { expected: SdpKind, actual: SdpKind },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_is_flat_and_ordered() {
        let d = SessionDescriptor::offer("sdpA");
        assert_eq!(d.encode(), r#"{"type":"offer","sdp":"sdpA"}"#);
    }

    #[test]
    fn roundtrip_keeps_body_verbatim() {
        let body = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\na=msid-semantic: WMS\r\n\"quoted\";\ttab";
        for kind in [SdpKind::Offer, SdpKind::Answer] {
            let d = SessionDescriptor::new(kind, body);
            let back = SessionDescriptor::decode(&d.encode()).unwrap();
            assert_eq!(back.kind(), kind);
            assert_eq!(back.body(), body);
        }
    }

    #[test]
    fn decode_accepts_surrounding_whitespace() {
        let d = SessionDescriptor::decode("  {\"sdp\":\"x\",\"type\":\"answer\"}\n").unwrap();
        assert_eq!(d, SessionDescriptor::answer("x"));
    }

    #[test]
    fn decode_rejects_missing_key() {
        assert!(matches!(
            SessionDescriptor::decode(r#"{"type":"offer"}"#),
            Err(DescriptorError::Malformed(_))
        ));
        assert!(SessionDescriptor::decode(r#"{"sdp":"x"}"#).is_err());
    }

    #[test]
    fn decode_rejects_unknown_key() {
        assert!(SessionDescriptor::decode(r#"{"type":"offer","sdp":"x","extra":1}"#).is_err());
    }

    #[test]
    fn decode_rejects_unknown_type_and_garbage() {
        assert!(SessionDescriptor::decode(r#"{"type":"pranswer","sdp":"x"}"#).is_err());
        assert!(SessionDescriptor::decode(r#"{"type":"OFFER","sdp":"x"}"#).is_err());
        assert!(SessionDescriptor::decode("not json").is_err());
        assert!(SessionDescriptor::decode("").is_err());
        assert!(SessionDescriptor::decode(r#"["offer","x"]"#).is_err());
    }

    #[test]
    fn decode_expecting_reports_mismatch() {
        let err = SessionDescriptor::decode_expecting(r#"{"type":"answer","sdp":"x"}"#, SdpKind::Offer)
            .unwrap_err();
        assert!(matches!(
            err,
            DescriptorError::UnexpectedKind {
                expected: SdpKind::Offer,
                actual: SdpKind::Answer
            }
        ));
    }

    fn any_kind() -> impl Strategy<Value = SdpKind> {
        prop_oneof![Just(SdpKind::Offer), Just(SdpKind::Answer)]
    }

    proptest! {
        #[test]
        fn roundtrip_any_body(kind in any_kind(), body in any::<String>()) {
            let encoded = SessionDescriptor::new(kind, body.clone()).encode();
            let back = SessionDescriptor::decode(&encoded).unwrap();
            prop_assert_eq!(back.kind(), kind);
            prop_assert_eq!(back.body(), body.as_str());
        }

        #[test]
        fn encoding_is_flat_json(kind in any_kind(), body in any::<String>()) {
            let encoded = SessionDescriptor::new(kind, body).encode();
            let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
            let object = value.as_object().unwrap();
            prop_assert_eq!(object.len(), 2);
            prop_assert_eq!(object["type"].as_str(), Some(kind.as_str()));
        }
    }
}
