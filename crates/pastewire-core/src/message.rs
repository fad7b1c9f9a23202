//! Chat messages.
//!
//! On the data channel every chat text travels as one UTF-8 JSON frame:
//! `{"message":"..."}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    pub message: String,
}

impl ChatFrame {
    /// Wrap `text` in a frame and return its UTF-8 bytes.
    pub fn encode(text: &str) -> Vec<u8> {
        serde_json::json!({ "message": text }).to_string().into_bytes()
    }

    /// Extract the text from a frame.
    pub fn decode(bytes: &[u8]) -> Result<String, FrameError> {
        let frame: ChatFrame = serde_json::from_slice(bytes)?;
        Ok(frame.message)
    }
}

/// Error decoding a chat frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed chat frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Which peer wrote a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Local,
    Remote,
}

/// A transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn local(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Local,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn remote(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Remote,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}
