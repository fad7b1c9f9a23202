//! Signaling configuration.

use crate::ConnectionOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CHANNEL_LABEL: &str = "test";

/// Settings for a [`crate::SignalingStateMachine`].
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
    /// Engine constraints passed to connection creation.
    pub constraints: BTreeMap<String, String>,
    /// Label of the chat data channel.
    pub channel_label: String,
    /// Events replayed to a newly registered observer.
    pub replay_capacity: usize,
    /// Events buffered per observer beyond the replay window.
    pub live_buffer: usize,
    /// Abandon a negotiation that has not connected after this many seconds.
    pub negotiation_timeout_secs: Option<u64>,
}

impl SignalingConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            ice_servers: self.ice_servers.clone(),
            constraints: self.constraints.clone(),
        }
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            constraints: BTreeMap::from([("DtlsSrtpKeyAgreement".to_string(), "true".to_string())]),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            replay_capacity: 3,
            live_buffer: 5,
            negotiation_timeout_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: SignalingConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SignalingConfig::default());
        assert_eq!(config.negotiation_timeout(), None);
    }

    #[test]
    fn partial_override() {
        let config: SignalingConfig =
            serde_json::from_str(r#"{"channel_label":"chat","negotiation_timeout_secs":30}"#).unwrap();
        assert_eq!(config.channel_label, "chat");
        assert_eq!(config.negotiation_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.ice_servers, [DEFAULT_STUN_SERVER]);
        assert_eq!(
            config.connection_options().constraints["DtlsSrtpKeyAgreement"],
            "true"
        );
    }
}
