//! Command-line flags and the config file.

use anyhow::Context;
use clap::Parser;
use pastewire_core::SignalingConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML config file with a [signaling] table
    #[arg(short, long, env = "PASTEWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// STUN/TURN server URL. Repeatable; replaces the configured servers
    #[arg(long = "stun", value_name = "URL")]
    pub stun: Vec<String>,

    /// Data channel label
    #[arg(long)]
    pub label: Option<String>,

    /// Abandon a negotiation that has not connected after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Config file (or defaults) with flag overrides applied.
    pub fn signaling_config(&self) -> anyhow::Result<SignalingConfig> {
        let mut config = match &self.config {
            Some(path) => {
                tracing::info!("loading configuration from {}", path.display());
                FileConfig::load(path)?.signaling
            }
            None => SignalingConfig::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut SignalingConfig) {
        if !self.stun.is_empty() {
            config.ice_servers = self.stun.clone();
        }
        if let Some(label) = &self.label {
            config.channel_label = label.clone();
        }
        if self.timeout.is_some() {
            config.negotiation_timeout_secs = self.timeout;
        }
    }

    /// Default log directive for this binary and its libraries.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "pastewire=debug"
        } else {
            "pastewire=info"
        }
    }
}

/// Layout of the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub signaling: SignalingConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn file_config_sections() {
        let file = FileConfig::parse(
            r#"
            [signaling]
            ice_servers = ["stun:stun.example.org:3478"]
            channel_label = "chat"
            negotiation_timeout_secs = 45

            [signaling.constraints]
            DtlsSrtpKeyAgreement = "false"
            "#,
        )
        .unwrap();
        assert_eq!(file.signaling.ice_servers, ["stun:stun.example.org:3478"]);
        assert_eq!(file.signaling.channel_label, "chat");
        assert_eq!(file.signaling.negotiation_timeout_secs, Some(45));
        assert_eq!(file.signaling.constraints["DtlsSrtpKeyAgreement"], "false");
        assert_eq!(file.signaling.replay_capacity, 3);
    }

    #[test]
    fn empty_file_is_defaults() {
        let file = FileConfig::parse("").unwrap();
        assert_eq!(file.signaling, SignalingConfig::default());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "pastewire",
            "--stun",
            "stun:a.example:3478",
            "--stun",
            "stun:b.example:3478",
            "--label",
            "room",
            "--timeout",
            "10",
        ])
        .unwrap();
        let mut config = SignalingConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(
            config.ice_servers,
            ["stun:a.example:3478", "stun:b.example:3478"]
        );
        assert_eq!(config.channel_label, "room");
        assert_eq!(config.negotiation_timeout_secs, Some(10));
    }

    #[test]
    fn no_flags_keep_config() {
        let cli = Cli::try_parse_from(["pastewire"]).unwrap();
        let mut config = SignalingConfig {
            negotiation_timeout_secs: Some(90),
            ..SignalingConfig::default()
        };
        cli.apply_overrides(&mut config);
        assert_eq!(config.negotiation_timeout_secs, Some(90));
        assert_eq!(cli.log_directive(), "pastewire=info");
    }
}
