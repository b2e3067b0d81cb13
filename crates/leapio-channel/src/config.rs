use std::fmt;

use leapio_umf::LinkConfig;
use serde::{Deserialize, Serialize};

use crate::marshal::DEFAULT_CREDIT_OVERHEAD;

/// Channel carrying request/response traffic for the service monitor.
pub const RRR_CHANNEL: u8 = 0;

/// Credits a channel starts with when none are configured.
pub const DEFAULT_INITIAL_CREDITS: usize = 128;

/// Value type carried by a logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Whole UMF messages, fragmented into two-chunk wire messages.
    #[default]
    Message,
    /// 128-bit values, one wire message each.
    Wide,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Message => f.write_str("message"),
            ChannelKind::Wide => f.write_str("wide"),
        }
    }
}

/// Static description of one logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: ChannelKind,
    /// Receive buffer space the peer grants this channel, in chunks.
    #[serde(default = "default_initial_credits")]
    pub initial_credits: usize,
    /// Extra credits charged per wire message for header and addressing.
    #[serde(default = "default_credit_overhead")]
    pub credit_overhead: usize,
    /// Send an explicit credit message once this many credits are owed to
    /// the peer. Unset means credits only travel piggybacked on outbound
    /// traffic or through `ChannelIo::return_credits`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_threshold: Option<usize>,
}

impl ChannelSpec {
    pub fn new(id: u8, kind: ChannelKind) -> Self {
        Self {
            id,
            name: None,
            kind,
            initial_credits: DEFAULT_INITIAL_CREDITS,
            credit_overhead: DEFAULT_CREDIT_OVERHEAD,
            return_threshold: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_credits(mut self, initial_credits: usize) -> Self {
        self.initial_credits = initial_credits;
        self
    }

    pub fn with_overhead(mut self, credit_overhead: usize) -> Self {
        self.credit_overhead = credit_overhead;
        self
    }

    pub fn with_return_threshold(mut self, threshold: usize) -> Self {
        self.return_threshold = Some(threshold);
        self
    }

    /// Name for diagnostics.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }
}

fn default_initial_credits() -> usize {
    DEFAULT_INITIAL_CREDITS
}

fn default_credit_overhead() -> usize {
    DEFAULT_CREDIT_OVERHEAD
}

/// Physical link settings plus the static channel table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIoConfig {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelSpec>,
}

impl ChannelIoConfig {
    /// Check the channel table before any channel is built.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = [false; 256];
        for spec in &self.channels {
            let slot = &mut seen[usize::from(spec.id)];
            if *slot {
                return Err(crate::ChannelError::Config(format!(
                    "channel {} configured twice",
                    spec.id
                )));
            }
            *slot = true;

            if spec.initial_credits == 0 {
                return Err(crate::ChannelError::Config(format!(
                    "channel {} has no initial credits",
                    spec.id
                )));
            }
        }
        Ok(())
    }
}

impl Default for ChannelIoConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            channels: default_channels(),
        }
    }
}

fn default_channels() -> Vec<ChannelSpec> {
    vec![ChannelSpec::new(RRR_CHANNEL, ChannelKind::Message).named("rrr")]
}

#[cfg(test)]
mod tests {
    use leapio_umf::HeaderFormat;

    use super::*;

    #[test]
    fn default_has_rrr_channel() {
        let config = ChannelIoConfig::default();
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.channels[0].id, RRR_CHANNEL);
        assert_eq!(config.channels[0].kind, ChannelKind::Message);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn spec_defaults_fill_in() {
        let spec: ChannelSpec = serde_json::from_str(r#"{ "id": 3, "kind": "wide" }"#).unwrap();
        assert_eq!(spec.kind, ChannelKind::Wide);
        assert_eq!(spec.initial_credits, DEFAULT_INITIAL_CREDITS);
        assert_eq!(spec.credit_overhead, DEFAULT_CREDIT_OVERHEAD);
        assert_eq!(spec.return_threshold, None);
        assert_eq!(spec.display_name(), "unnamed");
    }

    #[test]
    fn config_from_json() {
        let config: ChannelIoConfig = serde_json::from_str(
            r#"{
                "link": { "format": "sequenced" },
                "channels": [
                    { "id": 0, "name": "rrr" },
                    { "id": 4, "kind": "wide", "initial_credits": 16, "credit_overhead": 2 }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.link.format, HeaderFormat::Sequenced);
        assert_eq!(config.channels[1].initial_credits, 16);
        assert_eq!(config.channels[1].credit_overhead, 2);
    }

    #[test]
    fn duplicate_channel_rejected() {
        let config = ChannelIoConfig {
            link: LinkConfig::default(),
            channels: vec![
                ChannelSpec::new(2, ChannelKind::Message),
                ChannelSpec::new(2, ChannelKind::Wide),
            ],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn zero_credits_rejected() {
        let config = ChannelIoConfig {
            link: LinkConfig::default(),
            channels: vec![ChannelSpec::new(1, ChannelKind::Wide).with_credits(0)],
        };
        assert!(config.validate().is_err());
    }
}
