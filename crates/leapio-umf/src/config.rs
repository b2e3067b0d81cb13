use serde::{Deserialize, Serialize};

use crate::header::{HeaderFormat, DEFAULT_MAX_MESSAGE_CHUNKS};

/// Order in which payload chunks cross the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkOrder {
    /// Least significant chunk first.
    Forward,
    /// Most significant chunk first.
    Reverse,
}

/// Configuration of one physical link.
///
/// Chunk orders left unset follow the header format: the legacy hardware
/// demarshaller wants the most significant chunk first and emits least
/// significant first; sequenced links are forward both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Header encoding. Both ends must agree.
    pub format: HeaderFormat,
    /// Largest accepted payload, in chunks. Bigger inbound messages are dropped.
    pub max_message_chunks: usize,
    /// Payload chunk order on transmit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_order: Option<ChunkOrder>,
    /// Payload chunk order expected on receive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_order: Option<ChunkOrder>,
}

impl LinkConfig {
    /// Defaults for a given header format.
    pub fn new(format: HeaderFormat) -> Self {
        Self {
            format,
            max_message_chunks: DEFAULT_MAX_MESSAGE_CHUNKS,
            tx_order: None,
            rx_order: None,
        }
    }

    /// Legacy link with hardware chunk orders.
    pub fn legacy() -> Self {
        Self::new(HeaderFormat::Legacy)
    }

    /// Sequenced link.
    pub fn sequenced() -> Self {
        Self::new(HeaderFormat::Sequenced)
    }

    /// Host-to-host link: receive order mirrors transmit order.
    pub fn loopback(format: HeaderFormat) -> Self {
        let base = Self::new(format);
        Self {
            rx_order: Some(base.tx_order()),
            ..base
        }
    }

    /// Effective transmit order.
    pub fn tx_order(&self) -> ChunkOrder {
        self.tx_order.unwrap_or(match self.format {
            HeaderFormat::Legacy => ChunkOrder::Reverse,
            HeaderFormat::Sequenced => ChunkOrder::Forward,
        })
    }

    /// Effective receive order.
    pub fn rx_order(&self) -> ChunkOrder {
        self.rx_order.unwrap_or(ChunkOrder::Forward)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::legacy()
    }
}
