use leapio_umf::UmfError;

use crate::config::ChannelKind;

/// Errors that can occur on the channel layer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Physical channel error.
    #[error("physical channel error: {0}")]
    Umf(#[from] UmfError),

    /// The channel id is not in the channel table.
    #[error("channel {0} is not configured")]
    UnknownChannel(u8),

    /// A typed access used a codec the channel was not built with.
    #[error("channel {channel} carries {actual} values, not {requested}")]
    KindMismatch {
        channel: u8,
        requested: ChannelKind,
        actual: ChannelKind,
    },

    /// A wire message costs more credits than the channel can ever hold.
    #[error("credit request {requested} exceeds channel capacity {capacity}")]
    CreditsExceedCapacity { requested: usize, capacity: usize },

    /// A fragment arrived out of order or with an unknown tag.
    #[error("malformed fragment on channel {channel}: {reason}")]
    MalformedFragment { channel: u8, reason: &'static str },

    /// The inbound queue of a channel was already handed out.
    #[error("receiver for channel {0} already taken")]
    ReceiverTaken(u8),

    /// Channel I/O was shut down while the operation waited.
    #[error("channel io shut down")]
    Closed,

    /// The channel table is inconsistent.
    #[error("invalid channel configuration: {0}")]
    Config(String),
}

impl ChannelError {
    /// Build-mismatch errors that must terminate the link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Umf(err) if err.is_fatal())
    }

    /// Inbound traffic that was reported and dropped.
    pub fn is_malformed(&self) -> bool {
        match self {
            ChannelError::MalformedFragment { .. } => true,
            ChannelError::Umf(err) => err.is_malformed(),
            _ => false,
        }
    }

    /// The device is gone, or channel I/O was shut down.
    pub fn is_closed(&self) -> bool {
        match self {
            ChannelError::Closed => true,
            ChannelError::Umf(err) => err.is_closed(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
