use std::path::PathBuf;

use leapio_channel::ChannelError;
use leapio_device::DeviceError;
use leapio_rrr::{exit, RrrError};
use leapio_umf::UmfError;

/// Errors surfaced by the platform lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is larger than any sane configuration.
    #[error("config {path} is {size} bytes (max {max})")]
    ConfigTooLarge { path: PathBuf, size: u64, max: u64 },

    /// The configuration is not valid JSON for this schema.
    #[error("invalid config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Device error while opening the link.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Channel layer error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Service registration or dispatch error.
    #[error("service error: {0}")]
    Rrr(#[from] RrrError),

    /// The reader thread could not be started.
    #[error("failed to spawn reader thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// `init` was called after `uninit`.
    #[error("platform already shut down")]
    ShutDown,
}

impl From<UmfError> for PlatformError {
    fn from(err: UmfError) -> Self {
        PlatformError::Channel(err.into())
    }
}

impl PlatformError {
    pub fn is_fatal(&self) -> bool {
        match self {
            PlatformError::Channel(err) => err.is_fatal(),
            PlatformError::Rrr(err) => err.is_fatal(),
            PlatformError::ConfigRead { .. }
            | PlatformError::ConfigTooLarge { .. }
            | PlatformError::ConfigParse(_) => true,
            _ => false,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            PlatformError::ConfigRead { .. }
            | PlatformError::ConfigTooLarge { .. }
            | PlatformError::ConfigParse(_) => exit::CONFIG_ERROR,
            PlatformError::Rrr(err) => exit::exit_code(err),
            PlatformError::Channel(ChannelError::Config(_)) => exit::CONFIG_ERROR,
            PlatformError::Channel(err) if err.is_fatal() => exit::PROTOCOL_MISMATCH,
            _ => exit::FAILURE,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;
