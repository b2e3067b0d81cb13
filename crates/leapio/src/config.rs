use std::io::Read;
use std::path::Path;

use leapio_channel::ChannelIoConfig;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, Result};
use crate::logging::LoggingConfig;

/// Largest configuration file `from_file` will read.
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Everything needed to bring up a platform.
///
/// ```json
/// {
///   "link": { "format": "legacy", "max_message_chunks": 4096 },
///   "channels": [{ "id": 0, "name": "rrr", "initial_credits": 128 }],
///   "reader_thread": true,
///   "logging": { "format": "text", "level": "info" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(flatten)]
    pub io: ChannelIoConfig,
    /// Drive the receive path from a dedicated thread. When false, the
    /// caller's `Platform::poll` does it.
    #[serde(default = "default_reader_thread")]
    pub reader_thread: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_reader_thread() -> bool {
    true
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            io: ChannelIoConfig::default(),
            reader_thread: default_reader_thread(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PlatformConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.io.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let read_error = |source| PlatformError::ConfigRead {
            path: path.to_path_buf(),
            source,
        };

        let file = std::fs::File::open(path).map_err(read_error)?;
        let size = file.metadata().map_err(read_error)?.len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(PlatformError::ConfigTooLarge {
                path: path.to_path_buf(),
                size,
                max: MAX_CONFIG_FILE_SIZE,
            });
        }

        let mut json = String::new();
        file.take(MAX_CONFIG_FILE_SIZE)
            .read_to_string(&mut json)
            .map_err(read_error)?;
        Self::from_json_str(&json)
    }

    /// Single-threaded configuration: `Platform::poll` drives the receive
    /// path.
    pub fn polled(mut self) -> Self {
        self.reader_thread = false;
        self
    }
}
