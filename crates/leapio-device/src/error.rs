use std::path::PathBuf;

/// Errors that can occur at the device boundary.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Failed to connect to the device endpoint.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An I/O error occurred on the device.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device has been closed or shut down.
    #[error("device closed")]
    Closed,
}

impl DeviceError {
    /// Returns true if the device is gone and no further I/O will succeed.
    pub fn is_closed(&self) -> bool {
        match self {
            DeviceError::Closed => true,
            DeviceError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ),
            DeviceError::Connect { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
