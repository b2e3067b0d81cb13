use leapio_device::DeviceError;

/// Errors that can occur building, encoding or transporting UMF messages.
#[derive(Debug, thiserror::Error)]
pub enum UmfError {
    /// An append would write past the declared message length.
    #[error("message overflow ({requested} bytes requested, {remaining} remaining)")]
    MessageOverflow { requested: usize, remaining: usize },

    /// The length was changed after payload bytes were appended.
    #[error("message length must be set before payload is appended")]
    LengthLocked,

    /// The length does not fit the header's length field.
    #[error("message length {0} does not fit the header length field")]
    LengthTooLarge(usize),

    /// The payload exceeds the link's per-message chunk cap.
    #[error("message too long ({chunks} chunks, max {max})")]
    MessageTooLong { chunks: usize, max: usize },

    /// A message was handed to the physical channel before it was filled.
    #[error("incomplete message ({unwritten} bytes unwritten)")]
    IncompleteMessage { unwritten: usize },

    /// The peer encodes headers in a different format than this link.
    #[error("link header format mismatch (expected tag {expected:#x}, found {found:#x})")]
    HeaderFormatMismatch { expected: u8, found: u8 },

    /// An error reported by the device below the physical channel.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// The device closed while reading or writing.
    #[error("connection closed")]
    ConnectionClosed,
}

impl UmfError {
    /// Build-mismatch errors that must terminate the link.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UmfError::HeaderFormatMismatch { .. })
    }

    /// Inbound messages that were reported and dropped.
    pub fn is_malformed(&self) -> bool {
        matches!(self, UmfError::MessageTooLong { .. })
    }

    /// The device is gone.
    pub fn is_closed(&self) -> bool {
        match self {
            UmfError::ConnectionClosed => true,
            UmfError::Device(err) => err.is_closed(),
            _ => false,
        }
    }
}

pub(crate) fn device_to_umf_error(err: DeviceError) -> UmfError {
    if err.is_closed() {
        UmfError::ConnectionClosed
    } else {
        UmfError::Device(err)
    }
}

pub type Result<T> = std::result::Result<T, UmfError>;
