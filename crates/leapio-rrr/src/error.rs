use leapio_channel::ChannelError;

/// Errors that can occur registering or dispatching services.
#[derive(Debug, thiserror::Error)]
pub enum RrrError {
    /// Channel layer error.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// A service id was registered twice.
    #[error("duplicate service id registration: {0}")]
    DuplicateService(u8),

    /// A service id does not fit the service table.
    #[error("service id {id} out of range (max {max})")]
    ServiceOutOfRange { id: u8, max: usize },

    /// A request arrived for a service nobody registered.
    #[error("request for unregistered service id {0}")]
    UnregisteredService(u8),
}

impl RrrError {
    /// Errors that mean both sides were not built from the same service
    /// table, or the link itself is broken.
    pub fn is_fatal(&self) -> bool {
        match self {
            RrrError::Channel(err) => err.is_fatal(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, RrrError>;
