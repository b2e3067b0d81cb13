//! Logical channels multiplexed over one leapio physical link.
//!
//! Every value sent on a logical channel is marshalled into one or more wire
//! messages by the channel's codec. Before each wire message goes out, the
//! sender debits credits for the buffer space it will occupy at the peer;
//! the peer returns those credits in the service-id field of its own
//! outbound wire messages.
//!
//! Built-in codecs:
//! - [`MessageCodec`]: whole UMF messages, one header fragment plus one
//!   fragment per payload chunk
//! - [`WideCodec`]: `u128` values, one wire message each

pub mod channelio;
pub mod config;
pub mod credits;
pub mod error;
pub mod marshal;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channelio::{ChannelIo, ChannelIoStats, ChannelStats, DeliveryTarget, MarshalledChannel};
pub use config::{
    ChannelIoConfig, ChannelKind, ChannelSpec, DEFAULT_INITIAL_CREDITS, RRR_CHANNEL,
};
pub use credits::{CreditGate, CreditSnapshot};
pub use error::{ChannelError, Result};
pub use marshal::{
    message_cost, wide_cost, wire_cost, ChannelCodec, MessageCodec, WideCodec,
    DEFAULT_CREDIT_OVERHEAD, FRAGMENT_CHUNKS,
};

/// Lock a mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
