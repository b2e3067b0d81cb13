//! Universal Message Format (UMF) messages and the physical channel.
//!
//! A UMF message is a small header plus a payload padded to whole 64-bit
//! chunks. The physical channel moves complete messages over a device:
//! a single header chunk carrying channel id, service id and byte length,
//! followed by the payload chunks in the link's configured order.
//!
//! Reading is a chunk-at-a-time state machine with no read-ahead, so the
//! receiving side can be driven from a blocking reader thread or polled
//! with [`PhysicalReader::try_read`].

pub mod config;
pub mod error;
pub mod header;
pub mod message;
pub mod physical;
pub mod reader;
pub mod writer;

pub use config::{ChunkOrder, LinkConfig};
pub use error::{Result, UmfError};
pub use header::{Chunk, Header, HeaderFormat, CHUNK_BYTES, DEFAULT_MAX_MESSAGE_CHUNKS};
pub use message::Message;
pub use physical::PhysicalChannel;
pub use reader::{PhysicalReader, ReaderStats};
pub use writer::{PhysicalWriter, WriterStats};
