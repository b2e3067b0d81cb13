use bytes::BytesMut;
use leapio_device::DeviceWrite;
use tracing::trace;

use crate::config::{ChunkOrder, LinkConfig};
use crate::error::{device_to_umf_error, Result, UmfError};
use crate::header::{put_chunk, HeaderFormat, CHUNK_BYTES};
use crate::message::Message;

const INITIAL_BUFFER_CAPACITY: usize = 64 * CHUNK_BYTES;

/// Outbound counters of a physical channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub messages_out: u64,
    pub chunks_out: u64,
}

/// Serializes messages onto a device: header chunk first, then payload
/// chunks in the link's transmit order.
pub struct PhysicalWriter<W> {
    inner: W,
    buf: BytesMut,
    config: LinkConfig,
    next_sequence: u8,
    stats: WriterStats,
}

impl<W: DeviceWrite> PhysicalWriter<W> {
    /// Create a writer with the default (legacy) link configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, LinkConfig::default())
    }

    /// Create a writer with explicit link configuration.
    pub fn with_config(inner: W, config: LinkConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            next_sequence: 0,
            stats: WriterStats::default(),
        }
    }

    /// Write a complete message (blocking). The message is consumed.
    pub fn write(&mut self, mut message: Message) -> Result<()> {
        if message.can_append() {
            return Err(UmfError::IncompleteMessage {
                unwritten: message.bytes_unwritten(),
            });
        }
        let chunks = message.chunk_count();
        if chunks > self.config.max_message_chunks {
            return Err(UmfError::MessageTooLong {
                chunks,
                max: self.config.max_message_chunks,
            });
        }

        let header = match self.config.format {
            HeaderFormat::Legacy => message.encode_header(HeaderFormat::Legacy),
            HeaderFormat::Sequenced => {
                let sequence = self.next_sequence;
                self.next_sequence = self.next_sequence.wrapping_add(1);
                message.encode_header_with_phy_pvt(sequence)
            }
        };

        self.buf.clear();
        put_chunk(&mut self.buf, header);

        // The legacy hardware demarshaller expects the most significant chunk
        // first, so that path sends in reverse extraction order.
        match self.config.tx_order() {
            ChunkOrder::Forward => {
                message.start_extract();
                while let Some(chunk) = message.extract_chunk() {
                    put_chunk(&mut self.buf, chunk);
                }
            }
            ChunkOrder::Reverse => {
                message.start_reverse_extract();
                while let Some(chunk) = message.reverse_extract_chunk() {
                    put_chunk(&mut self.buf, chunk);
                }
            }
        }

        trace!(
            channel = message.channel_id(),
            service = message.service_id(),
            length = message.length(),
            chunks,
            "writing message"
        );

        self.inner.write(&self.buf).map_err(device_to_umf_error)?;
        self.inner.flush().map_err(device_to_umf_error)?;

        self.stats.messages_out += 1;
        self.stats.chunks_out += chunks as u64 + 1;
        Ok(())
    }

    /// Outbound counters.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Borrow the underlying device.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the underlying device.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the writer and return the device.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> std::fmt::Debug for PhysicalWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalWriter")
            .field("config", &self.config)
            .field("next_sequence", &self.next_sequence)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
