use leapio_device::DeviceRead;
use tracing::{trace, warn};

use crate::config::{ChunkOrder, LinkConfig};
use crate::error::{device_to_umf_error, Result};
use crate::header::{chunk_from_bytes, Chunk, Header, HeaderFormat, CHUNK_BYTES};
use crate::message::Message;

/// Inbound counters of a physical channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub messages_in: u64,
    pub chunks_in: u64,
    /// Messages whose header announced more than the link allows.
    pub malformed_dropped: u64,
    /// Headers whose sequence number skipped ahead (sequenced links only).
    pub sequence_gaps: u64,
}

/// Receive-side state of the physical channel.
#[derive(Debug)]
enum RxState {
    Idle,
    /// Some, but not all, header bytes have arrived.
    AccumulatingHeader,
    AccumulatingPayload(Message),
    /// Skipping the payload of a dropped message, in chunks.
    Discarding(usize),
    /// A complete message is waiting to be taken. Nothing more is read from
    /// the device until it is.
    Ready(Message),
}

/// Reassembles complete messages from a device, one chunk at a time.
///
/// There is no read-ahead: once a message is complete, the device is not
/// read again until that message has been taken by [`read`] or
/// [`try_read`]. Flow control above this layer is what keeps the remote
/// side from needing to send more in the meantime.
///
/// [`read`]: PhysicalReader::read
/// [`try_read`]: PhysicalReader::try_read
pub struct PhysicalReader<R> {
    inner: R,
    config: LinkConfig,
    state: RxState,
    pending: [u8; CHUNK_BYTES],
    pending_len: usize,
    expected_sequence: Option<u8>,
    stats: ReaderStats,
}

impl<R: DeviceRead> PhysicalReader<R> {
    /// Create a reader with the default (legacy) link configuration.
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, LinkConfig::default())
    }

    /// Create a reader with explicit link configuration.
    pub fn with_config(inner: R, config: LinkConfig) -> Self {
        Self {
            inner,
            config,
            state: RxState::Idle,
            pending: [0u8; CHUNK_BYTES],
            pending_len: 0,
            expected_sequence: None,
            stats: ReaderStats::default(),
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Waiting happens inside the device's `read`, which blocks until bytes
    /// arrive. A zero-byte read (an interrupted system call, a stalled test
    /// device) is retried after yielding the thread, so a device that keeps
    /// returning `Ok(0)` turns this into a spin.
    ///
    /// Returns `Err(UmfError::ConnectionClosed)` once the device closes. A
    /// malformed message is reported once as an error; its payload is then
    /// skipped by subsequent calls.
    pub fn read(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.take_ready() {
                return Ok(message);
            }
            if !self.step()? {
                std::thread::yield_now();
            }
        }
    }

    /// One non-blocking probe-and-drain step.
    ///
    /// If the device has data, reads one chunk and advances the state
    /// machine. Returns a message only if one is complete.
    pub fn try_read(&mut self) -> Result<Option<Message>> {
        if let Some(message) = self.take_ready() {
            return Ok(Some(message));
        }
        if self.pending_len > 0 || self.inner.probe().map_err(device_to_umf_error)? {
            self.step()?;
        }
        Ok(self.take_ready())
    }

    fn take_ready(&mut self) -> Option<Message> {
        match std::mem::replace(&mut self.state, RxState::Idle) {
            RxState::Ready(message) => Some(message),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Advance by one chunk. Returns false on a short read.
    fn step(&mut self) -> Result<bool> {
        if matches!(self.state, RxState::Ready(_)) {
            return Ok(true);
        }
        let Some(chunk) = self.fill_chunk()? else {
            return Ok(false);
        };
        self.stats.chunks_in += 1;

        match std::mem::replace(&mut self.state, RxState::Idle) {
            RxState::Idle | RxState::AccumulatingHeader => self.on_header(chunk)?,
            RxState::AccumulatingPayload(mut message) => {
                match self.config.rx_order() {
                    ChunkOrder::Forward => message.append_chunk(chunk)?,
                    ChunkOrder::Reverse => message.reverse_append_chunk(chunk)?,
                }
                self.state = if message.can_append() {
                    RxState::AccumulatingPayload(message)
                } else {
                    self.complete(&message);
                    RxState::Ready(message)
                };
            }
            RxState::Discarding(remaining) => {
                self.state = if remaining > 1 {
                    RxState::Discarding(remaining - 1)
                } else {
                    RxState::Idle
                };
            }
            RxState::Ready(_) => unreachable!("ready state is handled before reading"),
        }
        Ok(true)
    }

    fn on_header(&mut self, chunk: Chunk) -> Result<()> {
        let header = Header::decode(chunk, self.config.format)?;

        if self.config.format == HeaderFormat::Sequenced {
            if let Some(expected) = self.expected_sequence {
                if header.sequence != expected {
                    self.stats.sequence_gaps += 1;
                    warn!(
                        expected,
                        found = header.sequence,
                        channel = header.channel_id,
                        "physical channel sequence gap"
                    );
                }
            }
            self.expected_sequence = Some(header.sequence.wrapping_add(1));
        }

        if let Err(err) = header.validate(self.config.max_message_chunks) {
            self.stats.malformed_dropped += 1;
            warn!(
                channel = header.channel_id,
                service = header.service_id,
                length = header.length,
                "dropping malformed message: {err}"
            );
            self.state = RxState::Discarding(header.chunk_count());
            return Err(err);
        }

        let message = Message::from_header(&header);
        self.state = if message.can_append() {
            RxState::AccumulatingPayload(message)
        } else {
            self.complete(&message);
            RxState::Ready(message)
        };
        Ok(())
    }

    fn complete(&mut self, message: &Message) {
        self.stats.messages_in += 1;
        trace!(
            channel = message.channel_id(),
            service = message.service_id(),
            length = message.length(),
            "message reassembled"
        );
    }

    /// Read towards the next whole chunk. Returns `None` on a short read.
    fn fill_chunk(&mut self) -> Result<Option<Chunk>> {
        while self.pending_len < CHUNK_BYTES {
            let n = self
                .inner
                .read(&mut self.pending[self.pending_len..])
                .map_err(device_to_umf_error)?;
            if n == 0 {
                return Ok(None);
            }
            if self.pending_len == 0 && matches!(self.state, RxState::Idle) {
                self.state = RxState::AccumulatingHeader;
            }
            self.pending_len += n;
        }
        self.pending_len = 0;
        Ok(Some(chunk_from_bytes(self.pending)))
    }

    /// Inbound counters.
    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Link configuration.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Borrow the underlying device.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Mutably borrow the underlying device.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the reader and return the device.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> std::fmt::Debug for PhysicalReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalReader")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
