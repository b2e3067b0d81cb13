use bytes::BytesMut;

use crate::error::{Result, UmfError};
use crate::header::{
    chunk_from_bytes, chunks_for_length, Chunk, Header, HeaderFormat, CHUNK_BYTES,
};

/// A UMF message: a length-tagged run of chunks addressed by channel and
/// service.
///
/// A message is either being filled (receive side, [`can_append`] until
/// `length` bytes have arrived) or complete and readable. Payload can be
/// appended from the least significant end ([`append_chunk`],
/// [`append_bytes`]) or from the most significant end
/// ([`reverse_append_chunk`]).
///
/// Forward and reverse extraction share one pair of cursors: between a
/// `start_*` call and exhaustion, every chunk is handed out exactly once,
/// whichever end it is taken from.
///
/// Messages are not `Clone`. Each layer takes ownership when it is handed a
/// message, and the physical writer consumes it.
///
/// [`can_append`]: Message::can_append
/// [`append_chunk`]: Message::append_chunk
/// [`append_bytes`]: Message::append_bytes
/// [`reverse_append_chunk`]: Message::reverse_append_chunk
#[derive(Debug, Default)]
pub struct Message {
    channel_id: u8,
    service_id: u8,
    sequence: u8,
    length: usize,
    /// Payload padded with zeroes to a whole number of chunks.
    data: BytesMut,
    /// Bytes filled from the front.
    head: usize,
    /// Chunks filled from the back.
    tail_chunks: usize,
    extract_front: usize,
    extract_back: usize,
}

impl Message {
    /// Create an empty, header-only message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty message addressed to `channel_id` / `service_id`.
    pub fn with_ids(channel_id: u8, service_id: u8) -> Self {
        Self {
            channel_id,
            service_id,
            ..Self::default()
        }
    }

    /// Create a complete message holding `payload`.
    pub fn from_payload(channel_id: u8, service_id: u8, payload: &[u8]) -> Result<Self> {
        let mut message = Self::with_ids(channel_id, service_id);
        message.set_length(payload.len())?;
        message.append_bytes(payload)?;
        Ok(message)
    }

    /// Create an empty message sized by a decoded header, ready to be filled.
    pub fn from_header(header: &Header) -> Self {
        let mut message = Self::with_ids(header.channel_id, header.service_id);
        message.sequence = header.sequence;
        message.resize(header.length as usize);
        message
    }

    /// Declare the payload length in bytes.
    ///
    /// Must be called before any payload is appended.
    pub fn set_length(&mut self, length: usize) -> Result<()> {
        if self.head > 0 || self.tail_chunks > 0 {
            return Err(UmfError::LengthLocked);
        }
        if u32::try_from(length).is_err() {
            return Err(UmfError::LengthTooLarge(length));
        }
        self.resize(length);
        Ok(())
    }

    fn resize(&mut self, length: usize) {
        self.length = length;
        self.data = BytesMut::zeroed(chunks_for_length(length) * CHUNK_BYTES);
        self.start_extract();
    }

    /// Declared payload length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of payload chunks.
    pub fn chunk_count(&self) -> usize {
        self.data.len() / CHUNK_BYTES
    }

    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    pub fn set_channel_id(&mut self, channel_id: u8) {
        self.channel_id = channel_id;
    }

    pub fn service_id(&self) -> u8 {
        self.service_id
    }

    pub fn set_service_id(&mut self, service_id: u8) {
        self.service_id = service_id;
    }

    /// Physical-channel sequence number carried by the header, if any.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Remaining capacity before the message is full.
    pub fn bytes_unwritten(&self) -> usize {
        self.fill_end().saturating_sub(self.head)
    }

    /// True while payload bytes are still expected.
    pub fn can_append(&self) -> bool {
        self.bytes_unwritten() > 0
    }

    /// End (exclusive) of the region still open to front appends.
    fn fill_end(&self) -> usize {
        if self.tail_chunks == 0 {
            self.length
        } else {
            (self.chunk_count() - self.tail_chunks) * CHUNK_BYTES
        }
    }

    /// Append one chunk at the least significant free position.
    ///
    /// On the final chunk only the bytes that fit within `length` are kept.
    pub fn append_chunk(&mut self, chunk: Chunk) -> Result<()> {
        let remaining = self.bytes_unwritten();
        if remaining == 0 {
            return Err(UmfError::MessageOverflow {
                requested: CHUNK_BYTES,
                remaining,
            });
        }
        let n = remaining.min(CHUNK_BYTES);
        self.data[self.head..self.head + n].copy_from_slice(&chunk.to_le_bytes()[..n]);
        self.head += n;
        Ok(())
    }

    /// Append raw payload bytes at the least significant free position.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let remaining = self.bytes_unwritten();
        if bytes.len() > remaining {
            return Err(UmfError::MessageOverflow {
                requested: bytes.len(),
                remaining,
            });
        }
        self.data[self.head..self.head + bytes.len()].copy_from_slice(bytes);
        self.head += bytes.len();
        Ok(())
    }

    /// Append one chunk at the most significant free position.
    ///
    /// Used by receivers on links that deliver the most significant chunk
    /// first. Bytes of the top chunk beyond `length` are discarded.
    pub fn reverse_append_chunk(&mut self, chunk: Chunk) -> Result<()> {
        let remaining = self.bytes_unwritten();
        let index = self.chunk_count().saturating_sub(self.tail_chunks + 1);
        let start = index * CHUNK_BYTES;
        if remaining == 0 || start < self.head {
            return Err(UmfError::MessageOverflow {
                requested: CHUNK_BYTES,
                remaining,
            });
        }
        let end = (start + CHUNK_BYTES).min(self.length);
        self.data[start..end].copy_from_slice(&chunk.to_le_bytes()[..end - start]);
        self.tail_chunks += 1;
        Ok(())
    }

    fn chunk_at(&self, index: usize) -> Chunk {
        let start = index * CHUNK_BYTES;
        let mut bytes = [0u8; CHUNK_BYTES];
        bytes.copy_from_slice(&self.data[start..start + CHUNK_BYTES]);
        chunk_from_bytes(bytes)
    }

    /// Reset the extraction cursors.
    pub fn start_extract(&mut self) {
        self.extract_front = 0;
        self.extract_back = self.chunk_count();
    }

    /// True while unextracted chunks remain.
    pub fn can_extract(&self) -> bool {
        self.extract_front < self.extract_back
    }

    /// Take the least significant unextracted chunk.
    pub fn extract_chunk(&mut self) -> Option<Chunk> {
        if !self.can_extract() {
            return None;
        }
        let chunk = self.chunk_at(self.extract_front);
        self.extract_front += 1;
        Some(chunk)
    }

    /// Reset the extraction cursors for most-significant-first extraction.
    pub fn start_reverse_extract(&mut self) {
        self.start_extract();
    }

    pub fn can_reverse_extract(&self) -> bool {
        self.can_extract()
    }

    /// Take the most significant unextracted chunk.
    pub fn reverse_extract_chunk(&mut self) -> Option<Chunk> {
        if !self.can_extract() {
            return None;
        }
        self.extract_back -= 1;
        Some(self.chunk_at(self.extract_back))
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }

    /// The header describing this message.
    pub fn header(&self) -> Header {
        Header {
            channel_id: self.channel_id,
            service_id: self.service_id,
            // `set_length` and `from_header` keep the length within u32.
            length: self.length as u32,
            sequence: self.sequence,
        }
    }

    /// Encode the header chunk without a sequence field.
    pub fn encode_header(&self, format: HeaderFormat) -> Chunk {
        self.header().encode(format)
    }

    /// Encode a sequenced header carrying the physical-channel-private field.
    pub fn encode_header_with_phy_pvt(&mut self, sequence: u8) -> Chunk {
        self.sequence = sequence;
        self.header().encode(HeaderFormat::Sequenced)
    }

    /// Decode a header chunk into an empty message ready to be filled.
    pub fn decode_header(chunk: Chunk, format: HeaderFormat, max_chunks: usize) -> Result<Self> {
        let header = Header::decode(chunk, format)?;
        header.validate(max_chunks)?;
        Ok(Self::from_header(&header))
    }
}
