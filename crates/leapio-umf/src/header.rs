use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UmfError};

/// The atomic transfer unit of the link.
pub type Chunk = u64;

/// Size of one chunk on the wire.
pub const CHUNK_BYTES: usize = 8;

/// Default cap on the payload of a single message, in chunks.
pub const DEFAULT_MAX_MESSAGE_CHUNKS: usize = 4096;

const TAG_SHIFT: u32 = 60;
const SEQUENCE_SHIFT: u32 = 52;
const CHANNEL_SHIFT: u32 = 44;
const SERVICE_SHIFT: u32 = 36;
const RESERVED_SHIFT: u32 = 32;
const BYTE_MASK: u64 = 0xFF;
const NIBBLE_MASK: u64 = 0xF;
const LENGTH_MASK: u64 = 0xFFFF_FFFF;

/// Header encoding used on a link.
///
/// Both encodings share one layout; they differ in the format tag and in
/// whether the physical-channel sequence field is populated. A link uses
/// exactly one of them.
///
/// ```text
/// ┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────────┐
/// │ tag (4b) │ seq (8b) │ chan (8b)│ svc (8b) │ rsvd (4b)│ length (32b) │
/// │ 63..60   │ 59..52   │ 51..44   │ 43..36   │ 35..32   │ 31..0        │
/// └──────────┴──────────┴──────────┴──────────┴──────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderFormat {
    /// Original encoding: no sequence field.
    Legacy,
    /// Carries a per-physical-channel sequence number for loss detection.
    Sequenced,
}

impl HeaderFormat {
    /// The 4-bit format tag written into every header.
    pub const fn tag(self) -> u8 {
        match self {
            HeaderFormat::Legacy => 0x1,
            HeaderFormat::Sequenced => 0x2,
        }
    }
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub channel_id: u8,
    pub service_id: u8,
    /// Payload length in bytes.
    pub length: u32,
    /// Physical-channel-private sequence number. Always zero on legacy links.
    pub sequence: u8,
}

impl Header {
    /// Number of payload chunks this header announces.
    pub fn chunk_count(&self) -> usize {
        chunks_for_length(self.length as usize)
    }

    /// Encode into a header chunk.
    pub fn encode(&self, format: HeaderFormat) -> Chunk {
        let sequence = match format {
            HeaderFormat::Legacy => 0,
            HeaderFormat::Sequenced => u64::from(self.sequence),
        };
        (u64::from(format.tag()) << TAG_SHIFT)
            | (sequence << SEQUENCE_SHIFT)
            | (u64::from(self.channel_id) << CHANNEL_SHIFT)
            | (u64::from(self.service_id) << SERVICE_SHIFT)
            | u64::from(self.length)
    }

    /// Decode a header chunk, checking the format tag.
    ///
    /// A tag mismatch means the two ends of the link were built for
    /// different header versions.
    pub fn decode(chunk: Chunk, format: HeaderFormat) -> Result<Self> {
        let found = ((chunk >> TAG_SHIFT) & NIBBLE_MASK) as u8;
        if found != format.tag() {
            return Err(UmfError::HeaderFormatMismatch {
                expected: format.tag(),
                found,
            });
        }

        let sequence = match format {
            HeaderFormat::Legacy => 0,
            HeaderFormat::Sequenced => ((chunk >> SEQUENCE_SHIFT) & BYTE_MASK) as u8,
        };

        Ok(Self {
            channel_id: ((chunk >> CHANNEL_SHIFT) & BYTE_MASK) as u8,
            service_id: ((chunk >> SERVICE_SHIFT) & BYTE_MASK) as u8,
            length: (chunk & LENGTH_MASK) as u32,
            sequence,
        })
    }

    /// Reject headers whose payload exceeds the link's message cap.
    pub fn validate(&self, max_chunks: usize) -> Result<()> {
        let chunks = self.chunk_count();
        if chunks > max_chunks {
            return Err(UmfError::MessageTooLong {
                chunks,
                max: max_chunks,
            });
        }
        Ok(())
    }
}

/// Reserved header bits, exposed for diagnostics.
pub fn reserved_bits(chunk: Chunk) -> u8 {
    ((chunk >> RESERVED_SHIFT) & NIBBLE_MASK) as u8
}

/// Number of chunks needed to hold `length` payload bytes.
pub fn chunks_for_length(length: usize) -> usize {
    length.div_ceil(CHUNK_BYTES)
}

/// Append one chunk to a wire buffer (little-endian).
pub fn put_chunk(dst: &mut BytesMut, chunk: Chunk) {
    dst.put_u64_le(chunk);
}

/// Read a chunk from its wire bytes.
pub fn chunk_from_bytes(bytes: [u8; CHUNK_BYTES]) -> Chunk {
    Chunk::from_le_bytes(bytes)
}
