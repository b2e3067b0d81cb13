//! Value marshalling onto wire messages, and what each wire message costs.
//!
//! Splitting and pricing live together here: the sender debits exactly the
//! cost of every wire message it produces, and the receiver hands back the
//! cost of every wire message it consumes. If the two ever disagree the
//! channel eventually stalls in `CreditGate::acquire` with no way out.

use leapio_umf::{
    Chunk, Header, HeaderFormat, Message, UmfError, CHUNK_BYTES, DEFAULT_MAX_MESSAGE_CHUNKS,
};
use tracing::warn;

use crate::config::ChannelKind;
use crate::error::{ChannelError, Result};

/// Chunks in every wire message produced by the built-in codecs.
pub const FRAGMENT_CHUNKS: usize = 2;

/// Credits charged per wire message on top of its chunks.
pub const DEFAULT_CREDIT_OVERHEAD: usize = 1;

/// Fragment tag: the data chunk is the inner message header.
pub const FRAGMENT_HEADER: Chunk = 0;

/// Fragment tag: the data chunk is one payload chunk.
pub const FRAGMENT_PAYLOAD: Chunk = 1;

const FRAGMENT_BYTES: usize = FRAGMENT_CHUNKS * CHUNK_BYTES;

/// Credits one wire message costs.
pub fn wire_cost(message: &Message, overhead: usize) -> usize {
    message.chunk_count() + overhead
}

/// Credits a whole message costs on a message channel: a header fragment
/// plus one fragment per payload chunk.
pub fn message_cost(payload_chunks: usize, overhead: usize) -> usize {
    (payload_chunks + 1) * (FRAGMENT_CHUNKS + overhead)
}

/// Credits one value costs on a wide channel.
pub fn wide_cost(overhead: usize) -> usize {
    FRAGMENT_CHUNKS + overhead
}

/// Turns values into wire messages and back.
///
/// Decoders are stateful; one instance lives per inbound channel.
/// `max_message_chunks` is the link's payload cap: encoders refuse values
/// the peer would drop, and decoders drop what exceeds it.
pub trait ChannelCodec: Default + Send + 'static {
    type Value: Send + 'static;

    const KIND: ChannelKind;

    /// Decoder for a link with the given payload cap.
    fn with_max_chunks(_max_message_chunks: usize) -> Self {
        Self::default()
    }

    /// Append the wire messages for `value`, in send order.
    fn encode(
        channel_id: u8,
        value: Self::Value,
        max_message_chunks: usize,
        out: &mut Vec<Message>,
    ) -> Result<()>;

    /// Feed one wire message. Returns a value once one is complete.
    fn decode(&mut self, wire: Message) -> Result<Option<Self::Value>>;

    /// Partially decoded values given up on so far.
    fn abandoned(&self) -> u64 {
        0
    }
}

fn fragment(channel_id: u8, tag: Chunk, data: Chunk) -> Result<Message> {
    let mut wire = Message::with_ids(channel_id, 0);
    wire.set_length(FRAGMENT_BYTES)?;
    wire.append_chunk(tag)?;
    wire.append_chunk(data)?;
    Ok(wire)
}

fn unfragment(wire: &mut Message) -> Result<(Chunk, Chunk)> {
    let channel = wire.channel_id();
    let malformed = |reason| ChannelError::MalformedFragment { channel, reason };
    if wire.chunk_count() != FRAGMENT_CHUNKS {
        return Err(malformed("fragment is not two chunks"));
    }
    wire.start_extract();
    match (wire.extract_chunk(), wire.extract_chunk()) {
        (Some(tag), Some(data)) => Ok((tag, data)),
        _ => Err(malformed("fragment is not two chunks")),
    }
}

/// Carries whole UMF messages as a header fragment followed by one fragment
/// per payload chunk, in forward order.
///
/// A header fragment that arrives before the previous message completed
/// abandons that message; the new one is reassembled as usual.
#[derive(Debug)]
pub struct MessageCodec {
    partial: Option<Message>,
    max_chunks: usize,
    abandoned: u64,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::with_max_chunks(DEFAULT_MAX_MESSAGE_CHUNKS)
    }
}

impl MessageCodec {
    /// True while a message is half reassembled.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }
}

impl ChannelCodec for MessageCodec {
    type Value = Message;

    const KIND: ChannelKind = ChannelKind::Message;

    fn with_max_chunks(max_message_chunks: usize) -> Self {
        Self {
            partial: None,
            max_chunks: max_message_chunks,
            abandoned: 0,
        }
    }

    fn encode(
        channel_id: u8,
        mut value: Message,
        max_message_chunks: usize,
        out: &mut Vec<Message>,
    ) -> Result<()> {
        if value.can_append() {
            return Err(UmfError::IncompleteMessage {
                unwritten: value.bytes_unwritten(),
            }
            .into());
        }
        if value.chunk_count() > max_message_chunks {
            return Err(UmfError::MessageTooLong {
                chunks: value.chunk_count(),
                max: max_message_chunks,
            }
            .into());
        }
        out.reserve(value.chunk_count() + 1);
        out.push(fragment(
            channel_id,
            FRAGMENT_HEADER,
            value.encode_header(HeaderFormat::Legacy),
        )?);
        value.start_extract();
        while let Some(chunk) = value.extract_chunk() {
            out.push(fragment(channel_id, FRAGMENT_PAYLOAD, chunk)?);
        }
        Ok(())
    }

    fn decode(&mut self, mut wire: Message) -> Result<Option<Message>> {
        let channel = wire.channel_id();
        let (tag, data) = unfragment(&mut wire)?;

        let mut message = match tag {
            FRAGMENT_HEADER => {
                let header = Header::decode(data, HeaderFormat::Legacy).map_err(|_| {
                    ChannelError::MalformedFragment {
                        channel,
                        reason: "inner header has the wrong format tag",
                    }
                })?;
                if let Some(stale) = self.partial.take() {
                    self.abandoned += 1;
                    warn!(
                        channel,
                        service = stale.service_id(),
                        unwritten = stale.bytes_unwritten(),
                        "header fragment before previous message completed, dropping it"
                    );
                }
                header.validate(self.max_chunks)?;
                let message = Message::from_header(&header);
                if message.can_append() {
                    self.partial = Some(message);
                    return Ok(None);
                }
                message
            }
            FRAGMENT_PAYLOAD => {
                let Some(mut message) = self.partial.take() else {
                    return Err(ChannelError::MalformedFragment {
                        channel,
                        reason: "payload fragment without a header",
                    });
                };
                message.append_chunk(data)?;
                if message.can_append() {
                    self.partial = Some(message);
                    return Ok(None);
                }
                message
            }
            _ => {
                return Err(ChannelError::MalformedFragment {
                    channel,
                    reason: "unknown fragment tag",
                })
            }
        };
        message.set_channel_id(channel);
        Ok(Some(message))
    }

    fn abandoned(&self) -> u64 {
        self.abandoned
    }
}

/// Carries a 128-bit value as a single two-chunk wire message, low chunk
/// first.
#[derive(Debug, Default)]
pub struct WideCodec;

impl ChannelCodec for WideCodec {
    type Value = u128;

    const KIND: ChannelKind = ChannelKind::Wide;

    fn encode(channel_id: u8, value: u128, _: usize, out: &mut Vec<Message>) -> Result<()> {
        let mut wire = Message::with_ids(channel_id, 0);
        wire.set_length(FRAGMENT_BYTES)?;
        wire.append_chunk(value as u64)?;
        wire.append_chunk((value >> 64) as u64)?;
        out.push(wire);
        Ok(())
    }

    fn decode(&mut self, mut wire: Message) -> Result<Option<u128>> {
        let (low, high) = unfragment(&mut wire)?;
        Ok(Some(u128::from(low) | (u128::from(high) << 64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_message(payload: &[u8]) -> Vec<Message> {
        let message = Message::from_payload(9, 7, payload).unwrap();
        let mut wire = Vec::new();
        MessageCodec::encode(2, message, DEFAULT_MAX_MESSAGE_CHUNKS, &mut wire).unwrap();
        wire
    }

    #[test]
    fn split_and_cost_agree() {
        for len in [0usize, 1, 8, 9, 24, 100] {
            let wire = encode_message(&vec![0x5A; len]);
            let payload_chunks = len.div_ceil(CHUNK_BYTES);
            assert_eq!(wire.len(), payload_chunks + 1);

            for overhead in [0, DEFAULT_CREDIT_OVERHEAD, 4] {
                let charged: usize = wire.iter().map(|m| wire_cost(m, overhead)).sum();
                assert_eq!(charged, message_cost(payload_chunks, overhead));
            }
        }
    }

    #[test]
    fn default_overhead_matches_three_per_fragment() {
        assert_eq!(message_cost(0, DEFAULT_CREDIT_OVERHEAD), 3);
        assert_eq!(message_cost(4, DEFAULT_CREDIT_OVERHEAD), (4 + 1) * 3);
        assert_eq!(wide_cost(DEFAULT_CREDIT_OVERHEAD), 3);
    }

    #[test]
    fn wide_split_and_cost_agree() {
        let mut wire = Vec::new();
        WideCodec::encode(1, 42, DEFAULT_MAX_MESSAGE_CHUNKS, &mut wire).unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire_cost(&wire[0], 2), wide_cost(2));
    }

    #[test]
    fn message_reassembles_in_forward_order() {
        let payload: Vec<u8> = (0..29).collect();
        let wire = encode_message(&payload);

        let mut codec = MessageCodec::default();
        let mut out = None;
        for (i, fragment) in wire.into_iter().enumerate() {
            let result = codec.decode(fragment).unwrap();
            if i < 4 {
                assert!(result.is_none());
                assert!(codec.in_progress());
            } else {
                out = result;
            }
        }
        let message = out.expect("complete after last fragment");
        assert_eq!(message.payload(), payload.as_slice());
        assert_eq!(message.service_id(), 7);
        // The arrival channel wins over the inner header's channel.
        assert_eq!(message.channel_id(), 2);
        assert!(!codec.in_progress());
    }

    #[test]
    fn header_only_message_is_one_fragment() {
        let wire = encode_message(&[]);
        assert_eq!(wire.len(), 1);

        let mut codec = MessageCodec::default();
        let message = codec
            .decode(wire.into_iter().next().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(message.length(), 0);
        assert_eq!(message.service_id(), 7);
    }

    #[test]
    fn payload_without_header_is_malformed() {
        let mut wire = encode_message(b"abcdefgh");
        let payload = wire.pop().unwrap();

        let mut codec = MessageCodec::default();
        let err = codec.decode(payload).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn interrupted_message_is_counted_and_next_one_survives() {
        let mut first = encode_message(b"0123456789abcdef");
        first.truncate(2); // header + first payload fragment only
        let second = encode_message(b"xyz");

        let mut codec = MessageCodec::default();
        for fragment in first {
            assert!(codec.decode(fragment).unwrap().is_none());
        }

        let mut second = second.into_iter();
        assert!(codec.decode(second.next().unwrap()).unwrap().is_none());
        assert_eq!(codec.abandoned(), 1);

        let message = codec.decode(second.next().unwrap()).unwrap().unwrap();
        assert_eq!(message.payload(), b"xyz");
    }

    #[test]
    fn header_only_message_after_interrupted_one_is_delivered() {
        let mut first = encode_message(b"0123456789abcdef");
        first.truncate(1);
        let second = encode_message(&[]);

        let mut codec = MessageCodec::default();
        assert!(codec.decode(first.pop().unwrap()).unwrap().is_none());

        let message = codec
            .decode(second.into_iter().next().unwrap())
            .unwrap()
            .expect("header-only message is complete");
        assert_eq!(message.length(), 0);
        assert_eq!(message.service_id(), 7);
        assert_eq!(codec.abandoned(), 1);
        assert!(!codec.in_progress());
    }

    #[test]
    fn message_over_link_cap_is_not_sent() {
        let message = Message::from_payload(0, 1, &[0u8; 5 * CHUNK_BYTES]).unwrap();
        let mut wire = Vec::new();
        let err = MessageCodec::encode(0, message, 4, &mut wire).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Umf(UmfError::MessageTooLong { chunks: 5, max: 4 })
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn decoder_uses_configured_cap() {
        let wire = encode_message(&[0u8; 3 * CHUNK_BYTES]);
        let mut codec = MessageCodec::with_max_chunks(2);
        let mut wire = wire.into_iter();

        let err = codec.decode(wire.next().unwrap()).unwrap_err();
        assert!(err.is_malformed());
        assert!(!codec.in_progress());
        // Its payload fragments then have no header to attach to.
        for fragment in wire {
            assert!(codec.decode(fragment).unwrap_err().is_malformed());
        }
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut codec = MessageCodec::default();
        let err = codec.decode(fragment(0, 7, 0).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::MalformedFragment {
                reason: "unknown fragment tag",
                ..
            }
        ));
    }

    #[test]
    fn incomplete_message_is_not_sent() {
        let mut message = Message::new();
        message.set_length(16).unwrap();
        let mut wire = Vec::new();
        assert!(MessageCodec::encode(0, message, DEFAULT_MAX_MESSAGE_CHUNKS, &mut wire).is_err());
        assert!(wire.is_empty());
    }

    #[test]
    fn wide_value_low_chunk_first() {
        let value = (0x1111_2222_3333_4444u128 << 64) | 0x5555_6666_7777_8888;
        let mut wire = Vec::new();
        WideCodec::encode(3, value, DEFAULT_MAX_MESSAGE_CHUNKS, &mut wire).unwrap();

        let mut message = wire.pop().unwrap();
        message.start_extract();
        assert_eq!(message.extract_chunk(), Some(0x5555_6666_7777_8888));
        assert_eq!(message.extract_chunk(), Some(0x1111_2222_3333_4444));

        let mut wire = Vec::new();
        WideCodec::encode(3, value, DEFAULT_MAX_MESSAGE_CHUNKS, &mut wire).unwrap();
        let decoded = WideCodec::default().decode(wire.pop().unwrap()).unwrap();
        assert_eq!(decoded, Some(value));
    }

    #[test]
    fn wide_rejects_wrong_size() {
        let wire = Message::from_payload(3, 0, &[0u8; 8]).unwrap();
        assert!(WideCodec::default().decode(wire).unwrap_err().is_malformed());
    }
}
