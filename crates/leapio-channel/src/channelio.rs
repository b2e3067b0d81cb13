use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use leapio_device::{BoxedReader, BoxedWriter};
use leapio_umf::{Message, PhysicalReader, PhysicalWriter, ReaderStats, WriterStats};
use tracing::{debug, trace, warn};

use crate::config::{ChannelIoConfig, ChannelKind, ChannelSpec};
use crate::credits::{CreditGate, CreditSnapshot};
use crate::error::{ChannelError, Result};
use crate::lock;
use crate::marshal::{wire_cost, ChannelCodec, MessageCodec, WideCodec};

/// Most credits one wire message can return; the field is a byte.
const MAX_RETURN_PER_MESSAGE: usize = u8::MAX as usize;

/// Receives completed values from a logical channel.
///
/// Called on whichever thread drives the receive path (the reader thread,
/// or the caller of [`ChannelIo::poll`]), with no channel lock held.
pub trait DeliveryTarget<T>: Send + Sync {
    fn deliver(&self, value: T);
}

type Delivery = Box<dyn FnOnce() -> bool + Send>;

/// Type-erased inbound side of a channel.
trait InboundSlot: Send {
    /// Feed one wire message; returns the delivery to run once the channel
    /// lock is released.
    fn accept(&mut self, wire: Message) -> Result<Option<Delivery>>;

    fn clear_target(&mut self);

    fn abandoned(&self) -> u64;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Inbound<C: ChannelCodec> {
    codec: C,
    queue: Sender<C::Value>,
    receiver: Option<Receiver<C::Value>>,
    target: Option<Arc<dyn DeliveryTarget<C::Value>>>,
}

impl<C: ChannelCodec> Inbound<C> {
    fn new(max_message_chunks: usize) -> Self {
        let (queue, receiver) = mpsc::channel();
        Self {
            codec: C::with_max_chunks(max_message_chunks),
            queue,
            receiver: Some(receiver),
            target: None,
        }
    }
}

impl<C: ChannelCodec> InboundSlot for Inbound<C> {
    fn accept(&mut self, wire: Message) -> Result<Option<Delivery>> {
        let Some(value) = self.codec.decode(wire)? else {
            return Ok(None);
        };
        let delivery: Delivery = match &self.target {
            Some(target) => {
                let target = Arc::clone(target);
                Box::new(move || {
                    target.deliver(value);
                    true
                })
            }
            None => {
                let queue = self.queue.clone();
                Box::new(move || queue.send(value).is_ok())
            }
        };
        Ok(Some(delivery))
    }

    fn clear_target(&mut self) {
        self.target = None;
    }

    fn abandoned(&self) -> u64 {
        self.codec.abandoned()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct LogicalChannel {
    spec: ChannelSpec,
    credits: CreditGate,
    /// Held for a whole logical send so its wire messages stay contiguous.
    burst: Mutex<()>,
    /// Credits consumed locally and not yet returned to the peer.
    owed: AtomicUsize,
    inbound: Mutex<Box<dyn InboundSlot>>,
    wire_sent: AtomicU64,
    wire_received: AtomicU64,
    delivered: AtomicU64,
}

impl LogicalChannel {
    fn new(spec: ChannelSpec, max_message_chunks: usize) -> Self {
        let inbound: Box<dyn InboundSlot> = match spec.kind {
            ChannelKind::Message => Box::new(Inbound::<MessageCodec>::new(max_message_chunks)),
            ChannelKind::Wide => Box::new(Inbound::<WideCodec>::new(max_message_chunks)),
        };
        Self {
            credits: CreditGate::new(spec.initial_credits),
            spec,
            burst: Mutex::new(()),
            owed: AtomicUsize::new(0),
            inbound: Mutex::new(inbound),
            wire_sent: AtomicU64::new(0),
            wire_received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    fn id(&self) -> u8 {
        self.spec.id
    }

    fn cost(&self, wire: &Message) -> usize {
        wire_cost(wire, self.spec.credit_overhead)
    }

    fn check_kind<C: ChannelCodec>(&self) -> Result<()> {
        if self.spec.kind != C::KIND {
            return Err(ChannelError::KindMismatch {
                channel: self.id(),
                requested: C::KIND,
                actual: self.spec.kind,
            });
        }
        Ok(())
    }

    /// Take up to one message's worth of owed credits.
    fn take_owed(&self) -> u8 {
        let previous = self
            .owed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| {
                Some(owed.saturating_sub(MAX_RETURN_PER_MESSAGE))
            })
            .unwrap_or_else(|owed| owed);
        previous.min(MAX_RETURN_PER_MESSAGE) as u8
    }

    fn restore_owed(&self, credits: u8) {
        self.owed.fetch_add(usize::from(credits), Ordering::AcqRel);
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            channel_id: self.id(),
            credits: self.credits.snapshot(),
            credits_owed: self.owed.load(Ordering::Acquire),
            wire_sent: self.wire_sent.load(Ordering::Relaxed),
            wire_received: self.wire_received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub channel_id: u8,
    pub credits: CreditSnapshot,
    /// Credits to be returned to the peer.
    pub credits_owed: usize,
    pub wire_sent: u64,
    pub wire_received: u64,
    /// Completed values handed to a queue or delivery target.
    pub delivered: u64,
}

/// Counters of the whole multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelIoStats {
    pub reader: ReaderStats,
    pub writer: WriterStats,
    pub unknown_channel_dropped: u64,
    pub malformed_dropped: u64,
}

/// Multiplexes the configured logical channels over one physical link.
///
/// Sending may happen from any number of threads. The receive path is
/// driven either by one thread in [`run_reader`](Self::run_reader) or by
/// calling [`poll`](Self::poll) from the main loop.
///
/// Credit messages (header-only wire messages) are neither charged nor
/// returned, and may appear between the fragments of a logical send.
pub struct ChannelIo {
    writer: Mutex<PhysicalWriter<BoxedWriter>>,
    reader: Mutex<PhysicalReader<BoxedReader>>,
    reader_stats: Mutex<ReaderStats>,
    channels: BTreeMap<u8, LogicalChannel>,
    max_message_chunks: usize,
    unknown_dropped: AtomicU64,
    malformed_dropped: AtomicU64,
}

impl ChannelIo {
    /// Build every configured channel over a split device.
    pub fn new(reader: BoxedReader, writer: BoxedWriter, config: &ChannelIoConfig) -> Result<Self> {
        config.validate()?;
        let channels = config
            .channels
            .iter()
            .map(|spec| {
                let channel = LogicalChannel::new(spec.clone(), config.link.max_message_chunks);
                (spec.id, channel)
            })
            .collect();
        debug!(
            channels = config.channels.len(),
            format = ?config.link.format,
            "channel io initialized"
        );
        Ok(Self {
            writer: Mutex::new(PhysicalWriter::with_config(writer, config.link)),
            reader: Mutex::new(PhysicalReader::with_config(reader, config.link)),
            reader_stats: Mutex::new(ReaderStats::default()),
            channels,
            max_message_chunks: config.link.max_message_chunks,
            unknown_dropped: AtomicU64::new(0),
            malformed_dropped: AtomicU64::new(0),
        })
    }

    /// Configured channel ids, ascending.
    pub fn channel_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels.keys().copied()
    }

    pub fn spec(&self, channel_id: u8) -> Option<&ChannelSpec> {
        self.channels.get(&channel_id).map(|channel| &channel.spec)
    }

    fn channel(&self, channel_id: u8) -> Result<&LogicalChannel> {
        self.channels
            .get(&channel_id)
            .ok_or(ChannelError::UnknownChannel(channel_id))
    }

    fn typed<C: ChannelCodec>(&self, channel_id: u8) -> Result<&LogicalChannel> {
        let channel = self.channel(channel_id)?;
        channel.check_kind::<C>()?;
        Ok(channel)
    }

    /// Marshal `value` and send it, blocking for credits before every wire
    /// message.
    ///
    /// Blocks until [`shutdown`](Self::shutdown) if the peer stops
    /// returning credits. Values larger than the link's payload cap are
    /// rejected before anything is charged.
    pub fn send<C: ChannelCodec>(&self, channel_id: u8, value: C::Value) -> Result<()> {
        let channel = self.typed::<C>(channel_id)?;
        let mut wire = Vec::new();
        C::encode(channel_id, value, self.max_message_chunks, &mut wire)?;

        let _burst = lock(&channel.burst);
        for message in wire {
            self.write_wire(channel, message)?;
        }
        Ok(())
    }

    /// Send a UMF message on a message channel.
    pub fn send_message(&self, channel_id: u8, message: Message) -> Result<()> {
        self.send::<MessageCodec>(channel_id, message)
    }

    /// Send a 128-bit value on a wide channel.
    pub fn send_wide(&self, channel_id: u8, value: u128) -> Result<()> {
        self.send::<WideCodec>(channel_id, value)
    }

    fn write_wire(&self, channel: &LogicalChannel, mut wire: Message) -> Result<()> {
        let cost = channel.cost(&wire);
        channel.credits.acquire(cost)?;

        let returned = channel.take_owed();
        wire.set_service_id(returned);
        if let Err(err) = lock(&self.writer).write(wire) {
            channel.restore_owed(returned);
            return Err(err.into());
        }
        channel.wire_sent.fetch_add(1, Ordering::Relaxed);
        trace!(channel = channel.id(), cost, returned, "wire message sent");
        Ok(())
    }

    /// Send everything owed to the peer on `channel_id` as header-only
    /// credit messages. Returns the number of credits sent.
    pub fn return_credits(&self, channel_id: u8) -> Result<usize> {
        let channel = self.channel(channel_id)?;
        let mut total = 0;
        loop {
            let returned = channel.take_owed();
            if returned == 0 {
                break;
            }
            let wire = Message::with_ids(channel_id, returned);
            if let Err(err) = lock(&self.writer).write(wire) {
                channel.restore_owed(returned);
                return Err(err.into());
            }
            total += usize::from(returned);
        }
        if total > 0 {
            debug!(channel = channel_id, credits = total, "credits returned");
        }
        Ok(total)
    }

    /// Take the inbound queue of a channel. Values arrive here unless a
    /// delivery target is registered. Can be taken once.
    pub fn receiver<C: ChannelCodec>(&self, channel_id: u8) -> Result<Receiver<C::Value>> {
        let channel = self.typed::<C>(channel_id)?;
        let mut inbound = lock(&channel.inbound);
        let slot = inbound
            .as_any_mut()
            .downcast_mut::<Inbound<C>>()
            .ok_or(ChannelError::KindMismatch {
                channel: channel_id,
                requested: C::KIND,
                actual: channel.spec.kind,
            })?;
        slot.receiver
            .take()
            .ok_or(ChannelError::ReceiverTaken(channel_id))
    }

    /// Route completed values of a channel to `target` instead of its queue.
    pub fn register_for_delivery<C: ChannelCodec>(
        &self,
        channel_id: u8,
        target: Arc<dyn DeliveryTarget<C::Value>>,
    ) -> Result<()> {
        let channel = self.typed::<C>(channel_id)?;
        let mut inbound = lock(&channel.inbound);
        let slot = inbound
            .as_any_mut()
            .downcast_mut::<Inbound<C>>()
            .ok_or(ChannelError::KindMismatch {
                channel: channel_id,
                requested: C::KIND,
                actual: channel.spec.kind,
            })?;
        slot.target = Some(target);
        debug!(channel = channel_id, "delivery target registered");
        Ok(())
    }

    /// Drop the delivery target of a channel; values go back to its queue.
    pub fn unregister_delivery(&self, channel_id: u8) -> Result<()> {
        let channel = self.channel(channel_id)?;
        lock(&channel.inbound).clear_target();
        debug!(channel = channel_id, "delivery target unregistered");
        Ok(())
    }

    /// Typed sending handle for one channel.
    pub fn open<C: ChannelCodec>(self: &Arc<Self>, channel_id: u8) -> Result<MarshalledChannel<C>> {
        self.typed::<C>(channel_id)?;
        Ok(MarshalledChannel {
            io: Arc::clone(self),
            channel_id,
            _codec: PhantomData,
        })
    }

    /// Route one inbound wire message to its logical channel.
    ///
    /// Returned credits are applied first. Unknown channels and malformed
    /// fragments are logged, counted and dropped.
    pub fn dispatch(&self, wire: Message) -> Result<()> {
        let channel_id = wire.channel_id();
        let Some(channel) = self.channels.get(&channel_id) else {
            self.unknown_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                channel = channel_id,
                length = wire.length(),
                "dropping message for unconfigured channel"
            );
            return Ok(());
        };

        channel.credits.free(usize::from(wire.service_id()));
        if wire.chunk_count() == 0 {
            trace!(channel = channel_id, credits = wire.service_id(), "credit message");
            return Ok(());
        }

        channel.wire_received.fetch_add(1, Ordering::Relaxed);
        let cost = channel.cost(&wire);
        let owed = channel.owed.fetch_add(cost, Ordering::AcqRel) + cost;

        let (accepted, abandoned) = {
            let mut inbound = lock(&channel.inbound);
            let before = inbound.abandoned();
            let accepted = inbound.accept(wire);
            (accepted, inbound.abandoned() - before)
        };
        if abandoned > 0 {
            self.malformed_dropped.fetch_add(abandoned, Ordering::Relaxed);
        }
        match accepted {
            Ok(Some(delivery)) => {
                if delivery() {
                    channel.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(channel = channel_id, "receiver dropped, value discarded");
                }
            }
            Ok(None) => {}
            Err(err) if err.is_malformed() => {
                self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(channel = channel_id, "dropping inbound traffic: {err}");
            }
            Err(err) => return Err(err),
        }

        if channel.spec.return_threshold.is_some_and(|threshold| owed >= threshold) {
            self.return_credits(channel_id)?;
        }
        Ok(())
    }

    /// One non-blocking receive step: reads at most one chunk and dispatches
    /// a message if one completed. Returns whether any data was consumed.
    pub fn poll(&self) -> Result<bool> {
        let (next, progressed) = {
            let mut reader = lock(&self.reader);
            let before = reader.stats().chunks_in;
            let next = reader.try_read();
            let stats = reader.stats();
            *lock(&self.reader_stats) = stats;
            (next, stats.chunks_in != before)
        };
        match next {
            Ok(Some(message)) => self.dispatch(message)?,
            Ok(None) => {}
            // Already reported by the reader; its payload is skipped.
            Err(err) if err.is_malformed() => {}
            Err(err) => return Err(err.into()),
        }
        Ok(progressed)
    }

    /// Blocking receive loop for a dedicated reader thread.
    ///
    /// Runs until `running` is cleared and the device is closed, or until a
    /// fatal error.
    pub fn run_reader(&self, running: &AtomicBool) -> Result<()> {
        debug!("reader loop started");
        while running.load(Ordering::Acquire) {
            let next = {
                let mut reader = lock(&self.reader);
                let next = reader.read();
                *lock(&self.reader_stats) = reader.stats();
                next
            };
            match next {
                Ok(message) => self.dispatch(message)?,
                Err(err) if err.is_malformed() => {}
                Err(err) if err.is_closed() && !running.load(Ordering::Acquire) => break,
                Err(err) => return Err(err.into()),
            }
        }
        debug!("reader loop stopped");
        Ok(())
    }

    /// Close every credit gate so blocked and future sends fail with
    /// [`ChannelError::Closed`]. The device itself is closed by its
    /// shutdown handle.
    pub fn shutdown(&self) {
        for channel in self.channels.values() {
            channel.credits.close();
        }
        debug!("channel io shut down");
    }

    pub fn channel_stats(&self, channel_id: u8) -> Result<ChannelStats> {
        Ok(self.channel(channel_id)?.stats())
    }

    pub fn stats(&self) -> ChannelIoStats {
        ChannelIoStats {
            reader: *lock(&self.reader_stats),
            writer: lock(&self.writer).stats(),
            unknown_channel_dropped: self.unknown_dropped.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelIo")
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Sending handle bound to one channel and codec.
pub struct MarshalledChannel<C: ChannelCodec> {
    io: Arc<ChannelIo>,
    channel_id: u8,
    _codec: PhantomData<fn() -> C>,
}

impl<C: ChannelCodec> MarshalledChannel<C> {
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    pub fn send(&self, value: C::Value) -> Result<()> {
        self.io.send::<C>(self.channel_id, value)
    }

    pub fn return_credits(&self) -> Result<usize> {
        self.io.return_credits(self.channel_id)
    }

    pub fn stats(&self) -> Result<ChannelStats> {
        self.io.channel_stats(self.channel_id)
    }
}

impl<C: ChannelCodec> Clone for MarshalledChannel<C> {
    fn clone(&self) -> Self {
        Self {
            io: Arc::clone(&self.io),
            channel_id: self.channel_id,
            _codec: PhantomData,
        }
    }
}

impl<C: ChannelCodec> std::fmt::Debug for MarshalledChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarshalledChannel")
            .field("channel_id", &self.channel_id)
            .field("kind", &C::KIND)
            .finish()
    }
}
