use leapio_device::{Device, DeviceRead, DeviceShutdown, DeviceWrite};
use std::sync::Arc;

use crate::config::LinkConfig;
use crate::error::Result;
use crate::message::Message;
use crate::reader::{PhysicalReader, ReaderStats};
use crate::writer::{PhysicalWriter, WriterStats};

/// Both directions of one physical link over a split device.
pub struct PhysicalChannel<R, W> {
    reader: PhysicalReader<R>,
    writer: PhysicalWriter<W>,
    shutdown: Arc<dyn DeviceShutdown>,
}

impl<R: DeviceRead, W: DeviceWrite> PhysicalChannel<R, W> {
    /// Split `device` and wrap both halves with the same link configuration.
    pub fn open<D>(device: D, config: LinkConfig) -> Result<Self>
    where
        D: Device<Reader = R, Writer = W>,
    {
        let halves = device.split()?;
        Ok(Self {
            reader: PhysicalReader::with_config(halves.reader, config),
            writer: PhysicalWriter::with_config(halves.writer, config),
            shutdown: halves.shutdown,
        })
    }

    /// Read the next complete message (blocking).
    pub fn read(&mut self) -> Result<Message> {
        self.reader.read()
    }

    /// One non-blocking receive step.
    pub fn try_read(&mut self) -> Result<Option<Message>> {
        self.reader.try_read()
    }

    /// Write a complete message (blocking).
    pub fn write(&mut self, message: Message) -> Result<()> {
        self.writer.write(message)
    }

    /// Inbound and outbound counters.
    pub fn stats(&self) -> (ReaderStats, WriterStats) {
        (self.reader.stats(), self.writer.stats())
    }

    /// Close the device, unblocking any pending read.
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Separate the directions so they can be driven from different threads.
    pub fn into_parts(self) -> (PhysicalReader<R>, PhysicalWriter<W>, Arc<dyn DeviceShutdown>) {
        (self.reader, self.writer, self.shutdown)
    }
}

impl<R, W> std::fmt::Debug for PhysicalChannel<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalChannel")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use leapio_device::loopback_pair;

    use super::*;
    use crate::header::HeaderFormat;

    #[test]
    fn loopback_request_and_reply() {
        let (a, b) = loopback_pair();
        let config = LinkConfig::loopback(HeaderFormat::Sequenced);
        let mut host = PhysicalChannel::open(a, config).unwrap();
        let mut fpga = PhysicalChannel::open(b, config).unwrap();

        host.write(Message::from_payload(0, 7, b"ping").unwrap())
            .unwrap();
        let request = fpga.read().unwrap();
        assert_eq!(request.payload(), b"ping");

        fpga.write(Message::from_payload(0, 7, b"pong").unwrap())
            .unwrap();
        assert_eq!(host.read().unwrap().payload(), b"pong");

        let (rx, tx) = host.stats();
        assert_eq!((rx.messages_in, tx.messages_out), (1, 1));
    }

    #[cfg(unix)]
    #[test]
    fn shutdown_unblocks_reader_over_socket() {
        let (a, b) = leapio_device::UnixDevice::pair().unwrap();
        let config = LinkConfig::loopback(HeaderFormat::Legacy);
        let mut host = PhysicalChannel::open(a, config).unwrap();
        let fpga = PhysicalChannel::open(b, config).unwrap();

        let handle = std::thread::spawn(move || host.read());
        fpga.shutdown();
        drop(fpga);

        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_closed());
    }
}
