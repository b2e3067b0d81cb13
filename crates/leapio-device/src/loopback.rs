//! In-memory device pair.
//!
//! Bytes written on one end become readable on the other. Reads block on a
//! condition variable until data arrives or the pipe is closed. Used for
//! host-to-host loopback and for exercising the stack without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::traits::{Device, DeviceHalves, DeviceRead, DeviceShutdown, DeviceWrite};

#[derive(Debug, Default)]
struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }
}

/// One end of an in-memory device pair.
#[derive(Debug)]
pub struct LoopbackDevice {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
}

/// Create two connected loopback devices.
pub fn loopback_pair() -> (LoopbackDevice, LoopbackDevice) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    (
        LoopbackDevice {
            inbound: Arc::clone(&b_to_a),
            outbound: Arc::clone(&a_to_b),
        },
        LoopbackDevice {
            inbound: a_to_b,
            outbound: b_to_a,
        },
    )
}

impl Device for LoopbackDevice {
    type Reader = LoopbackReader;
    type Writer = LoopbackWriter;

    fn split(self) -> Result<DeviceHalves<LoopbackReader, LoopbackWriter>> {
        let shutdown = Arc::new(LoopbackShutdown {
            inbound: Arc::clone(&self.inbound),
            outbound: Arc::clone(&self.outbound),
        });
        Ok(DeviceHalves {
            reader: LoopbackReader {
                pipe: self.inbound,
            },
            writer: LoopbackWriter {
                pipe: self.outbound,
            },
            shutdown,
        })
    }

    fn device_name(&self) -> &'static str {
        "loopback"
    }
}

/// Reading half of a [`LoopbackDevice`].
#[derive(Debug)]
pub struct LoopbackReader {
    pipe: Arc<Pipe>,
}

impl DeviceRead for LoopbackReader {
    fn probe(&mut self) -> Result<bool> {
        let state = self.pipe.lock();
        if state.buf.is_empty() && state.closed {
            return Err(DeviceError::Closed);
        }
        Ok(!state.buf.is_empty())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.pipe.lock();
        while state.buf.is_empty() {
            if state.closed {
                return Err(DeviceError::Closed);
            }
            state = self
                .pipe
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let n = buf.len().min(state.buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Writing half of a [`LoopbackDevice`].
#[derive(Debug)]
pub struct LoopbackWriter {
    pipe: Arc<Pipe>,
}

impl DeviceWrite for LoopbackWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut state = self.pipe.lock();
        if state.closed {
            return Err(DeviceError::Closed);
        }
        state.buf.extend(buf);
        drop(state);
        self.pipe.readable.notify_all();
        Ok(())
    }
}

/// Closes both directions of a loopback device.
#[derive(Debug)]
struct LoopbackShutdown {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
}

impl DeviceShutdown for LoopbackShutdown {
    fn shutdown(&self) {
        debug!("closing loopback device");
        self.inbound.close();
        self.outbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_cross_the_pair() {
        let (a, b) = loopback_pair();
        let a = a.split().unwrap();
        let mut b = b.split().unwrap();

        let mut writer = a.writer;
        writer.write(b"hello").unwrap();

        assert!(b.reader.probe().unwrap());
        let mut buf = [0u8; 8];
        let n = b.reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(!b.reader.probe().unwrap());
    }

    #[test]
    fn short_reads_return_available_bytes() {
        let (a, b) = loopback_pair();
        let mut a = a.split().unwrap();
        let mut b = b.split().unwrap();

        a.writer.write(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(b.reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(b.reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 3);
    }

    #[test]
    fn blocked_read_wakes_on_write() {
        let (a, b) = loopback_pair();
        let mut a = a.split().unwrap();
        let mut b = b.split().unwrap();

        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let n = b.reader.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        a.writer.write(b"late").unwrap();

        let got = reader.join().unwrap();
        assert!(!got.is_empty());
        assert!(b"late".starts_with(&got));
    }

    #[test]
    fn shutdown_unblocks_reader() {
        let (a, b) = loopback_pair();
        let _a = a.split().unwrap();
        let b = b.split().unwrap();
        let shutdown = Arc::clone(&b.shutdown);
        let mut reader = b.reader;

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        shutdown.shutdown();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(DeviceError::Closed)));
    }

    #[test]
    fn write_after_shutdown_fails() {
        let (a, _b) = loopback_pair();
        let mut a = a.split().unwrap();
        a.shutdown.shutdown();
        assert!(matches!(a.writer.write(b"x"), Err(DeviceError::Closed)));
    }

    #[test]
    fn buffered_bytes_survive_close() {
        let (a, b) = loopback_pair();
        let mut a = a.split().unwrap();
        let mut b = b.split().unwrap();

        a.writer.write(b"tail").unwrap();
        a.shutdown.shutdown();

        let mut buf = [0u8; 4];
        assert_eq!(b.reader.read(&mut buf).unwrap(), 4);
        assert!(matches!(b.reader.read(&mut buf), Err(DeviceError::Closed)));
    }
}
