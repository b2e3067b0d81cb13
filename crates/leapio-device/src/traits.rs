use std::sync::Arc;

use crate::error::Result;

/// Inbound half of a device.
///
/// `read` blocks until at least one byte is available. Returning `Ok(0)`
/// means "not ready yet" and callers retry; a vanished device is reported
/// as [`DeviceError::Closed`](crate::DeviceError::Closed).
pub trait DeviceRead: Send {
    /// Returns true if at least one byte can be read without blocking.
    fn probe(&mut self) -> Result<bool>;

    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Outbound half of a device.
pub trait DeviceWrite: Send {
    /// Write the whole buffer (blocking).
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flush anything buffered below this layer.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Force-closes a device so that blocked reads return.
pub trait DeviceShutdown: Send + Sync {
    fn shutdown(&self);
}

/// A device that can be split into independent read and write halves.
pub trait Device {
    type Reader: DeviceRead + 'static;
    type Writer: DeviceWrite + 'static;

    /// Split into reader, writer and a shutdown handle.
    fn split(self) -> Result<DeviceHalves<Self::Reader, Self::Writer>>;

    /// Device name for diagnostics.
    fn device_name(&self) -> &'static str;
}

/// The parts of a split device.
pub struct DeviceHalves<R, W> {
    pub reader: R,
    pub writer: W,
    pub shutdown: Arc<dyn DeviceShutdown>,
}

impl<R, W> std::fmt::Debug for DeviceHalves<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHalves").finish_non_exhaustive()
    }
}

/// Boxed reader, used where layers above erase the concrete device type.
pub type BoxedReader = Box<dyn DeviceRead>;

/// Boxed writer, used where layers above erase the concrete device type.
pub type BoxedWriter = Box<dyn DeviceWrite>;

impl<T: DeviceRead + ?Sized> DeviceRead for Box<T> {
    fn probe(&mut self) -> Result<bool> {
        (**self).probe()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }
}

impl<T: DeviceWrite + ?Sized> DeviceWrite for Box<T> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<R: DeviceRead + 'static, W: DeviceWrite + 'static> DeviceHalves<R, W> {
    /// Erase the concrete reader and writer types.
    pub fn boxed(self) -> DeviceHalves<BoxedReader, BoxedWriter> {
        DeviceHalves {
            reader: Box::new(self.reader),
            writer: Box::new(self.writer),
            shutdown: self.shutdown,
        }
    }
}
