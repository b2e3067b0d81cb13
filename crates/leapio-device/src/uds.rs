use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::traits::{Device, DeviceHalves, DeviceRead, DeviceShutdown, DeviceWrite};

/// Device backed by a Unix domain stream socket.
///
/// Used to talk to a simulated accelerator (for example a bluesim or RTL
/// simulation process) that exposes its link as a socket.
#[derive(Debug)]
pub struct UnixDevice {
    stream: UnixStream,
}

impl UnixDevice {
    /// Connect to a simulator listening on `path` (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|e| DeviceError::Connect {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(?path, "connected to device socket");
        Ok(Self { stream })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Create a connected pair of devices.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }
}

impl Device for UnixDevice {
    type Reader = UnixDeviceReader;
    type Writer = UnixDeviceWriter;

    fn split(self) -> Result<DeviceHalves<UnixDeviceReader, UnixDeviceWriter>> {
        let reader_stream = self.stream.try_clone()?;
        let shutdown_stream = self.stream.try_clone()?;
        Ok(DeviceHalves {
            reader: UnixDeviceReader {
                stream: reader_stream,
            },
            writer: UnixDeviceWriter {
                stream: self.stream,
            },
            shutdown: Arc::new(UnixDeviceShutdown {
                stream: shutdown_stream,
            }),
        })
    }

    fn device_name(&self) -> &'static str {
        "unix-domain-socket"
    }
}

/// Reading half of a [`UnixDevice`].
#[derive(Debug)]
pub struct UnixDeviceReader {
    stream: UnixStream,
}

impl DeviceRead for UnixDeviceReader {
    /// Zero-timeout `poll(2)` on the socket. A hung-up socket counts as
    /// readable so the following `read` reports the close.
    fn probe(&mut self) -> Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        // SAFETY: `pollfd` is a valid, writable array of one element, and
        // `fd` is an open socket descriptor owned by this reader.
        let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(DeviceError::Io(err));
        }
        Ok(rc > 0 && pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Ok(0) => Err(DeviceError::Closed),
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(DeviceError::Io(err)),
        }
    }
}

/// Writing half of a [`UnixDevice`].
#[derive(Debug)]
pub struct UnixDeviceWriter {
    stream: UnixStream,
}

impl DeviceWrite for UnixDeviceWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            match self.stream.write(&buf[offset..]) {
                Ok(0) => return Err(DeviceError::Closed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(DeviceError::Io(err)),
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        loop {
            match self.stream.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(DeviceError::Io(err)),
            }
        }
    }
}

#[derive(Debug)]
struct UnixDeviceShutdown {
    stream: UnixStream,
}

impl DeviceShutdown for UnixDeviceShutdown {
    fn shutdown(&self) {
        debug!("shutting down device socket");
        // Already-disconnected sockets report NotConnected; nothing left to do.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
