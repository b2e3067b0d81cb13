//! Device boundary for the leapio FPGA link.
//!
//! The lowest layer of leapio: a byte-oriented probe/read/write interface to
//! the accelerator, split into independent read and write halves so that a
//! reader thread and the sending context never contend for one handle.
//!
//! Implementations:
//! - [`LoopbackDevice`]: in-memory pair, for host-to-host loopback and tests
//! - [`UnixDevice`]: Unix domain stream socket to a simulator (Unix only)

pub mod error;
pub mod loopback;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{DeviceError, Result};
pub use loopback::{loopback_pair, LoopbackDevice, LoopbackReader, LoopbackWriter};
pub use traits::{
    BoxedReader, BoxedWriter, Device, DeviceHalves, DeviceRead, DeviceShutdown, DeviceWrite,
};

#[cfg(unix)]
pub use uds::{UnixDevice, UnixDeviceReader, UnixDeviceWriter};
