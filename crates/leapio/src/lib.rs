//! Host-side message transport between software and FPGA logic.
//!
//! leapio moves structured messages across a narrow, chunked link in three
//! layers: a physical channel that reassembles 64-bit chunks into messages,
//! channel I/O that multiplexes logical channels with credit-based flow
//! control, and an RRR monitor that dispatches requests to registered
//! service stubs.
//!
//! # Crate Structure
//!
//! - [`device`]: byte-level device boundary (loopback, Unix socket)
//! - [`umf`]: messages and the physical channel
//! - [`channel`]: logical channels, codecs and credits
//! - [`rrr`]: service registry and dispatch
//! - [`Platform`]: the lifecycle context tying them together

pub mod config;
pub mod error;
pub mod logging;
pub mod platform;

/// Re-export device types.
pub mod device {
    pub use leapio_device::*;
}

/// Re-export message and physical channel types.
pub mod umf {
    pub use leapio_umf::*;
}

/// Re-export channel I/O types.
pub mod channel {
    pub use leapio_channel::*;
}

/// Re-export service dispatch types.
pub mod rrr {
    pub use leapio_rrr::*;
}

pub use config::PlatformConfig;
pub use error::{PlatformError, Result};
#[cfg(feature = "logging")]
pub use logging::init_logging;
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use platform::{Platform, PlatformBuilder, PlatformStats};
