//! Remote request/response (RRR) service dispatch.
//!
//! Services register a stub under a small integer id. The
//! [`RrrServerMonitor`] takes every complete message arriving on the RRR
//! channel, hands it to the stub registered under the message's service id,
//! and sends any reply back down the channel it came from. Both sides of the
//! link must agree on the service table; a request for an id nobody
//! registered is a fatal protocol mismatch.

pub mod error;
pub mod exit;
pub mod monitor;
pub mod registry;
pub mod service;

pub use error::{Result, RrrError};
pub use exit::{ExitHook, ProcessExit, RecordingExit};
pub use monitor::{MonitorStats, RrrServerMonitor};
pub use registry::{ServiceRegistry, MAX_SERVICES};
pub use service::{ServiceContext, ServiceStub};
