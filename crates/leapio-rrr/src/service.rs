use std::sync::Arc;

use leapio_channel::ChannelIo;
use leapio_umf::Message;

use crate::error::Result;
use crate::exit::{report_fatal, ExitHook};

/// Host-side implementation of one service.
///
/// All methods run with the service's lock held. `request` runs on the
/// thread that drives the receive path, so a stub that blocks there stalls
/// every channel behind it.
pub trait ServiceStub: Send {
    /// Called once from `RrrServerMonitor::init`.
    fn init(&mut self, _ctx: &ServiceContext) {}

    /// Handle one request. A returned message is sent back to the caller on
    /// the channel the request arrived on.
    fn request(&mut self, message: Message) -> Option<Message>;

    /// Periodic work, driven by the platform's poll loop.
    fn poll(&mut self) {}

    /// Release resources. Called once from `RrrServerMonitor::uninit`.
    fn uninit(&mut self) {}
}

/// What a service sees of the platform it runs in.
#[derive(Clone)]
pub struct ServiceContext {
    io: Arc<ChannelIo>,
    exit: Arc<dyn ExitHook>,
    service_id: u8,
    channel_id: u8,
}

impl ServiceContext {
    pub(crate) fn new(
        io: Arc<ChannelIo>,
        exit: Arc<dyn ExitHook>,
        service_id: u8,
        channel_id: u8,
    ) -> Self {
        Self {
            io,
            exit,
            service_id,
            channel_id,
        }
    }

    pub fn service_id(&self) -> u8 {
        self.service_id
    }

    /// Channel I/O shared by every service.
    pub fn io(&self) -> &Arc<ChannelIo> {
        &self.io
    }

    pub fn exit_hook(&self) -> &Arc<dyn ExitHook> {
        &self.exit
    }

    /// Send an unsolicited message from this service to the remote side.
    pub fn send(&self, mut message: Message) -> Result<()> {
        message.set_service_id(self.service_id);
        message.set_channel_id(self.channel_id);
        self.io.send_message(self.channel_id, message)?;
        Ok(())
    }

    /// Report a fatal error and hand `code` to the exit hook.
    pub fn fatal(&self, code: i32, message: &str) {
        report_fatal(self.exit.as_ref(), code, message);
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("service_id", &self.service_id)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}
