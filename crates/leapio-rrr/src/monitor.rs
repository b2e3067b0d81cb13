use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use leapio_channel::{ChannelIo, DeliveryTarget, MessageCodec, RRR_CHANNEL};
use leapio_umf::Message;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, RrrError};
use crate::exit::{report_fatal, ExitHook, PROTOCOL_MISMATCH};
use crate::registry::ServiceRegistry;
use crate::service::{ServiceContext, ServiceStub};

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub requests: u64,
    pub replies: u64,
    pub unregistered: u64,
}

/// Routes inbound request messages to the registered service stubs and
/// sends their replies back.
pub struct RrrServerMonitor {
    io: Arc<ChannelIo>,
    exit: Arc<dyn ExitHook>,
    channel_id: u8,
    registry: RwLock<ServiceRegistry>,
    initialized: AtomicBool,
    exited: AtomicBool,
    requests: AtomicU64,
    replies: AtomicU64,
    unregistered: AtomicU64,
}

fn read(registry: &RwLock<ServiceRegistry>) -> RwLockReadGuard<'_, ServiceRegistry> {
    registry.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(registry: &RwLock<ServiceRegistry>) -> RwLockWriteGuard<'_, ServiceRegistry> {
    registry.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock(stub: &Mutex<Box<dyn ServiceStub>>) -> MutexGuard<'_, Box<dyn ServiceStub>> {
    stub.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RrrServerMonitor {
    /// Monitor serving the RRR channel.
    pub fn new(io: Arc<ChannelIo>, exit: Arc<dyn ExitHook>) -> Self {
        Self::with_channel(io, exit, RRR_CHANNEL)
    }

    /// Monitor serving an arbitrary message channel.
    pub fn with_channel(io: Arc<ChannelIo>, exit: Arc<dyn ExitHook>, channel_id: u8) -> Self {
        Self::from_registry(io, exit, channel_id, ServiceRegistry::new())
    }

    /// Monitor over a service table filled in beforehand.
    pub fn from_registry(
        io: Arc<ChannelIo>,
        exit: Arc<dyn ExitHook>,
        channel_id: u8,
        registry: ServiceRegistry,
    ) -> Self {
        Self {
            io,
            exit,
            channel_id,
            registry: RwLock::new(registry),
            initialized: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            replies: AtomicU64::new(0),
            unregistered: AtomicU64::new(0),
        }
    }

    /// Register a service stub. Must happen before `init`.
    pub fn register_server(&self, id: u8, stub: Box<dyn ServiceStub>) -> Result<()> {
        write(&self.registry).register_server(id, stub)?;
        debug!(service = id, "service registered");
        Ok(())
    }

    pub fn is_registered(&self, id: u8) -> bool {
        read(&self.registry).is_registered(id)
    }

    /// Registered service ids, ascending.
    pub fn services(&self) -> Vec<u8> {
        read(&self.registry).ids().collect()
    }

    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Initialize every registered service, then start taking requests.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let registry = read(&self.registry);
            for (id, stub) in registry.iter() {
                let ctx = ServiceContext::new(
                    Arc::clone(&self.io),
                    Arc::clone(&self.exit),
                    id,
                    self.channel_id,
                );
                lock(stub).init(&ctx);
            }
        }
        let target: Arc<dyn DeliveryTarget<Message>> = Arc::clone(self) as _;
        self.io
            .register_for_delivery::<MessageCodec>(self.channel_id, target)?;
        info!(
            channel = self.channel_id,
            services = read(&self.registry).len(),
            "service monitor initialized"
        );
        Ok(())
    }

    /// Dispatch one request to its service and send back any reply.
    ///
    /// A request for an unregistered service means the two sides were built
    /// from different service tables; it is reported and the exit hook is
    /// invoked (once per monitor).
    pub fn deliver_message(&self, message: Message) -> Result<()> {
        let service_id = message.service_id();
        let channel_id = message.channel_id();
        self.requests.fetch_add(1, Ordering::Relaxed);

        let reply = {
            let registry = read(&self.registry);
            let Some(stub) = registry.get(service_id) else {
                drop(registry);
                self.unregistered.fetch_add(1, Ordering::Relaxed);
                self.protocol_mismatch(service_id);
                return Err(RrrError::UnregisteredService(service_id));
            };
            trace!(service = service_id, length = message.length(), "dispatching request");
            let mut stub = lock(stub);
            stub.request(message)
        };

        if let Some(mut reply) = reply {
            reply.set_service_id(service_id);
            reply.set_channel_id(channel_id);
            self.io.send_message(channel_id, reply)?;
            self.replies.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn protocol_mismatch(&self, service_id: u8) {
        if self.exited.swap(true, Ordering::AcqRel) {
            warn!(service = service_id, "request for unregistered service dropped");
            return;
        }
        report_fatal(
            self.exit.as_ref(),
            PROTOCOL_MISMATCH,
            &format!("request for unregistered service id {service_id}"),
        );
    }

    /// Give every service a chance to do periodic work.
    pub fn poll(&self) {
        let registry = read(&self.registry);
        for (_, stub) in registry.iter() {
            lock(stub).poll();
        }
    }

    /// Uninitialize and drop every service and stop taking requests.
    /// Safe to call more than once.
    pub fn uninit(&self) {
        let was_initialized = self.initialized.swap(false, Ordering::AcqRel);
        if was_initialized {
            if let Err(err) = self.io.unregister_delivery(self.channel_id) {
                warn!(channel = self.channel_id, "unregister failed: {err}");
            }
        }
        let stubs = write(&self.registry).drain();
        if stubs.is_empty() && !was_initialized {
            return;
        }
        for (id, mut stub) in stubs {
            if was_initialized {
                stub.uninit();
            }
            trace!(service = id, "service released");
        }
        debug!(channel = self.channel_id, "service monitor uninitialized");
    }

    pub fn stats(&self) -> MonitorStats {
        MonitorStats {
            requests: self.requests.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            unregistered: self.unregistered.load(Ordering::Relaxed),
        }
    }
}

impl DeliveryTarget<Message> for RrrServerMonitor {
    fn deliver(&self, message: Message) {
        match self.deliver_message(message) {
            Ok(()) | Err(RrrError::UnregisteredService(_)) => {}
            Err(RrrError::Channel(err)) if err.is_closed() => {
                debug!(channel = self.channel_id, "reply dropped, link shut down: {err}");
            }
            Err(err) if err.is_fatal() => {
                report_fatal(self.exit.as_ref(), crate::exit::exit_code(&err), &err.to_string());
            }
            Err(err) => error!(channel = self.channel_id, "reply failed: {err}"),
        }
    }
}

impl std::fmt::Debug for RrrServerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RrrServerMonitor")
            .field("channel_id", &self.channel_id)
            .field("registry", &*read(&self.registry))
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::Receiver;

    use leapio_channel::{ChannelIoConfig, ChannelKind, ChannelSpec};
    use leapio_device::{loopback_pair, Device, LoopbackDevice};
    use leapio_umf::{HeaderFormat, LinkConfig};

    use super::*;
    use crate::exit::RecordingExit;

    #[derive(Default)]
    struct Calls {
        init: AtomicUsize,
        request: AtomicUsize,
        poll: AtomicUsize,
        uninit: AtomicUsize,
        seen_id: AtomicUsize,
    }

    /// Replies with the request payload reversed.
    struct Reverse(Arc<Calls>);

    impl ServiceStub for Reverse {
        fn init(&mut self, ctx: &ServiceContext) {
            self.0.init.fetch_add(1, Ordering::SeqCst);
            self.0
                .seen_id
                .store(usize::from(ctx.service_id()), Ordering::SeqCst);
        }

        fn request(&mut self, message: Message) -> Option<Message> {
            self.0.request.fetch_add(1, Ordering::SeqCst);
            let mut payload = message.payload().to_vec();
            payload.reverse();
            Message::from_payload(0, 0, &payload).ok()
        }

        fn poll(&mut self) {
            self.0.poll.fetch_add(1, Ordering::SeqCst);
        }

        fn uninit(&mut self) {
            self.0.uninit.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// One-way service: never replies.
    struct Sink(Arc<Calls>);

    impl ServiceStub for Sink {
        fn request(&mut self, _message: Message) -> Option<Message> {
            self.0.request.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    fn io(device: LoopbackDevice) -> Arc<ChannelIo> {
        let halves = device.split().unwrap().boxed();
        let config = ChannelIoConfig {
            link: LinkConfig::loopback(HeaderFormat::Legacy),
            channels: vec![
                ChannelSpec::new(RRR_CHANNEL, ChannelKind::Message),
                ChannelSpec::new(1, ChannelKind::Wide),
            ],
        };
        Arc::new(ChannelIo::new(halves.reader, halves.writer, &config).unwrap())
    }

    struct Rig {
        monitor: Arc<RrrServerMonitor>,
        host: Arc<ChannelIo>,
        fpga: Arc<ChannelIo>,
        replies: Receiver<Message>,
        exit: Arc<RecordingExit>,
    }

    fn rig() -> Rig {
        let (a, b) = loopback_pair();
        let host = io(a);
        let fpga = io(b);
        let replies = fpga.receiver::<MessageCodec>(RRR_CHANNEL).unwrap();
        let exit = Arc::new(RecordingExit::new());
        let monitor = Arc::new(RrrServerMonitor::new(Arc::clone(&host), exit.clone()));
        Rig {
            monitor,
            host,
            fpga,
            replies,
            exit,
        }
    }

    fn drain(io: &ChannelIo) {
        while io.poll().unwrap() {}
    }

    fn request(rig: &Rig, service: u8, payload: &[u8]) {
        rig.fpga
            .send_message(RRR_CHANNEL, Message::from_payload(0, service, payload).unwrap())
            .unwrap();
        drain(&rig.host);
        drain(&rig.fpga);
    }

    #[test]
    fn request_reaches_registered_stub_and_reply_returns() {
        let rig = rig();
        let calls = Arc::new(Calls::default());
        rig.monitor
            .register_server(7, Box::new(Reverse(calls.clone())))
            .unwrap();
        rig.monitor.init().unwrap();
        assert_eq!(calls.init.load(Ordering::SeqCst), 1);
        assert_eq!(calls.seen_id.load(Ordering::SeqCst), 7);

        request(&rig, 7, b"abc");

        assert_eq!(calls.request.load(Ordering::SeqCst), 1);
        let reply = rig.replies.try_recv().unwrap();
        assert_eq!(reply.payload(), b"cba");
        assert_eq!(reply.service_id(), 7);
        assert_eq!(reply.channel_id(), RRR_CHANNEL);
        assert!(rig.exit.codes().is_empty());
    }

    #[test]
    fn unregistered_service_takes_fatal_path_once() {
        let rig = rig();
        let calls = Arc::new(Calls::default());
        rig.monitor
            .register_server(7, Box::new(Reverse(calls.clone())))
            .unwrap();
        rig.monitor.init().unwrap();

        request(&rig, 9, b"x");
        request(&rig, 9, b"y");

        assert_eq!(rig.exit.codes(), vec![PROTOCOL_MISMATCH]);
        assert_eq!(calls.request.load(Ordering::SeqCst), 0);
        assert!(rig.replies.try_recv().is_err());
        assert_eq!(rig.monitor.stats().unregistered, 2);
    }

    #[test]
    fn duplicate_registration_is_fatal() {
        let rig = rig();
        let calls = Arc::new(Calls::default());
        rig.monitor
            .register_server(3, Box::new(Sink(calls.clone())))
            .unwrap();
        let err = rig
            .monitor
            .register_server(3, Box::new(Sink(calls)))
            .unwrap_err();
        assert!(matches!(err, RrrError::DuplicateService(3)));
        assert!(err.is_fatal());
    }

    #[test]
    fn no_reply_writes_nothing() {
        let rig = rig();
        let calls = Arc::new(Calls::default());
        rig.monitor
            .register_server(2, Box::new(Sink(calls.clone())))
            .unwrap();
        rig.monitor.init().unwrap();

        request(&rig, 2, b"fire and forget");

        assert_eq!(calls.request.load(Ordering::SeqCst), 1);
        assert!(rig.replies.try_recv().is_err());
        assert_eq!(rig.monitor.stats().replies, 0);
    }

    #[test]
    fn poll_reaches_every_service() {
        let rig = rig();
        let calls = Arc::new(Calls::default());
        rig.monitor
            .register_server(4, Box::new(Reverse(calls.clone())))
            .unwrap();
        rig.monitor
            .register_server(5, Box::new(Reverse(calls.clone())))
            .unwrap();
        rig.monitor.init().unwrap();

        rig.monitor.poll();
        assert_eq!(calls.poll.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn uninit_is_idempotent_and_stops_dispatch() {
        let rig = rig();
        let calls = Arc::new(Calls::default());
        rig.monitor
            .register_server(7, Box::new(Reverse(calls.clone())))
            .unwrap();
        rig.monitor.init().unwrap();

        rig.monitor.uninit();
        rig.monitor.uninit();
        assert_eq!(calls.uninit.load(Ordering::SeqCst), 1);
        assert!(rig.monitor.services().is_empty());

        // With the monitor unregistered, requests land in the channel queue.
        let queued = rig.host.receiver::<MessageCodec>(RRR_CHANNEL).unwrap();
        request(&rig, 7, b"late");
        assert_eq!(calls.request.load(Ordering::SeqCst), 0);
        assert_eq!(queued.try_recv().unwrap().payload(), b"late");
        assert!(rig.exit.codes().is_empty());
    }

    #[test]
    fn service_context_sends_unsolicited_messages() {
        struct Announce(Option<ServiceContext>);

        impl ServiceStub for Announce {
            fn init(&mut self, ctx: &ServiceContext) {
                self.0 = Some(ctx.clone());
            }

            fn request(&mut self, _message: Message) -> Option<Message> {
                None
            }

            fn poll(&mut self) {
                if let Some(ctx) = &self.0 {
                    ctx.send(Message::from_payload(0, 0, b"tick").unwrap())
                        .unwrap();
                }
            }
        }

        let rig = rig();
        rig.monitor
            .register_server(11, Box::new(Announce(None)))
            .unwrap();
        rig.monitor.init().unwrap();
        rig.monitor.poll();
        drain(&rig.fpga);

        let message = rig.replies.try_recv().unwrap();
        assert_eq!(message.service_id(), 11);
        assert_eq!(message.payload(), b"tick");
    }

    #[test]
    fn init_rejects_non_message_channel() {
        let rig = rig();
        let monitor = Arc::new(RrrServerMonitor::with_channel(
            Arc::clone(&rig.host),
            rig.exit.clone(),
            1,
        ));
        assert!(matches!(monitor.init(), Err(RrrError::Channel(_))));
    }
}
