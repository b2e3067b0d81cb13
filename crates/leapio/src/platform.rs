use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use leapio_channel::{ChannelIo, ChannelIoStats, ChannelSpec, RRR_CHANNEL};
use leapio_device::{Device, DeviceShutdown};
use leapio_rrr::exit::{exit_code, report_fatal};
use leapio_rrr::{
    ExitHook, MonitorStats, ProcessExit, RrrError, RrrServerMonitor, ServiceRegistry, ServiceStub,
};
use tracing::{debug, error, info, warn};

use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};

const READER_THREAD_NAME: &str = "leapio-reader";

/// Assembles a [`Platform`]: configuration, exit hook and services.
pub struct PlatformBuilder {
    config: PlatformConfig,
    exit: Arc<dyn ExitHook>,
    services: ServiceRegistry,
    error: Option<RrrError>,
}

impl PlatformBuilder {
    pub fn new(config: PlatformConfig) -> Self {
        Self {
            config,
            exit: Arc::new(ProcessExit),
            services: ServiceRegistry::new(),
            error: None,
        }
    }

    /// Where fatal errors go. Defaults to terminating the process.
    pub fn exit_hook(mut self, exit: Arc<dyn ExitHook>) -> Self {
        self.exit = exit;
        self
    }

    /// Register a service stub under `id`.
    ///
    /// A duplicate or out-of-range id is a fatal configuration error: it is
    /// reported and handed to the exit hook, and `build` fails.
    pub fn service(mut self, id: u8, stub: impl ServiceStub + 'static) -> Self {
        if let Err(err) = self.services.register_server(id, Box::new(stub)) {
            report_fatal(self.exit.as_ref(), exit_code(&err), &err.to_string());
            self.error.get_or_insert(err);
        }
        self
    }

    /// Split `device` and build channel I/O and the service monitor on it.
    pub fn build<D: Device>(self, device: D) -> Result<Platform> {
        if let Some(err) = self.error {
            return Err(err.into());
        }

        let device_name = device.device_name();
        let halves = device.split()?.boxed();
        let io = Arc::new(ChannelIo::new(
            halves.reader,
            halves.writer,
            &self.config.io,
        )?);

        let monitor = Arc::new(RrrServerMonitor::from_registry(
            Arc::clone(&io),
            Arc::clone(&self.exit),
            RRR_CHANNEL,
            self.services,
        ));

        debug!(
            device = device_name,
            services = ?monitor.services(),
            reader_thread = self.config.reader_thread,
            "platform built"
        );

        Ok(Platform {
            io,
            monitor,
            exit: self.exit,
            shutdown: halves.shutdown,
            device_name,
            reader_thread: self.config.reader_thread,
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            initialized: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformStats {
    pub io: ChannelIoStats,
    pub monitor: MonitorStats,
}

/// The transport stack for one physical link: channel I/O, the service
/// monitor and, in threaded mode, the reader thread.
///
/// Lifecycle: [`init`](Self::init), then [`poll`](Self::poll) from the main
/// loop, then [`uninit`](Self::uninit) and
/// [`uninit_complete`](Self::uninit_complete). Dropping the platform runs
/// the last two.
pub struct Platform {
    io: Arc<ChannelIo>,
    monitor: Arc<RrrServerMonitor>,
    exit: Arc<dyn ExitHook>,
    shutdown: Arc<dyn DeviceShutdown>,
    device_name: &'static str,
    reader_thread: bool,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    stopped: AtomicBool,
}

impl Platform {
    pub fn builder(config: PlatformConfig) -> PlatformBuilder {
        PlatformBuilder::new(config)
    }

    /// Initialize services, start taking requests and, in threaded mode,
    /// start the reader thread.
    pub fn init(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PlatformError::ShutDown);
        }
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.monitor.init()?;

        if self.reader_thread {
            self.running.store(true, Ordering::Release);
            let io = Arc::clone(&self.io);
            let running = Arc::clone(&self.running);
            let exit = Arc::clone(&self.exit);
            let handle = std::thread::Builder::new()
                .name(READER_THREAD_NAME.to_string())
                .spawn(move || reader_loop(&io, &running, exit.as_ref()))
                .map_err(PlatformError::Spawn)?;
            *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        info!(
            device = self.device_name,
            services = ?self.monitor.services(),
            threaded = self.reader_thread,
            "platform initialized"
        );
        Ok(())
    }

    /// Periodic work from the main loop.
    ///
    /// In single-threaded mode this first drains whatever inbound data the
    /// device has ready. Services are always polled.
    pub fn poll(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.reader_thread {
            loop {
                match self.io.poll() {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        if err.is_fatal() {
                            let err = PlatformError::from(err);
                            report_fatal(self.exit.as_ref(), err.exit_code(), &err.to_string());
                            return Err(err);
                        }
                        return Err(err.into());
                    }
                }
            }
        }
        self.monitor.poll();
        Ok(())
    }

    /// Stop taking work: fail sends waiting for credits, close the device
    /// so blocked reads return, then uninitialize every service. Safe to
    /// call more than once.
    pub fn uninit(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.io.shutdown();
        self.shutdown.shutdown();
        self.monitor.uninit();
        info!(device = self.device_name, "platform uninitialized");
    }

    /// Wait for the reader thread to exit. Call after `uninit`.
    pub fn uninit_complete(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("reader thread panicked");
            }
            debug!("reader thread joined");
        }
    }

    /// Channel I/O, for sending on application channels.
    pub fn io(&self) -> &Arc<ChannelIo> {
        &self.io
    }

    pub fn monitor(&self) -> &Arc<RrrServerMonitor> {
        &self.monitor
    }

    pub fn channel(&self, channel_id: u8) -> Option<&ChannelSpec> {
        self.io.spec(channel_id)
    }

    pub fn device_name(&self) -> &'static str {
        self.device_name
    }

    pub fn is_running(&self) -> bool {
        self.initialized.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PlatformStats {
        PlatformStats {
            io: self.io.stats(),
            monitor: self.monitor.stats(),
        }
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.uninit();
        self.uninit_complete();
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("device", &self.device_name)
            .field("reader_thread", &self.reader_thread)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn reader_loop(io: &ChannelIo, running: &AtomicBool, exit: &dyn ExitHook) {
    match io.run_reader(running) {
        Ok(()) => {}
        Err(err) if err.is_closed() => {
            warn!("device closed while the platform was running");
        }
        Err(err) => {
            let err = PlatformError::from(err);
            report_fatal(exit, err.exit_code(), &err.to_string());
        }
    }
}
