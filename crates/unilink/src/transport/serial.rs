//! Serial port channel.
//!
//! Grounded on `flux_network::tcp::connector::ConnectionManager::
//! maybe_reconnect` for the open/retry loop shape, adapted to a device that
//! has no `mio` readiness notion: reads use the port's own blocking timeout
//! as the poll interval, and a timed-out read is remapped to `WouldBlock`
//! so it flows through [`Session::on_readable`] unchanged. A `0`-byte read
//! is remapped the same way, since serial EOF is not terminal.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{FlowControl, Parity, SerialConfig};
use crate::error::UnilinkError;
use crate::pool::BufferPool;
use crate::runtime::{SharedExecutor, Strand};
use crate::session::{
    BackpressureThresholds, Callbacks as SessionCallbacks, IoHandle, LinkState, Session,
};
use crate::transport::{Channel, ChannelCallbacks, ConnectionContext};

const POLL_TIMEOUT: Duration = Duration::from_millis(50);
const RESUME_WRITE_EVERY: u32 = 4;

struct SerialHandle {
    port: Box<dyn serialport::SerialPort>,
}

impl IoHandle for SerialHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, e))
            }
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.port.read(buf) {
            Ok(0) => Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "serial read: no data")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, e))
            }
            Err(e) => Err(e),
        }
    }

    fn shutdown(&mut self) {}
}

struct Shared {
    config: SerialConfig,
    callbacks: ChannelCallbacks,
    executor: SharedExecutor,
    connected: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    pool: Arc<BufferPool>,
    session: Mutex<Option<Session<SerialHandle>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A serial port channel with open-retry and non-terminal EOF semantics.
pub struct SerialPortChannel {
    inner: Arc<Shared>,
}

impl SerialPortChannel {
    pub fn new(config: SerialConfig, callbacks: ChannelCallbacks, auto_manage: bool) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::global(), auto_manage)
    }

    /// Opts this channel out of the process-wide shared executor into its
    /// own dedicated worker pool, for isolation from other channels.
    pub fn with_dedicated_executor(
        config: SerialConfig,
        callbacks: ChannelCallbacks,
        workers: usize,
        auto_manage: bool,
    ) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::new(workers), auto_manage)
    }

    fn with_executor(
        config: SerialConfig,
        callbacks: ChannelCallbacks,
        executor: SharedExecutor,
        auto_manage: bool,
    ) -> Self {
        let channel = Self {
            inner: Arc::new(Shared {
                config,
                callbacks,
                executor,
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                pool: Arc::new(BufferPool::new()),
                session: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        };
        if auto_manage {
            channel.start();
        }
        channel
    }
}

impl Channel for SerialPortChannel {
    fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_requested.store(false, Ordering::Release);
        let shared = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || run_serial(shared));
        *self.inner.worker.lock().unwrap() = Some(handle);
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_requested.store(true, Ordering::Release);
        if let Some(session) = self.inner.session.lock().unwrap().clone() {
            session.stop();
        }
        if let Some(handle) = self.inner.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn send(&self, data: &str) {
        if let Some(session) = self.inner.session.lock().unwrap().as_ref() {
            let _ = session.write_copy(data.as_bytes(), Some(&self.inner.pool));
        }
    }
}

fn run_serial(shared: Arc<Shared>) {
    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            return;
        }
        // The device is reachable for a handle-bearing `Session` only once
        // `open_and_configure` succeeds, so `Connecting` is raised straight
        // through the callback this attempt's eventual session will reuse.
        let session_callbacks = build_session_callbacks(Arc::clone(&shared));
        if let Some(cb) = &session_callbacks.on_state {
            cb(LinkState::Connecting);
        }
        match open_and_configure(&shared.config) {
            Ok(port) => run_session(&shared, port, session_callbacks),
            Err(e) => {
                notify_error(&shared, &e);
                if !shared.config.reopen_on_error {
                    return;
                }
                debug!(wait_ms = shared.config.retry_interval_ms, "serial: waiting before reopening");
                std::thread::sleep(Duration::from_millis(shared.config.retry_interval_ms));
            }
        }
        if shared.stop_requested.load(Ordering::Acquire) {
            return;
        }
    }
}

fn open_and_configure(config: &SerialConfig) -> Result<Box<dyn serialport::SerialPort>, UnilinkError> {
    config.validate()?;

    let data_bits = match config.char_size {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let parity = match config.parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    };
    let stop_bits = if config.stop_bits == 2 { serialport::StopBits::Two } else { serialport::StopBits::One };
    let flow = match config.flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    };

    serialport::new(&config.device, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow)
        .timeout(POLL_TIMEOUT)
        .open()
        .map_err(|e| UnilinkError::configuration("serial", "open", e.to_string()))
}

fn run_session(shared: &Arc<Shared>, port: Box<dyn serialport::SerialPort>, session_callbacks: SessionCallbacks) {
    let thresholds = BackpressureThresholds::from_threshold(64 * 1024);
    let strand = Strand::new(shared.executor.clone());
    let session = Session::new(strand.clone(), SerialHandle { port }, thresholds, false, session_callbacks);
    session.transition_to(LinkState::Connected);
    shared.connected.store(true, Ordering::Release);
    if let Some(cb) = &shared.callbacks.on_connect {
        cb(ConnectionContext { peer: Some(shared.config.device.clone()), client_id: None });
    }
    *shared.session.lock().unwrap() = Some(session.clone());

    let mut scratch = vec![0u8; shared.config.read_chunk];
    let mut tick: u32 = 0;
    while !shared.stop_requested.load(Ordering::Acquire) && session.is_alive() {
        session.on_readable(&mut scratch);
        tick = tick.wrapping_add(1);
        if tick % RESUME_WRITE_EVERY == 0 {
            session.resume_write();
        }
    }

    *shared.session.lock().unwrap() = None;
}

fn build_session_callbacks(shared: Arc<Shared>) -> SessionCallbacks {
    let bytes_shared = Arc::clone(&shared);
    let state_shared = Arc::clone(&shared);
    let error_shared = Arc::clone(&shared);

    SessionCallbacks {
        on_bytes: Some(Box::new(move |data: &[u8]| {
            if let Some(cb) = &bytes_shared.callbacks.on_bytes {
                cb(data);
            }
            if let Some(cb) = &bytes_shared.callbacks.on_data {
                cb(String::from_utf8_lossy(data).into_owned());
            }
        })),
        on_state: Some(Box::new(move |state: LinkState| {
            if matches!(state, LinkState::Closed | LinkState::Error) {
                state_shared.connected.store(false, Ordering::Release);
                if let Some(cb) = &state_shared.callbacks.on_disconnect {
                    cb(ConnectionContext { peer: Some(state_shared.config.device.clone()), client_id: None });
                }
            }
        })),
        on_backpressure: None,
        on_error: Some(Box::new(move |ctx| {
            if let Some(cb) = &error_shared.callbacks.on_error {
                cb(ctx);
            }
        })),
        on_close: None,
    }
}

fn notify_error(shared: &Arc<Shared>, err: &UnilinkError) {
    warn!(%err, "serial: open/configure failed");
    if let Some(cb) = &shared.callbacks.on_error {
        cb(err.to_context());
    }
}
