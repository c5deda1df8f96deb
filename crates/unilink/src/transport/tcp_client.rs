//! Reconnecting TCP client channel.
//!
//! Grounded on `flux_network::tcp::connector::ConnectionManager::
//! maybe_reconnect` for the connect/retry loop shape, adapted from a shared
//! multi-connection `Poll` to one dedicated `Poll` per client (this crate
//! has no equivalent to a single process-wide connector registry).

use std::io::{Read, Write};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::config::TcpClientConfig;
use crate::error::{ErrorCode, UnilinkError};
use crate::pool::BufferPool;
use crate::reconnect::{MaxRetries, ReconnectController, ReconnectDecision};
use crate::runtime::{SharedExecutor, Strand};
use crate::session::{
    BackpressureThresholds, Callbacks as SessionCallbacks, IoHandle, LinkState, Session,
};
use crate::transport::{Channel, ChannelCallbacks, ConnectionContext};

const CONNECT_TOKEN: Token = Token(0);
const READ_SCRATCH_SIZE: usize = 8192;

struct TcpHandle(mio::net::TcpStream);

impl IoHandle for TcpHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&mut self.0).write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&mut self.0).read(buf)
    }

    fn shutdown(&mut self) {
        let _ = self.0.shutdown(std::net::Shutdown::Both);
    }
}

struct Shared {
    config: TcpClientConfig,
    callbacks: ChannelCallbacks,
    executor: SharedExecutor,
    connected: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    pool: Arc<BufferPool>,
    session: Mutex<Option<Session<TcpHandle>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A TCP client channel that reconnects per [`crate::reconnect`]'s policy.
pub struct TcpClient {
    inner: Arc<Shared>,
}

impl TcpClient {
    pub fn new(config: TcpClientConfig, callbacks: ChannelCallbacks, auto_manage: bool) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::global(), auto_manage)
    }

    /// Opts this client out of the process-wide shared executor into its
    /// own dedicated worker pool, for isolation from other channels.
    pub fn with_dedicated_executor(
        config: TcpClientConfig,
        callbacks: ChannelCallbacks,
        workers: usize,
        auto_manage: bool,
    ) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::new(workers), auto_manage)
    }

    fn with_executor(
        config: TcpClientConfig,
        callbacks: ChannelCallbacks,
        executor: SharedExecutor,
        auto_manage: bool,
    ) -> Self {
        let client = Self {
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
            client.start();
        }
        client
    }
}

impl Channel for TcpClient {
    fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_requested.store(false, Ordering::Release);
        let shared = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || run_client(shared));
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

fn run_client(shared: Arc<Shared>) {
    let mut reconnect = ReconnectController::new(MaxRetries::from_raw(shared.config.max_retries), None);

    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            return;
        }
        match attempt_connection(&shared) {
            Ok(()) => {
                reconnect.reset();
            }
            Err(retryable) => match reconnect.decide(retryable) {
                ReconnectDecision::Stop => {
                    notify_error(&shared, "connect", "reconnect budget exhausted or error not retryable");
                    return;
                }
                ReconnectDecision::Retry { delay } => {
                    let wait = if delay.is_zero() {
                        Duration::from_millis(shared.config.retry_interval_ms)
                    } else {
                        delay
                    };
                    debug!(?wait, "tcp_client: waiting before next connect attempt");
                    std::thread::sleep(wait);
                }
            },
        }
        if shared.stop_requested.load(Ordering::Acquire) {
            return;
        }
    }
}

/// Runs one full connect attempt through to session end. `Ok(())` means a
/// session was established and later closed normally (or by user `stop`);
/// `Err(retryable)` means the connect itself failed.
fn attempt_connection(shared: &Arc<Shared>) -> Result<(), bool> {
    let addr = format!("{}:{}", shared.config.host, shared.config.port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or(false)?;

    let mut stream = mio::net::TcpStream::connect(addr).map_err(|e| ErrorCode::from_io_error(&e).retryable())?;

    let mut poll = Poll::new().map_err(|_| true)?;
    poll.registry()
        .register(&mut stream, CONNECT_TOKEN, Interest::READABLE | Interest::WRITABLE)
        .map_err(|_| true)?;

    // The remote has a name before it has a confirmed connection. There is no
    // `Session` to host `Connecting` yet (it needs a handle that only exists
    // once the handshake finishes), so the transition is raised straight
    // through the callback the eventual session will reuse.
    let peer = addr.to_string();
    let thresholds = BackpressureThresholds::from_threshold(shared.config.backpressure_threshold);
    let strand = Strand::new(shared.executor.clone());
    let session_callbacks = build_session_callbacks(Arc::clone(shared), peer.clone());
    if let Some(cb) = &session_callbacks.on_state {
        cb(LinkState::Connecting);
    }

    let deadline = Instant::now() + Duration::from_millis(shared.config.connection_timeout_ms);
    let mut events = Events::with_capacity(32);

    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(true);
        }
        let _ = poll.poll(&mut events, Some(deadline - now));
        if events.is_empty() {
            continue;
        }
        match stream.take_error() {
            Ok(None) => break,
            Ok(Some(e)) => return Err(ErrorCode::from_io_error(&e).retryable()),
            Err(e) => return Err(ErrorCode::from_io_error(&e).retryable()),
        }
    }

    let session = Session::new(strand.clone(), TcpHandle(stream), thresholds, false, session_callbacks);
    session.transition_to(LinkState::Connected);
    *shared.session.lock().unwrap() = Some(session.clone());

    loop {
        if shared.stop_requested.load(Ordering::Acquire) || !session.is_alive() {
            break;
        }
        let _ = poll.poll(&mut events, Some(Duration::from_millis(200)));
        for event in events.iter() {
            if event.is_readable() {
                let s = session.clone();
                strand.post(move || {
                    let mut buf = [0u8; READ_SCRATCH_SIZE];
                    s.on_readable(&mut buf);
                });
            }
            if event.is_writable() {
                session.resume_write();
            }
        }
    }

    let ended_in_error = session.state() == LinkState::Error;
    *shared.session.lock().unwrap() = None;
    if ended_in_error {
        Err(true)
    } else {
        Ok(())
    }
}

fn build_session_callbacks(shared: Arc<Shared>, peer: String) -> SessionCallbacks {
    let on_state_shared = Arc::clone(&shared);
    let on_bytes_shared = Arc::clone(&shared);
    let on_error_shared = Arc::clone(&shared);

    SessionCallbacks {
        on_bytes: Some(Box::new(move |data: &[u8]| {
            if let Some(cb) = &on_bytes_shared.callbacks.on_bytes {
                cb(data);
            }
            if let Some(cb) = &on_bytes_shared.callbacks.on_data {
                cb(String::from_utf8_lossy(data).into_owned());
            }
        })),
        on_state: Some(Box::new(move |state: LinkState| {
            let ctx = ConnectionContext { peer: Some(peer.clone()), client_id: None };
            match state {
                LinkState::Connected => {
                    on_state_shared.connected.store(true, Ordering::Release);
                    if let Some(cb) = &on_state_shared.callbacks.on_connect {
                        cb(ctx);
                    }
                }
                LinkState::Closed | LinkState::Error => {
                    on_state_shared.connected.store(false, Ordering::Release);
                    if let Some(cb) = &on_state_shared.callbacks.on_disconnect {
                        cb(ctx);
                    }
                }
                _ => {}
            }
        })),
        on_error: Some(Box::new(move |ctx| {
            if let Some(cb) = &on_error_shared.callbacks.on_error {
                cb(ctx);
            }
        })),
        on_backpressure: None,
        on_close: None,
    }
}

fn notify_error(shared: &Arc<Shared>, operation: &'static str, message: &str) {
    let err = UnilinkError::configuration("tcp_client", operation, message.to_string());
    warn!(%err, "tcp_client giving up");
    if let Some(cb) = &shared.callbacks.on_error {
        cb(err.to_context());
    }
}
