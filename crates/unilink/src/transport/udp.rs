//! UDP datagram channel with remote-learning and pinning.
//!
//! Grounded on `flux_network::tcp::connector`'s dedicated-`Poll` reactor
//! shape, adapted to datagram semantics: unlike the stream-oriented
//! `Session::on_readable` (where `0` means EOF), a UDP `recv_from` of `0`
//! bytes is a valid empty datagram, so this module drives its own receive
//! loop and funnels results through [`Session::deliver_bytes`] /
//! [`Session::fail`] directly rather than `on_readable`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};
use tracing::warn;

use crate::config::UdpConfig;
use crate::error::UnilinkError;
use crate::pool::BufferPool;
use crate::runtime::{SharedExecutor, Strand};
use crate::session::{
    BackpressureThresholds, Callbacks as SessionCallbacks, IoHandle, LinkState, Session,
};
use crate::sync::RwState;
use crate::transport::{Channel, ChannelCallbacks, ConnectionContext};

const SOCKET_TOKEN: Token = Token(0);
const MAX_DATAGRAM: usize = 65_527;

struct UdpHandle {
    socket: Arc<mio::net::UdpSocket>,
    remote: Arc<RwState<Option<SocketAddr>>>,
}

impl IoHandle for UdpHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.remote.get() {
            Some(addr) => self.socket.send_to(buf, addr),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "udp: no known remote")),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.socket.recv_from(buf).map(|(n, _addr)| n)
    }

    fn shutdown(&mut self) {}
}

struct Shared {
    config: UdpConfig,
    callbacks: ChannelCallbacks,
    executor: SharedExecutor,
    connected: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    remote: Arc<RwState<Option<SocketAddr>>>,
    pool: Arc<BufferPool>,
    session: Mutex<Option<Session<UdpHandle>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A UDP channel. Enters `Connected` immediately if a remote is configured,
/// otherwise `Listening` until the first inbound datagram pins one.
pub struct UdpChannel {
    inner: Arc<Shared>,
}

impl UdpChannel {
    pub fn new(config: UdpConfig, callbacks: ChannelCallbacks, auto_manage: bool) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::global(), auto_manage)
    }

    /// Opts this channel out of the process-wide shared executor into its
    /// own dedicated worker pool, for isolation from other channels.
    pub fn with_dedicated_executor(
        config: UdpConfig,
        callbacks: ChannelCallbacks,
        workers: usize,
        auto_manage: bool,
    ) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::new(workers), auto_manage)
    }

    fn with_executor(config: UdpConfig, callbacks: ChannelCallbacks, executor: SharedExecutor, auto_manage: bool) -> Self {
        let configured_remote = config
            .remote_address
            .as_ref()
            .zip(config.remote_port)
            .and_then(|(host, port)| format!("{host}:{port}").parse::<SocketAddr>().ok());

        let channel = Self {
            inner: Arc::new(Shared {
                config,
                callbacks,
                executor,
                connected: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                remote: Arc::new(RwState::new(configured_remote)),
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

impl Channel for UdpChannel {
    fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_requested.store(false, Ordering::Release);
        let shared = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || run_udp(shared));
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
        if self.inner.remote.get().is_none() {
            warn!("udp: send attempted with no known remote, dropping");
            return;
        }
        if let Some(session) = self.inner.session.lock().unwrap().as_ref() {
            let pool = self.inner.config.enable_memory_pool.then_some(&self.inner.pool);
            let _ = session.write_copy(data.as_bytes(), pool);
        }
    }
}

fn run_udp(shared: Arc<Shared>) {
    if let Err(e) = shared.config.validate() {
        notify_error(&shared, e);
        return;
    }

    let local_addr = match format!("{}:{}", shared.config.local_address, shared.config.local_port).parse() {
        Ok(addr) => addr,
        Err(_) => {
            notify_error(&shared, UnilinkError::configuration("udp", "local_address", "invalid address"));
            return;
        }
    };

    let mut socket = match mio::net::UdpSocket::bind(local_addr) {
        Ok(s) => s,
        Err(e) => {
            notify_error(&shared, UnilinkError::io("udp", "bind", &e));
            return;
        }
    };

    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(_) => return,
    };
    if poll.registry().register(&mut socket, SOCKET_TOKEN, Interest::READABLE | Interest::WRITABLE).is_err() {
        return;
    }
    let socket = Arc::new(socket);

    let thresholds = BackpressureThresholds::from_threshold(shared.config.clamped_backpressure_threshold());
    let strand = Strand::new(shared.executor.clone());
    let handle = UdpHandle { socket: Arc::clone(&socket), remote: Arc::clone(&shared.remote) };
    let session_callbacks = build_session_callbacks(Arc::clone(&shared));
    let session =
        Session::new(strand.clone(), handle, thresholds, shared.config.stop_on_callback_exception, session_callbacks);

    let initial_state = if shared.remote.get().is_some() { LinkState::Connected } else { LinkState::Listening };
    session.transition_to(initial_state);
    if initial_state == LinkState::Connected {
        shared.connected.store(true, Ordering::Release);
        if let Some(cb) = &shared.callbacks.on_connect {
            cb(ConnectionContext { peer: shared.remote.get().map(|a| a.to_string()), client_id: None });
        }
    }
    *shared.session.lock().unwrap() = Some(session.clone());

    let mut scratch = vec![0u8; MAX_DATAGRAM];
    let mut events = Events::with_capacity(32);

    while !shared.stop_requested.load(Ordering::Acquire) && session.is_alive() {
        let _ = poll.poll(&mut events, Some(Duration::from_millis(200)));
        for event in events.iter() {
            if event.is_readable() {
                drain_datagrams(&shared, &socket, &session, &mut scratch);
            }
            if event.is_writable() {
                session.resume_write();
            }
        }
    }

    *shared.session.lock().unwrap() = None;
}

fn drain_datagrams(shared: &Arc<Shared>, socket: &mio::net::UdpSocket, session: &Session<UdpHandle>, scratch: &mut [u8]) {
    loop {
        match socket.recv_from(scratch) {
            Ok((n, peer)) => {
                if n == scratch.len() {
                    session.fail(UnilinkError::io(
                        "udp",
                        "recv",
                        &std::io::Error::new(std::io::ErrorKind::InvalidData, "datagram truncated"),
                    ));
                    return;
                }
                pin_remote_if_needed(shared, session, peer);
                session.deliver_bytes(&scratch[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                session.fail(UnilinkError::io("udp", "recv", &e));
                return;
            }
        }
    }
}

fn pin_remote_if_needed(shared: &Arc<Shared>, session: &Session<UdpHandle>, peer: SocketAddr) {
    if shared.remote.get().is_some() {
        return;
    }
    shared.remote.set(Some(peer));
    shared.connected.store(true, Ordering::Release);
    session.transition_to(LinkState::Connected);
    if let Some(cb) = &shared.callbacks.on_connect {
        cb(ConnectionContext { peer: Some(peer.to_string()), client_id: None });
    }
}

fn build_session_callbacks(shared: Arc<Shared>) -> SessionCallbacks {
    let bytes_shared = Arc::clone(&shared);
    let error_shared = Arc::clone(&shared);
    let disconnect_shared = Arc::clone(&shared);

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
                disconnect_shared.connected.store(false, Ordering::Release);
                if let Some(cb) = &disconnect_shared.callbacks.on_disconnect {
                    cb(ConnectionContext { peer: disconnect_shared.remote.get().map(|a| a.to_string()), client_id: None });
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

fn notify_error(shared: &Arc<Shared>, err: UnilinkError) {
    if let Some(cb) = &shared.callbacks.on_error {
        cb(err.to_context());
    }
}
