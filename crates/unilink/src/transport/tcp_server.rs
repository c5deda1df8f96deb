//! Multi-client TCP server channel.
//!
//! Grounded on `flux_network::tcp::connector::ConnectionManager` for the
//! single-`Poll`, token-indexed accept/broadcast loop shape (`conns`,
//! `disconnect_at_index`, `broadcast`). The accept-pause DoS protection
//! (deregistering the listener while at capacity, re-arming on the next
//! disconnect) has no direct counterpart upstream; it follows the same
//! "never busy-loop on a saturated resource" instinct as `ConnectionManager`'s
//! `Repeater`-gated reconnect loop.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};
use tracing::warn;

use crate::config::TcpServerConfig;
use crate::error::{ErrorContext, UnilinkError};
use crate::pool::BufferPool;
use crate::runtime::{SharedExecutor, Strand};
use crate::session::{
    BackpressureThresholds, Callbacks as SessionCallbacks, IoHandle, LinkState, Session,
};
use crate::transport::Channel;

const LISTENER_TOKEN: Token = Token(0);
const READ_SCRATCH_SIZE: usize = 8192;
const REJECTION_LOG_BUDGET: u32 = 5;
const REJECTION_LOG_WINDOW: Duration = Duration::from_secs(2);

struct TcpHandle(TcpStream);

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

/// Multi-client callbacks, keyed by the server-assigned client id.
#[derive(Default)]
pub struct TcpServerCallbacks {
    pub on_multi_connect: Option<Box<dyn Fn(u64, String) + Send + Sync>>,
    pub on_multi_data: Option<Box<dyn Fn(u64, &[u8]) + Send + Sync>>,
    pub on_multi_disconnect: Option<Box<dyn Fn(u64) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(ErrorContext) + Send + Sync>>,
}

struct ClientEntry {
    session: Session<TcpHandle>,
    strand: Strand,
    token: Token,
}

struct Shared {
    config: TcpServerConfig,
    callbacks: TcpServerCallbacks,
    executor: SharedExecutor,
    running: AtomicBool,
    stop_requested: AtomicBool,
    next_id: AtomicU64,
    pool: Arc<BufferPool>,
    client_limit: Mutex<Option<usize>>,
    sessions: Mutex<HashMap<u64, ClientEntry>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A TCP acceptor managing an arbitrary number of concurrently connected
/// clients, each addressable by a monotonically increasing integer id.
pub struct TcpServer {
    inner: Arc<Shared>,
}

impl TcpServer {
    pub fn new(config: TcpServerConfig, callbacks: TcpServerCallbacks, auto_manage: bool) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::global(), auto_manage)
    }

    /// Opts this server out of the process-wide shared executor into its
    /// own dedicated worker pool, for isolation from other channels.
    pub fn with_dedicated_executor(
        config: TcpServerConfig,
        callbacks: TcpServerCallbacks,
        workers: usize,
        auto_manage: bool,
    ) -> Self {
        Self::with_executor(config, callbacks, SharedExecutor::new(workers), auto_manage)
    }

    fn with_executor(
        config: TcpServerConfig,
        callbacks: TcpServerCallbacks,
        executor: SharedExecutor,
        auto_manage: bool,
    ) -> Self {
        let limit = config.client_limit;
        let server = Self {
            inner: Arc::new(Shared {
                config,
                callbacks,
                executor,
                running: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                pool: Arc::new(BufferPool::new()),
                client_limit: Mutex::new(limit),
                sessions: Mutex::new(HashMap::new()),
                worker: Mutex::new(None),
            }),
        };
        if auto_manage {
            server.start();
        }
        server
    }

    pub fn get_client_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    pub fn get_connected_clients(&self) -> Vec<u64> {
        self.inner.sessions.lock().unwrap().keys().copied().collect()
    }

    pub fn set_client_limit(&self, n: usize) {
        *self.inner.client_limit.lock().unwrap() = Some(n);
    }

    pub fn set_unlimited_clients(&self) {
        *self.inner.client_limit.lock().unwrap() = None;
    }

    /// No-op if `id` does not resolve to a live session.
    pub fn send_to_client(&self, id: u64, data: &str) {
        let sessions = self.inner.sessions.lock().unwrap();
        if let Some(entry) = sessions.get(&id) {
            let _ = entry.session.write_copy(data.as_bytes(), Some(&self.inner.pool));
        }
    }

    /// Enqueues `data` to every live session. A per-session write failure
    /// does not abort the iteration.
    pub fn broadcast(&self, data: &str) {
        let live: Vec<Session<TcpHandle>> =
            self.inner.sessions.lock().unwrap().values().map(|e| e.session.clone()).collect();
        for session in live {
            let _ = session.write_copy(data.as_bytes(), Some(&self.inner.pool));
        }
    }
}

impl Channel for TcpServer {
    fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_requested.store(false, Ordering::Release);
        let shared = Arc::clone(&self.inner);
        let handle = std::thread::spawn(move || run_server(shared));
        *self.inner.worker.lock().unwrap() = Some(handle);
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.inner.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn is_connected(&self) -> bool {
        !self.inner.sessions.lock().unwrap().is_empty()
    }

    fn send(&self, data: &str) {
        self.broadcast(data);
    }
}

fn bind_with_retry(shared: &Shared) -> Option<TcpListener> {
    let max_attempts = if shared.config.enable_port_retry { shared.config.max_port_retries + 1 } else { 1 };
    for attempt in 0..max_attempts {
        match bind_once(shared.config.port) {
            Ok(listener) => return Some(listener),
            Err(e) => {
                warn!(port = shared.config.port, attempt, error = %e, "tcp_server bind failed");
                if attempt + 1 >= max_attempts {
                    let err = UnilinkError::io("tcp_server", "bind", &e);
                    if let Some(cb) = &shared.callbacks.on_error {
                        cb(err.to_context());
                    }
                    return None;
                }
                std::thread::sleep(Duration::from_millis(shared.config.port_retry_interval_ms));
            }
        }
    }
    None
}

fn bind_once(port: u16) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port);
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}

fn run_server(shared: Arc<Shared>) {
    let Some(mut listener) = bind_with_retry(&shared) else {
        return;
    };
    let Ok(mut poll) = Poll::new() else {
        return;
    };
    if poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE).is_err() {
        return;
    }
    let mut listener_registered = true;
    let mut next_client_token = 1usize;
    let mut client_tokens: HashMap<Token, u64> = HashMap::new();
    let mut events = Events::with_capacity(256);
    let mut rejection_window_start = Instant::now();
    let mut rejection_count = 0u32;

    loop {
        if shared.stop_requested.load(Ordering::Acquire) {
            break;
        }
        let _ = poll.poll(&mut events, Some(Duration::from_millis(200)));

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_pending(
                    &shared,
                    &mut listener,
                    &mut poll,
                    &mut listener_registered,
                    &mut next_client_token,
                    &mut client_tokens,
                    &mut rejection_window_start,
                    &mut rejection_count,
                );
                continue;
            }
            let Some(&id) = client_tokens.get(&event.token()) else { continue };
            let routed = shared.sessions.lock().unwrap().get(&id).map(|e| (e.session.clone(), e.strand.clone()));
            if let Some((session, strand)) = routed {
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

        reap_dead_sessions(&shared, &mut client_tokens);

        if !listener_registered {
            let limit = *shared.client_limit.lock().unwrap();
            let count = shared.sessions.lock().unwrap().len();
            let has_room = limit.is_none_or(|l| count < l);
            if has_room && poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE).is_ok() {
                listener_registered = true;
            }
        }
    }

    let ids: Vec<u64> = shared.sessions.lock().unwrap().keys().copied().collect();
    for id in ids {
        let session = shared.sessions.lock().unwrap().get(&id).map(|e| e.session.clone());
        if let Some(session) = session {
            session.stop();
        }
    }
    shared.sessions.lock().unwrap().clear();
}

#[allow(clippy::too_many_arguments)]
fn accept_pending(
    shared: &Arc<Shared>,
    listener: &mut TcpListener,
    poll: &mut Poll,
    listener_registered: &mut bool,
    next_client_token: &mut usize,
    client_tokens: &mut HashMap<Token, u64>,
    rejection_window_start: &mut Instant,
    rejection_count: &mut u32,
) {
    loop {
        let (mut stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(_) => return,
        };

        let at_capacity = {
            let limit = *shared.client_limit.lock().unwrap();
            let count = shared.sessions.lock().unwrap().len();
            limit.is_some_and(|l| count >= l)
        };
        if at_capacity {
            drop(stream);
            if rejection_window_start.elapsed() > REJECTION_LOG_WINDOW {
                *rejection_window_start = Instant::now();
                *rejection_count = 0;
            }
            if *rejection_count < REJECTION_LOG_BUDGET {
                warn!(%addr, "tcp_server rejecting connection: at client capacity");
                *rejection_count += 1;
            }
            if *listener_registered {
                let _ = poll.registry().deregister(listener);
                *listener_registered = false;
            }
            continue;
        }

        let token = Token(*next_client_token);
        *next_client_token += 1;
        if poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE).is_err() {
            continue;
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        client_tokens.insert(token, id);
        let strand = Strand::new(shared.executor.clone());
        let thresholds = BackpressureThresholds::from_threshold(shared.config.backpressure_threshold);
        let peer = addr.to_string();
        let session_callbacks = build_session_callbacks(Arc::clone(shared), id);
        let session = Session::new(strand.clone(), TcpHandle(stream), thresholds, false, session_callbacks);
        session.transition_to(LinkState::Connected);
        shared.sessions.lock().unwrap().insert(id, ClientEntry { session, strand, token });

        if let Some(cb) = &shared.callbacks.on_multi_connect {
            cb(id, peer);
        }
    }
}

fn reap_dead_sessions(shared: &Arc<Shared>, client_tokens: &mut HashMap<Token, u64>) {
    let dead: Vec<(u64, Token)> = {
        let sessions = shared.sessions.lock().unwrap();
        sessions.iter().filter(|(_, e)| !e.session.is_alive()).map(|(&id, e)| (id, e.token)).collect()
    };
    for (id, token) in dead {
        shared.sessions.lock().unwrap().remove(&id);
        client_tokens.remove(&token);
        if let Some(cb) = &shared.callbacks.on_multi_disconnect {
            cb(id);
        }
    }
}

fn build_session_callbacks(shared: Arc<Shared>, id: u64) -> SessionCallbacks {
    let bytes_shared = Arc::clone(&shared);
    let error_shared = Arc::clone(&shared);

    SessionCallbacks {
        on_bytes: Some(Box::new(move |data: &[u8]| {
            if let Some(cb) = &bytes_shared.callbacks.on_multi_data {
                cb(id, data);
            }
        })),
        on_state: None,
        on_backpressure: None,
        on_error: Some(Box::new(move |ctx| {
            if let Some(cb) = &error_shared.callbacks.on_error {
                cb(ctx.with_client(id));
            }
        })),
        on_close: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_callbacks_are_all_none() {
        let callbacks = TcpServerCallbacks::default();
        assert!(callbacks.on_multi_connect.is_none());
        assert!(callbacks.on_multi_data.is_none());
        assert!(callbacks.on_multi_disconnect.is_none());
        assert!(callbacks.on_error.is_none());
    }
}
