//! Per-connection I/O state machine shared by every transport.
//!
//! Grounded on `flux_network::tcp::stream::TcpStream`'s `RxState`/
//! `send_backlog`/`writable_armed` model, generalized from a TCP-specific
//! struct to a transport-agnostic [`Session<H>`] parameterized over an
//! [`IoHandle`]. No length-prefix wire format is imposed here — `TcpStream`'s
//! own framing is not carried over; framing is opt-in above the byte stream
//! via [`crate::framer`].

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::UnilinkError;
use crate::pool::{BufferPool, PooledBuffer};
use crate::runtime::Strand;
use crate::sync::{AtomicState, Counter, StateCode};

/// Single-write payloads above this size are rejected outright.
const MAX_SINGLE_WRITE: usize = 64 * 1024 * 1024;
const DEFAULT_HARD_LIMIT_FLOOR: usize = 1024 * 1024;
const HARD_LIMIT_CEILING: usize = 64 * 1024 * 1024;

/// Session-scoped lifecycle tag. Closed and Error are terminal: once
/// reached, no further transition is observed for this session instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Listening,
    Connected,
    Closed,
    Error,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Error)
    }
}

impl StateCode for LinkState {
    fn to_code(self) -> u8 {
        match self {
            LinkState::Idle => 0,
            LinkState::Connecting => 1,
            LinkState::Listening => 2,
            LinkState::Connected => 3,
            LinkState::Closed => 4,
            LinkState::Error => 5,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => LinkState::Idle,
            1 => LinkState::Connecting,
            2 => LinkState::Listening,
            3 => LinkState::Connected,
            4 => LinkState::Closed,
            _ => LinkState::Error,
        }
    }
}

/// The underlying byte-stream resource a [`Session`] drives.
///
/// Non-blocking semantics are assumed: `write`/`read` returning
/// `io::ErrorKind::WouldBlock` means "try again once the reactor reports
/// readiness", not an error.
pub trait IoHandle: Send + 'static {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn shutdown(&mut self);
}

/// A tagged union over the three ways a write's backing storage can be
/// owned, preserving zero-copy paths for move- and shared-writes.
pub enum WriteEntry {
    Pooled(PooledBuffer),
    Owned(Vec<u8>),
    Shared(bytes::Bytes),
}

impl WriteEntry {
    pub fn len(&self) -> usize {
        match self {
            WriteEntry::Pooled(buf) => buf.size(),
            WriteEntry::Owned(v) => v.len(),
            WriteEntry::Shared(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            WriteEntry::Pooled(buf) => buf.as_slice(),
            WriteEntry::Owned(v) => v,
            WriteEntry::Shared(s) => s,
        }
    }

    /// Rebuilds an entry for the unsent tail after a partial write of `n`
    /// bytes. The zero-copy tag is not preserved across a partial write —
    /// the remainder is always re-owned, which is adequate since partial
    /// writes are the uncommon path on a non-blocking socket.
    fn remainder(self, n: usize) -> WriteEntry {
        WriteEntry::Owned(self.as_slice()[n..].to_vec())
    }
}

/// The high/low hysteresis watermarks and hard cap derived from one
/// configured `backpressure_threshold`.
#[derive(Clone, Copy, Debug)]
pub struct BackpressureThresholds {
    pub high: usize,
    pub low: usize,
    pub hard_limit: usize,
}

impl BackpressureThresholds {
    pub fn from_threshold(b: usize) -> Self {
        let high = b;
        let low = (b / 2).max(1);
        let hard_limit = (4 * b).max(DEFAULT_HARD_LIMIT_FLOOR).min(HARD_LIMIT_CEILING);
        Self { high, low, hard_limit }
    }
}

/// User-facing callbacks. `on_close` is `FnOnce` since it fires exactly once
/// and then the whole set is discarded; the rest are `Fn` since they may
/// fire repeatedly before that point.
#[derive(Default)]
pub struct Callbacks {
    pub on_bytes: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
    pub on_state: Option<Box<dyn Fn(LinkState) + Send + Sync>>,
    pub on_backpressure: Option<Box<dyn Fn(usize, bool) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(crate::error::ErrorContext) + Send + Sync>>,
    pub on_close: Option<Box<dyn FnOnce() + Send>>,
}

struct State<H: IoHandle> {
    strand: Strand,
    state: AtomicState<LinkState>,
    alive: AtomicBool,
    closing: AtomicBool,
    cleanup_done: AtomicBool,
    writing: AtomicBool,
    backpressure_active: AtomicBool,
    queue: Mutex<VecDeque<WriteEntry>>,
    queued_bytes: Counter,
    thresholds: BackpressureThresholds,
    stop_on_callback_exception: bool,
    handle: Mutex<Option<H>>,
    callbacks: Mutex<Callbacks>,
}

/// One live byte-stream endpoint: TCP client connection, TCP server-accepted
/// connection, UDP channel, or serial port. Generic over the underlying
/// handle so all four share one state machine.
pub struct Session<H: IoHandle> {
    inner: Arc<State<H>>,
}

impl<H: IoHandle> Clone for Session<H> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<H: IoHandle> Session<H> {
    pub fn new(
        strand: Strand,
        handle: H,
        thresholds: BackpressureThresholds,
        stop_on_callback_exception: bool,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            inner: Arc::new(State {
                strand,
                state: AtomicState::new(LinkState::Idle),
                alive: AtomicBool::new(true),
                closing: AtomicBool::new(false),
                cleanup_done: AtomicBool::new(false),
                writing: AtomicBool::new(false),
                backpressure_active: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                queued_bytes: Counter::new(0),
                thresholds,
                stop_on_callback_exception,
                handle: Mutex::new(Some(handle)),
                callbacks: Mutex::new(callbacks),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        self.inner.state.load()
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn queued_bytes(&self) -> u64 {
        self.inner.queued_bytes.get()
    }

    /// Transitions to `new` unless the session is already in a terminal
    /// state, notifying the state callback on the owning strand exactly
    /// once for the change.
    pub fn transition_to(&self, new: LinkState) {
        let old = self.inner.state.load();
        if old.is_terminal() {
            return;
        }
        if !self.inner.state.compare_and_set(old, new) {
            return;
        }
        let this = self.clone();
        self.inner.strand.dispatch(move || {
            if let Some(cb) = &this.inner.callbacks.lock().on_state {
                cb(new);
            }
        });
    }

    pub fn write_copy(&self, data: &[u8], pool: Option<&Arc<BufferPool>>) -> Result<(), UnilinkError> {
        let entry = match pool {
            Some(pool) if !data.is_empty() && data.len() <= 64 * 1024 => match pool.acquire(data.len()) {
                Ok(mut buf) => {
                    buf.as_mut_slice().copy_from_slice(data);
                    WriteEntry::Pooled(buf)
                }
                Err(_) => WriteEntry::Owned(data.to_vec()),
            },
            _ => WriteEntry::Owned(data.to_vec()),
        };
        self.enqueue_write(entry)
    }

    pub fn write_move(&self, data: Vec<u8>) -> Result<(), UnilinkError> {
        self.enqueue_write(WriteEntry::Owned(data))
    }

    pub fn write_shared(&self, data: bytes::Bytes) -> Result<(), UnilinkError> {
        self.enqueue_write(WriteEntry::Shared(data))
    }

    fn enqueue_write(&self, entry: WriteEntry) -> Result<(), UnilinkError> {
        if !self.is_alive() || self.inner.closing.load(Ordering::Acquire) || self.state().is_terminal() {
            return Err(UnilinkError::configuration("session", "write", "session is not alive"));
        }
        if entry.len() > MAX_SINGLE_WRITE {
            return Err(UnilinkError::configuration(
                "session",
                "write",
                format!("write of {} bytes exceeds the {MAX_SINGLE_WRITE} byte limit", entry.len()),
            ));
        }
        let this = self.clone();
        self.inner.strand.post(move || this.handle_enqueued(entry));
        Ok(())
    }

    fn handle_enqueued(&self, entry: WriteEntry) {
        let size = entry.len() as u64;
        let would_be = self.inner.queued_bytes.get() + size;
        if would_be > self.inner.thresholds.hard_limit as u64 {
            self.inner.queue.lock().clear();
            self.inner.queued_bytes.set(0);
            self.transition_to(LinkState::Error);
            self.report_backpressure();
            self.do_close();
            return;
        }
        self.inner.queue.lock().push_back(entry);
        self.inner.queued_bytes.add(size);
        self.report_backpressure();
        if !self.inner.writing.load(Ordering::Acquire) {
            self.inner.writing.store(true, Ordering::Release);
            self.do_write();
        }
    }

    /// Drains the queue, issuing non-blocking writes until one would block,
    /// the queue empties, or an unrecoverable error occurs. Must only be
    /// called from the owning strand.
    fn do_write(&self) {
        loop {
            let entry = match self.inner.queue.lock().pop_front() {
                Some(e) => e,
                None => {
                    self.inner.writing.store(false, Ordering::Release);
                    return;
                }
            };
            let total_len = entry.len();

            let write_result = {
                let mut guard = self.inner.handle.lock();
                match guard.as_mut() {
                    Some(h) => h.write(entry.as_slice()),
                    None => {
                        self.inner.writing.store(false, Ordering::Release);
                        return;
                    }
                }
            };

            match write_result {
                Ok(n) if n >= total_len => {
                    self.finish_write_chunk(total_len as u64);
                }
                Ok(0) => {
                    self.inner.queue.lock().push_front(entry);
                    return;
                }
                Ok(n) => {
                    self.finish_write_chunk(n as u64);
                    self.inner.queue.lock().push_front(entry.remainder(n));
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.inner.queue.lock().push_front(entry);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.inner.queue.lock().push_front(entry);
                }
                Err(e) => {
                    self.fail(UnilinkError::io("session", "write", &e));
                    return;
                }
            }
        }
    }

    fn finish_write_chunk(&self, n: u64) {
        let before = self.inner.queued_bytes.get();
        self.inner.queued_bytes.set(before.saturating_sub(n));
        self.report_backpressure();
    }

    /// Resumes a stalled write once the reactor reports the handle is
    /// writable again. A no-op if no write is currently pending.
    pub fn resume_write(&self) {
        let this = self.clone();
        self.inner.strand.dispatch(move || {
            if this.inner.writing.load(Ordering::Acquire) {
                this.do_write();
            }
        });
    }

    fn report_backpressure(&self) {
        let queued = self.inner.queued_bytes.get() as usize;
        let active = self.inner.backpressure_active.load(Ordering::Acquire);
        if !active && queued >= self.inner.thresholds.high {
            self.inner.backpressure_active.store(true, Ordering::Release);
            self.notify_backpressure(queued, true);
        } else if active && queued <= self.inner.thresholds.low {
            self.inner.backpressure_active.store(false, Ordering::Release);
            self.notify_backpressure(queued, false);
        }
    }

    fn notify_backpressure(&self, depth: usize, active: bool) {
        let this = self.clone();
        self.inner.strand.dispatch(move || {
            if let Some(cb) = &this.inner.callbacks.lock().on_backpressure {
                cb(depth, active);
            }
        });
    }

    /// Drains available data from the handle, delivering each read via the
    /// bytes callback, until the handle would block, hits EOF, or errors.
    /// Must only be called from the owning strand.
    pub fn on_readable(&self, scratch: &mut [u8]) {
        loop {
            let read_result = {
                let mut guard = self.inner.handle.lock();
                match guard.as_mut() {
                    Some(h) => h.read(scratch),
                    None => return,
                }
            };
            match read_result {
                Ok(0) => {
                    self.transition_to(LinkState::Closed);
                    self.do_close();
                    return;
                }
                Ok(n) => self.deliver_bytes(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(UnilinkError::io("session", "read", &e));
                    return;
                }
            }
        }
    }

    /// Delivers `data` to the bytes callback with the same panic-catching
    /// and `stop_on_callback_exception` policy as [`Self::on_readable`].
    /// Exposed so transports whose read semantics don't fit the generic
    /// "0 bytes means EOF" stream loop (UDP's zero-length datagrams,
    /// truncation-is-fatal) can still funnel through the session's
    /// callback-dispatch path.
    pub(crate) fn deliver_bytes(&self, data: &[u8]) {
        let cb = self.inner.callbacks.lock();
        let Some(on_bytes) = cb.on_bytes.as_ref() else {
            return;
        };
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| on_bytes(data)));
        drop(cb);
        if outcome.is_err() {
            if self.inner.stop_on_callback_exception {
                self.fail(UnilinkError::configuration("session", "on_bytes", "callback panicked"));
            } else {
                crate::safe_panic!("session bytes callback panicked; continuing per policy");
            }
        }
    }

    /// Transitions to `Error`, notifies `on_error`, and closes. `pub(crate)`
    /// so transports can report fatal conditions detected outside the
    /// generic read loop (UDP truncation, serial configure failure).
    pub(crate) fn fail(&self, err: UnilinkError) {
        self.transition_to(LinkState::Error);
        let ctx = err.to_context();
        let this = self.clone();
        self.inner.strand.dispatch(move || {
            if let Some(cb) = &this.inner.callbacks.lock().on_error {
                cb(ctx.clone());
            }
        });
        self.do_close();
    }

    /// User-initiated stop: posts cleanup onto the strand, idempotent.
    pub fn stop(&self) {
        let this = self.clone();
        self.inner.strand.dispatch(move || {
            this.transition_to(LinkState::Closed);
            this.do_close();
        });
    }

    /// Idempotent close protocol: nulls callbacks (after taking the close
    /// callback), shuts down and drops the handle, clears the queue, then
    /// invokes the close callback exactly once.
    fn do_close(&self) {
        if self.inner.cleanup_done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.alive.store(false, Ordering::Release);
        self.inner.closing.store(true, Ordering::Release);

        let on_close = std::mem::take(&mut *self.inner.callbacks.lock()).on_close;

        if let Some(mut handle) = self.inner.handle.lock().take() {
            handle.shutdown();
        }

        self.inner.queue.lock().clear();
        self.inner.queued_bytes.set(0);

        if let Some(on_close) = on_close {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(on_close)).is_err() {
                crate::safe_panic!("session close callback panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SharedExecutor;
    use std::sync::mpsc;

    struct LoopbackHandle {
        inbox: VecDeque<u8>,
        written: Vec<u8>,
        fail_write_with: Option<io::ErrorKind>,
    }

    impl IoHandle for LoopbackHandle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.fail_write_with {
                return Err(io::Error::from(kind));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbox.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.inbox.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbox.pop_front().unwrap();
            }
            Ok(n)
        }

        fn shutdown(&mut self) {}
    }

    fn test_session(
        handle: LoopbackHandle,
        thresholds: BackpressureThresholds,
    ) -> (Session<LoopbackHandle>, SharedExecutor) {
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let session = Session::new(strand, handle, thresholds, false, Callbacks::default());
        (session, exec)
    }

    #[test]
    fn backpressure_thresholds_derive_from_one_value() {
        let t = BackpressureThresholds::from_threshold(256 * 1024);
        assert_eq!(t.high, 256 * 1024);
        assert_eq!(t.low, 128 * 1024);
        assert_eq!(t.hard_limit, 1024 * 1024);
    }

    #[test]
    fn hard_limit_clamps_between_one_and_sixty_four_mib() {
        let tiny = BackpressureThresholds::from_threshold(1);
        assert_eq!(tiny.hard_limit, DEFAULT_HARD_LIMIT_FLOOR);

        let huge = BackpressureThresholds::from_threshold(100 * 1024 * 1024);
        assert_eq!(huge.hard_limit, HARD_LIMIT_CEILING);
    }

    #[test]
    fn write_exceeding_hard_limit_forces_error_and_closes() {
        let (tx, rx) = mpsc::channel();
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let thresholds = BackpressureThresholds { high: 10, low: 5, hard_limit: 100 };
        let callbacks = Callbacks {
            on_close: Some(Box::new(move || tx.send(()).unwrap())),
            ..Default::default()
        };
        let session = Session::new(
            strand,
            LoopbackHandle { inbox: VecDeque::new(), written: Vec::new(), fail_write_with: None },
            thresholds,
            false,
            callbacks,
        );
        session.write_move(vec![0u8; 200]).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(session.state(), LinkState::Error);
        assert!(!session.is_alive());
        exec.stop();
    }

    #[test]
    fn write_under_hard_limit_is_delivered_to_the_handle() {
        let (session, exec) = test_session(
            LoopbackHandle { inbox: VecDeque::new(), written: Vec::new(), fail_write_with: None },
            BackpressureThresholds::from_threshold(1024),
        );
        session.write_copy(b"hello", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(session.queued_bytes(), 0);
        exec.stop();
    }

    #[test]
    fn stop_is_idempotent_and_fires_close_once() {
        let (tx, rx) = mpsc::channel::<()>();
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let callbacks = Callbacks {
            on_close: Some(Box::new(move || tx.send(()).unwrap())),
            ..Default::default()
        };
        let session = Session::new(
            strand,
            LoopbackHandle { inbox: VecDeque::new(), written: Vec::new(), fail_write_with: None },
            BackpressureThresholds::from_threshold(1024),
            false,
            callbacks,
        );
        session.stop();
        session.stop();
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());
        assert!(!session.is_alive());
        exec.stop();
    }

    #[test]
    fn peer_eof_transitions_to_closed_not_error() {
        let (tx, rx) = mpsc::channel();
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let callbacks = Callbacks { on_close: Some(Box::new(move || tx.send(()).unwrap())), ..Default::default() };
        let session = Session::new(
            strand.clone(),
            LoopbackHandle { inbox: VecDeque::new(), written: Vec::new(), fail_write_with: None },
            BackpressureThresholds::from_threshold(1024),
            false,
            callbacks,
        );
        let mut scratch = [0u8; 64];
        let s = session.clone();
        strand.post(move || s.on_readable(&mut scratch));
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(session.state(), LinkState::Closed);
        exec.stop();
    }

    #[test]
    fn write_error_transitions_to_error_state() {
        let (tx, rx) = mpsc::channel();
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let callbacks = Callbacks { on_close: Some(Box::new(move || tx.send(()).unwrap())), ..Default::default() };
        let session = Session::new(
            strand,
            LoopbackHandle {
                inbox: VecDeque::new(),
                written: Vec::new(),
                fail_write_with: Some(io::ErrorKind::ConnectionReset),
            },
            BackpressureThresholds::from_threshold(1024),
            false,
            callbacks,
        );
        session.write_copy(b"x", None).unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(session.state(), LinkState::Error);
        exec.stop();
    }
}
