//! Scenario C (multi-threaded backpressure relief) and Scenario D
//! (cancellation on close), exercised directly against `Session` since these
//! are session-level guarantees independent of which transport drives them.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use unilink::runtime::{SharedExecutor, Strand};
use unilink::session::{BackpressureThresholds, Callbacks, IoHandle, Session};

/// Accepts writes in bounded slices, simulating a peer that drains slowly.
struct SlowDrainHandle {
    chunk_size: usize,
}

impl IoHandle for SlowDrainHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len().min(self.chunk_size))
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn shutdown(&mut self) {}
}

#[test]
fn backpressure_relief_reports_high_then_low_watermark() {
    let exec = SharedExecutor::new(2);
    exec.start();
    let strand = Strand::new(exec.clone());

    let (tx, rx) = mpsc::channel::<(usize, bool)>();
    let callbacks = Callbacks {
        on_backpressure: Some(Box::new(move |depth, active| {
            let _ = tx.send((depth, active));
        })),
        ..Default::default()
    };

    let thresholds = BackpressureThresholds::from_threshold(256 * 1024);
    let session = Session::new(
        strand,
        SlowDrainHandle { chunk_size: 16 * 1024 },
        thresholds,
        false,
        callbacks,
    );

    session.write_copy(&vec![0u8; 512 * 1024], None).unwrap();

    let mut events = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while events.len() < 2 && std::time::Instant::now() < deadline {
        session.resume_write();
        if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
            events.push(event);
        }
    }

    assert!(events.len() >= 2, "expected at least two backpressure events, got {events:?}");
    let (first_depth, first_active) = events[0];
    assert!(first_active);
    assert!(first_depth >= 256 * 1024);

    let (last_depth, last_active) = *events.last().unwrap();
    assert!(!last_active);
    assert!(last_depth <= 128 * 1024);

    exec.stop();
}

struct BlockingHandle;

impl IoHandle for BlockingHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn shutdown(&mut self) {}
}

#[test]
fn cancel_while_reads_outstanding_closes_within_two_seconds() {
    let exec = SharedExecutor::new(2);
    exec.start();
    let strand = Strand::new(exec.clone());

    let (tx, rx) = mpsc::channel::<()>();
    let callbacks = Callbacks { on_close: Some(Box::new(move || tx.send(()).unwrap())), ..Default::default() };

    let session = Session::new(
        strand.clone(),
        BlockingHandle,
        BackpressureThresholds::from_threshold(1024),
        false,
        callbacks,
    );

    let outstanding_reads = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let s = session.clone();
        let counter = Arc::clone(&outstanding_reads);
        strand.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut scratch = [0u8; 64];
            s.on_readable(&mut scratch);
        });
    }

    session.stop();

    rx.recv_timeout(Duration::from_secs(2)).expect("close callback did not fire within 2s");
    assert!(!session.is_alive());

    exec.stop();
}
