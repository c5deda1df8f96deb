use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::runtime::Strand;

type Completion = Box<dyn FnOnce(TimerResult) + Send + 'static>;

/// Outcome delivered to a timer's completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerResult {
    Expired,
    Aborted,
}

struct Entry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.id.cmp(&other.id))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    pending: Mutex<std::collections::HashMap<u64, (Strand, Completion)>>,
    cancelled: Mutex<HashSet<u64>>,
    cond: Condvar,
}

/// A steady-clock timer service driven by one dedicated background thread.
///
/// Completion callbacks are always delivered by posting onto the owning
/// strand — never invoked directly from the timer thread — so the "no user
/// callback may suspend, suspension only at completion points" rule holds.
pub struct TimerService {
    shared: Arc<Shared>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            pending: Mutex::new(std::collections::HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        std::thread::spawn(move || timer_loop(worker_shared));
        Self { shared }
    }

    /// Schedules `on_complete` to run on `strand` after `duration`.
    pub fn schedule(
        &self,
        duration: Duration,
        strand: Strand,
        on_complete: impl FnOnce(TimerResult) + Send + 'static,
    ) -> TimerHandle {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + duration;

        self.shared.pending.lock().unwrap().insert(id, (strand, Box::new(on_complete)));
        self.shared.heap.lock().unwrap().push(Reverse(Entry { deadline, id }));
        self.shared.cond.notify_all();

        TimerHandle { shared: Arc::clone(&self.shared), id }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellable handle to a scheduled timer.
pub struct TimerHandle {
    shared: Arc<Shared>,
    id: u64,
}

impl TimerHandle {
    /// Cancels the timer. If it has not yet fired, its completion callback
    /// runs with [`TimerResult::Aborted`]; an already-fired timer is a no-op.
    pub fn cancel(&self) {
        let Some((strand, completion)) = self.shared.pending.lock().unwrap().remove(&self.id) else {
            return;
        };
        self.shared.cancelled.lock().unwrap().insert(self.id);
        strand.post(move || completion(TimerResult::Aborted));
    }
}

fn timer_loop(shared: Arc<Shared>) {
    loop {
        let mut heap = shared.heap.lock().unwrap();
        let wait_for = match heap.peek() {
            None => None,
            Some(Reverse(entry)) => {
                let now = Instant::now();
                if entry.deadline <= now {
                    None
                } else {
                    Some(entry.deadline - now)
                }
            }
        };

        let Reverse(entry) = match wait_for {
            Some(dur) => {
                let (mut heap2, _timeout) = shared.cond.wait_timeout(heap, dur).unwrap();
                match heap2.peek() {
                    Some(Reverse(e)) if e.deadline <= Instant::now() => heap2.pop().unwrap(),
                    _ => continue,
                }
            }
            None => match heap.pop() {
                Some(entry) => entry,
                None => {
                    drop(heap);
                    // Park until something is scheduled.
                    let guard = shared.heap.lock().unwrap();
                    let _ = shared.cond.wait_timeout(guard, Duration::from_millis(200)).unwrap();
                    continue;
                }
            },
        };

        if shared.cancelled.lock().unwrap().remove(&entry.id) {
            continue;
        }
        if let Some((strand, completion)) = shared.pending.lock().unwrap().remove(&entry.id) {
            strand.post(move || completion(TimerResult::Expired));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SharedExecutor;
    use std::sync::mpsc;

    #[test]
    fn timer_fires_after_duration() {
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        timers.schedule(Duration::from_millis(50), strand, move |r| tx.send((r, start.elapsed())).unwrap());
        let (result, elapsed) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result, TimerResult::Expired);
        assert!(elapsed >= Duration::from_millis(40));
        exec.stop();
    }

    #[test]
    fn cancel_delivers_aborted() {
        let exec = SharedExecutor::new(2);
        exec.start();
        let strand = Strand::new(exec.clone());
        let timers = TimerService::new();
        let (tx, rx) = mpsc::channel();
        let handle = timers.schedule(Duration::from_secs(10), strand, move |r| tx.send(r).unwrap());
        handle.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), TimerResult::Aborted);
        exec.stop();
    }
}
