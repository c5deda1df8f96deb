use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// A boxed, one-shot unit of work posted to a [`Strand`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const JOIN_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_WORKERS: usize = 4;

thread_local! {
    static CURRENT_STRAND: Cell<u64> = const { Cell::new(0) };
}

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    running: AtomicBool,
    refcount: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

/// A process-wide (or per-channel-dedicated) pool of worker threads.
///
/// Draining is FIFO: the single global queue is shared by all workers, and
/// [`Strand`]s post their ready-to-run tasks onto it. The pool provides no
/// ordering guarantee across strands — ordering is only guaranteed *within*
/// one strand, which is what sessions rely on.
#[derive(Clone)]
pub struct SharedExecutor {
    inner: Arc<Inner>,
}

impl SharedExecutor {
    /// Builds a new, stopped executor with `num_workers` threads.
    pub fn new(num_workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                refcount: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                num_workers: num_workers.max(1),
            }),
        }
    }

    /// The lazily-started, refcounted, process-wide shared executor.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<SharedExecutor> = OnceLock::new();
        let exec = GLOBAL.get_or_init(|| SharedExecutor::new(DEFAULT_WORKERS)).clone();
        exec.acquire();
        exec
    }

    fn acquire(&self) {
        if self.inner.refcount.fetch_add(1, Ordering::AcqRel) == 0 {
            self.start();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Starts the worker threads. No-op if already running.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.inner.workers.lock().unwrap();
        workers.clear();
        for _ in 0..self.inner.num_workers {
            let inner = Arc::clone(&self.inner);
            workers.push(std::thread::spawn(move || worker_loop(inner)));
        }
    }

    /// Stops the worker threads.
    ///
    /// A bounded-timeout join is attempted for each worker; any that does
    /// not land within [`JOIN_TIMEOUT`] is detached rather than blocking
    /// shutdown indefinitely. A subsequent [`start`](Self::start) recreates
    /// the pool and queue from scratch, so no stale tasks survive the cycle.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.cond.notify_all();

        let workers = std::mem::take(&mut *self.inner.workers.lock().unwrap());
        for worker in workers {
            join_with_timeout(worker, JOIN_TIMEOUT);
        }
        self.inner.queue.lock().unwrap().clear();
    }

    /// Schedules `task` to run on some worker thread.
    ///
    /// Not part of the public strand contract — [`Strand::post`] is the
    /// entry point sessions use; this is the primitive it's built on.
    fn spawn(&self, task: Task) {
        self.inner.queue.lock().unwrap().push_back(task);
        self.inner.cond.notify_one();
    }
}

/// Joins `handle`, detaching it if it doesn't finish within `timeout`.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let done = Arc::new((Mutex::new(false), Condvar::new()));
    let done2 = Arc::clone(&done);
    let watcher = std::thread::spawn(move || {
        let _ = handle.join();
        let (lock, cond) = &*done2;
        *lock.lock().unwrap() = true;
        cond.notify_all();
    });

    let (lock, cond) = &*done;
    let guard = lock.lock().unwrap();
    let (_guard, result) = cond.wait_timeout_while(guard, timeout, |done| !*done).unwrap();
    if result.timed_out() {
        // The underlying worker thread is detached by simply not joining it;
        // `watcher` itself is left to finish (and join) on its own.
        drop(watcher);
    } else {
        let _ = watcher.join();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let task = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if !inner.running.load(Ordering::Acquire) {
                    break None;
                }
                queue = inner.cond.wait_timeout(queue, Duration::from_millis(50)).unwrap().0;
                if !inner.running.load(Ordering::Acquire) {
                    break None;
                }
            }
        };
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}

struct StrandInner {
    executor: SharedExecutor,
    queue: Mutex<VecDeque<Task>>,
    busy: AtomicBool,
    id: u64,
}

/// A logical single-thread lane: at most one posted task runs at any instant
/// for a given strand, no matter which physical worker thread picks it up.
///
/// This is the sole concurrency primitive the session state machine relies
/// on — all handle access for one session is funneled through its strand.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new(executor: SharedExecutor) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            inner: Arc::new(StrandInner {
                executor,
                queue: Mutex::new(VecDeque::new()),
                busy: AtomicBool::new(false),
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// Enqueues `task` onto this strand and returns immediately.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.queue.lock().unwrap().push_back(Box::new(task));
        self.try_schedule();
    }

    /// Runs `task` inline if the current thread is already draining this
    /// strand, otherwise posts it like [`post`](Self::post).
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let on_this_strand = CURRENT_STRAND.with(|c| c.get() == self.inner.id);
        if on_this_strand {
            task();
        } else {
            self.post(task);
        }
    }

    fn try_schedule(&self) {
        if self.inner.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let strand = self.clone();
            self.inner.executor.spawn(Box::new(move || strand.drain()));
        }
    }

    fn drain(&self) {
        CURRENT_STRAND.with(|c| c.set(self.inner.id));
        loop {
            let next = self.inner.queue.lock().unwrap().pop_front();
            match next {
                Some(task) => task(),
                None => {
                    self.inner.busy.store(false, Ordering::Release);
                    // Re-check for a race: a post() may have landed between
                    // the pop_front() miss and the busy flag clearing.
                    let more_work = !self.inner.queue.lock().unwrap().is_empty();
                    if !more_work {
                        break;
                    }
                    if self
                        .inner
                        .busy
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        // Another drain picked it up concurrently.
                        break;
                    }
                }
            }
        }
        CURRENT_STRAND.with(|c| c.set(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn strand_runs_tasks_in_post_order() {
        let exec = SharedExecutor::new(4);
        exec.start();
        let strand = Strand::new(exec.clone());
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            strand.post(move || tx.send(i).unwrap());
        }
        drop(tx);
        let got: Vec<i32> = rx.iter().collect();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        exec.stop();
    }

    #[test]
    fn strand_never_runs_two_tasks_concurrently() {
        let exec = SharedExecutor::new(8);
        exec.start();
        let strand = Strand::new(exec.clone());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();
        for _ in 0..200 {
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            let done_tx = done_tx.clone();
            strand.post(move || {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::yield_now();
                concurrent.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        }
        drop(done_tx);
        for _ in 0..200 {
            done_rx.recv().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        exec.stop();
    }

    #[test]
    fn stop_then_start_recreates_pool_with_no_stale_tasks() {
        let exec = SharedExecutor::new(2);
        exec.start();
        assert!(exec.is_running());
        exec.stop();
        assert!(!exec.is_running());
        exec.start();
        assert!(exec.is_running());

        let strand = Strand::new(exec.clone());
        let (tx, rx) = mpsc::channel();
        strand.post(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        exec.stop();
    }
}
