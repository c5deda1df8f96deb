//! Thread-safe primitives exposed to users and used internally by sessions.
//!
//! These are the four primitives called out in the concurrency model: a
//! read-write state wrapper, an atomic state wrapper, an atomic counter, and
//! a flag with condition-variable wait. Contracts are standard: CAS returns
//! whether the swap happened, exchange returns the previous value, and all
//! mutations are happens-before ordered with respect to subsequent reads of
//! the same object.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};

use parking_lot::RwLock;

/// A read-write wrapper for arbitrary state, readable from any thread.
pub struct RwState<T> {
    inner: RwLock<T>,
}

impl<T: Clone> RwState<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    pub fn get(&self) -> T {
        self.inner.read().clone()
    }

    pub fn set(&self, value: T) {
        *self.inner.write() = value;
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.write())
    }
}

/// A small `Copy` enum backed by a single atomic byte.
///
/// Used for [`crate::session::LinkState`]: transitions are lock-free and the
/// "did I actually change state" check (needed for the single-notify
/// invariant) is a genuine CAS, not a read-then-write race.
pub struct AtomicState<T> {
    raw: AtomicU8,
    _marker: std::marker::PhantomData<T>,
}

/// Converts a state enum to and from its atomic byte representation.
pub trait StateCode: Copy {
    fn to_code(self) -> u8;
    fn from_code(code: u8) -> Self;
}

impl<T: StateCode> AtomicState<T> {
    pub fn new(initial: T) -> Self {
        Self { raw: AtomicU8::new(initial.to_code()), _marker: std::marker::PhantomData }
    }

    pub fn load(&self) -> T {
        T::from_code(self.raw.load(Ordering::Acquire))
    }

    /// Unconditionally stores `new` and returns the previous value.
    pub fn exchange(&self, new: T) -> T {
        T::from_code(self.raw.swap(new.to_code(), Ordering::AcqRel))
    }

    /// Stores `new` only if the current value is `current`.
    ///
    /// Returns whether the swap happened.
    pub fn compare_and_set(&self, current: T, new: T) -> bool {
        self.raw
            .compare_exchange(
                current.to_code(),
                new.to_code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// A monotonic (well, settable) atomic counter.
#[derive(Default)]
pub struct Counter {
    raw: AtomicU64,
}

impl Counter {
    pub const fn new(initial: u64) -> Self {
        Self { raw: AtomicU64::new(initial) }
    }

    pub fn get(&self) -> u64 {
        self.raw.load(Ordering::Acquire)
    }

    pub fn incr(&self) -> u64 {
        self.raw.fetch_add(1, Ordering::AcqRel)
    }

    pub fn add(&self, n: u64) -> u64 {
        self.raw.fetch_add(n, Ordering::AcqRel)
    }

    pub fn sub(&self, n: u64) -> u64 {
        self.raw.fetch_sub(n, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.raw.store(0, Ordering::Release);
    }

    pub fn set(&self, value: u64) {
        self.raw.store(value, Ordering::Release);
    }
}

/// A boolean flag with blocking-wait support via a condition variable.
pub struct Flag {
    raw: AtomicBool,
    gate: Mutex<()>,
    cond: Condvar,
}

impl Flag {
    pub fn new(initial: bool) -> Self {
        Self { raw: AtomicBool::new(initial), gate: Mutex::new(()), cond: Condvar::new() }
    }

    pub fn get(&self) -> bool {
        self.raw.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        let _guard = self.gate.lock().unwrap();
        self.raw.store(value, Ordering::Release);
        self.cond.notify_all();
    }

    /// Blocks the calling thread until the flag reads `true`.
    pub fn wait_until_set(&self) {
        let mut guard = self.gate.lock().unwrap();
        while !self.raw.load(Ordering::Acquire) {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Blocks until the flag reads `true` or `timeout` elapses.
    ///
    /// Returns whether the flag was observed set.
    pub fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.gate.lock().unwrap();
        loop {
            if self.raw.load(Ordering::Acquire) {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, timeout_result) = self.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
            if timeout_result.timed_out() && !self.raw.load(Ordering::Acquire) {
                return false;
            }
        }
    }
}
