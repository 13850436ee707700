//! Synchronization primitives shared by bindings and VIFs.
//!
//! - [`RefCount`]: atomic reference count whose transition to zero is
//!   observed by exactly one caller.
//! - [`Gate`]: in-flight operation counter that can be closed against new
//!   admissions and waited on until it drains.
//! - [`Slots`]: lock-free bounded counter for per-VIF pools.
//! - [`Event`]: manual-reset completion signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Atomic reference count.
///
/// Once the count has reached zero it can never be raised again, so the
/// zero transition happens at most once.
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    /// Take a reference. Fails if the count already dropped to zero.
    pub fn acquire(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == 0 { None } else { Some(c + 1) }
            })
            .is_ok()
    }

    /// Drop a reference and return the remaining count.
    ///
    /// Returns `None` if the count was already zero; that is a caller bug.
    pub fn release(&self) -> Option<usize> {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(prev) => Some(prev - 1),
            Err(_) => {
                debug_assert!(false, "reference count underflow");
                None
            }
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    closed: bool,
}

/// Counter of in-flight operations with a close-then-drain protocol.
///
/// Admission and closing are serialized by one mutex, so after
/// [`Gate::close`] followed by [`Gate::wait_idle`] returns, no operation
/// admitted before the close is still running and none can start.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one operation unless the gate is closed.
    pub fn try_enter(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.active += 1;
        true
    }

    /// Retire one operation. Returns the number still in flight.
    pub fn exit(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.active > 0, "gate exit without enter");
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.idle.notify_all();
        }
        state.active
    }

    /// Stop admitting operations. Returns true for the call that closed it.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        !std::mem::replace(&mut state.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    /// Block until no operation is in flight.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.active > 0 {
            state = self.idle.wait(state).unwrap();
        }
    }

    /// Block until idle or the timeout expires. Returns true if idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.idle.wait_timeout(state, deadline - now).unwrap().0;
        }
        true
    }
}

/// Bounded counter used for send pools and receive queues.
#[derive(Debug)]
pub struct Slots {
    capacity: AtomicUsize,
    used: AtomicUsize,
}

impl Slots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            used: AtomicUsize::new(0),
        }
    }

    /// Take a slot if one is free.
    pub fn try_take(&self) -> bool {
        let capacity = self.capacity.load(Ordering::Acquire);
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                if u < capacity { Some(u + 1) } else { None }
            })
            .is_ok()
    }

    pub fn put(&self) {
        let prev = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| u.checked_sub(1));
        debug_assert!(prev.is_ok(), "slot returned twice");
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Change the bound. Slots already taken stay valid; new takes see the
    /// new bound.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }
}

/// Manual-reset event.
#[derive(Debug, Default)]
pub struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.set.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut set = self.set.lock().unwrap();
        while !*set {
            set = self.cond.wait(set).unwrap();
        }
    }

    /// Wait with a timeout. Returns true if the event was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let set = self.set.lock().unwrap();
        let (set, _) = self
            .cond
            .wait_timeout_while(set, timeout, |set| !*set)
            .unwrap();
        *set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_refcount_acquire_after_zero_fails() {
        let rc = RefCount::new(1);
        assert!(rc.acquire());
        assert_eq!(rc.release(), Some(1));
        assert_eq!(rc.release(), Some(0));
        assert!(!rc.acquire());
        assert_eq!(rc.get(), 0);
    }

    #[test]
    fn test_refcount_zero_observed_once() {
        for _ in 0..50 {
            let rc = Arc::new(RefCount::new(1));
            for _ in 0..15 {
                assert!(rc.acquire());
            }
            let zeros = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let rc = Arc::clone(&rc);
                    let zeros = Arc::clone(&zeros);
                    thread::spawn(move || {
                        if rc.release() == Some(0) {
                            zeros.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(zeros.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_gate_close_rejects_new_work() {
        let gate = Gate::new();
        assert!(gate.try_enter());
        assert!(gate.close());
        assert!(!gate.close());
        assert!(!gate.try_enter());
        assert_eq!(gate.active(), 1);
        assert_eq!(gate.exit(), 0);
        gate.wait_idle();
    }

    #[test]
    fn test_gate_wait_idle_blocks_until_drained() {
        let gate = Arc::new(Gate::new());
        assert!(gate.try_enter());
        gate.close();

        let g = Arc::clone(&gate);
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            g.exit();
        });

        gate.wait_idle();
        assert_eq!(gate.active(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_gate_wait_idle_timeout() {
        let gate = Gate::new();
        assert!(gate.try_enter());
        assert!(!gate.wait_idle_timeout(Duration::from_millis(10)));
        gate.exit();
        assert!(gate.wait_idle_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_slots_bound() {
        let slots = Slots::new(2);
        assert!(slots.try_take());
        assert!(slots.try_take());
        assert!(!slots.try_take());
        slots.put();
        assert!(slots.try_take());
        assert_eq!(slots.used(), 2);

        slots.set_capacity(3);
        assert!(slots.try_take());
        assert_eq!(slots.capacity(), 3);
    }

    #[test]
    fn test_event() {
        let ev = Arc::new(Event::new());
        assert!(!ev.is_set());
        assert!(!ev.wait_timeout(Duration::from_millis(5)));

        let e = Arc::clone(&ev);
        let setter = thread::spawn(move || e.set());
        ev.wait();
        assert!(ev.is_set());
        setter.join().unwrap();
    }
}
