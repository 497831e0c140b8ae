//! Deadline enforcement.
//!
//! One timer thread per runtime holds a min-heap of call deadlines.
//! When a deadline fires the call transitions to `DEADLINE_EXCEEDED`
//! through its cancellation path, which resets the stream and fails any
//! pending batch. Deadlines are absolute and fire whether or not the
//! connection has traffic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::call::CallShared;

struct Entry {
    at: Instant,
    seq: u64,
    call: Weak<CallShared>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline
        // must surface first.
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    entries: BinaryHeap<Entry>,
    seq: u64,
    shutdown: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    cv: Condvar,
}

/// Shared deadline wheel. Dropping it stops the thread.
pub(crate) struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });

        let thread_inner = inner.clone();
        std::thread::Builder::new()
            .name("grpc-timer".into())
            .spawn(move || Self::run(thread_inner))
            .expect("spawn timer thread");

        Self { inner }
    }

    pub(crate) fn schedule(&self, at: Instant, call: Weak<CallShared>) {
        let mut state = self.inner.state.lock();
        state.seq += 1;
        let seq = state.seq;
        state.entries.push(Entry { at, seq, call });
        self.inner.cv.notify_all();
    }

    fn run(inner: Arc<TimerInner>) {
        let mut state = inner.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let next_at = match state.entries.peek() {
                Some(top) if top.at <= now => {
                    if let Some(entry) = state.entries.pop() {
                        // Fire outside the heap lock; expiry takes the
                        // call lock and pushes a completion event.
                        drop(state);
                        if let Some(call) = entry.call.upgrade() {
                            call.expire_deadline();
                        }
                        state = inner.state.lock();
                    }
                    continue;
                }
                Some(top) => Some(top.at),
                None => None,
            };

            match next_at {
                Some(at) => {
                    inner.cv.wait_until(&mut state, at);
                }
                None => inner.cv.wait(&mut state),
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cv.notify_all();
    }
}
