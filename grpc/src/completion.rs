//! Completion queues.
//!
//! A completion queue linearizes asynchronous activity into a stream of
//! events the application drains with [`CompletionQueue::next`]. Many
//! producers (connection drivers, the timer thread, server workers) may
//! push concurrently; many consumers may wait concurrently.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Opaque application token carried through a batch to its event.
pub type Tag = u64;

/// What a drained event signifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A batch (or server notification) finished; `tag` identifies it.
    OpComplete,
    /// The queue was shut down and is fully drained.
    Shutdown,
    /// The wait deadline passed with nothing to deliver.
    QueueTimeout,
}

/// One drained completion.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub tag: Tag,
    pub kind: EventKind,
    pub success: bool,
}

impl Event {
    pub(crate) fn completion(tag: Tag, success: bool) -> Self {
        Self {
            tag,
            kind: EventKind::OpComplete,
            success,
        }
    }

    fn shutdown() -> Self {
        Self {
            tag: 0,
            kind: EventKind::Shutdown,
            success: false,
        }
    }

    fn timeout() -> Self {
        Self {
            tag: 0,
            kind: EventKind::QueueTimeout,
            success: false,
        }
    }
}

/// Queue flavor: FIFO draining or selection by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionType {
    Next,
    Pluck,
}

/// Thread-safe event queue with timed waits and graceful shutdown.
#[derive(Clone)]
pub struct CompletionQueue {
    inner: Arc<CqInner>,
}

struct CqInner {
    kind: CompletionType,
    state: Mutex<CqState>,
    cond: Condvar,
}

struct CqState {
    queue: VecDeque<Event>,
    shutdown: bool,
    /// Tags registered for pluck-style retrieval (PLUCK queues only).
    pluckable: HashSet<Tag>,
}

impl CompletionQueue {
    pub fn new(kind: CompletionType) -> Self {
        Self {
            inner: Arc::new(CqInner {
                kind,
                state: Mutex::new(CqState {
                    queue: VecDeque::new(),
                    shutdown: false,
                    pluckable: HashSet::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn kind(&self) -> CompletionType {
        self.inner.kind
    }

    /// Identity comparison: clones of one queue share their state.
    pub(crate) fn same_queue(&self, other: &CompletionQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait for the next event in FIFO order.
    ///
    /// Returns the head event when one is available, a
    /// [`EventKind::Shutdown`] event once the queue is shut down and
    /// drained, or [`EventKind::QueueTimeout`] at or after `deadline`.
    /// A deadline already in the past never blocks.
    pub fn next(&self, deadline: Instant) -> Event {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return event;
            }
            if state.shutdown {
                return Event::shutdown();
            }
            if Instant::now() >= deadline {
                return Event::timeout();
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                // Re-check the queue once; a producer may have raced the
                // timeout.
                if let Some(event) = state.queue.pop_front() {
                    return event;
                }
                if state.shutdown {
                    return Event::shutdown();
                }
                return Event::timeout();
            }
        }
    }

    /// Wait for the event carrying `tag` specifically.
    ///
    /// Only meaningful on PLUCK queues; the tag must have been
    /// registered by the batch that will complete it.
    pub fn pluck(&self, tag: Tag, deadline: Instant) -> Event {
        if self.inner.kind != CompletionType::Pluck {
            warn!("pluck called on a NEXT completion queue");
            return Event::timeout();
        }

        let mut state = self.inner.state.lock();
        if !state.pluckable.contains(&tag) && !state.queue.iter().any(|e| e.tag == tag) {
            warn!(tag, "pluck for an unregistered tag");
            return Event::timeout();
        }

        loop {
            if let Some(pos) = state.queue.iter().position(|e| e.tag == tag) {
                let event = state.queue.remove(pos).expect("position just found");
                state.pluckable.remove(&tag);
                return event;
            }
            if state.shutdown {
                return Event::shutdown();
            }
            if Instant::now() >= deadline {
                return Event::timeout();
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                if let Some(pos) = state.queue.iter().position(|e| e.tag == tag) {
                    let event = state.queue.remove(pos).expect("position just found");
                    state.pluckable.remove(&tag);
                    return event;
                }
                return Event::timeout();
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        self.inner.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Enqueue an event. Dropped with a diagnostic after shutdown; the
    /// contract forbids new events past that point.
    pub(crate) fn push(&self, event: Event) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            debug!(tag = event.tag, "event dropped after queue shutdown");
            return;
        }
        if self.inner.kind == CompletionType::Pluck && !state.pluckable.contains(&event.tag) {
            warn!(tag = event.tag, "event for unregistered pluck tag dropped");
            return;
        }
        state.queue.push_back(event);
        self.inner.cond.notify_all();
    }

    /// Register a tag for later pluck retrieval. No-op on NEXT queues.
    pub(crate) fn register_pluck_tag(&self, tag: Tag) {
        if self.inner.kind == CompletionType::Pluck {
            self.inner.state.lock().pluckable.insert(tag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[test]
    fn fifo_order() {
        let cq = CompletionQueue::new(CompletionType::Next);
        cq.push(Event::completion(1, true));
        cq.push(Event::completion(2, false));
        cq.push(Event::completion(3, true));

        assert_eq!(cq.next(soon()).tag, 1);
        let second = cq.next(soon());
        assert_eq!(second.tag, 2);
        assert!(!second.success);
        assert_eq!(cq.next(soon()).tag, 3);
    }

    #[test]
    fn past_deadline_returns_timeout_without_blocking() {
        let cq = CompletionQueue::new(CompletionType::Next);
        let start = Instant::now();
        let event = cq.next(Instant::now() - Duration::from_secs(1));
        assert_eq!(event.kind, EventKind::QueueTimeout);
        assert!(!event.success);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn timeout_at_deadline() {
        let cq = CompletionQueue::new(CompletionType::Next);
        let deadline = Instant::now() + Duration::from_millis(50);
        let event = cq.next(deadline);
        assert_eq!(event.kind, EventKind::QueueTimeout);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn shutdown_drains_then_reports() {
        let cq = CompletionQueue::new(CompletionType::Next);
        cq.push(Event::completion(7, true));
        cq.shutdown();

        // Existing events remain drainable.
        let event = cq.next(soon());
        assert_eq!(event.tag, 7);
        assert_eq!(event.kind, EventKind::OpComplete);

        // Exactly one shutdown observation per wait thereafter.
        assert_eq!(cq.next(soon()).kind, EventKind::Shutdown);
    }

    #[test]
    fn push_after_shutdown_is_dropped() {
        let cq = CompletionQueue::new(CompletionType::Next);
        cq.shutdown();
        cq.push(Event::completion(9, true));
        assert_eq!(cq.next(soon()).kind, EventKind::Shutdown);
    }

    #[test]
    fn producer_wakes_blocked_consumer() {
        let cq = CompletionQueue::new(CompletionType::Next);
        let cq2 = cq.clone();

        let handle = std::thread::spawn(move || cq2.next(Instant::now() + Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        cq.push(Event::completion(42, true));

        let event = handle.join().unwrap();
        assert_eq!(event.tag, 42);
    }

    #[test]
    fn shutdown_wakes_blocked_consumer() {
        let cq = CompletionQueue::new(CompletionType::Next);
        let cq2 = cq.clone();

        let handle = std::thread::spawn(move || cq2.next(Instant::now() + Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        cq.shutdown();

        assert_eq!(handle.join().unwrap().kind, EventKind::Shutdown);
    }

    #[test]
    fn many_producers_one_consumer() {
        let cq = CompletionQueue::new(CompletionType::Next);
        let mut handles = Vec::new();
        for tag in 0..8u64 {
            let cq = cq.clone();
            handles.push(std::thread::spawn(move || {
                cq.push(Event::completion(tag, true));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen: Vec<Tag> = (0..8).map(|_| cq.next(soon()).tag).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn pluck_selects_by_tag() {
        let cq = CompletionQueue::new(CompletionType::Pluck);
        cq.register_pluck_tag(1);
        cq.register_pluck_tag(2);
        cq.push(Event::completion(1, true));
        cq.push(Event::completion(2, true));

        assert_eq!(cq.pluck(2, soon()).tag, 2);
        assert_eq!(cq.pluck(1, soon()).tag, 1);
    }

    #[test]
    fn pluck_unregistered_tag_rejected() {
        let cq = CompletionQueue::new(CompletionType::Pluck);
        let event = cq.pluck(99, Instant::now() + Duration::from_millis(10));
        assert_eq!(event.kind, EventKind::QueueTimeout);
    }

    #[test]
    fn pluck_on_next_queue_rejected() {
        let cq = CompletionQueue::new(CompletionType::Next);
        assert_eq!(cq.pluck(1, soon()).kind, EventKind::QueueTimeout);
    }
}
