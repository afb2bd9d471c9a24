//! Deferred cleanup
//!
//! Releasing a greenlet can run arbitrary code: the node's entry closure and
//! payloads drop, and a suspended node is first unwound by switching into
//! it. None of that may happen while a context transfer is half done, so a
//! node whose last reference goes away mid-transfer (or on a foreign
//! thread) is parked here, together with the stacks of greenlets that just
//! died and are still executing their final switch. The owning thread
//! drains the queue in FIFO order at the next safe point.

use crate::greenlet::{NodePtr, release_node};
use crate::registry::current_thread_state;
use crate::stack::StackSegment;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

pub static TOTAL_DEFERRED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_DRAINED: AtomicU64 = AtomicU64::new(0);

pub(crate) enum Deferred {
    /// Node whose last reference dropped while release was unsafe
    Node(NodePtr),
    /// Stack of a greenlet that died; freed once execution has left it
    Stack(StackSegment),
}

impl Deferred {
    /// Release now. Node release may run arbitrary code, including switches.
    fn release(self) {
        match self {
            Deferred::Node(ptr) => release_node(ptr),
            Deferred::Stack(stack) => drop(stack),
        }
    }
}

struct QueueInner {
    items: VecDeque<Deferred>,
    closed: bool,
}

/// FIFO of pending releases owned by one thread state
pub struct DeferredCleanupQueue {
    inner: Mutex<QueueInner>,
}

impl DeferredCleanupQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Queue an item. A closed queue (thread exiting) hands it back.
    pub(crate) fn push(&self, item: Deferred) -> Result<(), Deferred> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(item);
        }
        inner.items.push_back(item);
        TOTAL_DEFERRED.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn pop(&self) -> Option<Deferred> {
        self.inner.lock().items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Refuse further pushes and hand back everything still queued.
    pub(crate) fn close(&self) -> VecDeque<Deferred> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        std::mem::take(&mut inner.items)
    }

    /// Release queued items front to back.
    ///
    /// Items are popped one at a time with the lock released, so a release
    /// that re-enters the runtime (and queues or drains more) sees a
    /// consistent queue and FIFO order holds across the nesting.
    pub(crate) fn drain(&self) -> usize {
        let mut released = 0;
        while let Some(item) = self.pop() {
            item.release();
            released += 1;
        }
        if released > 0 {
            TOTAL_DRAINED.fetch_add(released as u64, Ordering::Relaxed);
            debug!(released, "drained deferred cleanup queue");
        }
        released
    }
}

/// Drain the calling thread's queue now, unless a switch is in flight.
///
/// Returns the number of items released. Outside a greenlet runtime
/// operation this is always a safe point.
pub fn drain_deferred() -> usize {
    let Ok(ts) = current_thread_state() else {
        return 0;
    };
    if ts.in_flight() {
        trace!("drain_deferred skipped: switch in flight");
        return 0;
    }
    ts.cleanup().drain()
}

/// Run `f` as though a switch were in flight: releases that become due
/// while it runs are queued, then drained once it returns (or unwinds).
pub fn with_deferred_cleanup<R>(f: impl FnOnce() -> R) -> R {
    struct Landing(Option<std::sync::Arc<crate::thread_state::ThreadState>>);

    impl Drop for Landing {
        fn drop(&mut self) {
            if let Some(ts) = self.0.take() {
                ts.land();
            }
        }
    }

    let ts = current_thread_state().ok();
    if let Some(ts) = &ts {
        ts.begin_flight();
    }
    let _landing = Landing(ts);
    f()
}
