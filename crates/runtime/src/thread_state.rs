//! Per-thread greenlet state
//!
//! One `ThreadState` per OS thread that has touched the runtime. It owns the
//! thread's main greenlet and cleanup queue and tracks which greenlet is
//! running. `current` is a plain pointer: the running node keeps itself
//! alive through its anchor, so the thread state does not own it.
//!
//! Shared through `Arc` with the registry (for diagnostics) and through
//! `Weak` with every node of the tree (for cross-thread release).

use crate::cleanup::{Deferred, DeferredCleanupQueue};
use crate::error::GreenletError;
use crate::greenlet::{BorrowedGreenlet, Greenlet, GreenletNode, TraceEvent, free_node};
use crate::registry::ThreadKey;
use parking_lot::Mutex;
use serde::Serialize;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, error};

/// Switch tracer: called with the event, origin and target before each
/// explicit switch or throw.
pub type Tracer = Arc<dyn Fn(TraceEvent, BorrowedGreenlet<'_>, BorrowedGreenlet<'_>) + Send + Sync>;

pub struct ThreadState {
    key: ThreadKey,
    main: Mutex<Option<Greenlet>>,
    current: AtomicPtr<GreenletNode>,
    /// Id of `current`, readable from other threads (0 once torn down)
    current_id: AtomicU64,
    /// Context transfers (and explicit deferral scopes) not yet landed
    in_flight: AtomicUsize,
    cleanup: DeferredCleanupQueue,
    tracer: Mutex<Option<Tracer>>,
    switches: AtomicU64,
}

impl ThreadState {
    /// New thread state whose main greenlet is the calling context.
    pub(crate) fn new(key: ThreadKey) -> Arc<ThreadState> {
        Arc::new_cyclic(|weak| {
            let main = Greenlet::new_main(key, weak.clone());
            ThreadState {
                key,
                current: AtomicPtr::new(main.node_ptr()),
                current_id: AtomicU64::new(main.id()),
                main: Mutex::new(Some(main)),
                in_flight: AtomicUsize::new(0),
                cleanup: DeferredCleanupQueue::new(),
                tracer: Mutex::new(None),
                switches: AtomicU64::new(0),
            }
        })
    }

    pub fn key(&self) -> ThreadKey {
        self.key
    }

    pub(crate) fn current_ptr(&self) -> *mut GreenletNode {
        self.current.load(Ordering::Acquire)
    }

    /// Owner thread only: `node` must be null or live.
    pub(crate) fn set_current(&self, node: *mut GreenletNode) {
        // Safety: a non-null node is live on the owning thread
        let id = NonNull::new(node).map_or(0, |ptr| unsafe { ptr.as_ref() }.id());
        self.current_id.store(id, Ordering::Relaxed);
        self.current.store(node, Ordering::Release);
    }

    /// Handle to the running greenlet
    pub fn current_greenlet(&self) -> Result<Greenlet, GreenletError> {
        let ptr = NonNull::new(self.current_ptr()).ok_or_else(|| {
            GreenletError::InvalidState("thread state has been torn down".to_string())
        })?;
        // Safety: the running node is anchored (or is main, owned by us)
        Ok(unsafe { Greenlet::from_node_ptr(ptr) })
    }

    /// Handle to main; none once the thread has been torn down
    pub fn main_greenlet(&self) -> Option<Greenlet> {
        self.main.lock().clone()
    }

    pub(crate) fn begin_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// End one in-flight transfer; the last one out drains the queue.
    pub(crate) fn land(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "landed without a transfer in flight");
        if prev == 1 {
            self.cleanup.drain();
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    pub fn cleanup(&self) -> &DeferredCleanupQueue {
        &self.cleanup
    }

    pub(crate) fn tracer(&self) -> Option<Tracer> {
        self.tracer.lock().clone()
    }

    pub(crate) fn set_tracer(&self, tracer: Option<Tracer>) -> Option<Tracer> {
        std::mem::replace(&mut *self.tracer.lock(), tracer)
    }

    pub(crate) fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Safe from any thread: reads counters only, never the current node.
    pub fn summary(&self) -> ThreadSummary {
        ThreadSummary {
            thread: self.key.as_u64(),
            current: self.current_id.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            deferred: self.cleanup.len(),
            switches: self.switches.load(Ordering::Relaxed),
        }
    }

    /// Release everything this thread owns. Runs on the thread itself,
    /// from main, after which the thread state is unusable.
    ///
    /// Queued nodes are freed without unwinding their stacks.
    pub(crate) fn teardown(&self) {
        let main_ptr = self
            .main
            .lock()
            .as_ref()
            .map_or(ptr::null_mut(), Greenlet::node_ptr);
        if self.current_ptr() != main_ptr {
            error!(
                thread = self.key.as_u64(),
                "thread exiting while a greenlet other than main is running"
            );
        }

        let leftover = self.cleanup.close();
        let discarded = leftover.len();
        for item in leftover {
            match item {
                Deferred::Node(ptr) => free_node(ptr),
                Deferred::Stack(stack) => drop(stack),
            }
        }

        let tracer = self.set_tracer(None);
        drop(tracer);

        let main = self.main.lock().take();
        self.set_current(ptr::null_mut());
        if let Some(main) = main {
            main.node().mark_dead();
            drop(main);
        }
        debug!(thread = self.key.as_u64(), discarded, "thread state torn down");
    }
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("key", &self.key)
            .field("in_flight", &self.in_flight())
            .field("deferred", &self.cleanup.len())
            .finish()
    }
}

/// Point-in-time view of one thread, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub thread: u64,
    /// Id of the running greenlet (0 after teardown)
    pub current: u64,
    pub in_flight: bool,
    pub deferred: usize,
    pub switches: u64,
}

/// Install (or with `None`, remove) the calling thread's switch tracer.
/// Returns the tracer it replaces.
pub fn set_trace(tracer: Option<Tracer>) -> Result<Option<Tracer>, GreenletError> {
    Ok(crate::registry::current_thread_state()?.set_tracer(tracer))
}

/// The calling thread's tracer, if any
pub fn get_trace() -> Result<Option<Tracer>, GreenletError> {
    Ok(crate::registry::current_thread_state()?.tracer())
}
