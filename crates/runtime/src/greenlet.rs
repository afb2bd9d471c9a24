//! Greenlet nodes and handles
//!
//! A [`GreenletNode`] is one coroutine: an id, a lifecycle state, a parent
//! link, and (once started) its own stack segment and saved machine
//! context. Nodes are reference counted; [`Greenlet`] is the owning handle
//! user code holds.
//!
//! Nodes form one tree per OS thread, rooted at that thread's main greenlet.
//! A node may only be switched to, killed or reparented from its own
//! thread, but handles are `Send` and may be dropped anywhere: a release
//! that cannot happen in place is queued on the owning thread (see
//! `cleanup`).
//!
//! ## Lifecycle
//!
//! ```text
//! Unstarted --(first switch in)--> Running <--(switch in/out)--> Suspended
//!                                     |
//!                          (entry returns or raises)
//!                                     v
//!                                   Dead
//! ```

use crate::cleanup::Deferred;
use crate::config::{MIN_STACK_SIZE, config};
use crate::context::Context;
use crate::error::{GreenletError, SwitchResult};
use crate::registry::{ThreadKey, current_thread_key, current_thread_state};
use crate::stack::StackSegment;
use crate::switch as engine;
use crate::thread_state::ThreadState;
use parking_lot::Mutex;
use sprig_core::{Borrowed, ErrorDescriptor, HostSnapshot, Object, Owned, RefCounted};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Weak;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering, fence};
use tracing::{debug, trace, warn};

// Lifecycle counters (diagnostics)
pub static TOTAL_SPAWNED: AtomicU64 = AtomicU64::new(0);
pub static TOTAL_FINISHED: AtomicU64 = AtomicU64::new(0);
pub static LIVE_NODES: AtomicU64 = AtomicU64::new(0);

/// Unique greenlet ID generator
static NEXT_GREENLET_ID: AtomicU64 = AtomicU64::new(1);

/// Body of a greenlet. Receives the payload of the switch that starts it;
/// its result is delivered to the parent when it finishes.
pub type Entry = Box<dyn FnOnce(Owned<Object>) -> SwitchResult>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Unstarted = 0,
    Running = 1,
    Suspended = 2,
    Dead = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Lifecycle {
        match v {
            0 => Lifecycle::Unstarted,
            1 => Lifecycle::Running,
            2 => Lifecycle::Suspended,
            _ => Lifecycle::Dead,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Unstarted => "unstarted",
            Lifecycle::Running => "running",
            Lifecycle::Suspended => "suspended",
            Lifecycle::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// State only ever touched from the owning thread (or after it is gone)
pub(crate) struct NodeLocal {
    entry: Option<Entry>,
    stack: Option<StackSegment>,
    context: Context,
    /// Payload or error delivered by the switch that resumes this node
    pending: Option<SwitchResult>,
    /// Host state saved while suspended
    host: HostSnapshot,
    /// Self reference held while Running
    anchor: Option<Greenlet>,
}

pub struct GreenletNode {
    refcnt: AtomicUsize,
    id: u64,
    owner: ThreadKey,
    is_main: bool,
    state: AtomicU8,
    parent: Mutex<Option<Greenlet>>,
    thread: Weak<ThreadState>,
    stack_size: usize,
    local: UnsafeCell<NodeLocal>,
    data: Mutex<Option<Owned<Object>>>,
}

// `local` is only accessed on the owning thread, or once the owning thread
// has exited and the node is unreachable from it. Everything else is atomic
// or behind a lock.
unsafe impl Send for GreenletNode {}
unsafe impl Sync for GreenletNode {}

impl GreenletNode {
    fn allocate(
        owner: ThreadKey,
        thread: Weak<ThreadState>,
        parent: Option<Greenlet>,
        entry: Option<Entry>,
        stack_size: usize,
        is_main: bool,
    ) -> Greenlet {
        let state = if is_main {
            Lifecycle::Running
        } else {
            Lifecycle::Unstarted
        };
        let node = Box::new(GreenletNode {
            refcnt: AtomicUsize::new(1),
            id: NEXT_GREENLET_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            is_main,
            state: AtomicU8::new(state as u8),
            parent: Mutex::new(parent),
            thread,
            stack_size,
            local: UnsafeCell::new(NodeLocal {
                entry,
                stack: None,
                context: Context::new(),
                pending: None,
                host: HostSnapshot::default(),
                anchor: None,
            }),
            data: Mutex::new(None),
        });
        LIVE_NODES.fetch_add(1, Ordering::Relaxed);
        // Safety: fresh box, its single reference moves into the handle
        Greenlet(unsafe { Owned::from_raw(NonNull::from(Box::leak(node))) })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn owner(&self) -> ThreadKey {
        self.owner
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: Lifecycle) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn mark_dead(&self) {
        let prev = self.state.swap(Lifecycle::Dead as u8, Ordering::AcqRel);
        if prev != Lifecycle::Dead as u8 && !self.is_main {
            TOTAL_FINISHED.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Kill a node that never ran: Dead without calling the entry.
    pub(crate) fn finish_unstarted(&self) {
        self.mark_dead();
        let entry = self.with_local(|local| local.entry.take());
        drop(entry);
    }

    pub(crate) fn parent(&self) -> Option<Greenlet> {
        self.parent.lock().clone()
    }

    pub(crate) fn replace_parent(&self, parent: Option<Greenlet>) -> Option<Greenlet> {
        std::mem::replace(&mut *self.parent.lock(), parent)
    }

    /// Run `f` on the owner-only state. `f` must not switch or drop
    /// anything that can run user code; values that can are moved out.
    fn with_local<R>(&self, f: impl FnOnce(&mut NodeLocal) -> R) -> R {
        debug_assert!(current_thread_key().is_none_or(|key| key == self.owner));
        // Safety: owner thread only, and the borrow ends before `f` returns
        f(unsafe { &mut *self.local.get() })
    }

    pub(crate) fn take_entry(&self) -> Option<Entry> {
        self.with_local(|local| local.entry.take())
    }

    pub(crate) fn install_stack(&self, stack: StackSegment) {
        self.with_local(|local| local.stack = Some(stack));
    }

    pub(crate) fn take_stack(&self) -> Option<StackSegment> {
        self.with_local(|local| local.stack.take())
    }

    /// Raw pointer to the saved context, valid while the node lives
    pub(crate) fn context_ptr(&self) -> *mut Context {
        // Safety: no reference is formed
        unsafe { &raw mut (*self.local.get()).context }
    }

    pub(crate) fn set_pending(&self, payload: SwitchResult) {
        let previous = self.with_local(|local| local.pending.replace(payload));
        debug_assert!(previous.is_none(), "greenlet had an undelivered payload");
        drop(previous);
    }

    pub(crate) fn take_pending(&self) -> Option<SwitchResult> {
        self.with_local(|local| local.pending.take())
    }

    pub(crate) fn store_host(&self, host: HostSnapshot) {
        let previous = self.with_local(|local| std::mem::replace(&mut local.host, host));
        drop(previous);
    }

    pub(crate) fn take_host(&self) -> HostSnapshot {
        self.with_local(|local| std::mem::take(&mut local.host))
    }

    pub(crate) fn set_anchor(&self, handle: Greenlet) {
        let previous = self.with_local(|local| local.anchor.replace(handle));
        drop(previous);
    }

    pub(crate) fn take_anchor(&self) -> Option<Greenlet> {
        self.with_local(|local| local.anchor.take())
    }
}

unsafe impl RefCounted for GreenletNode {
    fn incref(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn decref(ptr: NonNull<Self>) {
        let prev = unsafe { ptr.as_ref() }.refcnt.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "greenlet reference count underflow");
        if prev != 1 {
            return;
        }
        fence(Ordering::Acquire);
        on_last_reference(NodePtr(ptr));
    }

    fn refcount(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for GreenletNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreenletNode")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("main", &self.is_main)
            .finish()
    }
}

/// Pointer to a node with no references left, awaiting release
pub(crate) struct NodePtr(NonNull<GreenletNode>);

// Moves between threads only to reach the owner's cleanup queue.
unsafe impl Send for NodePtr {}

/// Decide how a node with no references left is released.
fn on_last_reference(ptr: NodePtr) {
    let node = unsafe { ptr.0.as_ref() };
    let id = node.id;
    let Some(ts) = node.thread.upgrade() else {
        free_orphan(ptr);
        return;
    };
    let local = current_thread_key() == Some(node.owner);

    if local && ts.cleanup().is_closed() {
        // thread teardown: release without unwinding
        drop(ts);
        free_node(ptr);
        return;
    }
    if local && !ts.in_flight() {
        drop(ts);
        release_node(ptr);
        return;
    }

    match ts.cleanup().push(Deferred::Node(ptr)) {
        Ok(()) => trace!(id, "greenlet release deferred"),
        Err(item) => {
            drop(ts);
            match item {
                Deferred::Node(ptr) if local => free_node(ptr),
                Deferred::Node(ptr) => free_orphan(ptr),
                other => drop(other),
            }
        }
    }
}

/// Release a node on its owning thread at a safe point.
///
/// A suspended node still has frames on its stack holding references; it
/// is brought back to life just long enough to be killed so those frames
/// unwind. One that refuses to die is leaked.
pub(crate) fn release_node(ptr: NodePtr) {
    let node = unsafe { ptr.0.as_ref() };
    if node.state() != Lifecycle::Suspended || node.is_main {
        free_node(ptr);
        return;
    }

    debug!(id = node.id, "collecting unreferenced suspended greenlet");
    node.refcnt.store(1, Ordering::Relaxed);
    // Safety: the count was zero; this handle is now its only reference
    let handle = Greenlet(unsafe { Owned::from_raw(ptr.0) });
    if let Err(err) = engine::kill(&handle) {
        warn!(id = handle.id(), "killing unreferenced greenlet failed: {}", err);
    }
    if handle.is_dead() {
        drop(handle);
    } else {
        warn!(id = handle.id(), "unreferenced greenlet refused to exit; leaking it");
        std::mem::forget(handle);
    }
}

/// Free a node on its owning thread. Suspended frames are not unwound.
pub(crate) fn free_node(ptr: NodePtr) {
    // Safety: allocated by GreenletNode::allocate, no references remain
    let node = unsafe { Box::from_raw(ptr.0.as_ptr()) };
    trace!(id = node.id, "freeing greenlet");
    drop(node);
    LIVE_NODES.fetch_sub(1, Ordering::Relaxed);
}

/// Free a node whose owning thread is gone, from whatever thread dropped it.
/// The entry closure is leaked rather than dropped off its thread.
fn free_orphan(ptr: NodePtr) {
    // Safety: as free_node; the owner can no longer reach the node
    let mut node = unsafe { Box::from_raw(ptr.0.as_ptr()) };
    if let Some(entry) = node.local.get_mut().entry.take() {
        std::mem::forget(entry);
    }
    debug!(id = node.id, "freeing orphaned greenlet");
    drop(node);
    LIVE_NODES.fetch_sub(1, Ordering::Relaxed);
}

/// Owning handle to a greenlet
#[derive(Clone)]
pub struct Greenlet(Owned<GreenletNode>);

impl Greenlet {
    pub(crate) fn new_main(owner: ThreadKey, thread: Weak<ThreadState>) -> Greenlet {
        GreenletNode::allocate(owner, thread, None, None, 0, true)
    }

    /// New reference to a node kept alive by someone else
    ///
    /// # Safety
    /// `ptr` must point at a live node.
    pub(crate) unsafe fn from_node_ptr(ptr: NonNull<GreenletNode>) -> Greenlet {
        Greenlet(Owned::new_ref(unsafe { Borrowed::from_raw(ptr) }))
    }

    /// Spawn an unstarted greenlet whose parent is the current greenlet.
    pub fn spawn(
        entry: impl FnOnce(Owned<Object>) -> SwitchResult + 'static,
    ) -> Result<Greenlet, GreenletError> {
        Builder::new().spawn(entry)
    }

    /// Switch to this greenlet, handing it `payload`.
    ///
    /// Returns what the next switch back into the caller delivers.
    pub fn switch(&self, payload: Owned<Object>) -> SwitchResult {
        engine::switch_to(self, Ok(payload), TraceEvent::Switch)
    }

    /// Switch to this greenlet and raise `err` inside it.
    pub fn throw(&self, err: ErrorDescriptor) -> SwitchResult {
        engine::switch_to(
            self,
            Err(GreenletError::Propagated(err)),
            TraceEvent::Throw,
        )
    }

    pub fn kill(&self) -> Result<(), GreenletError> {
        engine::kill(self)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> Lifecycle {
        self.0.state()
    }

    pub fn is_dead(&self) -> bool {
        self.state() == Lifecycle::Dead
    }

    pub fn is_started(&self) -> bool {
        self.state() != Lifecycle::Unstarted
    }

    /// Started and not yet dead
    pub fn is_active(&self) -> bool {
        matches!(self.state(), Lifecycle::Running | Lifecycle::Suspended)
    }

    pub fn is_main(&self) -> bool {
        self.0.is_main
    }

    pub fn parent(&self) -> Option<Greenlet> {
        self.0.parent()
    }

    /// Reparent this greenlet.
    ///
    /// The new parent must live on the same thread and must not be this
    /// greenlet or one of its descendants.
    pub fn set_parent(&self, parent: &Greenlet) -> Result<(), GreenletError> {
        if self.is_main() {
            return Err(GreenletError::InvalidState(
                "a main greenlet cannot have a parent".to_string(),
            ));
        }
        if parent.0.owner != self.0.owner {
            return Err(GreenletError::InvalidTarget(
                "parent belongs to another thread".to_string(),
            ));
        }
        let mut cursor = Some(parent.clone());
        while let Some(node) = cursor {
            if Greenlet::ptr_eq(&node, self) {
                return Err(GreenletError::InvalidState(
                    "cyclic parent chain is not allowed".to_string(),
                ));
            }
            cursor = node.parent();
        }
        let previous = self.0.replace_parent(Some(parent.clone()));
        drop(previous);
        Ok(())
    }

    /// Attach a host object to this greenlet; returns the previous one.
    pub fn set_data(&self, data: Option<Owned<Object>>) -> Option<Owned<Object>> {
        std::mem::replace(&mut *self.0.data.lock(), data)
    }

    pub fn data(&self) -> Option<Owned<Object>> {
        self.0.data.lock().clone()
    }

    pub fn borrow(&self) -> BorrowedGreenlet<'_> {
        BorrowedGreenlet(self.0.borrow())
    }

    pub fn ptr_eq(a: &Greenlet, b: &Greenlet) -> bool {
        Owned::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn node(&self) -> &GreenletNode {
        &self.0
    }

    pub(crate) fn node_ptr(&self) -> *mut GreenletNode {
        self.0.as_ptr().as_ptr()
    }
}

impl PartialEq for Greenlet {
    fn eq(&self, other: &Self) -> bool {
        Greenlet::ptr_eq(self, other)
    }
}

impl Eq for Greenlet {}

impl fmt::Debug for Greenlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Greenlet({}, {})", self.id(), self.state())
    }
}

/// Non-owning view of a greenlet, valid for the borrow it came from
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BorrowedGreenlet<'a>(Borrowed<'a, GreenletNode>);

impl BorrowedGreenlet<'_> {
    pub fn id(self) -> u64 {
        self.0.get().id
    }

    pub fn state(self) -> Lifecycle {
        self.0.get().state()
    }

    pub fn is_main(self) -> bool {
        self.0.get().is_main
    }

    /// Take a reference of our own, to keep past the borrow
    pub fn to_owned(self) -> Greenlet {
        Greenlet(self.0.to_owned_ref())
    }
}

impl fmt::Debug for BorrowedGreenlet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BorrowedGreenlet({}, {})", self.id(), self.state())
    }
}

/// What a tracer is told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Switch,
    Throw,
}

/// Greenlet factory, which can be used in order to configure the
/// properties of a new greenlet.
#[derive(Default)]
pub struct Builder {
    parent: Option<Greenlet>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Parent to receive the result (default: the current greenlet)
    pub fn parent(mut self, parent: &Greenlet) -> Builder {
        self.parent = Some(parent.clone());
        self
    }

    /// Stack size in bytes (default: `SPRIG_STACK_SIZE`, at least 64 KiB)
    pub fn stack_size(mut self, size: usize) -> Builder {
        self.stack_size = Some(size);
        self
    }

    /// Create the greenlet. No stack is allocated until it first runs.
    pub fn spawn(
        self,
        entry: impl FnOnce(Owned<Object>) -> SwitchResult + 'static,
    ) -> Result<Greenlet, GreenletError> {
        let ts = current_thread_state()?;
        let parent = match self.parent {
            Some(parent) if parent.0.owner != ts.key() => {
                return Err(GreenletError::InvalidTarget(
                    "parent belongs to another thread".to_string(),
                ));
            }
            Some(parent) => parent,
            None => ts.current_greenlet()?,
        };
        let stack_size = self
            .stack_size
            .unwrap_or_else(|| config().stack_size)
            .max(MIN_STACK_SIZE);
        let greenlet = GreenletNode::allocate(
            ts.key(),
            std::sync::Arc::downgrade(&ts),
            Some(parent),
            Some(Box::new(entry)),
            stack_size,
            false,
        );
        TOTAL_SPAWNED.fetch_add(1, Ordering::Relaxed);
        debug!(id = greenlet.id(), stack_size, "spawned greenlet");
        Ok(greenlet)
    }
}

// Free-function interface

/// Create an unstarted greenlet under `parent` (default: the current one).
pub fn create(
    parent: Option<&Greenlet>,
    entry: impl FnOnce(Owned<Object>) -> SwitchResult + 'static,
) -> Result<Greenlet, GreenletError> {
    let builder = Builder::new();
    let builder = match parent {
        Some(parent) => builder.parent(parent),
        None => builder,
    };
    builder.spawn(entry)
}

pub fn switch(target: &Greenlet, payload: Owned<Object>) -> SwitchResult {
    target.switch(payload)
}

pub fn throw_into(target: &Greenlet, err: ErrorDescriptor) -> SwitchResult {
    target.throw(err)
}

pub fn kill(target: &Greenlet) -> Result<(), GreenletError> {
    target.kill()
}

pub fn is_dead(target: &Greenlet) -> bool {
    target.is_dead()
}

pub fn get_parent(target: &Greenlet) -> Option<Greenlet> {
    target.parent()
}
