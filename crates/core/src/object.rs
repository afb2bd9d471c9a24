//! Host objects
//!
//! A minimal manually reference-counted object model. Each object is a heap
//! box holding a [`Value`], an atomic reference count and an optional
//! finalizer that runs when the last reference is released.
//!
//! Finalizers are arbitrary code. They may run from inside runtime
//! operations (for example when a payload is dropped after a switch) and may
//! themselves call back into the runtime.

use crate::refs::{Owned, RefCounted};
use crate::value::Value;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};
use tracing::trace;

/// Code run once when an object's last reference goes away.
pub type Finalizer = Box<dyn FnOnce() + Send + Sync>;

// Lifetime counters (diagnostics only; relaxed ordering)
static OBJECTS_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static OBJECTS_FREED: AtomicU64 = AtomicU64::new(0);

pub struct Object {
    refcnt: AtomicUsize,
    value: Value,
    finalizer: Option<Finalizer>,
}

impl Object {
    /// Allocate a new object; the returned handle owns its only reference.
    pub fn new(value: Value) -> Owned<Object> {
        Self::allocate(value, None)
    }

    /// Allocate an object whose finalizer runs when it is released.
    pub fn with_finalizer(value: Value, finalizer: impl FnOnce() + Send + Sync + 'static) -> Owned<Object> {
        Self::allocate(value, Some(Box::new(finalizer)))
    }

    pub fn none() -> Owned<Object> {
        Self::new(Value::None)
    }

    pub fn int(n: i64) -> Owned<Object> {
        Self::new(Value::Int(n))
    }

    pub fn string(s: impl Into<String>) -> Owned<Object> {
        Self::new(Value::String(s.into()))
    }

    fn allocate(value: Value, finalizer: Option<Finalizer>) -> Owned<Object> {
        let boxed = Box::new(Object {
            refcnt: AtomicUsize::new(1),
            value,
            finalizer,
        });
        OBJECTS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
        // Safety: Box::into_raw never returns null and the box starts with
        // one reference, which the handle takes over.
        unsafe { Owned::from_raw(NonNull::new_unchecked(Box::into_raw(boxed))) }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

unsafe impl RefCounted for Object {
    fn incref(&self) {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn decref(ptr: NonNull<Self>) {
        let prev = unsafe { ptr.as_ref() }.refcnt.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "object reference count underflow");
        if prev != 1 {
            return;
        }
        fence(Ordering::Acquire);

        // Safety: the count reached zero, so this is the last reference and
        // the box was created by Object::allocate.
        let mut boxed = unsafe { Box::from_raw(ptr.as_ptr()) };
        let finalizer = boxed.finalizer.take();
        if let Some(finalize) = finalizer {
            trace!(value = boxed.value.type_name(), "running object finalizer");
            finalize();
        }
        drop(boxed);
        OBJECTS_FREED.fetch_add(1, Ordering::Relaxed);
    }

    fn refcount(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("refcnt", &self.refcount())
            .field("value", &self.value)
            .finish()
    }
}

impl PartialEq<Value> for Object {
    fn eq(&self, other: &Value) -> bool {
        &self.value == other
    }
}

/// Object lifetime counters across all threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStats {
    pub allocated: u64,
    pub freed: u64,
}

impl ObjectStats {
    pub fn live(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

pub fn object_stats() -> ObjectStats {
    ObjectStats {
        allocated: OBJECTS_ALLOCATED.load(Ordering::Relaxed),
        freed: OBJECTS_FREED.load(Ordering::Relaxed),
    }
}
