//! Per-thread host execution state
//!
//! The host keeps a pending error and a call depth per OS thread. Each
//! greenlet needs its own view of both, so the switch path snapshots them
//! when a greenlet is suspended and puts them back when it resumes. A fresh
//! greenlet starts with no pending error and depth zero.

use crate::error::{ErrorDescriptor, ErrorKind};
use crate::object::Object;
use crate::refs::OutParam;
use std::cell::{Cell, RefCell};
use tracing::warn;

thread_local! {
    static PENDING_ERROR: RefCell<Option<ErrorDescriptor>> = const { RefCell::new(None) };
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Set the pending error, replacing any previous one
pub fn set_pending_error(err: ErrorDescriptor) {
    PENDING_ERROR.with(|e| *e.borrow_mut() = Some(err));
}

/// Take (and clear) the pending error
pub fn take_pending_error() -> Option<ErrorDescriptor> {
    PENDING_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_pending_error() -> bool {
    PENDING_ERROR.with(|e| e.borrow().is_some())
}

pub fn clear_pending_error() {
    PENDING_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Fetch the pending error in pieces.
///
/// The attached value, if any, is written into `value`; the caller owns it
/// from then on and it is released with the slot unless taken or disowned.
/// A slot that is already filled keeps its contents and the new value is
/// dropped.
pub fn fetch_pending_error(value: &mut OutParam<Object>) -> Option<(ErrorKind, String)> {
    let err = take_pending_error()?;
    if let Some(attached) = err.value {
        if let Err(rejected) = value.fill(attached) {
            warn!("out-parameter already filled; dropping the error's attached value");
            drop(rejected);
        }
    }
    Some((err.kind, err.message))
}

/// Current host call depth
pub fn call_depth() -> usize {
    CALL_DEPTH.with(Cell::get)
}

/// Guard for one level of host call depth
pub struct CallGuard {
    _private: (),
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Enter one level of host call depth until the guard is dropped
pub fn enter_call() -> CallGuard {
    CALL_DEPTH.with(|d| d.set(d.get() + 1));
    CallGuard { _private: () }
}

/// Saved host state of a suspended greenlet
#[derive(Debug, Default)]
pub struct HostSnapshot {
    error: Option<ErrorDescriptor>,
    depth: usize,
}

impl HostSnapshot {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Move the thread's host state into a snapshot, leaving it reset.
pub fn save_host_state() -> HostSnapshot {
    let mut value = OutParam::new();
    let error = fetch_pending_error(&mut value).map(|(kind, message)| ErrorDescriptor {
        kind,
        message,
        value: value.take(),
    });
    let depth = CALL_DEPTH.with(|d| d.replace(0));
    HostSnapshot { error, depth }
}

/// Install a snapshot as the thread's host state.
pub fn restore_host_state(snapshot: HostSnapshot) {
    PENDING_ERROR.with(|e| *e.borrow_mut() = snapshot.error);
    CALL_DEPTH.with(|d| d.set(snapshot.depth));
}
