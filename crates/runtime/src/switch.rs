//! Switch engine
//!
//! Moves execution from the running greenlet (the origin) to a target on
//! the same thread:
//!
//! 1. Resolve the target. A dead target redirects to its nearest live
//!    ancestor; a target on another thread is rejected. Switching to
//!    yourself hands the payload straight back.
//! 2. Capture the origin: save its host state, mark it Suspended.
//! 3. Establish the target: an unstarted one gets a stack and a context that
//!    enters [`greenlet_main`]; a suspended one is resumed where it left off.
//! 4. Make the target current, hand over the payload, transfer.
//!
//! Every failure is detected before step 2, so a failed switch leaves the
//! caller exactly as it was.
//!
//! A greenlet whose entry returns or raises is marked Dead and leaves
//! through the same transfer, carrying its result to its nearest live
//! ancestor. Its stack cannot be unmapped while still in use, so it goes to
//! the cleanup queue and is released once the ancestor has landed.
//!
//! No `tracing` span is entered here: span guards live on a thread-local
//! stack that a context transfer would tear apart.

use crate::cleanup::Deferred;
use crate::context::{Context, prepare, switch_context};
use crate::error::{GreenletError, SwitchResult};
use crate::greenlet::{Entry, Greenlet, GreenletNode, Lifecycle, TraceEvent};
use crate::registry::current_thread_state;
use crate::stack::StackSegment;
use crate::thread_state::ThreadState;
use sprig_core::{ErrorDescriptor, Object, Owned, format_panic_payload, restore_host_state, save_host_state};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

pub static TOTAL_SWITCHES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Departure {
    /// Origin is suspended and will be resumed by a later switch
    Suspend,
    /// Origin just died; this transfer never returns
    Dying,
}

/// Explicit switch or throw from the running greenlet to `target`.
pub(crate) fn switch_to(target: &Greenlet, payload: SwitchResult, event: TraceEvent) -> SwitchResult {
    let ts = current_thread_state()?;
    let target = resolve(&ts, target)?;
    let origin = ts.current_greenlet()?;
    if origin != target {
        run_tracer(&ts, event, &origin, &target)?;
    }
    drop(origin);
    transfer(&ts, target, payload, Departure::Suspend)
}

/// Kill `target` from the running greenlet.
///
/// An unstarted greenlet dies without running. A suspended one is resumed
/// with an exit error, temporarily reparented to the caller so that its
/// death returns here.
pub(crate) fn kill(target: &Greenlet) -> Result<(), GreenletError> {
    let ts = current_thread_state()?;
    if target.node().owner() != ts.key() {
        return Err(GreenletError::InvalidTarget(
            "cannot kill a greenlet of another thread".to_string(),
        ));
    }
    match target.state() {
        Lifecycle::Dead => Ok(()),
        Lifecycle::Unstarted => {
            target.node().finish_unstarted();
            debug!(id = target.id(), "killed unstarted greenlet");
            Ok(())
        }
        Lifecycle::Running => Err(GreenletError::InvalidState(
            "cannot kill the running greenlet".to_string(),
        )),
        Lifecycle::Suspended if target.is_main() => Err(GreenletError::InvalidState(
            "cannot kill a main greenlet".to_string(),
        )),
        Lifecycle::Suspended => {
            let current = ts.current_greenlet()?;
            drop(ts);
            let saved = target.node().replace_parent(Some(current));
            let outcome = switch_to(
                target,
                Err(GreenletError::Propagated(ErrorDescriptor::exit())),
                TraceEvent::Throw,
            );
            let killer = target.node().replace_parent(saved);
            drop(killer);

            match outcome {
                _ if !target.is_dead() => {
                    warn!(id = target.id(), "greenlet survived kill");
                    Err(GreenletError::InvalidState(
                        "greenlet did not exit when killed".to_string(),
                    ))
                }
                Err(err) if !err.is_exit() => Err(err),
                _ => {
                    debug!(id = target.id(), "killed suspended greenlet");
                    Ok(())
                }
            }
        }
    }
}

fn resolve(ts: &ThreadState, target: &Greenlet) -> Result<Greenlet, GreenletError> {
    if target.node().owner() != ts.key() {
        return Err(GreenletError::InvalidTarget(
            "cannot switch to a greenlet of another thread".to_string(),
        ));
    }
    if !target.is_dead() {
        return Ok(target.clone());
    }
    live_ancestor(target.node()).ok_or_else(|| {
        GreenletError::InvalidTarget("dead greenlet has no live ancestor".to_string())
    })
}

/// Nearest non-dead node above `node`
fn live_ancestor(node: &GreenletNode) -> Option<Greenlet> {
    let mut cursor = node.parent();
    while let Some(candidate) = cursor {
        if !candidate.is_dead() {
            return Some(candidate);
        }
        cursor = candidate.parent();
    }
    None
}

fn run_tracer(
    ts: &ThreadState,
    event: TraceEvent,
    origin: &Greenlet,
    target: &Greenlet,
) -> Result<(), GreenletError> {
    let Some(tracer) = ts.tracer() else {
        return Ok(());
    };
    catch_unwind(AssertUnwindSafe(|| {
        tracer(event, origin.borrow(), target.borrow())
    }))
    .map_err(|panic| {
        let msg = format_panic_payload(panic.as_ref());
        warn!("switch tracer panicked: {}", msg);
        GreenletError::Propagated(ErrorDescriptor::panic(format!("tracer panicked: {}", msg)))
    })
}

/// Hand control and `payload` to `target`.
///
/// With `Departure::Suspend` this returns the payload of whatever switch
/// later resumes the origin. With `Departure::Dying` it returns only if the
/// transfer could not be started.
fn transfer(
    ts: &ThreadState,
    target: Greenlet,
    payload: SwitchResult,
    departure: Departure,
) -> SwitchResult {
    let origin_ptr = ts.current_ptr();
    if target.node_ptr() == origin_ptr {
        return payload;
    }

    let payload = match (target.state(), payload) {
        (Lifecycle::Unstarted, Err(err)) => {
            return throw_into_unstarted(ts, target, err, departure);
        }
        (_, payload) => payload,
    };

    let fresh_stack = match target.state() {
        Lifecycle::Suspended => None,
        Lifecycle::Unstarted => Some(StackSegment::allocate(target.node().stack_size())?),
        Lifecycle::Running => {
            return Err(GreenletError::InvalidState(
                "target is already running".to_string(),
            ));
        }
        Lifecycle::Dead => {
            return Err(GreenletError::InvalidTarget("target is dead".to_string()));
        }
    };

    // Nothing below can fail.
    // Safety: the running node is anchored until we retire its anchor, and
    // after that it is only released through the cleanup queue.
    let origin = unsafe { &*origin_ptr };
    let target_ptr = target.node_ptr();
    // Safety: `target` keeps the node alive, then its anchor (or, for main,
    // the thread state) does
    let target_node = unsafe { &*target_ptr };

    origin.store_host(save_host_state());
    if departure == Departure::Suspend {
        origin.set_state(Lifecycle::Suspended);
    }

    if let Some(stack) = fresh_stack {
        let top = stack.top();
        target_node.install_stack(stack);
        // Safety: the stack was just mapped and belongs to the target
        unsafe { prepare(&mut *target_node.context_ptr(), top, greenlet_main) };
    }
    target_node.set_pending(payload);
    target_node.set_state(Lifecycle::Running);
    ts.set_current(target_ptr);
    ts.record_switch();
    TOTAL_SWITCHES.fetch_add(1, Ordering::Relaxed);
    trace!(from = origin.id(), to = target_node.id(), "switch");

    // main is owned by the thread state and is never anchored
    let spare = if target.is_main() {
        Some(target)
    } else {
        target_node.set_anchor(target);
        None
    };
    let retired = origin.take_anchor();
    if departure == Departure::Suspend {
        ts.begin_flight();
    }
    // may hand the origin to the cleanup queue; it is released after landing
    drop(retired);
    drop(spare);

    let load = target_node.context_ptr() as *const Context;
    match departure {
        Departure::Suspend => {
            // Safety: both contexts belong to live nodes of this thread
            unsafe { switch_context(origin.context_ptr(), load) };
        }
        Departure::Dying => {
            // the dead node may be freed as soon as the target lands
            let mut scratch = Context::new();
            unsafe { switch_context(&mut scratch, load) };
            fatal("a dead greenlet was resumed");
        }
    }

    // Resumed: whoever switched here made us current and left a payload.
    let result = origin.take_pending();
    restore_host_state(origin.take_host());
    ts.land();
    result.unwrap_or_else(|| {
        Err(GreenletError::InvalidState(
            "greenlet resumed without a payload".to_string(),
        ))
    })
}

/// An error thrown into a greenlet that never ran kills it on the spot;
/// the error (an exit becomes `None`) continues to its parent.
fn throw_into_unstarted(
    ts: &ThreadState,
    target: Greenlet,
    err: GreenletError,
    departure: Departure,
) -> SwitchResult {
    debug!(id = target.id(), "error thrown into unstarted greenlet");
    target.node().finish_unstarted();
    let payload = if err.is_exit() {
        Ok(Object::none())
    } else {
        Err(err)
    };
    let parent = live_ancestor(target.node()).ok_or_else(|| {
        GreenletError::InvalidTarget("dead greenlet has no live ancestor".to_string())
    })?;
    drop(target);
    transfer(ts, parent, payload, departure)
}

/// Base frame of every greenlet stack.
extern "C" fn greenlet_main() -> ! {
    let (ts, node, result) = run_current();
    // Safety: the thread state outlives every greenlet running on the
    // thread, and the node is anchored until finish retires the anchor.
    unsafe { finish(&*ts, &*node, result) }
}

/// Run the entry of the greenlet that was just switched into. Everything
/// owned here is dropped on return; nothing may be live on this stack when
/// the final transfer leaves it.
#[inline(never)]
fn run_current() -> (*const ThreadState, *const GreenletNode, SwitchResult) {
    let ts = match current_thread_state() {
        Ok(ts) => ts,
        Err(err) => fatal(&format!("greenlet started without thread state: {}", err)),
    };
    let node_ptr = ts.current_ptr() as *const GreenletNode;
    // Safety: the node we were switched into is current and anchored
    let node = unsafe { &*node_ptr };

    let arg = node.take_pending();
    let entry = node.take_entry();
    ts.land();

    let result = match (entry, arg) {
        (Some(entry), Some(Ok(arg))) => run_entry(node.id(), entry, arg),
        (_, Some(Err(err))) => Err(err),
        _ => Err(GreenletError::InvalidState(
            "greenlet started without an entry".to_string(),
        )),
    };
    let result = match result {
        Err(err) if err.is_exit() => Ok(Object::none()),
        other => other,
    };
    (Arc::as_ptr(&ts), node_ptr, result)
}

fn run_entry(id: u64, entry: Entry, arg: Owned<Object>) -> SwitchResult {
    trace!(id, "greenlet entry starting");
    match catch_unwind(AssertUnwindSafe(move || entry(arg))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = format_panic_payload(panic.as_ref());
            warn!(id, "greenlet panicked: {}", msg);
            Err(GreenletError::Propagated(ErrorDescriptor::panic(msg)))
        }
    }
}

/// Mark the node dead and leave its stack for good.
fn finish(ts: &ThreadState, node: &GreenletNode, result: SwitchResult) -> ! {
    node.mark_dead();
    debug!(id = node.id(), ok = result.is_ok(), "greenlet finished");
    ts.begin_flight();
    if let Some(stack) = node.take_stack()
        && let Err(item) = ts.cleanup().push(Deferred::Stack(stack))
    {
        // queue closes only at teardown, which runs on main
        error!("cleanup queue closed under a running greenlet; leaking its stack");
        std::mem::forget(item);
    }

    let mut payload = result;
    let mut target = live_ancestor(node).or_else(|| ts.main_greenlet());
    loop {
        let Some(next) = target else {
            fatal("dying greenlet has no live ancestor");
        };
        let fell_back_to_main = next.is_main();
        trace_departure(ts, node, &next, &payload);
        payload = transfer(ts, next, payload, Departure::Dying);
        if fell_back_to_main {
            fatal("could not return to the main greenlet");
        }
        error!(id = node.id(), "returning to parent failed; delivering to main");
        target = ts.main_greenlet();
    }
}

/// Tell the tracer about a dying greenlet's return to its ancestor. That
/// transfer cannot be refused, so a panicking tracer is only logged.
fn trace_departure(ts: &ThreadState, node: &GreenletNode, target: &Greenlet, payload: &SwitchResult) {
    let event = if payload.is_ok() {
        TraceEvent::Switch
    } else {
        TraceEvent::Throw
    };
    // Safety: the dying node is anchored until the transfer retires it
    let origin = unsafe { Greenlet::from_node_ptr(NonNull::from(node)) };
    let _ = run_tracer(ts, event, &origin, target);
}

/// Abort after an unrecoverable runtime fault.
fn fatal(msg: &str) -> ! {
    error!("fatal greenlet runtime error: {}", msg);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::greenlet::Builder;
    use crate::registry::main_greenlet;
    use sprig_core::Value;

    #[test]
    fn test_identity_switch() {
        let main = main_greenlet().unwrap();
        let out = main.switch(Object::int(5)).unwrap();
        assert_eq!(out.value(), &Value::Int(5));
        assert_eq!(main.state(), Lifecycle::Running);
    }

    #[test]
    fn test_return_value_reaches_parent() {
        let g = Greenlet::spawn(|arg| {
            let n = arg.value().as_int().unwrap_or(0);
            Ok(Object::int(n * 2))
        })
        .unwrap();
        let out = g.switch(Object::int(21)).unwrap();
        assert_eq!(out.value().as_int(), Some(42));
        assert!(g.is_dead());
    }

    #[test]
    fn test_dead_stack_is_released() {
        let g = Greenlet::spawn(|arg| Ok(arg)).unwrap();
        g.switch(Object::none()).unwrap();
        let ts = current_thread_state().unwrap();
        assert!(ts.cleanup().is_empty());
        assert!(g.node().take_stack().is_none());
    }

    #[test]
    fn test_live_ancestor_skips_dead() {
        let a = Greenlet::spawn(|arg| Ok(arg)).unwrap();
        let b = Builder::new().parent(&a).spawn(|arg| Ok(arg)).unwrap();
        a.kill().unwrap();
        let main = main_greenlet().unwrap();
        assert_eq!(live_ancestor(b.node()), Some(main));
    }

    #[test]
    fn test_oversized_stack_fails_synchronously() {
        let g = Builder::new()
            .stack_size(usize::MAX)
            .spawn(|arg| Ok(arg))
            .unwrap();
        let err = g.switch(Object::none()).unwrap_err();
        assert!(matches!(err, GreenletError::Allocation(_)));
        assert_eq!(g.state(), Lifecycle::Unstarted);
        assert_eq!(main_greenlet().unwrap().state(), Lifecycle::Running);
    }
}
