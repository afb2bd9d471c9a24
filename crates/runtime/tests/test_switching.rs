//! Switch protocol tests
//!
//! Round trips, the identity and redirect laws, death propagation, error
//! and panic delivery, host state isolation and tracing.

use sprig_runtime::host::{
    call_depth, enter_call, has_pending_error, set_pending_error, take_pending_error,
};
use sprig_runtime::{
    BorrowedGreenlet, Builder, ErrorDescriptor, ErrorKind, Greenlet, GreenletError, Lifecycle,
    Object, Owned, RefCounted, TraceEvent, Value, current_greenlet, main_greenlet, set_trace,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn int(obj: &Object) -> i64 {
    obj.value().as_int().expect("expected an Int payload")
}

#[test]
fn test_round_trip() {
    init_tracing();
    let main = main_greenlet().unwrap();
    let seen = Rc::new(RefCell::new(Vec::new()));

    let g = {
        let main = main.clone();
        let seen = Rc::clone(&seen);
        Greenlet::spawn(move |arg| {
            seen.borrow_mut().push(int(&arg));
            let back = main.switch(Object::int(2))?;
            seen.borrow_mut().push(int(&back));
            Ok(Object::none())
        })
        .unwrap()
    };

    let first = g.switch(Object::int(1)).unwrap();
    assert_eq!(int(&first), 2);
    assert_eq!(g.state(), Lifecycle::Suspended);
    assert_eq!(main.state(), Lifecycle::Running);

    let last = g.switch(Object::int(3)).unwrap();
    assert!(last.value().is_none());
    assert!(g.is_dead());
    assert_eq!(*seen.borrow(), vec![1, 3]);
}

#[test]
fn test_identity_law() {
    let current = current_greenlet().unwrap();
    let payload = Object::string("same");
    let out = current.switch(payload.clone()).unwrap();
    assert!(Owned::ptr_eq(&out, &payload));
    assert_eq!(current.state(), Lifecycle::Running);
}

#[test]
fn test_redirect_law() {
    let main = main_greenlet().unwrap();
    let b_slot: Rc<RefCell<Option<Greenlet>>> = Rc::new(RefCell::new(None));

    let a = {
        let main = main.clone();
        let b_slot = Rc::clone(&b_slot);
        Greenlet::spawn(move |_| {
            let b = Greenlet::spawn(|arg| Ok(arg))?;
            b.switch(Object::none())?;
            assert!(b.is_dead());
            *b_slot.borrow_mut() = Some(b);
            // parked here until someone switches to the dead child
            let redirected = main.switch(Object::string("parked"))?;
            Ok(Object::new(Value::List(vec![redirected])))
        })
        .unwrap()
    };

    let parked = a.switch(Object::none()).unwrap();
    assert_eq!(parked.value().as_str(), Some("parked"));

    let b = b_slot.borrow_mut().take().unwrap();
    assert_eq!(b.parent(), Some(a.clone()));
    let out = b.switch(Object::int(7)).unwrap();
    // the payload reached A unchanged; A wrapped it and finished
    assert_eq!(out.value(), &Value::List(vec![Object::int(7)]));
    assert!(a.is_dead());
}

#[test]
fn test_end_to_end_main_a_b() {
    let main = main_greenlet().unwrap();
    let log = Rc::new(RefCell::new(Vec::<String>::new()));

    let a = {
        let main = main.clone();
        let log = Rc::clone(&log);
        Greenlet::spawn(move |arg| {
            log.borrow_mut().push(format!("A got {}", arg.value()));
            let b = Greenlet::spawn(|arg| {
                assert_eq!(arg.value().as_int(), Some(10));
                Ok(Object::int(20))
            })?;
            assert_eq!(b.parent().map(|p| p.id()), current_greenlet().ok().map(|c| c.id()));
            let from_b = b.switch(Object::int(10))?;
            log.borrow_mut().push(format!("A got {}", from_b.value()));
            assert!(b.is_dead());
            main.switch(Object::string("done"))?;
            Ok(Object::none())
        })
        .unwrap()
    };

    let out = a.switch(Object::string("go")).unwrap();
    assert_eq!(out.value().as_str(), Some("done"));
    assert_eq!(*log.borrow(), vec!["A got \"go\"", "A got 20"]);

    // let A finish
    a.switch(Object::none()).unwrap();
    assert!(a.is_dead());
}

#[test]
fn test_single_running_invariant() {
    let all: Rc<RefCell<Vec<Greenlet>>> = Rc::new(RefCell::new(vec![main_greenlet().unwrap()]));
    let samples = Rc::new(RefCell::new(Vec::new()));

    let sample = {
        let all = Rc::clone(&all);
        let samples = Rc::clone(&samples);
        move || {
            let running = all
                .borrow()
                .iter()
                .filter(|g| g.state() == Lifecycle::Running)
                .count();
            samples.borrow_mut().push(running);
        }
    };

    let a = {
        let sample = sample.clone();
        let all = Rc::clone(&all);
        Greenlet::spawn(move |_| {
            sample();
            let b = {
                let sample = sample.clone();
                Greenlet::spawn(move |arg| {
                    sample();
                    Ok(arg)
                })?
            };
            all.borrow_mut().push(b.clone());
            b.switch(Object::none())?;
            sample();
            Ok(Object::none())
        })
        .unwrap()
    };
    all.borrow_mut().push(a.clone());

    sample();
    a.switch(Object::none()).unwrap();
    sample();

    assert_eq!(samples.borrow().len(), 5);
    assert!(samples.borrow().iter().all(|&n| n == 1));
}

#[test]
fn test_error_propagates_to_parent() {
    let g = Greenlet::spawn(|_| {
        Err(ErrorDescriptor::new("ValueError", "bad payload").into())
    })
    .unwrap();

    let err = g.switch(Object::none()).unwrap_err();
    let desc = err.descriptor().expect("propagated error");
    assert_eq!(desc.kind, ErrorKind::Raised("ValueError".to_string()));
    assert_eq!(desc.message, "bad payload");
    assert!(g.is_dead());
}

#[test]
fn test_panic_becomes_propagated_error() {
    let g = Greenlet::spawn(|_| panic!("greenlet blew up")).unwrap();
    match g.switch(Object::none()) {
        Err(GreenletError::Propagated(desc)) => {
            assert_eq!(desc.kind, ErrorKind::Panic);
            assert_eq!(desc.message, "greenlet blew up");
        }
        other => panic!("expected propagated panic, got {:?}", other),
    }
    assert!(g.is_dead());
    assert_eq!(main_greenlet().unwrap().state(), Lifecycle::Running);
}

#[test]
fn test_throw_into_suspended() {
    let main = main_greenlet().unwrap();
    let g = {
        let main = main.clone();
        Greenlet::spawn(move |_| {
            main.switch(Object::none())?;
            unreachable!("the throw raises at the switch above");
        })
        .unwrap()
    };
    g.switch(Object::none()).unwrap();

    let err = g.throw(ErrorDescriptor::new("KeyError", "missing")).unwrap_err();
    assert_eq!(err.to_string(), "KeyError: missing");
    assert!(g.is_dead());
}

#[test]
fn test_throw_exit_finishes_normally() {
    let main = main_greenlet().unwrap();
    let g = {
        let main = main.clone();
        Greenlet::spawn(move |_| {
            main.switch(Object::none())?;
            Ok(Object::int(1))
        })
        .unwrap()
    };
    g.switch(Object::none()).unwrap();

    let out = g.throw(ErrorDescriptor::exit()).unwrap();
    assert!(out.value().is_none());
    assert!(g.is_dead());
}

#[test]
fn test_error_crosses_two_levels() {
    let outer = Greenlet::spawn(|_| {
        let inner = Greenlet::spawn(|_| Err(ErrorDescriptor::new("IOError", "disk").into()))?;
        // not caught here: `?` lets it continue to our parent
        inner.switch(Object::none())?;
        Ok(Object::none())
    })
    .unwrap();

    let err = outer.switch(Object::none()).unwrap_err();
    assert_eq!(err.to_string(), "IOError: disk");
    assert!(outer.is_dead());
}

#[test]
fn test_host_state_is_per_greenlet() {
    let main = main_greenlet().unwrap();
    let _depth = enter_call();
    set_pending_error(ErrorDescriptor::new("MainError", "main's own"));

    let g = {
        let main = main.clone();
        Greenlet::spawn(move |_| {
            assert!(!has_pending_error());
            assert_eq!(call_depth(), 0);

            set_pending_error(ErrorDescriptor::new("ChildError", "child's own"));
            let _depth = enter_call();
            let _depth2 = enter_call();
            main.switch(Object::none())?;

            assert_eq!(call_depth(), 2);
            let mine = take_pending_error().expect("child error restored");
            assert_eq!(mine.message, "child's own");
            Ok(Object::none())
        })
        .unwrap()
    };

    g.switch(Object::none()).unwrap();
    assert_eq!(call_depth(), 1);
    let mine = take_pending_error().expect("main error restored");
    assert_eq!(mine.message, "main's own");

    g.switch(Object::none()).unwrap();
    assert!(g.is_dead());
    assert!(!has_pending_error());
}

#[test]
fn test_tracer_sees_switches() {
    let events: Arc<Mutex<Vec<(TraceEvent, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&events);
    let previous = set_trace(Some(Arc::new(
        move |event: TraceEvent, origin: BorrowedGreenlet<'_>, target: BorrowedGreenlet<'_>| {
            recorder
                .lock()
                .unwrap()
                .push((event, origin.id(), target.id()));
        },
    )))
    .unwrap();
    assert!(previous.is_none());

    let main = main_greenlet().unwrap();
    let g = {
        let main = main.clone();
        Greenlet::spawn(move |_| {
            main.switch(Object::none())?;
            Ok(Object::none())
        })
        .unwrap()
    };
    g.switch(Object::none()).unwrap();
    g.throw(ErrorDescriptor::exit()).unwrap();

    let removed = set_trace(None).unwrap();
    assert!(removed.is_some());

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            (TraceEvent::Switch, main.id(), g.id()),
            (TraceEvent::Switch, g.id(), main.id()),
            (TraceEvent::Throw, main.id(), g.id()),
            (TraceEvent::Switch, g.id(), main.id()),
        ]
    );
}

#[test]
fn test_tracer_sees_death_with_error_as_throw() {
    let events: Arc<Mutex<Vec<(TraceEvent, u64, u64, Lifecycle)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&events);
    set_trace(Some(Arc::new(
        move |event: TraceEvent, origin: BorrowedGreenlet<'_>, target: BorrowedGreenlet<'_>| {
            recorder
                .lock()
                .unwrap()
                .push((event, origin.id(), target.id(), origin.state()));
        },
    )))
    .unwrap();

    let main = main_greenlet().unwrap();
    let g = Greenlet::spawn(|_| Err(ErrorDescriptor::new("ValueError", "no").into())).unwrap();
    assert!(g.switch(Object::none()).is_err());
    set_trace(None).unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            (TraceEvent::Switch, main.id(), g.id(), Lifecycle::Running),
            (TraceEvent::Throw, g.id(), main.id(), Lifecycle::Dead),
        ]
    );
}

fn breaks_on_death(_: TraceEvent, origin: BorrowedGreenlet<'_>, _: BorrowedGreenlet<'_>) {
    if origin.state() == Lifecycle::Dead {
        panic!("tracer broke while a greenlet was dying");
    }
}

#[test]
fn test_panicking_tracer_does_not_block_death() {
    set_trace(Some(Arc::new(breaks_on_death))).unwrap();
    let g = Greenlet::spawn(|arg| Ok(arg)).unwrap();
    let out = g.switch(Object::int(8)).unwrap();
    set_trace(None).unwrap();

    assert_eq!(int(&out), 8);
    assert!(g.is_dead());
    assert_eq!(main_greenlet().unwrap().state(), Lifecycle::Running);
}

fn broken_tracer(_: TraceEvent, _: BorrowedGreenlet<'_>, _: BorrowedGreenlet<'_>) {
    panic!("tracer broke");
}

#[test]
fn test_panicking_tracer_fails_switch() {
    set_trace(Some(Arc::new(broken_tracer))).unwrap();
    let g = Greenlet::spawn(|arg| Ok(arg)).unwrap();

    let err = g.switch(Object::none()).unwrap_err();
    assert!(matches!(err, GreenletError::Propagated(_)));
    assert_eq!(g.state(), Lifecycle::Unstarted);
    assert_eq!(main_greenlet().unwrap().state(), Lifecycle::Running);

    set_trace(None).unwrap();
    g.switch(Object::none()).unwrap();
    assert!(g.is_dead());
}

#[test]
fn test_payload_refcount_across_switch() {
    let payload = Object::int(99);
    let g = Greenlet::spawn(|arg| Ok(arg)).unwrap();
    let out = g.switch(payload.clone()).unwrap();
    assert!(Owned::ptr_eq(&out, &payload));
    drop(out);
    assert_eq!(payload.refcount(), 1);
}

#[test]
fn test_explicit_parent_receives_result() {
    let main = main_greenlet().unwrap();
    let collector = {
        let main = main.clone();
        Greenlet::spawn(move |_| {
            // first delivery comes from the child finishing
            let from_child = main.switch(Object::none())?;
            main.switch(from_child)?;
            Ok(Object::none())
        })
        .unwrap()
    };
    collector.switch(Object::none()).unwrap();

    let child = Builder::new()
        .parent(&collector)
        .spawn(|_| Ok(Object::string("for collector")))
        .unwrap();
    let relayed = child.switch(Object::none()).unwrap();
    assert_eq!(relayed.value().as_str(), Some("for collector"));
    assert!(child.is_dead());

    collector.switch(Object::none()).unwrap();
    assert!(collector.is_dead());
}
