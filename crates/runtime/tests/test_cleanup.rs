//! Deferred cleanup: releases that fall due mid-operation are queued and
//! run in order at the next safe point

use serial_test::serial;
use sprig_runtime::{
    Builder, Greenlet, Object, Value, current_thread_state, drain_deferred, main_greenlet, stats,
    with_deferred_cleanup,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

fn finished(index: i64, log: &Arc<Mutex<Vec<i64>>>) -> Greenlet {
    let g = Greenlet::spawn(|arg| Ok(arg)).unwrap();
    let log = Arc::clone(log);
    g.set_data(Some(Object::with_finalizer(Value::Int(index), move || {
        log.lock().unwrap().push(index)
    })));
    g.switch(Object::none()).unwrap();
    assert!(g.is_dead());
    g
}

#[test]
fn test_releases_wait_for_safe_point() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let greenlets: Vec<Greenlet> = (0..5).map(|i| finished(i, &log)).collect();
    let ts = current_thread_state().unwrap();
    assert!(ts.cleanup().is_empty());

    with_deferred_cleanup(|| {
        for g in greenlets {
            drop(g);
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(ts.cleanup().len(), 5);
        // not a safe point while the scope is open
        assert_eq!(drain_deferred(), 0);
    });

    assert!(ts.cleanup().is_empty());
    assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_nested_scopes_drain_at_outermost() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let outer = finished(0, &log);
    let inner = finished(1, &log);

    with_deferred_cleanup(|| {
        drop(outer);
        with_deferred_cleanup(|| drop(inner));
        assert!(log.lock().unwrap().is_empty());
    });
    assert_eq!(*log.lock().unwrap(), vec![0, 1]);
}

#[test]
fn test_outside_scope_release_is_immediate() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let g = finished(7, &log);
    drop(g);
    assert_eq!(*log.lock().unwrap(), vec![7]);
    assert_eq!(drain_deferred(), 0);
}

#[test]
fn test_scope_lands_when_closure_panics() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let g = finished(3, &log);
    let ts = current_thread_state().unwrap();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _: () = with_deferred_cleanup(|| {
            drop(g);
            panic!("scope body failed");
        });
    }));
    assert!(outcome.is_err());
    assert!(!ts.in_flight());
    assert_eq!(*log.lock().unwrap(), vec![3]);
}

#[test]
#[serial]
fn test_counters_track_deferred_and_drained() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let greenlets: Vec<Greenlet> = (0..3).map(|i| finished(i, &log)).collect();
    let before = stats();

    with_deferred_cleanup(|| drop(greenlets));

    let after = stats();
    assert!(after.cleanups_deferred >= before.cleanups_deferred + 3);
    assert!(after.cleanups_drained >= before.cleanups_drained + 3);
    assert!(after.greenlets_finished >= 3);
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn test_release_during_switch_waits_for_landing() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let main = main_greenlet().unwrap();
    let child_slot: Rc<RefCell<Option<Greenlet>>> = Rc::new(RefCell::new(None));

    let g = {
        let log = Arc::clone(&log);
        let main = main.clone();
        let child_slot = Rc::clone(&child_slot);
        Greenlet::spawn(move |_| {
            let frame_log = Arc::clone(&log);
            let _frame = Object::with_finalizer(Value::None, move || {
                frame_log.lock().unwrap().push("frame")
            });
            // the child's parent link is the last handle besides our anchor
            let child = child_slot.borrow_mut().take().unwrap();
            child.set_parent(&main)?;
            drop(child);
            log.lock().unwrap().push("switching");
            main.switch(Object::none())?;
            Ok(Object::none())
        })
        .unwrap()
    };
    {
        let log = Arc::clone(&log);
        g.set_data(Some(Object::with_finalizer(Value::None, move || {
            log.lock().unwrap().push("data")
        })));
    }
    let child = Builder::new().parent(&g).spawn(|arg| Ok(arg)).unwrap();
    child.kill().unwrap();
    *child_slot.borrow_mut() = Some(child.clone());
    drop(g);

    let before = stats().cleanups_deferred;
    // dead child redirects to its live parent, which starts `g`
    let out = child.switch(Object::none()).unwrap();
    assert!(out.value().is_none());

    assert!(stats().cleanups_deferred > before);
    assert_eq!(*log.lock().unwrap(), vec!["switching", "frame", "data"]);
    assert!(current_thread_state().unwrap().cleanup().is_empty());
}
