//! Thread-state registry
//!
//! Maps each registered thread to its [`ThreadState`]. A thread registers on
//! its first runtime call (or explicitly via [`on_thread_start`]) and is
//! retired when it exits: a thread-local guard runs [`on_thread_exit`]'s
//! teardown from its destructor, so threads that never call the hook still
//! release their tree.
//!
//! The map is the only mutable structure shared between threads, and it
//! is only written at registration and retirement. The running thread
//! reaches its own state through the thread-local guard without touching
//! the map.

use crate::config::config;
use crate::error::GreenletError;
use crate::greenlet::Greenlet;
use crate::thread_state::{ThreadState, ThreadSummary};
use dashmap::DashMap;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

// Thread lifecycle counters (diagnostics)
pub static ACTIVE_THREADS: AtomicUsize = AtomicUsize::new(0);
pub static PEAK_THREADS: AtomicUsize = AtomicUsize::new(0);
pub static TOTAL_THREADS: AtomicU64 = AtomicU64::new(0);

/// Global counter for thread-state keys. Starts at 1; every registration
/// gets a fresh key, so a thread that re-registers starts a new tree.
static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of one thread registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(u64);

impl ThreadKey {
    pub(crate) fn next() -> ThreadKey {
        ThreadKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

pub struct ThreadStateRegistry {
    states: DashMap<ThreadKey, Arc<ThreadState>>,
}

impl ThreadStateRegistry {
    fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    fn insert(&self, ts: Arc<ThreadState>) {
        self.states.insert(ts.key(), ts);
    }

    fn remove(&self, key: ThreadKey) -> Option<Arc<ThreadState>> {
        self.states.remove(&key).map(|(_, ts)| ts)
    }

    pub fn get(&self, key: ThreadKey) -> Option<Arc<ThreadState>> {
        self.states.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Summaries of all registered threads, ordered by key
    pub fn summaries(&self) -> Vec<ThreadSummary> {
        let mut all: Vec<ThreadSummary> = self
            .states
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        all.sort_by_key(|s| s.thread);
        all
    }
}

static REGISTRY: OnceLock<ThreadStateRegistry> = OnceLock::new();

/// Get the global thread-state registry
pub fn registry() -> &'static ThreadStateRegistry {
    REGISTRY.get_or_init(ThreadStateRegistry::new)
}

enum HookState {
    Unregistered,
    Active(Arc<ThreadState>),
    /// Retiring, or the thread-local guard already ran
    Exited,
}

struct ThreadHook {
    state: RefCell<HookState>,
}

impl Drop for ThreadHook {
    fn drop(&mut self) {
        let state = std::mem::replace(self.state.get_mut(), HookState::Exited);
        if let HookState::Active(ts) = state {
            retire(ts);
        }
    }
}

thread_local! {
    static HOOK: ThreadHook = const {
        ThreadHook {
            state: RefCell::new(HookState::Unregistered),
        }
    };

    // Key of this thread's live registration. No destructor, so it stays
    // readable while other thread-locals are torn down.
    static CURRENT_KEY: Cell<Option<ThreadKey>> = const { Cell::new(None) };
}

/// Key of the calling thread's registration, if it has one
pub fn current_thread_key() -> Option<ThreadKey> {
    CURRENT_KEY.try_with(Cell::get).ok().flatten()
}

fn register() -> Arc<ThreadState> {
    let ts = ThreadState::new(ThreadKey::next());
    registry().insert(Arc::clone(&ts));
    let _ = CURRENT_KEY.try_with(|k| k.set(Some(ts.key())));

    TOTAL_THREADS.fetch_add(1, Ordering::Relaxed);
    let active = ACTIVE_THREADS.fetch_add(1, Ordering::Relaxed) + 1;
    PEAK_THREADS.fetch_max(active, Ordering::Relaxed);
    debug!(thread = ts.key().as_u64(), "thread registered");

    if config().diagnostics {
        #[cfg(feature = "diagnostics")]
        crate::diagnostics::install_signal_handler();
    }
    ts
}

fn retire(ts: Arc<ThreadState>) {
    let key = ts.key();
    registry().remove(key);
    ts.teardown();
    let _ = CURRENT_KEY.try_with(|k| k.set(None));
    ACTIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
    debug!(thread = key.as_u64(), "thread retired");
}

/// The calling thread's state, registering the thread on first use.
pub fn current_thread_state() -> Result<Arc<ThreadState>, GreenletError> {
    HOOK.try_with(|hook| {
        let mut state = hook.state.borrow_mut();
        match &*state {
            HookState::Active(ts) => Ok(Arc::clone(ts)),
            HookState::Exited => Err(GreenletError::InvalidState(
                "thread has left the greenlet runtime".to_string(),
            )),
            HookState::Unregistered => {
                let ts = register();
                *state = HookState::Active(Arc::clone(&ts));
                Ok(ts)
            }
        }
    })
    .unwrap_or_else(|_| {
        Err(GreenletError::InvalidState(
            "thread-local runtime state already destroyed".to_string(),
        ))
    })
}

/// The greenlet running on the calling thread
pub fn current_greenlet() -> Result<Greenlet, GreenletError> {
    current_thread_state()?.current_greenlet()
}

/// The calling thread's main greenlet
pub fn main_greenlet() -> Result<Greenlet, GreenletError> {
    current_thread_state()?.main_greenlet().ok_or_else(|| {
        GreenletError::InvalidState("main greenlet already torn down".to_string())
    })
}

/// Register the calling thread now instead of on first use.
pub fn on_thread_start() -> Result<Greenlet, GreenletError> {
    main_greenlet()
}

/// Tear down the calling thread's tree and remove it from the registry.
///
/// Must be called from main. Suspended greenlets are freed without being
/// unwound. A later runtime call on the same thread starts a new tree.
pub fn on_thread_exit() -> Result<(), GreenletError> {
    let retiring = HOOK
        .try_with(|hook| {
            let mut state = hook.state.borrow_mut();
            if let HookState::Active(ts) = &*state {
                let on_main = ts
                    .main_greenlet()
                    .is_some_and(|main| main.node_ptr() == ts.current_ptr());
                if !on_main {
                    return Err(GreenletError::InvalidState(
                        "on_thread_exit must be called from the main greenlet".to_string(),
                    ));
                }
            }
            match std::mem::replace(&mut *state, HookState::Exited) {
                HookState::Active(ts) => Ok(Some(ts)),
                _ => Ok(None),
            }
        })
        .unwrap_or(Ok(None))?;

    if let Some(ts) = retiring {
        retire(ts);
    }
    let _ = HOOK.try_with(|hook| {
        let mut state = hook.state.borrow_mut();
        if matches!(*state, HookState::Exited) {
            *state = HookState::Unregistered;
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_touch_registers() {
        std::thread::spawn(|| {
            assert!(current_thread_key().is_none());
            let main = current_greenlet().unwrap();
            assert!(main.is_main());
            let key = current_thread_key().unwrap();
            assert!(registry().get(key).is_some());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_thread_exit_removes_entry() {
        let key = std::thread::spawn(|| {
            on_thread_start().unwrap();
            current_thread_key().unwrap()
        })
        .join()
        .unwrap();
        assert!(registry().get(key).is_none());
    }

    #[test]
    fn test_explicit_exit_then_reregister() {
        std::thread::spawn(|| {
            let first = on_thread_start().unwrap();
            let key = current_thread_key().unwrap();
            on_thread_exit().unwrap();
            assert!(first.is_dead());
            assert!(registry().get(key).is_none());

            let second = main_greenlet().unwrap();
            assert_ne!(first, second);
            assert_ne!(current_thread_key(), Some(key));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_main_is_stable() {
        let a = main_greenlet().unwrap();
        let b = main_greenlet().unwrap();
        assert_eq!(a, b);
        assert_eq!(current_greenlet().unwrap(), a);
    }
}
