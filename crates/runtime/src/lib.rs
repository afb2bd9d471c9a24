//! Sprig Runtime: stackful greenlets
//!
//! A greenlet is a coroutine with its own call stack. Any number of them
//! share one OS thread, and control moves between them only when one
//! explicitly switches to another, carrying a payload. The greenlets of a
//! thread form a tree rooted at that thread's main greenlet: when one
//! finishes, its result goes to its parent as if the parent had been
//! switched to.
//!
//! ```ignore
//! use sprig_runtime::{Greenlet, Object};
//!
//! let doubler = Greenlet::spawn(|arg| {
//!     let n = arg.value().as_int().unwrap_or(0);
//!     Ok(Object::int(n * 2))
//! })?;
//! let out = doubler.switch(Object::int(21))?;
//! assert_eq!(out.value().as_int(), Some(42));
//! ```
//!
//! # Modules
//!
//! - `greenlet`: Nodes, handles, lifecycle, spawning
//! - `switch`: The switch engine (transfer, kill, death propagation)
//! - `context`: Per-architecture register save/restore
//! - `stack`: mmap'd stack segments with guard pages
//! - `thread_state`: Per-thread state (main, current, tracer)
//! - `registry`: Thread registration and the global thread map
//! - `cleanup`: Deferred release queue and safe points
//! - `config`: Environment configuration
//! - `diagnostics`: Counters, SIGQUIT dump, JSON stats

pub mod cleanup;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod greenlet;
pub mod registry;
pub mod stack;
mod switch;
pub mod thread_state;

pub use cleanup::{drain_deferred, with_deferred_cleanup};
pub use config::{RuntimeConfig, config};
pub use error::{GreenletError, SwitchResult};
pub use greenlet::{
    BorrowedGreenlet, Builder, Entry, Greenlet, Lifecycle, TraceEvent, create, get_parent,
    is_dead, kill, switch, throw_into,
};
pub use registry::{
    ThreadKey, current_greenlet, current_thread_state, main_greenlet, on_thread_exit,
    on_thread_start, registry,
};
pub use thread_state::{ThreadState, ThreadSummary, Tracer, get_trace, set_trace};

// Diagnostics
pub use diagnostics::{RuntimeStats, dump_diagnostics, stats};
#[cfg(feature = "report-json")]
pub use diagnostics::stats_json;
#[cfg(feature = "diagnostics")]
pub use diagnostics::install_signal_handler;

// Host object model
pub use sprig_core::host;
pub use sprig_core::{
    ApiResult, Borrowed, ErrorDescriptor, ErrorKind, Object, OutParam, Owned, RefCounted, Value,
};
