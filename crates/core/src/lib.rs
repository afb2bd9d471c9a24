//! Sprig Core: host object model for the sprig greenlet runtime
//!
//! This crate holds everything the runtime needs from its host that is not
//! about switching stacks: reference-counted objects, the ownership wrappers
//! used to move them across switch boundaries, error descriptors and the
//! per-thread host state that each greenlet saves and restores.
//!
//! # Modules
//!
//! - `refs`: Owned / Borrowed / OutParam reference wrappers
//! - `object`: Reference-counted host objects with finalizers
//! - `value`: What an object carries (None, Int, String, List, ...)
//! - `error`: Error descriptors and the exit kind
//! - `host`: Thread-local pending error and call depth, with snapshots

pub mod error;
pub mod host;
pub mod object;
pub mod refs;
pub mod value;

pub use error::{EXIT, ErrorDescriptor, ErrorKind, format_panic_payload};
pub use host::{
    CallGuard, HostSnapshot, call_depth, clear_pending_error, enter_call, fetch_pending_error,
    has_pending_error, restore_host_state, save_host_state, set_pending_error,
    take_pending_error,
};
pub use object::{Finalizer, Object, ObjectStats, object_stats};
pub use refs::{ApiResult, Borrowed, OutParam, Owned, RefCounted};
pub use value::Value;
