//! Machine context switching
//!
//! One primitive per architecture: [`switch_context`] saves the callee-saved
//! registers and stack pointer of the running code into `save`, loads the
//! ones in `load` and returns into whatever `load` describes. A context that
//! was never run is set up by [`prepare`] so that the first switch into it
//! calls the given entry function at the top of a fresh stack.
//!
//! Everything above this module (stacks, lifecycle, payloads) is
//! architecture-independent.

#[cfg(not(unix))]
compile_error!("sprig-runtime requires a unix target (mmap-backed stacks)");

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{Context, prepare, switch_context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{Context, prepare, switch_context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("sprig-runtime supports x86_64 and aarch64 only");

/// Function a fresh context starts in. It must never return.
pub type EntryFn = extern "C" fn() -> !;
