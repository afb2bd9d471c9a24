//! Runtime diagnostics for production debugging
//!
//! Provides a SIGQUIT (kill -3) handler that dumps runtime statistics to
//! stderr, similar to JVM thread dumps, without stopping the process.
//!
//! ## Usage
//!
//! ```bash
//! SPRIG_DIAGNOSTICS=1 ./my-program &
//! kill -3 <pid>
//! ```
//!
//! ## Signal Safety
//!
//! dump_diagnostics() does I/O and takes locks, which is not allowed inside
//! a signal handler. The handler is therefore a dedicated thread that waits
//! on signal-hook's iterator and does the dump from ordinary thread context.

use crate::cleanup::{TOTAL_DEFERRED, TOTAL_DRAINED};
use crate::greenlet::{LIVE_NODES, TOTAL_FINISHED, TOTAL_SPAWNED};
use crate::registry::{ACTIVE_THREADS, PEAK_THREADS, TOTAL_THREADS, registry};
use crate::stack::{STACK_BYTES, STACKS_MAPPED, STACKS_UNMAPPED};
use crate::switch::TOTAL_SWITCHES;
use crate::thread_state::ThreadSummary;
use serde::Serialize;
use std::sync::atomic::Ordering;

/// Maximum number of threads listed individually in the dump
const THREAD_DISPLAY_LIMIT: usize = 20;

/// Snapshot of every runtime counter
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub threads_active: usize,
    pub threads_peak: usize,
    pub threads_total: u64,
    pub greenlets_spawned: u64,
    pub greenlets_finished: u64,
    /// Allocated nodes, main greenlets included
    pub greenlets_live: u64,
    pub switches: u64,
    pub stacks_mapped: u64,
    pub stacks_unmapped: u64,
    pub stack_bytes: u64,
    pub cleanups_deferred: u64,
    pub cleanups_drained: u64,
    pub objects_live: u64,
    pub threads: Vec<ThreadSummary>,
}

/// Collect the current counters. Values are read independently and may be
/// mutually inconsistent while other threads are switching.
pub fn stats() -> RuntimeStats {
    RuntimeStats {
        threads_active: ACTIVE_THREADS.load(Ordering::Relaxed),
        threads_peak: PEAK_THREADS.load(Ordering::Relaxed),
        threads_total: TOTAL_THREADS.load(Ordering::Relaxed),
        greenlets_spawned: TOTAL_SPAWNED.load(Ordering::Relaxed),
        greenlets_finished: TOTAL_FINISHED.load(Ordering::Relaxed),
        greenlets_live: LIVE_NODES.load(Ordering::Relaxed),
        switches: TOTAL_SWITCHES.load(Ordering::Relaxed),
        stacks_mapped: STACKS_MAPPED.load(Ordering::Relaxed),
        stacks_unmapped: STACKS_UNMAPPED.load(Ordering::Relaxed),
        stack_bytes: STACK_BYTES.load(Ordering::Relaxed),
        cleanups_deferred: TOTAL_DEFERRED.load(Ordering::Relaxed),
        cleanups_drained: TOTAL_DRAINED.load(Ordering::Relaxed),
        objects_live: sprig_core::object_stats().live(),
        threads: registry().summaries(),
    }
}

/// Runtime statistics as a JSON document
#[cfg(feature = "report-json")]
pub fn stats_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&stats())
}

/// Install the SIGQUIT signal handler for diagnostics
///
/// Called at the first thread registration when `SPRIG_DIAGNOSTICS` is set.
/// Safe to call multiple times (idempotent).
#[cfg(feature = "diagnostics")]
pub fn install_signal_handler() {
    use std::sync::Once;
    static SIGNAL_HANDLER_INIT: Once = Once::new();

    SIGNAL_HANDLER_INIT.call_once(|| {
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGQUIT;
            use signal_hook::iterator::Signals;

            let mut signals = match Signals::new([SIGQUIT]) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!("could not register SIGQUIT handler: {}", err);
                    return;
                }
            };

            let spawned = std::thread::Builder::new()
                .name("sprig-diagnostics".to_string())
                .spawn(move || {
                    for sig in signals.forever() {
                        if sig == SIGQUIT {
                            dump_diagnostics();
                        }
                    }
                });
            if let Err(err) = spawned {
                tracing::warn!("could not start diagnostics thread: {}", err);
            }
        }
    });
}

/// Dump runtime diagnostics to stderr
///
/// Can be called directly or triggered via SIGQUIT.
pub fn dump_diagnostics() {
    use std::io::Write;

    let stats = stats();
    let mut out = std::io::stderr().lock();

    let _ = writeln!(out, "\n=== Sprig Runtime Diagnostics ===");
    let _ = writeln!(out, "Timestamp: {:?}", std::time::SystemTime::now());

    let _ = writeln!(out, "\n[Threads]");
    let _ = writeln!(out, "  Active:    {}", stats.threads_active);
    let _ = writeln!(out, "  Peak:      {} (high-water mark)", stats.threads_peak);
    let _ = writeln!(out, "  Total:     {}", stats.threads_total);

    let _ = writeln!(out, "\n[Greenlets]");
    let _ = writeln!(out, "  Spawned:   {} (total)", stats.greenlets_spawned);
    let _ = writeln!(out, "  Finished:  {} (total)", stats.greenlets_finished);
    let _ = writeln!(out, "  Live:      {} (including mains)", stats.greenlets_live);
    let _ = writeln!(out, "  Switches:  {}", stats.switches);

    let _ = writeln!(out, "\n[Stacks]");
    let _ = writeln!(out, "  Mapped:    {} (total)", stats.stacks_mapped);
    let _ = writeln!(out, "  Unmapped:  {} (total)", stats.stacks_unmapped);
    let _ = writeln!(out, "  In use:    {}", format_bytes(stats.stack_bytes));

    let _ = writeln!(out, "\n[Deferred cleanup]");
    let _ = writeln!(out, "  Deferred:  {} (total)", stats.cleanups_deferred);
    let _ = writeln!(out, "  Drained:   {} (total)", stats.cleanups_drained);
    let pending = stats
        .cleanups_deferred
        .saturating_sub(stats.cleanups_drained);
    if pending > 0 {
        let _ = writeln!(out, "  Pending:   {}", pending);
    }

    let _ = writeln!(out, "\n[Registered Threads]");
    if stats.threads.is_empty() {
        let _ = writeln!(out, "  (no threads registered)");
    } else {
        for summary in stats.threads.iter().take(THREAD_DISPLAY_LIMIT) {
            let _ = writeln!(
                out,
                "  Thread #{:<6} running greenlet #{:<8} switches={} deferred={}{}",
                summary.thread,
                summary.current,
                summary.switches,
                summary.deferred,
                if summary.in_flight { " (in flight)" } else { "" }
            );
        }
        if stats.threads.len() > THREAD_DISPLAY_LIMIT {
            let _ = writeln!(
                out,
                "  ... and {} more threads",
                stats.threads.len() - THREAD_DISPLAY_LIMIT
            );
        }
    }

    let _ = writeln!(out, "\n[Objects]");
    let _ = writeln!(out, "  Live:      {}", stats.objects_live);

    let _ = writeln!(out, "\n=== End Diagnostics ===\n");
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
