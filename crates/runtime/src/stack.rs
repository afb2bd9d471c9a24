//! Greenlet stack segments
//!
//! Each started greenlet runs on its own mmap'd stack with a PROT_NONE guard
//! page at the low end, so an overflow faults instead of silently writing
//! into a neighbour. Segments are released with munmap when dropped, which
//! may happen on any thread.

use crate::error::GreenletError;
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

// Lifetime counters (diagnostics)
pub static STACKS_MAPPED: AtomicU64 = AtomicU64::new(0);
pub static STACKS_UNMAPPED: AtomicU64 = AtomicU64::new(0);
/// Bytes currently mapped for greenlet stacks, guard pages included
pub static STACK_BYTES: AtomicU64 = AtomicU64::new(0);

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// System page size (falls back to 4 KiB if sysconf fails)
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

pub struct StackSegment {
    base: NonNull<u8>,
    /// Total mapping length including the guard page
    len: usize,
    guard: usize,
}

// The mapping is plain memory; ownership moves with the segment.
unsafe impl Send for StackSegment {}

impl StackSegment {
    /// Map a stack with at least `size` usable bytes plus one guard page.
    pub fn allocate(size: usize) -> Result<StackSegment, GreenletError> {
        let page = page_size();
        let usable = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or_else(|| GreenletError::Allocation(format!("stack size {} overflows", size)))?;
        let len = usable
            .checked_add(page)
            .ok_or_else(|| GreenletError::Allocation(format!("stack size {} overflows", size)))?;

        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK | libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            warn!("mmap of {} byte stack failed: {}", len, err);
            return Err(GreenletError::Allocation(format!(
                "mmap of {} bytes failed: {}",
                len, err
            )));
        }
        let Some(base) = NonNull::new(addr as *mut u8) else {
            return Err(GreenletError::Allocation("mmap returned null".to_string()));
        };

        // Stacks grow down: the guard sits at the lowest page.
        if unsafe { libc::mprotect(addr, page, libc::PROT_NONE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(addr, len) };
            return Err(GreenletError::Allocation(format!(
                "mprotect of guard page failed: {}",
                err
            )));
        }

        STACKS_MAPPED.fetch_add(1, Ordering::Relaxed);
        STACK_BYTES.fetch_add(len as u64, Ordering::Relaxed);
        trace!(len, "mapped greenlet stack");
        Ok(StackSegment {
            base,
            len,
            guard: page,
        })
    }

    /// One past the highest usable address
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Usable bytes (excluding the guard page)
    pub fn usable(&self) -> usize {
        self.len - self.guard
    }

    pub fn contains(&self, addr: usize) -> bool {
        let lo = self.base.as_ptr() as usize + self.guard;
        let hi = self.base.as_ptr() as usize + self.len;
        (lo..hi).contains(&addr)
    }
}

impl Drop for StackSegment {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if rc != 0 {
            warn!(
                "munmap of greenlet stack failed: {}",
                std::io::Error::last_os_error()
            );
        }
        STACKS_UNMAPPED.fetch_add(1, Ordering::Relaxed);
        STACK_BYTES.fetch_sub(self.len as u64, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for StackSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackSegment")
            .field("base", &self.base)
            .field("usable", &self.usable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_pages() {
        let seg = StackSegment::allocate(10_000).unwrap();
        assert_eq!(seg.usable() % page_size(), 0);
        assert!(seg.usable() >= 10_000);
    }

    #[test]
    fn test_stack_is_writable_below_top() {
        let seg = StackSegment::allocate(64 * 1024).unwrap();
        unsafe {
            let p = seg.top().sub(8) as *mut u64;
            p.write(0xdead_beef);
            assert_eq!(p.read(), 0xdead_beef);
        }
        assert!(seg.contains(seg.top() as usize - 1));
        assert!(!seg.contains(seg.top() as usize));
    }

    #[test]
    fn test_oversized_request_fails() {
        let err = StackSegment::allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, GreenletError::Allocation(_)));
    }

    #[test]
    fn test_segment_moves_across_threads() {
        let seg = StackSegment::allocate(64 * 1024).unwrap();
        std::thread::spawn(move || drop(seg)).join().unwrap();
    }
}
