//! AArch64 (AAPCS64) context switch

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved register state of a suspended context
///
/// Layout is fixed: the offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// x19..=x28, x29 (frame pointer), x30 (link register)
    pub gp: [u64; 12],
    pub sp: u64,
    /// low halves of v8..=v15
    pub fp: [u64; 8],
}

impl Context {
    pub const fn new() -> Self {
        Context {
            gp: [0; 12],
            sp: 0,
            fp: [0; 8],
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.sp as usize
    }
}

/// Save the running context into `save` and resume `load`.
///
/// Returns when some later switch loads `save` again.
///
/// # Safety
/// Both pointers must be valid. `load` must come from a previous
/// `switch_context` or from [`prepare`], and its stack must still be mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        // x30 is the resume address, or the entry function for a fresh context
        "ret",
    );
}

/// Set up `ctx` so the first switch into it calls `entry` on the stack
/// ending at `top`.
///
/// # Safety
/// `top` must be the one-past-the-end address of a writable stack.
pub unsafe fn prepare(ctx: &mut Context, top: *mut u8, entry: EntryFn) {
    let top = (top as usize) & !15;
    let mut gp = [0u64; 12];
    // x29 = 0 terminates frame-pointer walks; x30 = entry
    gp[11] = entry as usize as u64;
    *ctx = Context {
        gp,
        sp: top as u64,
        fp: [0; 8],
    };
}
