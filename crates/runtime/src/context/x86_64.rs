//! x86_64 System V context switch

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved register state of a suspended context
///
/// Layout is fixed: the offsets are hard-coded in `switch_context`.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// SSE control/status (callee-saved control bits)
    pub mxcsr: u32,
    /// x87 control word
    pub fpucw: u32,
}

impl Context {
    pub const fn new() -> Self {
        Context {
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: 0,
            fpucw: 0,
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.rsp as usize
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
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr [rdi + 0x38]",
        "fnstcw [rdi + 0x3c]",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr [rsi + 0x38]",
        "fldcw [rsi + 0x3c]",
        // resumed context: back to its switch_context caller
        // fresh context: pops the entry address written by prepare
        "ret",
    );
}

/// Set up `ctx` so the first switch into it calls `entry` on the stack
/// ending at `top`.
///
/// # Safety
/// `top` must be the one-past-the-end address of a writable stack with room
/// for at least two words.
pub unsafe fn prepare(ctx: &mut Context, top: *mut u8, entry: EntryFn) {
    let top = (top as usize) & !15;
    let sp = top - 16;
    unsafe {
        // fake return address: entry never returns
        ((top - 8) as *mut u64).write(0);
        (sp as *mut u64).write(entry as usize as u64);
    }
    *ctx = Context {
        rsp: sp as u64,
        mxcsr: 0x1f80,
        fpucw: 0x037f,
        ..Context::new()
    };
}
