//! Execution contexts and the stack-transfer primitive.
//!
//! A [`Context`] is the minimal resumable state of a suspended call frame:
//! instruction pointer, stack pointer, callee-saved registers, and a link
//! to the parent context higher up the same stack. It is not a separate
//! allocation: the context lives *at the stack pointer* of the frame it
//! describes, so `ctx as *mut u8` is also the low bound of the frame, and
//! the byte range `[ctx, ctx.parent + size_of::<Context>())` is the frame
//! image that migrates between processes.
//!
//! This module is the only place in the crate permitted to touch raw
//! registers or switch stacks. Everything above it composes exactly four
//! operations:
//!
//! - [`save_context_with_call`]: push a resumable snapshot of the current
//!   frame onto the stack and call a handler with it. The call returns
//!   either when the handler returns normally or when somebody
//!   [`resume_context`]s the snapshot, possibly on another process.
//! - [`resume_context`]: restore a snapshot's stack pointer and return
//!   into it. Never returns to its caller.
//! - [`execute_on_stack`]: move execution below a given stack address and
//!   call a handler there. Used before overwriting a stack range with a
//!   restored frame image. Never returns.
//! - [`call_on_new_stack`]: run a function on a fresh stack (the
//!   iso-address stack) and return to the original stack when it finishes.
//!
//! Only x86_64 System V is implemented; ports add another arch block here
//! without touching the rest of the runtime.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("isoweave's context-switch primitive currently requires x86_64");

use std::arch::naked_asm;

/// Largest frame image the runtime will queue or migrate. Frames are small
/// by construction (a few live call frames between suspension points); a
/// larger frame indicates a corrupted parent link.
pub const MAX_FRAME_SIZE: usize = 128 * 1024;

/// System V AMD64 red zone, skipped before pushing a snapshot.
pub const RED_ZONE: usize = 128;

/// Saved register state of a suspended frame.
///
/// Field order is the layout `save_context_with_call` pushes; the struct is
/// read back by offset from assembly, so the order is load-bearing.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub rip: *mut u8,
    pub rsp: *mut u8,
    pub rbp: *mut u8,
    pub rbx: *mut u8,
    pub r12: *mut u8,
    pub r13: *mut u8,
    pub r14: *mut u8,
    pub r15: *mut u8,
    /// Context of the parent frame, higher on the same stack. Null only
    /// for the root context of the main task.
    pub parent: *mut Context,
}

impl Context {
    #[inline]
    pub fn instr_ptr(&self) -> *mut u8 {
        self.rip
    }

    #[inline]
    pub fn stack_ptr(&self) -> *mut u8 {
        self.rsp
    }

    /// Low bound of this frame's byte image. The context itself sits at
    /// the stack pointer.
    #[inline]
    pub fn top_ptr(&self) -> *mut u8 {
        self.rsp
    }

    /// Size of the frame image: everything from this context up to and
    /// including the parent context.
    #[inline]
    pub fn stack_size(&self) -> usize {
        debug_assert!(!self.parent.is_null());
        let size = self.parent as usize + std::mem::size_of::<Context>() - self.top_ptr() as usize;
        debug_assert!(size > 0 && size < MAX_FRAME_SIZE);
        size
    }
}

/// Heap-owned snapshot of a fully suspended task: its context plus a byte
/// copy of its frame image ("partial stack").
///
/// Created by [`pack_context`], handed around as a raw single-owner
/// pointer, and consumed exactly once by the resume that copies the bytes
/// back into the iso-address range and frees it.
pub struct SavedContext {
    pub is_main_task: bool,
    pub ip: *mut u8,
    pub sp: *mut u8,
    pub ctx: *mut Context,
    pub stack_top: *mut u8,
    pub stack: Box<[u8]>,
}

/// Pack a suspended frame into a heap snapshot.
///
/// # Safety
/// `ctx` must be a live context produced by [`save_context_with_call`]
/// whose frame image is currently resident on this process's stack.
pub unsafe fn pack_context(ctx: *mut Context, is_main_task: bool) -> *mut SavedContext {
    let top = (*ctx).top_ptr();
    let size = (*ctx).stack_size();

    let mut stack = vec![0u8; size].into_boxed_slice();
    std::ptr::copy_nonoverlapping(top, stack.as_mut_ptr(), size);

    tracing::trace!(
        frame_base = ?top,
        frame_size = size,
        is_main_task,
        "packed suspended frame"
    );

    Box::into_raw(Box::new(SavedContext {
        is_main_task,
        ip: (*ctx).instr_ptr(),
        sp: (*ctx).stack_ptr(),
        ctx,
        stack_top: top,
        stack,
    }))
}

/// Handler invoked by [`save_context_with_call`] with the fresh context.
pub type ContextHandler = unsafe extern "C" fn(*mut Context, *mut u8, *mut u8);

/// Handler invoked on a switched stack; must never return.
pub type StackHandler = unsafe extern "C" fn(*mut u8, *mut u8, *mut u8, *mut u8);

/// Snapshot the current frame and call `f(ctx, arg0, arg1)`.
///
/// The snapshot is pushed onto the current stack: red zone skip, alignment
/// word, `parent`, callee-saved registers, resume stack pointer, resume
/// instruction pointer. The context address handed to `f` is the final
/// stack pointer, so the context is the lowest object of the frame image.
///
/// Control comes back here on two paths that converge on the same
/// register-restore epilogue:
/// - `f` returns normally (the continuation was consumed locally), or
/// - some process copies the frame image into its own iso-address range
///   and calls [`resume_context`] on the context.
///
/// # Safety
/// `f` must treat the context as borrowed from the current stack; `parent`
/// must be null or point to a live context higher on this stack. Callers
/// must not hold references to memory below the current stack pointer.
#[unsafe(naked)]
pub unsafe extern "C" fn save_context_with_call(
    _parent: *mut Context,
    _f: ContextHandler,
    _arg0: *mut u8,
    _arg1: *mut u8,
) {
    naked_asm!(
        // skip the red zone, then align for SIMD spills
        "sub rsp, 128",
        "mov rax, rsp",
        "and rsp, -16",
        "push rax",
        // parent field of the context
        "push rdi",
        // callee-saved registers
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push rbx",
        "push rbp",
        // resume stack pointer (= context address once rip is pushed)
        "lea rax, [rsp - 16]",
        "push rax",
        // resume instruction pointer
        "lea rax, [rip + 2f]",
        "push rax",
        // f(ctx, arg0, arg1); rsp is the context
        "mov r8, rsi",
        "mov rdi, rsp",
        "mov rsi, rdx",
        "mov rdx, rcx",
        "call r8",
        // normal return: step over the rip slot
        "add rsp, 8",
        // resume lands here with rsp at the rsp slot
        "2:",
        "add rsp, 8",
        "pop rbp",
        "pop rbx",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        // parent slot
        "add rsp, 8",
        // undo alignment and red zone skip
        "pop rsp",
        "add rsp, 128",
        "ret",
    )
}

/// Restore `ctx` and return into it. Never returns to the caller.
///
/// # Safety
/// `ctx`'s frame image must be resident at the addresses it was saved at
/// (restored there first if it was packed or stolen).
#[unsafe(naked)]
pub unsafe extern "C" fn resume_context(_ctx: *mut Context) -> ! {
    naked_asm!(
        // the context address is the suspended stack pointer; ret pops the
        // saved rip and the epilogue in save_context_with_call restores the
        // callee-saved registers from the frame image
        "mov rsp, rdi",
        "ret",
    )
}

#[unsafe(naked)]
unsafe extern "C" fn switch_stack_call(
    _p0: *mut u8,
    _p1: *mut u8,
    _p2: *mut u8,
    _p3: *mut u8,
    _stack_ptr: *mut u8,
    _f: StackHandler,
) -> ! {
    naked_asm!(
        "mov rsp, r8",
        "and rsp, -16",
        "call r9",
        // the handler must resume another context
        "ud2",
    )
}

/// Move execution below `stack_ptr` (or below the current stack pointer,
/// whichever is lower) and call `f(p0, p1, p2, p3)` there.
///
/// Used before a stack range is overwritten by a restored frame image: the
/// handler's own frames land strictly below the range being written.
///
/// # Safety
/// `f` must never return, and must copy anything it needs out of its
/// pointer arguments before writing to the stack range above `stack_ptr`.
#[inline]
pub unsafe fn execute_on_stack(
    f: StackHandler,
    p0: *mut u8,
    p1: *mut u8,
    p2: *mut u8,
    p3: *mut u8,
    stack_ptr: *mut u8,
) -> ! {
    let top = current_stack_pointer().sub(RED_ZONE);
    let sp = if top < stack_ptr { top } else { stack_ptr };
    switch_stack_call(p0, p1, p2, p3, sp, f)
}

/// Run `f(p0, p1, p2, p3)` on the stack whose (16-byte aligned) initial
/// stack pointer is `stack_ptr`, then return to the current stack.
///
/// # Safety
/// `stack_ptr` must be the high end of a mapped, writable region large
/// enough for everything `f` does.
#[unsafe(naked)]
pub unsafe extern "C" fn call_on_new_stack(
    _p0: *mut u8,
    _p1: *mut u8,
    _p2: *mut u8,
    _p3: *mut u8,
    _stack_ptr: *mut u8,
    _f: StackHandler,
) {
    naked_asm!(
        "mov rax, rsp",
        "mov rsp, r8",
        // alignment for xmm register accesses
        "sub rsp, 8",
        "push rax",
        "call r9",
        "pop rsp",
        "ret",
    )
}

/// The current stack pointer.
#[inline(always)]
pub fn current_stack_pointer() -> *mut u8 {
    let sp: *mut u8;
    // SAFETY: reads a register, no memory effects.
    unsafe {
        std::arch::asm!("mov {}, rsp", out(reg) sp, options(nomem, preserves_flags));
    }
    sp
}
