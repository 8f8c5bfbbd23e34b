//! Raw machine-context switch between fiber stacks.
//!
//! The original runtime this crate reimplements snapshots a fiber's
//! registers with the signal-mask-preserving non-local-jump facility
//! (`sigsetjmp`/`siglongjmp`) and relies on a volatile-locals trick to place
//! the new stack's top. That idiom does not exist in safe, portable Rust, so
//! this module replaces it with a small purpose-built switch, in the same
//! spirit as a boost-context-style fiber switch: save the callee-saved
//! registers of the outgoing fiber onto its own stack, swap the stack
//! pointer, and restore the callee-saved registers of the incoming fiber
//! from its stack. The contract is unchanged: one fiber's machine state in,
//! another's out.
//!
//! Only x86_64 is implemented; other ISAs would add a sibling module behind
//! `cfg(target_arch = ...)`, the same way the original dispatches to
//! `epoll.inc`/`kqueue.inc`/`poll.inc` per platform.

use std::arch::naked_asm;

/// A suspended fiber's saved stack pointer. Opaque outside this module;
/// `sched` only ever stores and hands it back to [`switch`].
#[derive(Debug, Clone, Copy)]
pub struct Context(*mut u8);

impl Context {
    /// A context that must never be switched into (used as a placeholder
    /// before a fiber's stack has been initialized).
    pub const fn invalid() -> Self {
        Context(std::ptr::null_mut())
    }
}

/// Prepare a freshly mapped stack so that the first [`switch`] into it calls
/// `entry(arg)`. `stack_top` must be the one-past-the-end address of the
/// usable stack region (16-byte aligned, as all mmap'd pages are).
///
/// # Safety
/// `stack_top` must point to a writable region of at least 64 bytes
/// immediately below it, owned exclusively by the new fiber.
pub unsafe fn init(stack_top: *mut u8, entry: extern "C" fn(*mut u8) -> !, arg: *mut u8) -> Context {
    // Reserve 7 machine words below the top: [ret=trampoline, rbp, rbx,
    // r12=arg, r13=entry, r14, r15], plus one extra word of padding above
    // them so `rsp` lands at `stack_top - 8` (not `stack_top`) once the
    // trampoline's `ret` consumes the return address. `switch` pushes
    // rbp,rbx,r12,r13,r14,r15 in that order and pops them in reverse, so the
    // 7-word layout must mirror that exactly; the 8th word is pure padding
    // to restore the SysV ABI's "rsp ≡ 8 (mod 16) at a call site" invariant
    // for the entry closure, matching what a real `call` into `entry` would
    // leave behind instead of the `ret`/`jmp` tail-call `fiber_trampoline`
    // actually performs.
    let top = stack_top as usize;
    let frame = top - 8 * 8;
    let words = frame as *mut usize;
    // words[0] is the lowest address, popped last (-> rbp), mirroring the
    // push order in `switch`'s prologue.
    *words.add(0) = 0; // r15 (unused)
    *words.add(1) = 0; // r14 (unused)
    *words.add(2) = entry as usize; // r13: entry fn, read by the trampoline
    *words.add(3) = arg as usize; // r12: argument, read by the trampoline
    *words.add(4) = 0; // rbx (unused)
    *words.add(5) = 0; // rbp (unused)
    *words.add(6) = fiber_trampoline as usize; // return address

    Context(frame as *mut u8)
}

/// Suspend the calling fiber (saving its callee-saved registers and stack
/// pointer into `*save_to`) and resume execution at `restore_from`.
///
/// # Safety
/// `restore_from` must be a [`Context`] previously produced by [`init`] or
/// previously saved by an earlier `switch` call for a stack that is still
/// live and not concurrently in use.
#[inline(never)]
pub unsafe fn switch(save_to: &mut Context, restore_from: Context) {
    raw_switch(&mut save_to.0, restore_from.0);
}

#[naked]
unsafe extern "C" fn raw_switch(save_to: *mut *mut u8, restore_from: *mut u8) {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );
}

/// Entered by `ret` the first time a freshly [`init`]-ed stack is switched
/// into. `r12`/`r13` arrive in `rdi`/`rsi` implicitly via the register
/// values `init` wrote onto the stack and `raw_switch`'s epilogue restored;
/// this stub just moves them into the SysV calling convention's argument
/// register and jumps to the real entry point.
#[naked]
unsafe extern "C" fn fiber_trampoline() -> ! {
    naked_asm!("mov rdi, r12", "jmp r13");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Stack;
    use std::cell::Cell;

    thread_local! {
        // Raw pointer to the test's `saved` local, set *before* the initial
        // switch so the fiber can read it back. `switch` writes the caller's
        // resume point into `*saved` synchronously, before jumping to the
        // fiber, so by the time the fiber dereferences this it's valid.
        static RETURN_TO: Cell<*const Context> = Cell::new(std::ptr::null());
        static SEEN: Cell<usize> = Cell::new(0);
    }

    extern "C" fn record_and_return(arg: *mut u8) -> ! {
        SEEN.with(|s| s.set(arg as usize));
        let back_ptr = RETURN_TO.with(|r| r.get());
        // SAFETY: `back_ptr` points at the test's still-live `saved` local,
        // which `switch` already populated before jumping here.
        let back = unsafe { *back_ptr };
        let mut here = Context::invalid();
        unsafe { switch(&mut here, back) };
        unreachable!("a fiber's stack is never resumed after this test");
    }

    #[test]
    fn switch_round_trips_through_a_fresh_stack() {
        let stack = Stack::new(64 * 1024).unwrap();
        let ctx = unsafe { init(stack.top(), record_and_return, 0x1234 as *mut u8) };
        let mut saved = Context::invalid();
        RETURN_TO.with(|r| r.set(&saved as *const Context));
        // SAFETY: `ctx` was just initialized above for a freshly mapped,
        // exclusively owned stack.
        unsafe { switch(&mut saved, ctx) };
        assert_eq!(SEEN.with(|s| s.get()), 0x1234);
    }
}
