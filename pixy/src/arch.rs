//! Architecture-specific context switching.
//!
//! A [`Context`] is a snapshot of the callee-saved register state taken at a
//! suspension point. [`switch`] stores the current state into one snapshot
//! and restores another, transferring control to wherever that snapshot was
//! taken. A snapshot is single-shot: it is invalid the moment it has been
//! restored.
//!
//! A fresh fiber has no snapshot to restore, so [`Context::fresh`] fabricates
//! one that makes the first switch land in a trampoline on the fiber's own
//! stack: the stack pointer is set near the top of the stack region, the
//! frame pointer is cleared, and a zero return-address sentinel terminates
//! the frame chain. The trampoline never returns; it runs the fiber entry
//! and then exits through the scheduler.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use core::arch::global_asm;

        /// Callee-saved state: rsp, rbp, rbx, r12–r15.
        #[repr(C)]
        pub(crate) struct Context {
            regs: [usize; 7],
        }

        global_asm!(
            ".text",
            ".globl pixy_context_switch",
            ".type pixy_context_switch, @function",
            ".balign 16",
            "pixy_context_switch:",
            // Save the callee-saved state. The return address sits on the
            // stack where `call` pushed it, so saving rsp is enough to come
            // back here later.
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], rbx",
            "mov [rdi + 0x18], r12",
            "mov [rdi + 0x20], r13",
            "mov [rdi + 0x28], r14",
            "mov [rdi + 0x30], r15",
            // Restore the target state and return into it. For a fresh
            // context the "return address" is the trampoline.
            "mov rsp, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov rbx, [rsi + 0x10]",
            "mov r12, [rsi + 0x18]",
            "mov r13, [rsi + 0x20]",
            "mov r14, [rsi + 0x28]",
            "mov r15, [rsi + 0x30]",
            "ret",
            ".size pixy_context_switch, . - pixy_context_switch",
        );

        impl Context {
            pub(crate) const fn zeroed() -> Context {
                Context { regs: [0; 7] }
            }

            /// Builds a context whose restoration enters `entry` on the
            /// stack ending at `stack_top` (exclusive).
            ///
            /// # Safety
            ///
            /// `stack_top` must point one past a writable region large
            /// enough for the sentinel words and the frames `entry` needs.
            pub(crate) unsafe fn fresh(
                stack_top: *mut u8,
                entry: extern "C" fn() -> !,
            ) -> Context {
                let mut sp = (stack_top as usize) & !15;
                // Zero return-address sentinel; `entry` never returns
                // through it, and unwinders stop on it.
                sp -= 8;
                *(sp as *mut usize) = 0;
                // `ret` in the switch pops this into rip. The pop leaves
                // rsp ≡ 8 (mod 16), the System V alignment at fn entry.
                sp -= 8;
                *(sp as *mut usize) = entry as usize;
                let mut regs = [0; 7];
                regs[0] = sp;
                Context { regs }
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        use core::arch::global_asm;

        /// Callee-saved state: sp, x29 (fp), x30 (lr), x19–x28, d8–d15.
        #[repr(C)]
        pub(crate) struct Context {
            regs: [usize; 21],
        }

        global_asm!(
            ".text",
            ".globl pixy_context_switch",
            ".type pixy_context_switch, %function",
            ".balign 16",
            "pixy_context_switch:",
            "mov x2, sp",
            "str x2, [x0, #0]",
            "stp x29, x30, [x0, #8]",
            "stp x19, x20, [x0, #24]",
            "stp x21, x22, [x0, #40]",
            "stp x23, x24, [x0, #56]",
            "stp x25, x26, [x0, #72]",
            "stp x27, x28, [x0, #88]",
            "stp d8, d9, [x0, #104]",
            "stp d10, d11, [x0, #120]",
            "stp d12, d13, [x0, #136]",
            "stp d14, d15, [x0, #152]",
            "ldr x2, [x1, #0]",
            "mov sp, x2",
            "ldp x29, x30, [x1, #8]",
            "ldp x19, x20, [x1, #24]",
            "ldp x21, x22, [x1, #40]",
            "ldp x23, x24, [x1, #56]",
            "ldp x25, x26, [x1, #72]",
            "ldp x27, x28, [x1, #88]",
            "ldp d8, d9, [x1, #104]",
            "ldp d10, d11, [x1, #120]",
            "ldp d12, d13, [x1, #136]",
            "ldp d14, d15, [x1, #152]",
            // Jumps to the restored x30; for a fresh context that is the
            // trampoline, with x29 = 0 ending the frame chain.
            "ret",
            ".size pixy_context_switch, . - pixy_context_switch",
        );

        impl Context {
            pub(crate) const fn zeroed() -> Context {
                Context { regs: [0; 21] }
            }

            /// See the x86_64 variant.
            pub(crate) unsafe fn fresh(
                stack_top: *mut u8,
                entry: extern "C" fn() -> !,
            ) -> Context {
                let mut regs = [0; 21];
                regs[0] = (stack_top as usize) & !15; // sp, 16-aligned
                regs[1] = 0; // x29: terminate the frame chain
                regs[2] = entry as usize; // x30: first `ret` target
                Context { regs }
            }
        }
    } else {
        compile_error!("architecture not supported");
    }
}

extern "C" {
    /// Stores the calling context into `save` and restores `restore`.
    ///
    /// Returns when (and if) some later switch restores `save`.
    pub(crate) fn pixy_context_switch(save: *mut Context, restore: *const Context);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    // A minimal two-context ping-pong, driven without any scheduler: enough
    // to prove save/restore and the fresh-stack bootstrap work.

    thread_local! {
        static MAIN_CTX: Cell<*mut Context> = Cell::new(std::ptr::null_mut());
        static SIDE_CTX: Cell<*mut Context> = Cell::new(std::ptr::null_mut());
        static TRACE: Cell<u32> = Cell::new(0);
    }

    extern "C" fn side_entry() -> ! {
        TRACE.with(|t| t.set(t.get() * 10 + 1));
        unsafe {
            pixy_context_switch(SIDE_CTX.with(|c| c.get()), MAIN_CTX.with(|c| c.get()));
        }
        TRACE.with(|t| t.set(t.get() * 10 + 2));
        unsafe {
            pixy_context_switch(SIDE_CTX.with(|c| c.get()), MAIN_CTX.with(|c| c.get()));
        }
        unreachable!("side context resumed after its last yield");
    }

    #[test]
    fn bootstrap_and_ping_pong() {
        let mut stack = vec![0u8; 32 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };

        let mut main_ctx = Context::zeroed();
        let mut side_ctx = unsafe { Context::fresh(top, side_entry) };
        MAIN_CTX.with(|c| c.set(&mut main_ctx));
        SIDE_CTX.with(|c| c.set(&mut side_ctx));
        TRACE.with(|t| t.set(0));

        unsafe { pixy_context_switch(&mut main_ctx, &side_ctx) };
        TRACE.with(|t| t.set(t.get() * 10 + 9));
        unsafe { pixy_context_switch(&mut main_ctx, &side_ctx) };

        assert_eq!(TRACE.with(|t| t.get()), 192);
    }
}
