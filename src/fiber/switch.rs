//! The context switch.
//!
//! A suspended fiber is nothing but a stack pointer: every callee-saved
//! register sits in a fixed-size frame at the top of its stack.
//! `weft_switch` pushes that frame on the current stack, publishes the
//! resulting stack pointer through `save`, installs `load` and pops the
//! frame found there. The switch is symmetric; whoever resumes a fiber is
//! suspended by the very same instruction sequence until switched back to.
//!
//! A brand new fiber gets a hand-written frame (see [`init_stack`]) whose
//! return address is a thunk that materializes the entry arguments out of
//! the callee-saved registers and calls [`fiber_entry`]. The frame layouts
//! here and in the assembly must be kept in sync.
//!
//! [`fiber_entry`]: super::fiber_entry

extern "C" {
    /// `save` receives the stack pointer of the suspended caller; `load`
    /// must be a pointer previously produced through `save` or by
    /// [`init_stack`].
    pub(crate) fn weft_switch(save: *mut *mut u8, load: *mut u8);

    fn weft_fiber_begin();
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .globl weft_switch
    .p2align 4
weft_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

    .globl weft_fiber_begin
    .p2align 4
weft_fiber_begin:
    mov rdi, r12
    call rbx
    ud2
"#
);

/// Frame layout matching the pop sequence of `weft_switch` on x86_64:
/// six callee-saved registers and a return address, 16-byte aligned
/// against the stack top. `r12` carries the entry argument and `rbx`
/// the entry function, consumed by `weft_fiber_begin`.
#[cfg(target_arch = "x86_64")]
pub(crate) unsafe fn init_stack(
    top: *mut u8,
    entry: extern "C" fn(*const ()) -> !,
    arg: *const (),
) -> *mut u8 {
    let mut sp = top.cast::<usize>();
    sp = sp.sub(1);
    sp.write(weft_fiber_begin as usize); // return address
    sp = sp.sub(1);
    sp.write(0); // rbp
    sp = sp.sub(1);
    sp.write(entry as usize); // rbx
    sp = sp.sub(1);
    sp.write(arg as usize); // r12
    sp = sp.sub(3);
    sp.write(0); // r13..r15
    sp.add(1).write(0);
    sp.add(2).write(0);
    sp.cast()
}

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
    .text
    .globl weft_switch
    .p2align 2
weft_switch:
    stp x29, x30, [sp, #-16]!
    stp x27, x28, [sp, #-16]!
    stp x25, x26, [sp, #-16]!
    stp x23, x24, [sp, #-16]!
    stp x21, x22, [sp, #-16]!
    stp x19, x20, [sp, #-16]!
    stp d14, d15, [sp, #-16]!
    stp d12, d13, [sp, #-16]!
    stp d10, d11, [sp, #-16]!
    stp d8,  d9,  [sp, #-16]!
    mov x2, sp
    str x2, [x0]
    mov sp, x1
    ldp d8,  d9,  [sp], #16
    ldp d10, d11, [sp], #16
    ldp d12, d13, [sp], #16
    ldp d14, d15, [sp], #16
    ldp x19, x20, [sp], #16
    ldp x21, x22, [sp], #16
    ldp x23, x24, [sp], #16
    ldp x25, x26, [sp], #16
    ldp x27, x28, [sp], #16
    ldp x29, x30, [sp], #16
    ret

    .globl weft_fiber_begin
    .p2align 2
weft_fiber_begin:
    mov x0, x19
    blr x20
    brk #0
"#
);

/// Frame layout matching the load sequence of `weft_switch` on aarch64:
/// d8-d15, x19-x28, fp and lr, 20 slots. `x19` carries the entry
/// argument, `x20` the entry function and `lr` points at
/// `weft_fiber_begin`.
#[cfg(target_arch = "aarch64")]
pub(crate) unsafe fn init_stack(
    top: *mut u8,
    entry: extern "C" fn(*const ()) -> !,
    arg: *const (),
) -> *mut u8 {
    let sp = top.cast::<usize>().sub(20);
    for i in 0..20 {
        sp.add(i).write(0);
    }
    sp.add(8).write(arg as usize); // x19
    sp.add(9).write(entry as usize); // x20
    sp.add(19).write(weft_fiber_begin as usize); // x30 (lr)
    sp.cast()
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fibers are not supported on this CPU architecture");
