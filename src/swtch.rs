use core::arch::global_asm;

use crate::proc::Context;

// Context switch between a process's kernel thread and its CPU's scheduler.
//
// Pushes the callee-saved registers onto the current stack, records the
// resulting frame address through `old`, adopts `new` as the stack pointer
// and pops the registers saved there. The `ret` then continues wherever the
// new context last called swtch -- or, for a freshly allocated process, at
// `fork_ret`, whose address proc_alloc planted in the saved x30.
global_asm!(
    r#"
.globl swtch
swtch:
    sub sp, sp, #96
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]

    mov x9, sp
    str x9, [x0]

    mov sp, x1
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    add sp, sp, #96
    ret
"#
);

unsafe extern "C" {
    /// Saves the current kernel context, records it through `old`, and
    /// resumes execution in `new`.
    pub fn swtch(old: *mut *mut Context, new: *mut Context);
}
