use core::arch::global_asm;

// Every core enters here: qemu starts the boot core at the image base, and
// psci::cpu_on points secondaries at the same address. Each core picks its
// slice of the boot stack and calls start().
global_asm!(
    r#"
.section .text.entry
.globl _entry
_entry:
    mrs x0, mpidr_el1
    and x0, x0, #0xff
    add x0, x0, #1

    ldr x1, =STACK0
    mov x2, #0x4000
    madd x1, x0, x2, x1
    mov sp, x1

    bl start
spin:
    wfe
    b spin
"#
);

unsafe extern "C" {
    /// The shared entry point, for handing to psci::cpu_on.
    pub fn _entry();
}
