//! Bare-metal leaves: interrupt flag control and the context-switch asm.

use core::arch::global_asm;

pub fn intr_enabled() -> bool {
    ::x86_64::instructions::interrupts::are_enabled()
}

pub fn intr_off() {
    ::x86_64::instructions::interrupts::disable();
}

pub fn intr_on() {
    ::x86_64::instructions::interrupts::enable();
}

pub fn wait_for_interrupt() {
    ::x86_64::instructions::hlt();
}

global_asm!(
    r#"
.global switch_context
switch_context:
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
"#
);

global_asm!(
    r#"
.global trap_return
trap_return:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16     // fs, ds restored by the segment reload path
    add rsp, 16     // trapno, errno
    iretq
"#
);

extern "C" {
    /// Store the callee-saved set on the current stack, publish the
    /// suspended context pointer to `*old`, and resume `new`.
    pub fn switch_context(old: *mut u64, new: u64);
}
