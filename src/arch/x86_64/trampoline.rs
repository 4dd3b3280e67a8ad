//! Assembly entry points for the timer and yield vectors.
//!
//! Each stub pushes the general-purpose registers on top of the CPU's
//! `iret` frame, hands `(vector, frame)` to `irq_rust_dispatch`, and resumes
//! whatever frame the dispatcher returns. Returning a different frame is how
//! a context switch happens.

use core::arch::global_asm;

use super::{TIMER_VECTOR, YIELD_VECTOR};

macro_rules! switch_stub_asm {
    ($name:ident, $vector:expr) => {
        global_asm!(
            concat!(
                ".section .text\n",
                ".global ",
                stringify!($name),
                "\n",
                ".type ",
                stringify!($name),
                ", @function\n",
                stringify!($name),
                ":\n",
                "    cli\n",
                "    push rax\n",
                "    push rcx\n",
                "    push rdx\n",
                "    push rbx\n",
                "    push rbp\n",
                "    push rsi\n",
                "    push rdi\n",
                "    push r8\n",
                "    push r9\n",
                "    push r10\n",
                "    push r11\n",
                "    push r12\n",
                "    push r13\n",
                "    push r14\n",
                "    push r15\n",
                "    mov edi, {vector}\n",
                "    mov rsi, rsp\n",
                "    and rsp, -16\n",
                "    call irq_rust_dispatch\n",
                "    mov rsp, rax\n",
                "    pop r15\n",
                "    pop r14\n",
                "    pop r13\n",
                "    pop r12\n",
                "    pop r11\n",
                "    pop r10\n",
                "    pop r9\n",
                "    pop r8\n",
                "    pop rdi\n",
                "    pop rsi\n",
                "    pop rbp\n",
                "    pop rbx\n",
                "    pop rdx\n",
                "    pop rcx\n",
                "    pop rax\n",
                "    iretq\n",
            ),
            vector = const $vector,
        );
    };
}

switch_stub_asm!(timer_switch_stub, TIMER_VECTOR);
switch_stub_asm!(yield_switch_stub, YIELD_VECTOR);

extern "C" {
    fn timer_switch_stub();
    fn yield_switch_stub();
}

/// Address to install in the IDT for the timer vector.
pub fn timer_stub_address() -> usize {
    timer_switch_stub as usize
}

/// Address to install in the IDT for the yield vector.
pub fn yield_stub_address() -> usize {
    yield_switch_stub as usize
}
