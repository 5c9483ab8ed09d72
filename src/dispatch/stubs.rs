/*
 *  dispatch/stubs.rs
 *
 *  gfx-loader - worth the squeeze
 *  (c) 2020-26 Stuart Hunter
 *
 *  Register-preserving assembly stubs for unknown entry points
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

//! Signature-agnostic stubs
//!
//! One contiguous block of [`STUB_COUNT`] stubs, [`STUB_STRIDE`] bytes
//! apart. A stub records its own address in a scratch register and jumps
//! to a shared routine. The routine spills every integer and vector
//! argument register, asks [`resolve_stub`] for the next stage (which may
//! rewrite the spilled first argument with the driver's handle), restores
//! the registers and tail-jumps. Stack arguments, the vararg count and
//! float returns never pass through Rust.
//!
//! The block holds four groups of [`MAX_UNKNOWN_FUNCTIONS`] stubs in
//! [`StubKind`] order.

use crate::api::PfnVoidFunction;
use crate::dispatch::unknown::{self, MAX_UNKNOWN_FUNCTIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubKind {
    PhysDevTrampoline,
    PhysDevTerminator,
    DevTrampoline,
    DevTerminator,
}

impl StubKind {
    const ALL: [StubKind; 4] = [
        StubKind::PhysDevTrampoline,
        StubKind::PhysDevTerminator,
        StubKind::DevTrampoline,
        StubKind::DevTerminator,
    ];
}

pub(crate) const STUB_COUNT: usize = StubKind::ALL.len() * MAX_UNKNOWN_FUNCTIONS;
pub(crate) const STUB_STRIDE: usize = 16;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
std::arch::global_asm!(
    ".pushsection .text.gfx_loader_unknown,\"ax\",@progbits",
    ".balign 16",
    ".globl gfx_loader_unknown_stubs",
    ".hidden gfx_loader_unknown_stubs",
    ".type gfx_loader_unknown_stubs,@function",
    "gfx_loader_unknown_stubs:",
    ".rept {count}",
    ".balign 16",
    "leaq 0(%rip), %r11",
    "jmp 2f",
    ".endr",
    "2:",
    "pushq %rbp",
    "movq %rsp, %rbp",
    "subq $192, %rsp",
    "movq %rdi, 0(%rsp)",
    "movq %rsi, 8(%rsp)",
    "movq %rdx, 16(%rsp)",
    "movq %rcx, 24(%rsp)",
    "movq %r8, 32(%rsp)",
    "movq %r9, 40(%rsp)",
    "movq %rax, 48(%rsp)",
    "movaps %xmm0, 64(%rsp)",
    "movaps %xmm1, 80(%rsp)",
    "movaps %xmm2, 96(%rsp)",
    "movaps %xmm3, 112(%rsp)",
    "movaps %xmm4, 128(%rsp)",
    "movaps %xmm5, 144(%rsp)",
    "movaps %xmm6, 160(%rsp)",
    "movaps %xmm7, 176(%rsp)",
    "movq %r11, %rsi",
    "movq %rsp, %rdx",
    "call {resolve}",
    "movq %rax, %r11",
    "movq 0(%rsp), %rdi",
    "movq 8(%rsp), %rsi",
    "movq 16(%rsp), %rdx",
    "movq 24(%rsp), %rcx",
    "movq 32(%rsp), %r8",
    "movq 40(%rsp), %r9",
    "movq 48(%rsp), %rax",
    "movaps 64(%rsp), %xmm0",
    "movaps 80(%rsp), %xmm1",
    "movaps 96(%rsp), %xmm2",
    "movaps 112(%rsp), %xmm3",
    "movaps 128(%rsp), %xmm4",
    "movaps 144(%rsp), %xmm5",
    "movaps 160(%rsp), %xmm6",
    "movaps 176(%rsp), %xmm7",
    "movq %rbp, %rsp",
    "popq %rbp",
    "jmpq *%r11",
    ".size gfx_loader_unknown_stubs, . - gfx_loader_unknown_stubs",
    ".popsection",
    count = const STUB_COUNT,
    resolve = sym resolve_stub,
    options(att_syntax)
);

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
std::arch::global_asm!(
    ".pushsection .text.gfx_loader_unknown,\"ax\",%progbits",
    ".balign 16",
    ".globl gfx_loader_unknown_stubs",
    ".hidden gfx_loader_unknown_stubs",
    ".type gfx_loader_unknown_stubs,%function",
    "gfx_loader_unknown_stubs:",
    ".rept {count}",
    ".balign 16",
    "adr x17, .",
    "b 2f",
    ".endr",
    "2:",
    "stp x29, x30, [sp, #-224]!",
    "mov x29, sp",
    "stp x0, x1, [sp, #16]",
    "stp x2, x3, [sp, #32]",
    "stp x4, x5, [sp, #48]",
    "stp x6, x7, [sp, #64]",
    "str x8, [sp, #80]",
    "stp q0, q1, [sp, #96]",
    "stp q2, q3, [sp, #128]",
    "stp q4, q5, [sp, #160]",
    "stp q6, q7, [sp, #192]",
    "mov x1, x17",
    "add x2, sp, #16",
    "bl {resolve}",
    "mov x16, x0",
    "ldp x0, x1, [sp, #16]",
    "ldp x2, x3, [sp, #32]",
    "ldp x4, x5, [sp, #48]",
    "ldp x6, x7, [sp, #64]",
    "ldr x8, [sp, #80]",
    "ldp q0, q1, [sp, #96]",
    "ldp q2, q3, [sp, #128]",
    "ldp q4, q5, [sp, #160]",
    "ldp q6, q7, [sp, #192]",
    "ldp x29, x30, [sp], #224",
    "br x16",
    ".size gfx_loader_unknown_stubs, . - gfx_loader_unknown_stubs",
    ".popsection",
    count = const STUB_COUNT,
    resolve = sym resolve_stub,
);

#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
unsafe extern "C" {
    fn gfx_loader_unknown_stubs();
}

#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
fn stub_base() -> usize {
    gfx_loader_unknown_stubs as usize
}

/// Address of the stub for `index` in group `kind`
#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
pub(crate) fn stub(kind: StubKind, index: usize) -> Option<PfnVoidFunction> {
    if index >= MAX_UNKNOWN_FUNCTIONS {
        return None;
    }
    let slot = kind as usize * MAX_UNKNOWN_FUNCTIONS + index;
    let address = stub_base() + slot * STUB_STRIDE;
    // SAFETY: every slot of the block is a code address
    Some(unsafe { std::mem::transmute::<usize, PfnVoidFunction>(address) })
}

/// No stubs on this target; unknown names stay unresolved
#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux")))]
pub(crate) fn stub(_kind: StubKind, _index: usize) -> Option<PfnVoidFunction> {
    None
}

/// Group and index of the stub that recorded `address`
#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
fn locate(address: usize) -> Option<(StubKind, usize)> {
    let slot = address.checked_sub(stub_base())? / STUB_STRIDE;
    let kind = *StubKind::ALL.get(slot / MAX_UNKNOWN_FUNCTIONS)?;
    Some((kind, slot % MAX_UNKNOWN_FUNCTIONS))
}

/// Called by the shared stub routine with the spilled registers.
///
/// # Safety
/// `first_argument` points at the spilled first integer argument.
#[cfg(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "linux"))]
unsafe extern "C" fn resolve_stub(handle: u64, address: usize, first_argument: *mut u64) -> PfnVoidFunction {
    let Some((kind, index)) = locate(address) else {
        crate::error::fail_fast(&format!("stray unknown-function stub address 0x{:x}", address));
    };
    let (next, handle) = unknown::next_stage(kind, index, handle);
    // SAFETY: the slot lives in the caller's frame until the tail jump
    unsafe { *first_argument = handle };
    next
}
