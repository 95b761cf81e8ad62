//! The x86_64 trampoline stub.
//!
//! A small position-independent blob that runs from safe memory after
//! firmware teardown: it switches to the trampoline stack, runs the
//! copy routine over the relocation table and enters the kernel in the
//! machine state its hand-off contract asks for. ESXBootInfo kernels
//! are entered in long mode with the SysV argument registers; legacy
//! Multiboot kernels get the drop to 32-bit protected mode (paging and
//! long mode off) with the magic in EAX and the info block in EBX.
//!
//! Everything here addresses the hand-off record by byte offset; the
//! offsets are asserted against `HandoffRecord` at compile time over in
//! mboot_core. The blob only uses RIP-relative addressing internally,
//! so internal distances survive the copy and it can run from anywhere
//! below 4 GiB.

use core::arch::global_asm;

use mboot_core::reloc::TrampolineImage;

global_asm!(
    r#"
.balign 16
.global mboot_tramp_start
.global mboot_tramp_copy
.global mboot_tramp_end

// rdi = runtime address of the hand-off record
mboot_tramp_start:
    cli
    mov rbx, rdi
    mov rsp, [rbx + 0x00]           // trampoline stack
    mov rdi, [rbx + 0x08]           // relocation table
    call qword ptr [rbx + 0x10]     // copy routine
    mov eax, dword ptr [rbx + 0x30] // register magic
    cmp eax, 0x2BADB002
    je 20f
    // ESXBootInfo: long mode, (magic, info) in the argument registers
    mov edi, eax
    mov rsi, [rbx + 0x18]
    mov rax, [rbx + 0x20]
    jmp rax

    // legacy Multiboot: leave long mode first. All references are
    // RIP-relative, so they resolve inside whichever copy is running.
20:
    lea rcx, [rip + mboot_tramp_gdt]
    mov [rip + mboot_tramp_gdtbase], rcx
    lgdt [rip + mboot_tramp_gdtptr]
    lea rcx, [rip + mboot_tramp_code32]
    push 0x08
    push rcx
    retfq
.code32
mboot_tramp_code32:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    mov ss, ax
    // paging off (this leaves IA-32e mode)
    mov ecx, cr0
    and ecx, 0x7fffffff
    mov cr0, ecx
    // long mode off
    mov ecx, 0xC0000080
    rdmsr
    and eax, 0xfffffeff
    wrmsr
    // PAE off
    mov ecx, cr4
    and ecx, 0xffffffdf
    mov cr4, ecx
    mov esi, [ebx + 0x18]
    mov edi, [ebx + 0x20]
    mov eax, [ebx + 0x30]
    mov ebx, esi
    jmp edi

.code64
// rdi = relocation table: 40-byte entries, kind byte at +32, zero kind
// terminates. A null source zero-fills; otherwise the copy direction is
// picked so overlapping moves stay safe.
mboot_tramp_copy:
    mov r8, rdi
30:
    movzx eax, byte ptr [r8 + 32]
    test eax, eax
    jz 34f
    mov rsi, [r8]
    mov rdi, [r8 + 8]
    mov rcx, [r8 + 16]
    test rsi, rsi
    jz 32f
    cmp rsi, rdi
    jae 33f
    // source below destination: copy downwards
    lea rsi, [rsi + rcx - 1]
    lea rdi, [rdi + rcx - 1]
    std
    rep movsb
    cld
    jmp 31f
32:
    xor eax, eax
    rep stosb
    jmp 31f
33:
    cld
    rep movsb
31:
    add r8, 40
    jmp 30b
34:
    wbinvd
    ret

.balign 8
mboot_tramp_gdt:
    .quad 0
    .quad 0x00cf9a000000ffff        // 32-bit flat code
    .quad 0x00cf92000000ffff        // 32-bit flat data
mboot_tramp_gdtptr:
    .word 23
mboot_tramp_gdtbase:
    .quad 0
mboot_tramp_end:
"#
);

extern "C" {
    static mboot_tramp_start: u8;
    static mboot_tramp_copy: u8;
    static mboot_tramp_end: u8;
}

/// The blob as the relocation engine wants it.
pub(super) fn image() -> TrampolineImage<'static> {
    unsafe {
        let start = core::ptr::addr_of!(mboot_tramp_start) as usize;
        let end = core::ptr::addr_of!(mboot_tramp_end) as usize;
        let copy = core::ptr::addr_of!(mboot_tramp_copy) as usize;
        TrampolineImage {
            code: core::slice::from_raw_parts(start as *const u8, end - start),
            entry_offset: 0,
            copy_routine_offset: copy - start,
        }
    }
}
