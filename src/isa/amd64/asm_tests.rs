//! Golden encoding tests for the AMD64 assembler.
//!
//! Each case is (emit closure, expected bytes, assembly text). The
//! expected hex was transcribed from objdump disassembly of the textual
//! form; the text column is documentation for the reader.

use crate::isa::amd64::args::{Amode, CondCode, OperandSize::*, Scale};
use crate::isa::amd64::asm::{AluOp, Assembler, FloatSize, ShiftKind, SseOp};
use crate::isa::amd64::regs::*;
use crate::result::CodegenError;
use crate::runtime::{PatchKind, PatchTarget};

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[test]
fn test_amd64_binemit() {
    let mut insns: Vec<(Box<dyn Fn(&mut Assembler)>, &str, &str)> = Vec::new();

    // ALU register forms.
    insns.push((
        Box::new(|a| a.alu_rr(Size32, AluOp::Add, rax(), rcx())),
        "01C8",
        "add eax, ecx",
    ));
    insns.push((
        Box::new(|a| a.alu_rr(Size64, AluOp::Add, rax(), rcx())),
        "4801C8",
        "add rax, rcx",
    ));
    insns.push((
        Box::new(|a| a.alu_rr(Size64, AluOp::Add, gpr(8), gpr(9))),
        "4D01C8",
        "add r8, r9",
    ));
    insns.push((
        Box::new(|a| a.alu_rr(Size64, AluOp::Cmp, rdi(), rsi())),
        "4839F7",
        "cmp rdi, rsi",
    ));
    insns.push((
        Box::new(|a| a.alu_rr(Size32, AluOp::Xor, rcx(), rcx())),
        "31C9",
        "xor ecx, ecx",
    ));
    insns.push((
        Box::new(|a| a.alu_ri(Size64, AluOp::Sub, rsp(), 32)),
        "4883EC20",
        "sub rsp, 32",
    ));
    insns.push((
        Box::new(|a| a.alu_ri(Size64, AluOp::Add, rax(), 42)),
        "4883C02A",
        "add rax, 42",
    ));
    insns.push((
        Box::new(|a| a.alu_ri(Size32, AluOp::Add, rax(), 1000)),
        "81C0E8030000",
        "add eax, 1000",
    ));
    insns.push((
        Box::new(|a| {
            a.alu_rm(
                Size32,
                AluOp::Add,
                rdx(),
                &Amode::base_disp(rbx(), 8),
            )
        }),
        "035308",
        "add edx, dword [rbx + 8]",
    ));
    insns.push((
        Box::new(|a| {
            a.alu_mr(
                Size64,
                AluOp::Sub,
                &Amode::base(rdi()),
                rax(),
            )
        }),
        "482907",
        "sub qword [rdi], rax",
    ));

    // test / inc / dec / neg / not.
    insns.push((
        Box::new(|a| a.test_rr(Size64, rax(), rax())),
        "4885C0",
        "test rax, rax",
    ));
    insns.push((
        Box::new(|a| a.test_ri(Size32, rcx(), 0xFF)),
        "F7C1FF000000",
        "test ecx, 0xff",
    ));
    insns.push((Box::new(|a| a.inc_r(Size32, rax())), "FFC0", "inc eax"));
    insns.push((
        Box::new(|a| a.dec_r(Size32, gpr(10))),
        "41FFCA",
        "dec r10d",
    ));
    insns.push((Box::new(|a| a.neg_r(Size64, rax())), "48F7D8", "neg rax"));
    insns.push((Box::new(|a| a.not_r(Size32, rcx())), "F7D1", "not ecx"));

    // Multiplication and division.
    insns.push((
        Box::new(|a| a.imul_rr(Size64, rax(), rcx())),
        "480FAFC1",
        "imul rax, rcx",
    ));
    insns.push((
        Box::new(|a| a.imul_rri(Size32, rdx(), rax(), 10)),
        "6BD00A",
        "imul edx, eax, 10",
    ));
    insns.push((
        Box::new(|a| a.imul_rri(Size32, rdx(), rax(), 100_000)),
        "69D0A0860100",
        "imul edx, eax, 100000",
    ));
    insns.push((Box::new(|a| a.cdq(Size32)), "99", "cdq"));
    insns.push((Box::new(|a| a.cdq(Size64)), "4899", "cqo"));
    insns.push((
        Box::new(|a| a.idiv_r(Size32, rcx())),
        "F7F9",
        "idiv ecx",
    ));
    insns.push((
        Box::new(|a| a.div_r(Size64, rsi())),
        "48F7F6",
        "div rsi",
    ));

    // Shifts.
    insns.push((
        Box::new(|a| a.shift_cl(Size32, ShiftKind::Shl, rax())),
        "D3E0",
        "shl eax, cl",
    ));
    insns.push((
        Box::new(|a| a.shift_ri(Size64, ShiftKind::Sar, rdx(), 3)),
        "48C1FA03",
        "sar rdx, 3",
    ));
    insns.push((
        Box::new(|a| a.shift_ri(Size32, ShiftKind::Shr, rax(), 1)),
        "D1E8",
        "shr eax, 1",
    ));
    insns.push((
        Box::new(|a| a.shift_ri(Size32, ShiftKind::Shl, rax(), 33)),
        "D1E0",
        "shl eax, 33 & 31",
    ));

    // Moves.
    insns.push((
        Box::new(|a| a.mov_rr(Size64, rbx(), rsp())),
        "488BDC",
        "mov rbx, rsp",
    ));
    insns.push((
        Box::new(|a| a.mov_ri32(rax(), 7)),
        "B807000000",
        "mov eax, 7",
    ));
    insns.push((
        Box::new(|a| a.mov_ri32(gpr(9), -1)),
        "41B9FFFFFFFF",
        "mov r9d, -1",
    ));
    insns.push((
        Box::new(|a| a.mov_ri(Size64, rax(), 0x1_0000_0000)),
        "48B80000000001000000",
        "movabs rax, 0x100000000",
    ));
    insns.push((
        Box::new(|a| a.mov_ri(Size64, rcx(), -2)),
        "48C7C1FEFFFFFF",
        "mov rcx, -2",
    ));
    insns.push((
        Box::new(|a| a.mov_rm(Size64, rax(), &Amode::base_disp(rbp(), -8))),
        "488B45F8",
        "mov rax, qword [rbp - 8]",
    ));
    insns.push((
        Box::new(|a| a.mov_rm(Size32, rcx(), &Amode::base_disp(rsp(), 4))),
        "8B4C2404",
        "mov ecx, dword [rsp + 4]",
    ));
    insns.push((
        Box::new(|a| a.mov_rm(Size64, rax(), &Amode::base(gpr(13)))),
        "498B4500",
        "mov rax, qword [r13]",
    ));
    insns.push((
        Box::new(|a| a.mov_rm(Size64, rax(), &Amode::base(gpr(12)))),
        "498B0424",
        "mov rax, qword [r12]",
    ));
    insns.push((
        Box::new(|a| {
            a.mov_rm(
                Size64,
                rax(),
                &Amode::base_index_disp(rdx(), rcx(), Scale::Eight, 0x40),
            )
        }),
        "488B44CA40",
        "mov rax, qword [rdx + rcx*8 + 0x40]",
    ));
    insns.push((
        Box::new(|a| a.mov_mr(Size32, &Amode::base(rax()), rdx())),
        "8910",
        "mov dword [rax], edx",
    ));
    insns.push((
        Box::new(|a| a.mov_mr(Size8, &Amode::base(rcx()), rax())),
        "8801",
        "mov byte [rcx], al",
    ));
    insns.push((
        Box::new(|a| a.mov_mr(Size8, &Amode::base(rcx()), rsi())),
        "408831",
        "mov byte [rcx], sil",
    ));
    insns.push((
        Box::new(|a| a.mov_mr(Size16, &Amode::base(rdi()), rbx())),
        "66891F",
        "mov word [rdi], bx",
    ));
    insns.push((
        Box::new(|a| a.mov_mi(Size32, &Amode::base_disp(rbx(), 16), 0)),
        "C743100000000000",
        "mov dword [rbx + 16], 0",
    ));
    insns.push((
        Box::new(|a| a.mov_mi(Size8, &Amode::base(rax()), 1)),
        "C60001",
        "mov byte [rax], 1",
    ));

    // Sign/zero extension.
    insns.push((
        Box::new(|a| a.movsx_rr(Size8, Size32, rax(), rcx())),
        "0FBEC1",
        "movsx eax, cl",
    ));
    insns.push((
        Box::new(|a| a.movsx_rr(Size32, Size64, rax(), rcx())),
        "4863C1",
        "movsxd rax, ecx",
    ));
    insns.push((
        Box::new(|a| a.movzx_rr(Size16, rax(), rcx())),
        "0FB7C1",
        "movzx eax, cx",
    ));
    insns.push((
        Box::new(|a| a.movzx_rr(Size8, rdx(), rsi())),
        "400FB6D6",
        "movzx edx, sil",
    ));
    insns.push((
        Box::new(|a| a.movsx_rm(Size16, Size32, rax(), &Amode::base(rdi()))),
        "0FBF07",
        "movsx eax, word [rdi]",
    ));
    insns.push((
        Box::new(|a| a.movzx_rm(Size8, rcx(), &Amode::base_disp(rbp(), -1))),
        "0FB64DFF",
        "movzx ecx, byte [rbp - 1]",
    ));

    // lea / push / pop.
    insns.push((
        Box::new(|a| a.lea(rax(), &Amode::base_disp(rbp(), -24))),
        "488D45E8",
        "lea rax, [rbp - 24]",
    ));
    insns.push((Box::new(|a| a.push_r(rbp())), "55", "push rbp"));
    insns.push((Box::new(|a| a.push_r(gpr(12))), "4154", "push r12"));
    insns.push((Box::new(|a| a.pop_r(rbp())), "5D", "pop rbp"));
    insns.push((
        Box::new(|a| a.push_m(Size64, &Amode::base_disp(rbp(), 16))),
        "FF7510",
        "push qword [rbp + 16]",
    ));
    insns.push((
        Box::new(|a| a.push_m(Size16, &Amode::base_disp(rbp(), 16))),
        "66FF7510",
        "push word [rbp + 16]",
    ));
    insns.push((
        Box::new(|a| a.pop_m(Size64, &Amode::base_disp(rbp(), -16))),
        "8F45F0",
        "pop qword [rbp - 16]",
    ));

    // Conditional move / set.
    insns.push((
        Box::new(|a| a.cmov_rr(Size64, CondCode::G, rax(), rcx())),
        "480F4FC1",
        "cmovg rax, rcx",
    ));
    insns.push((
        Box::new(|a| a.cmov_rm(Size32, CondCode::NE, rdx(), &Amode::base(rbx()))),
        "0F4513",
        "cmovne edx, dword [rbx]",
    ));
    insns.push((
        Box::new(|a| a.setcc(CondCode::E, rax())),
        "0F94C0",
        "sete al",
    ));
    insns.push((
        Box::new(|a| a.setcc(CondCode::NE, rsi())),
        "400F95C6",
        "setne sil",
    ));

    // Atomics and fences.
    insns.push((
        Box::new(|a| a.lock_cmpxchg(Size64, &Amode::base(rdi()), rsi())),
        "F0480FB137",
        "lock cmpxchg qword [rdi], rsi",
    ));
    insns.push((
        Box::new(|a| a.lock_xadd(Size32, &Amode::base(rax()), rcx())),
        "F00FC108",
        "lock xadd dword [rax], ecx",
    ));
    insns.push((
        Box::new(|a| a.xchg(Size64, &Amode::base(rsi()), rax())),
        "488706",
        "xchg qword [rsi], rax",
    ));
    insns.push((Box::new(|a| a.mfence()), "0FAEF0", "mfence"));
    insns.push((Box::new(|a| a.lfence()), "0FAEE8", "lfence"));
    insns.push((Box::new(|a| a.sfence()), "0FAEF8", "sfence"));

    // Calls, returns, traps.
    insns.push((Box::new(|a| a.call_r(rax())), "FFD0", "call rax"));
    insns.push((
        Box::new(|a| a.call_r(gpr(11))),
        "41FFD3",
        "call r11",
    ));
    insns.push((Box::new(|a| a.jmp_r(rax())), "FFE0", "jmp rax"));
    insns.push((Box::new(|a| a.ret()), "C3", "ret"));
    insns.push((Box::new(|a| a.ud2()), "0F0B", "ud2"));
    insns.push((Box::new(|a| a.nop()), "90", "nop"));

    // SSE scalar.
    insns.push((
        Box::new(|a| a.movs_rm(FloatSize::Single, xmm(0), &Amode::base(rax()))),
        "F30F1000",
        "movss xmm0, dword [rax]",
    ));
    insns.push((
        Box::new(|a| a.movs_mr(FloatSize::Double, &Amode::base_disp(rbp(), -8), xmm(1))),
        "F20F114DF8",
        "movsd qword [rbp - 8], xmm1",
    ));
    insns.push((
        Box::new(|a| a.movaps_rr(xmm(2), xmm(3))),
        "0F28D3",
        "movaps xmm2, xmm3",
    ));
    insns.push((
        Box::new(|a| a.movaps_rr(xmm(8), xmm(1))),
        "440F28C1",
        "movaps xmm8, xmm1",
    ));
    insns.push((
        Box::new(|a| a.sse_op_rr(FloatSize::Double, SseOp::Add, xmm(0), xmm(1))),
        "F20F58C1",
        "addsd xmm0, xmm1",
    ));
    insns.push((
        Box::new(|a| a.sse_op_rr(FloatSize::Single, SseOp::Div, xmm(4), xmm(5))),
        "F30F5EE5",
        "divss xmm4, xmm5",
    ));
    insns.push((
        Box::new(|a| a.ucomis(FloatSize::Single, xmm(0), xmm(1))),
        "0F2EC1",
        "ucomiss xmm0, xmm1",
    ));
    insns.push((
        Box::new(|a| a.ucomis(FloatSize::Double, xmm(0), xmm(1))),
        "660F2EC1",
        "ucomisd xmm0, xmm1",
    ));
    insns.push((
        Box::new(|a| a.movd_xr(Size32, xmm(0), rax())),
        "660F6EC0",
        "movd xmm0, eax",
    ));
    insns.push((
        Box::new(|a| a.movd_xr(Size64, xmm(1), rcx())),
        "66480F6EC9",
        "movq xmm1, rcx",
    ));
    insns.push((
        Box::new(|a| a.movd_rx(Size64, rax(), xmm(0))),
        "66480F7EC0",
        "movq rax, xmm0",
    ));
    insns.push((
        Box::new(|a| a.cvtsi2s(FloatSize::Double, Size32, xmm(0), rax())),
        "F20F2AC0",
        "cvtsi2sd xmm0, eax",
    ));
    insns.push((
        Box::new(|a| a.cvtsi2s(FloatSize::Single, Size64, xmm(2), rdx())),
        "F3480F2AD2",
        "cvtsi2ss xmm2, rdx",
    ));
    insns.push((
        Box::new(|a| a.cvtts2si(FloatSize::Double, Size64, rax(), xmm(3))),
        "F2480F2CC3",
        "cvttsd2si rax, xmm3",
    ));
    insns.push((
        Box::new(|a| a.cvts2s(FloatSize::Single, xmm(1), xmm(2))),
        "F30F5ACA",
        "cvtss2sd xmm1, xmm2",
    ));

    // Byte swap.
    insns.push((Box::new(|a| a.bswap(Size64, rax())), "480FC8", "bswap rax"));
    insns.push((
        Box::new(|a| a.bswap(Size32, gpr(9))),
        "410FC9",
        "bswap r9d",
    ));

    for (emit, expected, text) in insns {
        let mut asm = Assembler::new();
        emit(&mut asm);
        let (bytes, _) = asm.finish().unwrap();
        assert_eq!(hex(&bytes), expected, "encoding mismatch for `{}`", text);
    }
}

#[test]
fn forward_branch_fixup() {
    let mut asm = Assembler::new();
    let l = asm.new_label();
    asm.jcc(CondCode::E, l);
    asm.nop();
    asm.bind(l);
    let (bytes, _) = asm.finish().unwrap();
    // je +1 over the nop: rel32 = 1.
    assert_eq!(hex(&bytes), "0F840100000090");
}

#[test]
fn backward_branch() {
    let mut asm = Assembler::new();
    let l = asm.new_label();
    asm.bind(l);
    asm.nop();
    asm.jmp(l);
    let (bytes, _) = asm.finish().unwrap();
    // jmp back over itself and the nop: rel32 = -6.
    assert_eq!(hex(&bytes), "90E9FAFFFFFF");
}

#[test]
fn lea_rip_of_next_instruction() {
    let mut asm = Assembler::new();
    let l = asm.new_label();
    asm.lea_rip(rax(), l);
    asm.bind(l);
    let (bytes, _) = asm.finish().unwrap();
    // Label binds at the instruction end, so rel32 is 0.
    assert_eq!(hex(&bytes), "488D0500000000");
}

#[test]
fn jump_table_entry_is_base_relative() {
    let mut asm = Assembler::new();
    let t = asm.new_label();
    let base = asm.offset();
    asm.jump_table_entry(t, base);
    asm.bind(t);
    let (bytes, _) = asm.finish().unwrap();
    // The entry is the distance from the table base: 4 bytes.
    assert_eq!(hex(&bytes), "04000000");
}

#[test]
fn unbound_label_is_fatal() {
    let mut asm = Assembler::new();
    let l = asm.new_label();
    asm.jmp(l);
    assert_eq!(
        asm.finish().unwrap_err(),
        CodegenError::OutOfRange("unbound label at finish")
    );
}

#[test]
fn direct_call_records_patch() {
    let mut asm = Assembler::new();
    asm.call_patch(PatchTarget::Foreign("deoptimize"));
    let (bytes, patches) = asm.finish().unwrap();
    assert_eq!(hex(&bytes), "E800000000");
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].offset, 1);
    assert_eq!(patches[0].kind, PatchKind::DirectCall);
    assert_eq!(patches[0].target, PatchTarget::Foreign("deoptimize"));
}

#[test]
fn object_constant_records_patch() {
    use crate::ir::{Constant, ObjectHandle};
    let mut asm = Assembler::new();
    asm.mov_ri64_patch(
        rax(),
        PatchKind::ObjectRef,
        PatchTarget::Data(Constant::Object(ObjectHandle(7))),
    );
    let (bytes, patches) = asm.finish().unwrap();
    // movabs rax, 0 with the imm64 field patched at install time.
    assert_eq!(hex(&bytes), "48B80000000000000000");
    assert_eq!(patches[0].offset, 2);
    assert_eq!(patches[0].kind, PatchKind::ObjectRef);
}
