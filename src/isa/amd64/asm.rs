//! AMD64 binary code emission.
//!
//! The assembler encodes one instruction per method call into a growable
//! byte buffer, managing labels, branch fixups, and installation patch
//! sites. Encoding helpers follow the usual split: a REX specification, a
//! ModRM/SIB/displacement writer with the rsp/r12 and rbp/r13 special
//! cases, and immediate classification (imm8 where it sign-extends).

use crate::ir::{DoubleBits, FloatBits};
use crate::isa::amd64::args::{Amode, CondCode, OperandSize, Scale};
use crate::isa::amd64::regs::Reg;
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::{CodeOffset, PatchKind, PatchSite, PatchTarget};

pub(crate) fn low8_will_sign_extend_to_32(x: i32) -> bool {
    x == ((x << 24) >> 24)
}

/// Encode the ModR/M byte.
#[inline]
fn encode_modrm(m0d: u8, enc_reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((enc_reg_g & 7) << 3) | (rm_e & 7)
}

/// Encode the SIB byte (scale-index-base).
#[inline]
fn encode_sib(scale: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(scale < 4);
    ((scale & 3) << 6) | ((enc_index & 7) << 3) | (enc_base & 7)
}

/// A REX prefix specification:
/// - bit 0 set means REX.W must be 0 (cleared);
/// - bit 1 set means the prefix must be emitted even if otherwise empty
///   (required to reach sil/dil/bpl/spl in 8-bit operations).
#[derive(Clone, Copy)]
struct RexFlags(u8);

impl RexFlags {
    fn set_w() -> Self {
        RexFlags(0)
    }

    fn clear_w() -> Self {
        RexFlags(1)
    }

    fn from_size(size: OperandSize) -> Self {
        if size.is64() {
            Self::set_w()
        } else {
            Self::clear_w()
        }
    }

    fn must_clear_w(self) -> bool {
        (self.0 & 1) != 0
    }

    fn always_emit(mut self) -> Self {
        self.0 |= 2;
        self
    }

    fn must_always_emit(self) -> bool {
        (self.0 & 2) != 0
    }

    /// Byte registers 4..=7 without REX address ah/ch/dh/bh; force the
    /// prefix so they mean spl/bpl/sil/dil instead.
    fn always_emit_if_8bit_needed(self, enc: u8) -> Self {
        if (4..=7).contains(&enc) {
            self.always_emit()
        } else {
            self
        }
    }

    fn emit_one_op(self, buf: &mut Vec<u8>, enc_e: u8) {
        let w = if self.must_clear_w() { 0 } else { 1 };
        let b = (enc_e >> 3) & 1;
        let rex = 0x40 | (w << 3) | b;
        if rex != 0x40 || self.must_always_emit() {
            buf.push(rex);
        }
    }

    fn emit_two_op(self, buf: &mut Vec<u8>, enc_g: u8, enc_e: u8) {
        let w = if self.must_clear_w() { 0 } else { 1 };
        let r = (enc_g >> 3) & 1;
        let b = (enc_e >> 3) & 1;
        let rex = 0x40 | (w << 3) | (r << 2) | b;
        if rex != 0x40 || self.must_always_emit() {
            buf.push(rex);
        }
    }

    fn emit_three_op(self, buf: &mut Vec<u8>, enc_g: u8, enc_index: u8, enc_base: u8) {
        let w = if self.must_clear_w() { 0 } else { 1 };
        let r = (enc_g >> 3) & 1;
        let x = (enc_index >> 3) & 1;
        let b = (enc_base >> 3) & 1;
        let rex = 0x40 | (w << 3) | (r << 2) | (x << 1) | b;
        if rex != 0x40 || self.must_always_emit() {
            buf.push(rex);
        }
    }
}

/// Displacement classification for ModRM "mod" bits.
#[derive(Clone, Copy)]
enum Disp {
    None,
    Disp8(i8),
    Disp32(i32),
}

impl Disp {
    fn new(val: i32) -> Disp {
        if val == 0 {
            Disp::None
        } else if let Ok(v) = i8::try_from(val) {
            Disp::Disp8(v)
        } else {
            Disp::Disp32(val)
        }
    }

    fn force_disp8_if_none(self) -> Disp {
        match self {
            Disp::None => Disp::Disp8(0),
            d => d,
        }
    }

    fn m0d(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::Disp8(_) => 0b01,
            Disp::Disp32(_) => 0b10,
        }
    }

    fn emit(self, buf: &mut Vec<u8>) {
        match self {
            Disp::None => {}
            Disp::Disp8(v) => buf.push(v as u8),
            Disp::Disp32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// Integer ALU opcode family sharing the r/m-r, r-r/m, and r/m-imm forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// /digit for the 0x81/0x83 immediate forms.
    fn modrm_digit(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }

    /// Opcode for the `op r/m, r` direction.
    fn opcode_mr(self) -> u8 {
        0x01 + self.modrm_digit() * 8
    }

    /// Opcode for the `op r, r/m` direction.
    fn opcode_rm(self) -> u8 {
        0x03 + self.modrm_digit() * 8
    }
}

/// Shift/rotate family (/digit of 0xD3 and 0xC1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftKind {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// SSE scalar arithmetic family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl SseOp {
    fn opcode(self) -> u8 {
        match self {
            SseOp::Add => 0x58,
            SseOp::Sub => 0x5C,
            SseOp::Mul => 0x59,
            SseOp::Div => 0x5E,
        }
    }
}

/// Scalar float width selector for SSE ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatSize {
    Single,
    Double,
}

impl FloatSize {
    fn prefix(self) -> u8 {
        match self {
            FloatSize::Single => 0xF3,
            FloatSize::Double => 0xF2,
        }
    }
}

/// A code label; forward references are fixed up when the label binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(u32);

enum FixupKind {
    /// rel32 relative to the end of the 4-byte field.
    PcRel32,
    /// 32-bit distance of the label from a fixed base offset
    /// (jump-table entries).
    DispFromBase(CodeOffset),
}

struct Fixup {
    /// Offset of the 4-byte field.
    at: CodeOffset,
    label: Label,
    kind: FixupKind,
}

/// The AMD64 assembler: byte buffer, labels, fixups, patch sites.
#[derive(Default)]
pub struct Assembler {
    buf: Vec<u8>,
    labels: Vec<Option<CodeOffset>>,
    fixups: Vec<Fixup>,
    patches: Vec<PatchSite>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::default()
    }

    /// Current end-of-buffer offset.
    pub fn offset(&self) -> CodeOffset {
        self.buf.len() as CodeOffset
    }

    /// Create a new unbound label.
    pub fn new_label(&mut self) -> Label {
        let l = Label(self.labels.len() as u32);
        self.labels.push(None);
        l
    }

    /// Bind `label` to the current offset, resolving pending fixups to it.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(
            self.labels[label.0 as usize].is_none(),
            "label bound twice"
        );
        let here = self.offset();
        self.labels[label.0 as usize] = Some(here);
        let mut i = 0;
        while i < self.fixups.len() {
            if self.fixups[i].label == label {
                let fixup = self.fixups.swap_remove(i);
                let value = match fixup.kind {
                    FixupKind::PcRel32 => here as i64 - (fixup.at as i64 + 4),
                    FixupKind::DispFromBase(base) => here as i64 - base as i64,
                };
                let value32 = i32::try_from(value).expect("fixup within 32-bit range");
                self.buf[fixup.at as usize..fixup.at as usize + 4]
                    .copy_from_slice(&value32.to_le_bytes());
            } else {
                i += 1;
            }
        }
    }

    /// The offset a label was bound to, if it was.
    pub fn label_offset(&self, label: Label) -> Option<CodeOffset> {
        self.labels[label.0 as usize]
    }

    /// Finish assembly; fails if any referenced label is unbound or any
    /// displacement went out of range.
    pub fn finish(self) -> CodegenResult<(Vec<u8>, Vec<PatchSite>)> {
        if !self.fixups.is_empty() {
            return Err(CodegenError::OutOfRange("unbound label at finish"));
        }
        Ok((self.buf, self.patches))
    }

    /// Record a patch site whose rel32/abs64 field starts at `at`.
    fn record_patch(&mut self, at: CodeOffset, kind: PatchKind, target: PatchTarget) {
        self.patches.push(PatchSite {
            offset: at,
            kind,
            target,
        });
    }

    fn put1(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn put4(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put8(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// 0x66 operand-size prefix for 16-bit forms; must precede REX.
    fn prefix16(&mut self, size: OperandSize) {
        if size == OperandSize::Size16 {
            self.put1(0x66);
        }
    }

    /// Emit ModRM for a register-direct operand.
    fn modrm_rr(&mut self, enc_g: u8, enc_e: u8) {
        self.put1(encode_modrm(0b11, enc_g, enc_e));
    }

    /// Emit the ModRM/SIB/disp sequence for a memory operand.
    fn modrm_mem(&mut self, enc_g: u8, mem: &Amode) {
        let enc_base = mem.base.enc();
        match mem.index {
            None => {
                let mut disp = Disp::new(mem.disp);
                if enc_base & 7 == 4 {
                    // rsp/r12 base requires a SIB byte with index=100.
                    self.put1(encode_modrm(disp.m0d(), enc_g, 0b100));
                    self.put1(encode_sib(0, 0b100, enc_base));
                    disp.emit(&mut self.buf);
                } else {
                    // rbp/r13 base cannot use mod=00; force a zero disp8.
                    if enc_base & 7 == 5 {
                        disp = disp.force_disp8_if_none();
                    }
                    self.put1(encode_modrm(disp.m0d(), enc_g, enc_base));
                    disp.emit(&mut self.buf);
                }
            }
            Some((index, scale)) => {
                let enc_index = index.enc();
                debug_assert!(enc_index != 4, "rsp cannot be an index register");
                let mut disp = Disp::new(mem.disp);
                if enc_base & 7 == 5 {
                    disp = disp.force_disp8_if_none();
                }
                self.put1(encode_modrm(disp.m0d(), enc_g, 0b100));
                self.put1(encode_sib(scale.enc(), enc_index, enc_base));
                disp.emit(&mut self.buf);
            }
        }
    }

    fn emit_rex_mem(&mut self, rex: RexFlags, enc_g: u8, mem: &Amode) {
        match mem.index {
            None => rex.emit_two_op(&mut self.buf, enc_g, mem.base.enc()),
            Some((index, _)) => {
                rex.emit_three_op(&mut self.buf, enc_g, index.enc(), mem.base.enc())
            }
        }
    }

    // ---- integer ALU ----

    /// `op dst, src` (register forms).
    pub fn alu_rr(&mut self, size: OperandSize, op: AluOp, dst: Reg, src: Reg) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, src.enc(), dst.enc());
        self.put1(op.opcode_mr());
        self.modrm_rr(src.enc(), dst.enc());
    }

    /// `op dst, [mem]`.
    pub fn alu_rm(&mut self, size: OperandSize, op: AluOp, dst: Reg, mem: &Amode) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, dst.enc(), mem);
        self.put1(op.opcode_rm());
        self.modrm_mem(dst.enc(), mem);
    }

    /// `op [mem], src`.
    pub fn alu_mr(&mut self, size: OperandSize, op: AluOp, mem: &Amode, src: Reg) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, src.enc(), mem);
        self.put1(op.opcode_mr());
        self.modrm_mem(src.enc(), mem);
    }

    /// `op dst, imm`, choosing the sign-extended imm8 form when it fits.
    pub fn alu_ri(&mut self, size: OperandSize, op: AluOp, dst: Reg, imm: i32) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        if low8_will_sign_extend_to_32(imm) {
            self.put1(0x83);
            self.modrm_rr(op.modrm_digit(), dst.enc());
            self.put1(imm as u8);
        } else {
            self.put1(0x81);
            self.modrm_rr(op.modrm_digit(), dst.enc());
            self.put4(imm as u32);
        }
    }

    /// `op [mem], imm`.
    pub fn alu_mi(&mut self, size: OperandSize, op: AluOp, mem: &Amode, imm: i32) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, 0, mem);
        if low8_will_sign_extend_to_32(imm) {
            self.put1(0x83);
            self.modrm_mem(op.modrm_digit(), mem);
            self.put1(imm as u8);
        } else {
            self.put1(0x81);
            self.modrm_mem(op.modrm_digit(), mem);
            self.put4(imm as u32);
        }
    }

    /// `test dst, src`.
    pub fn test_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, src.enc(), dst.enc());
        self.put1(0x85);
        self.modrm_rr(src.enc(), dst.enc());
    }

    /// `test dst, imm32`.
    pub fn test_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xF7);
        self.modrm_rr(0, dst.enc());
        self.put4(imm as u32);
    }

    /// `inc dst`.
    pub fn inc_r(&mut self, size: OperandSize, dst: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xFF);
        self.modrm_rr(0, dst.enc());
    }

    /// `dec dst`.
    pub fn dec_r(&mut self, size: OperandSize, dst: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xFF);
        self.modrm_rr(1, dst.enc());
    }

    /// `neg dst` (two's complement).
    pub fn neg_r(&mut self, size: OperandSize, dst: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xF7);
        self.modrm_rr(3, dst.enc());
    }

    /// `not dst` (bitwise complement).
    pub fn not_r(&mut self, size: OperandSize, dst: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xF7);
        self.modrm_rr(2, dst.enc());
    }

    /// Two-operand `imul dst, src`.
    pub fn imul_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x0F);
        self.put1(0xAF);
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// Three-operand `imul dst, src, imm`, short form for imm8.
    pub fn imul_rri(&mut self, size: OperandSize, dst: Reg, src: Reg, imm: i32) {
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        if low8_will_sign_extend_to_32(imm) {
            self.put1(0x6B);
            self.modrm_rr(dst.enc(), src.enc());
            self.put1(imm as u8);
        } else {
            self.put1(0x69);
            self.modrm_rr(dst.enc(), src.enc());
            self.put4(imm as u32);
        }
    }

    /// Sign-extend rax into rdx:rax (`cdq`/`cqo`).
    pub fn cdq(&mut self, size: OperandSize) {
        RexFlags::from_size(size).emit_one_op(&mut self.buf, 0);
        self.put1(0x99);
    }

    /// Signed divide of rdx:rax by `divisor`.
    pub fn idiv_r(&mut self, size: OperandSize, divisor: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, divisor.enc());
        self.put1(0xF7);
        self.modrm_rr(7, divisor.enc());
    }

    /// Unsigned divide of rdx:rax by `divisor`.
    pub fn div_r(&mut self, size: OperandSize, divisor: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, divisor.enc());
        self.put1(0xF7);
        self.modrm_rr(6, divisor.enc());
    }

    /// Shift by the count in `cl`.
    pub fn shift_cl(&mut self, size: OperandSize, kind: ShiftKind, dst: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xD3);
        self.modrm_rr(kind as u8, dst.enc());
    }

    /// Shift by a masked constant; a count of 1 selects the short
    /// one-operand encoding.
    pub fn shift_ri(&mut self, size: OperandSize, kind: ShiftKind, dst: Reg, imm: u8) {
        let imm = imm & size.shift_mask();
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        if imm == 1 {
            self.put1(0xD1);
            self.modrm_rr(kind as u8, dst.enc());
        } else {
            self.put1(0xC1);
            self.modrm_rr(kind as u8, dst.enc());
            self.put1(imm);
        }
    }

    /// `bswap dst`.
    pub fn bswap(&mut self, size: OperandSize, dst: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0x0F);
        self.put1(0xC8 | (dst.enc() & 7));
    }

    // ---- moves ----

    /// `mov dst, src` between registers.
    pub fn mov_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x8B);
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// `mov dst, imm32` (32-bit, zeroing the upper half).
    pub fn mov_ri32(&mut self, dst: Reg, imm: i32) {
        RexFlags::clear_w().emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xB8 | (dst.enc() & 7));
        self.put4(imm as u32);
    }

    /// `movabs dst, imm64`. Returns the offset of the 8-byte field so a
    /// data/object patch can cover it.
    pub fn mov_ri64(&mut self, dst: Reg, imm: u64) -> CodeOffset {
        RexFlags::set_w().emit_one_op(&mut self.buf, dst.enc());
        self.put1(0xB8 | (dst.enc() & 7));
        let at = self.offset();
        self.put8(imm);
        at
    }

    /// `mov dst, imm` choosing the shortest legal form: sign-extended
    /// `C7 /0` for 64-bit values that fit i32, plain 32-bit otherwise.
    pub fn mov_ri(&mut self, size: OperandSize, dst: Reg, imm: i64) {
        if size.is64() {
            if let Ok(imm32) = i32::try_from(imm) {
                RexFlags::set_w().emit_one_op(&mut self.buf, dst.enc());
                self.put1(0xC7);
                self.modrm_rr(0, dst.enc());
                self.put4(imm32 as u32);
            } else {
                self.mov_ri64(dst, imm as u64);
            }
        } else {
            self.mov_ri32(dst, imm as i32);
        }
    }

    /// 32/64-bit load `mov dst, [mem]`.
    pub fn mov_rm(&mut self, size: OperandSize, dst: Reg, mem: &Amode) {
        debug_assert!(matches!(size, OperandSize::Size32 | OperandSize::Size64));
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, dst.enc(), mem);
        self.put1(0x8B);
        self.modrm_mem(dst.enc(), mem);
    }

    /// Store `mov [mem], src` at any width; 8/16-bit use the byte/word
    /// variants.
    pub fn mov_mr(&mut self, size: OperandSize, mem: &Amode, src: Reg) {
        self.prefix16(size);
        let mut rex = RexFlags::from_size(size);
        let opcode = if size == OperandSize::Size8 {
            rex = rex.always_emit_if_8bit_needed(src.enc());
            0x88
        } else {
            0x89
        };
        self.emit_rex_mem(rex, src.enc(), mem);
        self.put1(opcode);
        self.modrm_mem(src.enc(), mem);
    }

    /// Store an immediate `mov [mem], imm` at any width.
    pub fn mov_mi(&mut self, size: OperandSize, mem: &Amode, imm: i32) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, 0, mem);
        match size {
            OperandSize::Size8 => {
                self.put1(0xC6);
                self.modrm_mem(0, mem);
                self.put1(imm as u8);
            }
            OperandSize::Size16 => {
                self.put1(0xC7);
                self.modrm_mem(0, mem);
                self.put1(imm as u8);
                self.put1((imm >> 8) as u8);
            }
            _ => {
                self.put1(0xC7);
                self.modrm_mem(0, mem);
                self.put4(imm as u32);
            }
        }
    }

    /// Sign-extending load: `movsx dst, byte/word [mem]`, or
    /// `movsxd dst, dword [mem]` when `from` is 32 bits.
    pub fn movsx_rm(&mut self, from: OperandSize, to: OperandSize, dst: Reg, mem: &Amode) {
        let rex = RexFlags::from_size(to);
        self.emit_rex_mem(rex, dst.enc(), mem);
        match from {
            OperandSize::Size8 => {
                self.put1(0x0F);
                self.put1(0xBE);
            }
            OperandSize::Size16 => {
                self.put1(0x0F);
                self.put1(0xBF);
            }
            OperandSize::Size32 => self.put1(0x63),
            OperandSize::Size64 => unreachable!("no 64-to-64 sign extension"),
        }
        self.modrm_mem(dst.enc(), mem);
    }

    /// Register form of `movsx`/`movsxd`.
    pub fn movsx_rr(&mut self, from: OperandSize, to: OperandSize, dst: Reg, src: Reg) {
        let mut rex = RexFlags::from_size(to);
        if from == OperandSize::Size8 {
            rex = rex.always_emit_if_8bit_needed(src.enc());
        }
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        match from {
            OperandSize::Size8 => {
                self.put1(0x0F);
                self.put1(0xBE);
            }
            OperandSize::Size16 => {
                self.put1(0x0F);
                self.put1(0xBF);
            }
            OperandSize::Size32 => self.put1(0x63),
            OperandSize::Size64 => unreachable!("no 64-to-64 sign extension"),
        }
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// Zero-extending load: `movzx dst, byte/word [mem]`; a 32-bit source
    /// is a plain DWORD move (the upper half clears for free).
    pub fn movzx_rm(&mut self, from: OperandSize, dst: Reg, mem: &Amode) {
        match from {
            OperandSize::Size8 | OperandSize::Size16 => {
                let rex = RexFlags::clear_w();
                self.emit_rex_mem(rex, dst.enc(), mem);
                self.put1(0x0F);
                self.put1(if from == OperandSize::Size8 { 0xB6 } else { 0xB7 });
                self.modrm_mem(dst.enc(), mem);
            }
            _ => self.mov_rm(OperandSize::Size32, dst, mem),
        }
    }

    /// Register form of `movzx`.
    pub fn movzx_rr(&mut self, from: OperandSize, dst: Reg, src: Reg) {
        match from {
            OperandSize::Size8 | OperandSize::Size16 => {
                let mut rex = RexFlags::clear_w();
                if from == OperandSize::Size8 {
                    rex = rex.always_emit_if_8bit_needed(src.enc());
                }
                rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
                self.put1(0x0F);
                self.put1(if from == OperandSize::Size8 { 0xB6 } else { 0xB7 });
                self.modrm_rr(dst.enc(), src.enc());
            }
            _ => self.mov_rr(OperandSize::Size32, dst, src),
        }
    }

    /// `lea dst, [mem]`.
    pub fn lea(&mut self, dst: Reg, mem: &Amode) {
        let rex = RexFlags::set_w();
        self.emit_rex_mem(rex, dst.enc(), mem);
        self.put1(0x8D);
        self.modrm_mem(dst.enc(), mem);
    }

    /// `push src` (always 64-bit).
    pub fn push_r(&mut self, src: Reg) {
        RexFlags::clear_w().emit_one_op(&mut self.buf, src.enc());
        self.put1(0x50 | (src.enc() & 7));
    }

    /// `pop dst` (always 64-bit).
    pub fn pop_r(&mut self, dst: Reg) {
        RexFlags::clear_w().emit_one_op(&mut self.buf, dst.enc());
        self.put1(0x58 | (dst.enc() & 7));
    }

    /// `push word/qword [mem]` (the operand-size prefix selects 16-bit).
    pub fn push_m(&mut self, size: OperandSize, mem: &Amode) {
        debug_assert!(matches!(size, OperandSize::Size16 | OperandSize::Size64));
        self.prefix16(size);
        let rex = RexFlags::clear_w();
        self.emit_rex_mem(rex, 6, mem);
        self.put1(0xFF);
        self.modrm_mem(6, mem);
    }

    /// `pop word/qword [mem]`.
    pub fn pop_m(&mut self, size: OperandSize, mem: &Amode) {
        debug_assert!(matches!(size, OperandSize::Size16 | OperandSize::Size64));
        self.prefix16(size);
        let rex = RexFlags::clear_w();
        self.emit_rex_mem(rex, 0, mem);
        self.put1(0x8F);
        self.modrm_mem(0, mem);
    }

    // ---- flags consumers ----

    /// `cmov<cc> dst, src`.
    pub fn cmov_rr(&mut self, size: OperandSize, cc: CondCode, dst: Reg, src: Reg) {
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x0F);
        self.put1(0x40 | cc.bits());
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// `cmov<cc> dst, [mem]`.
    pub fn cmov_rm(&mut self, size: OperandSize, cc: CondCode, dst: Reg, mem: &Amode) {
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, dst.enc(), mem);
        self.put1(0x0F);
        self.put1(0x40 | cc.bits());
        self.modrm_mem(dst.enc(), mem);
    }

    /// `set<cc> dst` (byte register).
    pub fn setcc(&mut self, cc: CondCode, dst: Reg) {
        let rex = RexFlags::clear_w().always_emit_if_8bit_needed(dst.enc());
        rex.emit_one_op(&mut self.buf, dst.enc());
        self.put1(0x0F);
        self.put1(0x90 | cc.bits());
        self.modrm_rr(0, dst.enc());
    }

    // ---- control flow ----

    fn emit_rel32_to(&mut self, label: Label) {
        match self.labels[label.0 as usize] {
            Some(target) => {
                let rel = target as i64 - (self.offset() as i64 + 4);
                let rel32 = i32::try_from(rel).expect("backward branch within rel32 range");
                self.put4(rel32 as u32);
            }
            None => {
                self.fixups.push(Fixup {
                    at: self.offset(),
                    label,
                    kind: FixupKind::PcRel32,
                });
                self.put4(0);
            }
        }
    }

    /// `lea dst, [rip + label]`: position-independent address of a label.
    pub fn lea_rip(&mut self, dst: Reg, label: Label) {
        RexFlags::set_w().emit_two_op(&mut self.buf, dst.enc(), 0);
        self.put1(0x8D);
        self.put1(0x05 | ((dst.enc() & 7) << 3));
        self.emit_rel32_to(label);
    }

    /// A 4-byte jump-table entry holding `target - base`, where `base` is
    /// the table's start offset.
    pub fn jump_table_entry(&mut self, target: Label, base: CodeOffset) {
        match self.labels[target.0 as usize] {
            Some(t) => self.put4((t as i64 - base as i64) as u32),
            None => {
                self.fixups.push(Fixup {
                    at: self.offset(),
                    label: target,
                    kind: FixupKind::DispFromBase(base),
                });
                self.put4(0);
            }
        }
    }

    /// `jmp label` (rel32 form).
    pub fn jmp(&mut self, label: Label) {
        self.put1(0xE9);
        self.emit_rel32_to(label);
    }

    /// `j<cc> label` (rel32 form).
    pub fn jcc(&mut self, cc: CondCode, label: Label) {
        self.put1(0x0F);
        self.put1(0x80 | cc.bits());
        self.emit_rel32_to(label);
    }

    /// `jmp target` through a register.
    pub fn jmp_r(&mut self, target: Reg) {
        RexFlags::clear_w().emit_one_op(&mut self.buf, target.enc());
        self.put1(0xFF);
        self.modrm_rr(4, target.enc());
    }

    /// Patchable direct call: `call rel32` with a zero displacement and a
    /// `DirectCall` patch site over the field.
    pub fn call_patch(&mut self, target: PatchTarget) {
        self.put1(0xE8);
        let at = self.offset();
        self.put4(0);
        self.record_patch(at, PatchKind::DirectCall, target);
    }

    /// `call target` through a register (the far-call form, target already
    /// materialized).
    pub fn call_r(&mut self, target: Reg) {
        RexFlags::clear_w().emit_one_op(&mut self.buf, target.enc());
        self.put1(0xFF);
        self.modrm_rr(2, target.enc());
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.put1(0xC3);
    }

    /// `ud2`; anything jumping here is a compiler bug made loud.
    pub fn ud2(&mut self) {
        self.put1(0x0F);
        self.put1(0x0B);
    }

    /// `nop`.
    pub fn nop(&mut self) {
        self.put1(0x90);
    }

    /// Materialize a 64-bit constant that the installer must relocate;
    /// records the patch over the movabs immediate field.
    pub fn mov_ri64_patch(&mut self, dst: Reg, kind: PatchKind, target: PatchTarget) {
        let at = self.mov_ri64(dst, 0);
        self.record_patch(at, kind, target);
    }

    // ---- atomics ----

    /// `lock cmpxchg [mem], src`; compares against rax.
    pub fn lock_cmpxchg(&mut self, size: OperandSize, mem: &Amode, src: Reg) {
        self.put1(0xF0);
        self.prefix16(size);
        let mut rex = RexFlags::from_size(size);
        if size == OperandSize::Size8 {
            rex = rex.always_emit_if_8bit_needed(src.enc());
        }
        self.emit_rex_mem(rex, src.enc(), mem);
        self.put1(0x0F);
        self.put1(if size == OperandSize::Size8 { 0xB0 } else { 0xB1 });
        self.modrm_mem(src.enc(), mem);
    }

    /// `lock xadd [mem], src`: fetch-and-add, old value lands in `src`.
    pub fn lock_xadd(&mut self, size: OperandSize, mem: &Amode, src: Reg) {
        self.put1(0xF0);
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, src.enc(), mem);
        self.put1(0x0F);
        self.put1(if size == OperandSize::Size8 { 0xC0 } else { 0xC1 });
        self.modrm_mem(src.enc(), mem);
    }

    /// `xchg [mem], src`; the lock is implicit for memory operands.
    pub fn xchg(&mut self, size: OperandSize, mem: &Amode, src: Reg) {
        self.prefix16(size);
        let rex = RexFlags::from_size(size);
        self.emit_rex_mem(rex, src.enc(), mem);
        self.put1(if size == OperandSize::Size8 { 0x86 } else { 0x87 });
        self.modrm_mem(src.enc(), mem);
    }

    // ---- fences ----

    /// `mfence`: the only fence TSO actually needs for store-load.
    pub fn mfence(&mut self) {
        self.put1(0x0F);
        self.put1(0xAE);
        self.put1(0xF0);
    }

    /// `lfence`.
    pub fn lfence(&mut self) {
        self.put1(0x0F);
        self.put1(0xAE);
        self.put1(0xE8);
    }

    /// `sfence`.
    pub fn sfence(&mut self) {
        self.put1(0x0F);
        self.put1(0xAE);
        self.put1(0xF8);
    }

    // ---- SSE scalar ----

    fn sse_prefixed(
        &mut self,
        prefix: Option<u8>,
        opcode2: u8,
        rex: RexFlags,
        enc_g: u8,
        enc_e: u8,
    ) {
        if let Some(p) = prefix {
            self.put1(p);
        }
        rex.emit_two_op(&mut self.buf, enc_g, enc_e);
        self.put1(0x0F);
        self.put1(opcode2);
        self.modrm_rr(enc_g, enc_e);
    }

    fn sse_prefixed_mem(
        &mut self,
        prefix: Option<u8>,
        opcode2: u8,
        rex: RexFlags,
        enc_g: u8,
        mem: &Amode,
    ) {
        if let Some(p) = prefix {
            self.put1(p);
        }
        self.emit_rex_mem(rex, enc_g, mem);
        self.put1(0x0F);
        self.put1(opcode2);
        self.modrm_mem(enc_g, mem);
    }

    /// `movss/movsd dst, [mem]`.
    pub fn movs_rm(&mut self, fsize: FloatSize, dst: Reg, mem: &Amode) {
        self.sse_prefixed_mem(
            Some(fsize.prefix()),
            0x10,
            RexFlags::clear_w(),
            dst.enc(),
            mem,
        );
    }

    /// `movss/movsd [mem], src`.
    pub fn movs_mr(&mut self, fsize: FloatSize, mem: &Amode, src: Reg) {
        self.sse_prefixed_mem(
            Some(fsize.prefix()),
            0x11,
            RexFlags::clear_w(),
            src.enc(),
            mem,
        );
    }

    /// `movaps dst, src`: XMM register move, width-agnostic for scalars.
    pub fn movaps_rr(&mut self, dst: Reg, src: Reg) {
        self.sse_prefixed(None, 0x28, RexFlags::clear_w(), dst.enc(), src.enc());
    }

    /// `addss/subss/mulss/divss` (and the `sd` forms): `dst op= src`.
    pub fn sse_op_rr(&mut self, fsize: FloatSize, op: SseOp, dst: Reg, src: Reg) {
        self.sse_prefixed(
            Some(fsize.prefix()),
            op.opcode(),
            RexFlags::clear_w(),
            dst.enc(),
            src.enc(),
        );
    }

    /// `ucomiss/ucomisd x, y`: unordered float compare setting ZF/PF/CF.
    pub fn ucomis(&mut self, fsize: FloatSize, x: Reg, y: Reg) {
        let prefix = match fsize {
            FloatSize::Single => None,
            FloatSize::Double => Some(0x66),
        };
        self.sse_prefixed(prefix, 0x2E, RexFlags::clear_w(), x.enc(), y.enc());
    }

    /// `movd/movq xmm, gpr`: reinterpret int bits as float.
    pub fn movd_xr(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.put1(0x66);
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x0F);
        self.put1(0x6E);
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// `movd/movq gpr, xmm`: reinterpret float bits as int.
    pub fn movd_rx(&mut self, size: OperandSize, dst: Reg, src: Reg) {
        self.put1(0x66);
        let rex = RexFlags::from_size(size);
        rex.emit_two_op(&mut self.buf, src.enc(), dst.enc());
        self.put1(0x0F);
        self.put1(0x7E);
        self.modrm_rr(src.enc(), dst.enc());
    }

    /// `cvtsi2ss/cvtsi2sd dst, src` from a 32- or 64-bit integer.
    pub fn cvtsi2s(&mut self, fsize: FloatSize, isize_: OperandSize, dst: Reg, src: Reg) {
        self.put1(fsize.prefix());
        let rex = RexFlags::from_size(isize_);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x0F);
        self.put1(0x2A);
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// `cvttss2si/cvttsd2si dst, src` truncating to a 32- or 64-bit
    /// integer.
    pub fn cvtts2si(&mut self, fsize: FloatSize, isize_: OperandSize, dst: Reg, src: Reg) {
        self.put1(fsize.prefix());
        let rex = RexFlags::from_size(isize_);
        rex.emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x0F);
        self.put1(0x2C);
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// `cvtss2sd` / `cvtsd2ss` between float widths.
    pub fn cvts2s(&mut self, from: FloatSize, dst: Reg, src: Reg) {
        self.put1(from.prefix());
        RexFlags::clear_w().emit_two_op(&mut self.buf, dst.enc(), src.enc());
        self.put1(0x0F);
        self.put1(0x5A);
        self.modrm_rr(dst.enc(), src.enc());
    }

    /// Materialize a float constant through the scratch GPR (no constant
    /// pool: two instructions, fully position-independent).
    pub fn load_float_const(&mut self, scratch: Reg, dst: Reg, bits: FloatBits) {
        self.mov_ri32(scratch, bits.bits() as i32);
        self.movd_xr(OperandSize::Size32, dst, scratch);
    }

    /// Materialize a double constant through the scratch GPR.
    pub fn load_double_const(&mut self, scratch: Reg, dst: Reg, bits: DoubleBits) {
        self.mov_ri(OperandSize::Size64, scratch, bits.bits() as i64);
        self.movd_xr(OperandSize::Size64, dst, scratch);
    }
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Assembler({} bytes)", self.buf.len())
    }
}
