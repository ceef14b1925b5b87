//! Code emission: allocated LIR to bytes plus side tables.
//!
//! Blocks emit in the generator's order, each behind a bound label, with
//! fallthrough branches elided. Before any operation carrying a frame
//! state the emitter records the current buffer position into the
//! safepoint table. Deoptimization stubs and other cold sequences emit
//! after the last block. The prologue and epilogue bracket everything;
//! `Return` delegates to the epilogue.

use log::debug;

use crate::context::CancelToken;
use crate::ir::{Block, Constant, Kind, Value};
use crate::isa::amd64::args::{Amode, CondCode, OperandSize, Scale};
use crate::isa::amd64::asm::{AluOp, Assembler, FloatSize, Label, ShiftKind};
use crate::isa::amd64::regs::{self, Reg};
use crate::lir::{
    CallTargetKind, DivKind, FloatConvertOp, FrameMap, Inst, Lir, RmwOp, UnaryOp,
};
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::{
    Barriers, CompiledCode, DeoptStubRecord, ExceptionHandler, PatchTarget, RuntimeCaps,
    SafepointRecord, DEOPTIMIZE,
};
use crate::settings::CoreConfig;
use crate::ir::state::{DeoptAction, DeoptReason};
use crate::ir::StateId;

/// Emit allocated LIR into an installable artifact.
pub fn emit_code(
    lir: &Lir,
    frame: &FrameMap,
    caps: &dyn RuntimeCaps,
    config: &CoreConfig,
    cancel: &CancelToken,
) -> CodegenResult<CompiledCode> {
    debug_assert!(frame.is_frozen(), "emitter ran before the frame froze");
    let mut emitter = CodeEmitter::new(lir, frame, caps, config);
    emitter.emit_all(cancel)?;
    emitter.finish()
}

struct PendingStub {
    label: Label,
    action: DeoptAction,
    reason: DeoptReason,
    state: StateId,
}

struct PendingHandler {
    start: u32,
    end: u32,
    handler: Block,
}

struct CodeEmitter<'a> {
    lir: &'a Lir,
    frame: &'a FrameMap,
    caps: &'a dyn RuntimeCaps,
    config: &'a CoreConfig,
    asm: Assembler,
    frame_size: u32,
    block_labels: Vec<Label>,
    safepoints: Vec<SafepointRecord>,
    stubs: Vec<PendingStub>,
    handlers: Vec<PendingHandler>,
}

impl<'a> CodeEmitter<'a> {
    fn new(
        lir: &'a Lir,
        frame: &'a FrameMap,
        caps: &'a dyn RuntimeCaps,
        config: &'a CoreConfig,
    ) -> CodeEmitter<'a> {
        let mut asm = Assembler::new();
        let block_labels = (0..lir.blocks.len()).map(|_| asm.new_label()).collect();
        CodeEmitter {
            lir,
            frame,
            caps,
            config,
            asm,
            frame_size: frame.frame_size(),
            block_labels,
            safepoints: Vec::new(),
            stubs: Vec::new(),
            handlers: Vec::new(),
        }
    }

    fn emit_all(&mut self, cancel: &CancelToken) -> CodegenResult<()> {
        self.emit_prologue();
        let order = &self.lir.order;
        for (i, &b) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(CodegenError::Cancelled);
            }
            self.asm.bind(self.block_labels[b.index()]);
            let next = order.get(i + 1).copied();
            for inst in &self.lir.block(b).insts {
                if let Some(sid) = inst.frame_state() {
                    self.safepoints.push(SafepointRecord {
                        offset: self.asm.offset(),
                        state: sid,
                    });
                }
                self.emit_inst(inst, next)?;
            }
        }
        self.emit_stubs()?;
        Ok(())
    }

    fn finish(self) -> CodegenResult<CompiledCode> {
        let CodeEmitter {
            asm,
            frame_size,
            safepoints,
            stubs,
            handlers,
            block_labels,
            caps,
            ..
        } = self;

        let mut deopt_stubs = Vec::with_capacity(stubs.len());
        for stub in &stubs {
            let offset = asm
                .label_offset(stub.label)
                .expect("stub label bound during stub emission");
            deopt_stubs.push(DeoptStubRecord {
                offset,
                reason: stub.reason,
                action: stub.action,
                encoded: caps.encode_deopt_action_and_reason(stub.action, stub.reason),
                state: stub.state,
            });
        }
        let exception_handlers = handlers
            .iter()
            .map(|h| ExceptionHandler {
                start: h.start,
                end: h.end,
                handler: asm
                    .label_offset(block_labels[h.handler.index()])
                    .expect("handler block emitted"),
            })
            .collect();

        let (code, patch_sites) = asm.finish()?;
        debug!(
            "emitted {} bytes, {} safepoints, {} stubs",
            code.len(),
            safepoints.len(),
            deopt_stubs.len()
        );
        Ok(CompiledCode {
            code,
            entry_offset: 0,
            frame_size,
            safepoints,
            exception_handlers,
            patch_sites,
            deopt_stubs,
        })
    }

    // ---- frame context ----

    fn emit_prologue(&mut self) {
        self.asm.push_r(regs::rbp());
        self.asm
            .mov_rr(OperandSize::Size64, regs::rbp(), regs::rsp());
        if self.frame_size > 0 {
            self.asm.alu_ri(
                OperandSize::Size64,
                AluOp::Sub,
                regs::rsp(),
                self.frame_size as i32,
            );
        }
        // Stack banging: touch each shadow page below the new frame so a
        // stack overflow traps here, where the frame state is trivial.
        for page in 1..=self.config.stack_shadow_pages {
            let off = -((page * CoreConfig::PAGE_SIZE) as i32);
            self.asm.mov_mr(
                OperandSize::Size32,
                &Amode::base_disp(regs::rsp(), off),
                regs::rax(),
            );
        }
    }

    fn emit_epilogue(&mut self) {
        self.asm
            .mov_rr(OperandSize::Size64, regs::rsp(), regs::rbp());
        self.asm.pop_r(regs::rbp());
        self.asm.ret();
    }

    // ---- operand resolution ----

    fn reg_of(v: &Value) -> CodegenResult<Reg> {
        match v {
            Value::Reg(r, _) => Ok(*r),
            other => Err(CodegenError::Unsupported(format!(
                "operand not in a register at emission: {}",
                other
            ))),
        }
    }

    fn slot_amode(&self, v: &Value) -> CodegenResult<Amode> {
        match v {
            Value::Stack(s) => Ok(Amode::base_disp(
                regs::rsp(),
                s.sp_offset(self.frame_size),
            )),
            other => Err(CodegenError::Unsupported(format!(
                "operand not a stack slot at emission: {}",
                other
            ))),
        }
    }

    /// An address operand resolved to base/index registers.
    fn amode_of(&self, v: &Value) -> CodegenResult<Amode> {
        match v {
            Value::Address(a) => {
                let base = Self::reg_of(&a.base)?;
                let index = match &a.index {
                    Value::Illegal => None,
                    iv => Some((Self::reg_of(iv)?, a.scale)),
                };
                Ok(Amode {
                    base,
                    index,
                    disp: a.disp,
                })
            }
            Value::Stack(_) => self.slot_amode(v),
            other => Err(CodegenError::Unsupported(format!(
                "operand not addressable at emission: {}",
                other
            ))),
        }
    }

    fn label_of(&self, b: Block) -> Label {
        self.block_labels[b.index()]
    }

    // ---- moves ----

    fn emit_move(&mut self, kind: Kind, dst: &Value, src: &Value) -> CodegenResult<()> {
        let size = int_size(kind);
        match (dst, src) {
            (Value::Reg(d, _), Value::Reg(s, _)) => {
                if kind.is_float() {
                    self.asm.movaps_rr(*d, *s);
                } else if d != s {
                    self.asm.mov_rr(size, *d, *s);
                }
            }
            (Value::Reg(d, _), Value::Stack(_)) => {
                let mem = self.slot_amode(src)?;
                if kind.is_float() {
                    self.asm.movs_rm(float_size(kind), *d, &mem);
                } else {
                    self.emit_extending_load_slot(kind, *d, &mem);
                }
            }
            (Value::Stack(_), Value::Reg(s, _)) => {
                let mem = self.slot_amode(dst)?;
                if kind.is_float() {
                    self.asm.movs_mr(float_size(kind), &mem, *s);
                } else {
                    self.asm.mov_mr(mem_size(kind), &mem, *s);
                }
            }
            _ => {
                return Err(CodegenError::Unsupported(format!(
                    "move {} <- {} at emission",
                    dst, src
                )))
            }
        }
        Ok(())
    }

    /// Loads from spill slots widen sub-int kinds like memory loads do.
    fn emit_extending_load_slot(&mut self, kind: Kind, dst: Reg, mem: &Amode) {
        match kind {
            Kind::Boolean | Kind::Char => self.asm.movzx_rm(
                if kind == Kind::Boolean {
                    OperandSize::Size8
                } else {
                    OperandSize::Size16
                },
                dst,
                mem,
            ),
            Kind::Byte => self.asm.movsx_rm(OperandSize::Size8, OperandSize::Size32, dst, mem),
            Kind::Short => self.asm.movsx_rm(OperandSize::Size16, OperandSize::Size32, dst, mem),
            Kind::Int => self.asm.mov_rm(OperandSize::Size32, dst, mem),
            Kind::Long | Kind::Object => self.asm.mov_rm(OperandSize::Size64, dst, mem),
            _ => unreachable!("float handled by caller"),
        }
    }

    fn emit_const_to(&mut self, dst: &Value, c: Constant) -> CodegenResult<()> {
        match dst {
            Value::Reg(d, _) => self.emit_const_to_reg(*d, c),
            Value::Stack(_) => {
                let mem = self.slot_amode(dst)?;
                match c {
                    Constant::Int(v) => self.asm.mov_mi(OperandSize::Size32, &mem, v),
                    Constant::Null => self.asm.mov_mi(OperandSize::Size64, &mem, 0),
                    Constant::Long(v) => match i32::try_from(v) {
                        Ok(v32) => self.asm.mov_mi(OperandSize::Size64, &mem, v32),
                        Err(_) => {
                            // Materialize through the scratch register.
                            self.asm.mov_ri64(regs::scratch_reg(), v as u64);
                            self.asm.mov_mr(OperandSize::Size64, &mem, regs::scratch_reg());
                        }
                    },
                    Constant::Float(bits) => {
                        self.asm.mov_mi(OperandSize::Size32, &mem, bits.bits() as i32)
                    }
                    Constant::Double(bits) => {
                        self.asm.mov_ri64(regs::scratch_reg(), bits.bits());
                        self.asm.mov_mr(OperandSize::Size64, &mem, regs::scratch_reg());
                    }
                    Constant::Object(_) => {
                        self.emit_const_to_reg(regs::scratch_reg(), c)?;
                        self.asm.mov_mr(OperandSize::Size64, &mem, regs::scratch_reg());
                    }
                }
                Ok(())
            }
            other => Err(CodegenError::Unsupported(format!(
                "constant destination {} at emission",
                other
            ))),
        }
    }

    fn emit_const_to_reg(&mut self, d: Reg, c: Constant) -> CodegenResult<()> {
        match c {
            Constant::Int(v) => self.asm.mov_ri32(d, v),
            Constant::Long(v) => self.asm.mov_ri(OperandSize::Size64, d, v),
            Constant::Null => self.asm.mov_ri32(d, 0),
            Constant::Object(_) => {
                if self.caps.needs_data_patch(&c) {
                    self.asm.mov_ri64_patch(
                        d,
                        crate::runtime::PatchKind::ObjectRef,
                        PatchTarget::Data(c),
                    );
                } else {
                    self.asm.mov_ri64(d, 0);
                }
            }
            Constant::Float(bits) => self.asm.load_float_const(regs::scratch_reg(), d, bits),
            Constant::Double(bits) => self.asm.load_double_const(regs::scratch_reg(), d, bits),
        }
        Ok(())
    }

    /// Force an ALU-position operand into reg-or-imm form for CMOV-style
    /// consumers that need r/m; constants go through the scratch reg.
    fn cmov_source(&mut self, v: &Value, size: OperandSize) -> CodegenResult<Reg> {
        match v {
            Value::Reg(r, _) => Ok(*r),
            Value::Constant(c) => {
                let scratch = regs::scratch_reg();
                match c.as_long() {
                    Some(imm) => self.asm.mov_ri(size, scratch, imm),
                    None => self.emit_const_to_reg(scratch, *c)?,
                }
                Ok(scratch)
            }
            other => Err(CodegenError::Unsupported(format!(
                "conditional-move source {} at emission",
                other
            ))),
        }
    }

    // ---- instruction dispatch ----

    fn emit_inst(&mut self, inst: &Inst, next: Option<Block>) -> CodegenResult<()> {
        match inst {
            Inst::MoveFromReg { kind, dst, src } | Inst::MoveToReg { kind, dst, src } => {
                match src {
                    Value::Constant(c) => self.emit_const_to(dst, *c)?,
                    _ => self.emit_move(*kind, dst, src)?,
                }
            }
            Inst::MoveFromConst { dst, src } => self.emit_const_to(dst, *src)?,
            Inst::StackMove {
                kind,
                dst,
                src,
                scratch,
                backup,
            } => self.emit_stack_move(*kind, dst, src, *scratch, backup)?,
            Inst::Lea { dst, addr } => {
                let d = Self::reg_of(dst)?;
                let mem = self.amode_of(addr)?;
                self.asm.lea(d, &mem);
            }
            Inst::StackLea { dst, slot } => {
                let d = Self::reg_of(dst)?;
                let mem = self.slot_amode(slot)?;
                self.asm.lea(d, &mem);
            }
            Inst::Binary {
                op,
                size,
                dst,
                x,
                y,
            } => {
                let d = Self::reg_of(dst)?;
                let xr = Self::reg_of(x)?;
                if d != xr {
                    self.asm.mov_rr(*size, d, xr);
                }
                match y {
                    Value::Reg(yr, _) => self.asm.alu_rr(*size, *op, d, *yr),
                    Value::Stack(_) => {
                        let mem = self.slot_amode(y)?;
                        self.asm.alu_rm(*size, *op, d, &mem);
                    }
                    Value::Constant(c) => {
                        let imm = constant_imm32(c)?;
                        self.asm.alu_ri(*size, *op, d, imm);
                    }
                    other => {
                        return Err(CodegenError::Unsupported(format!(
                            "ALU operand {} at emission",
                            other
                        )))
                    }
                }
            }
            Inst::Unary { op, size, dst, src } => {
                let d = Self::reg_of(dst)?;
                let s = Self::reg_of(src)?;
                if d != s {
                    self.asm.mov_rr(*size, d, s);
                }
                match op {
                    UnaryOp::Inc => self.asm.inc_r(*size, d),
                    UnaryOp::Dec => self.asm.dec_r(*size, d),
                    UnaryOp::Neg => self.asm.neg_r(*size, d),
                    UnaryOp::Not => self.asm.not_r(*size, d),
                }
            }
            Inst::Mul { size, dst, x, y } => {
                let d = Self::reg_of(dst)?;
                let xr = Self::reg_of(x)?;
                if d != xr {
                    self.asm.mov_rr(*size, d, xr);
                }
                let yr = Self::reg_of(y)?;
                self.asm.imul_rr(*size, d, yr);
            }
            Inst::MulImm { size, dst, x, imm } => {
                let d = Self::reg_of(dst)?;
                let xr = Self::reg_of(x)?;
                self.asm.imul_rri(*size, d, xr, *imm);
            }
            Inst::DivRem {
                kind,
                size,
                divisor,
                ..
            } => {
                let dr = Self::reg_of(divisor)?;
                debug_assert!(dr != regs::rax() && dr != regs::rdx());
                match kind {
                    DivKind::Signed => {
                        self.asm.cdq(*size);
                        self.asm.idiv_r(*size, dr);
                    }
                    DivKind::Unsigned => {
                        self.asm
                            .alu_rr(OperandSize::Size32, AluOp::Xor, regs::rdx(), regs::rdx());
                        self.asm.div_r(*size, dr);
                    }
                }
            }
            Inst::FloatBinary {
                op,
                kind,
                dst,
                x,
                y,
            } => {
                let d = Self::reg_of(dst)?;
                let xr = Self::reg_of(x)?;
                if d != xr {
                    self.asm.movaps_rr(d, xr);
                }
                let yr = Self::reg_of(y)?;
                self.asm.sse_op_rr(float_size(*kind), *op, d, yr);
            }
            Inst::Shift {
                kind,
                size,
                dst,
                value,
                count,
            } => {
                let d = Self::reg_of(dst)?;
                let v = Self::reg_of(value)?;
                if d != v {
                    self.asm.mov_rr(*size, d, v);
                }
                match count {
                    Value::Constant(c) => {
                        let imm = constant_imm32(c)? as u8;
                        self.asm.shift_ri(*size, *kind, d, imm);
                    }
                    Value::Reg(r, _) => {
                        debug_assert_eq!(*r, regs::rcx(), "shift count must sit in cl");
                        self.asm.shift_cl(*size, *kind, d);
                    }
                    other => {
                        return Err(CodegenError::Unsupported(format!(
                            "shift count {} at emission",
                            other
                        )))
                    }
                }
            }
            Inst::Cmp { size, x, y } => {
                let xr = Self::reg_of(x)?;
                match y {
                    Value::Reg(yr, _) => self.asm.alu_rr(*size, AluOp::Cmp, xr, *yr),
                    Value::Stack(_) => {
                        let mem = self.slot_amode(y)?;
                        self.asm.alu_rm(*size, AluOp::Cmp, xr, &mem);
                    }
                    Value::Constant(c) => {
                        let imm = constant_imm32(c)?;
                        self.asm.alu_ri(*size, AluOp::Cmp, xr, imm);
                    }
                    other => {
                        return Err(CodegenError::Unsupported(format!(
                            "compare operand {} at emission",
                            other
                        )))
                    }
                }
            }
            Inst::Test { size, x, y } => {
                let xr = Self::reg_of(x)?;
                match y {
                    Value::Reg(yr, _) => self.asm.test_rr(*size, xr, *yr),
                    Value::Constant(c) => self.asm.test_ri(*size, xr, constant_imm32(c)?),
                    other => {
                        return Err(CodegenError::Unsupported(format!(
                            "test operand {} at emission",
                            other
                        )))
                    }
                }
            }
            Inst::FloatCmp { kind, x, y } => {
                let xr = Self::reg_of(x)?;
                let yr = Self::reg_of(y)?;
                self.asm.ucomis(float_size(*kind), xr, yr);
            }
            Inst::Branch {
                cond,
                float_unordered,
                true_target,
                false_target,
            } => self.emit_branch(*cond, *float_unordered, *true_target, *false_target, next),
            Inst::Jump { target } => {
                if next != Some(*target) {
                    let l = self.label_of(*target);
                    self.asm.jmp(l);
                }
            }
            Inst::CMove {
                size,
                cond,
                float_unordered,
                dst,
                true_value,
                false_value,
            } => {
                let d = Self::reg_of(dst)?;
                // dst := true, then overwrite on the inverted condition.
                match true_value {
                    Value::Constant(c) => self.emit_const_to(dst, *c)?,
                    _ => self.emit_move(kind_for_size(*size), dst, true_value)?,
                }
                match false_value {
                    Value::Stack(_) => {
                        let mem = self.slot_amode(false_value)?;
                        self.asm.cmov_rm(*size, cond.invert(), d, &mem);
                    }
                    _ => {
                        let fr = self.cmov_source(false_value, *size)?;
                        self.asm.cmov_rr(*size, cond.invert(), d, fr);
                    }
                }
                // Unordered float compares set PF; route the parity case
                // to the side the semantics demand.
                if let Some(unordered_is_true) = float_unordered {
                    let pick = if *unordered_is_true {
                        true_value
                    } else {
                        false_value
                    };
                    let pr = self.cmov_source(pick, *size)?;
                    self.asm.cmov_rr(*size, CondCode::P, d, pr);
                }
            }
            Inst::SetCc { cond, dst } => {
                let d = Self::reg_of(dst)?;
                self.asm.setcc(*cond, d);
                self.asm.movzx_rr(OperandSize::Size8, d, d);
            }
            Inst::Load { kind, dst, addr, .. } => {
                let mem = self.amode_of(addr)?;
                self.emit_load(*kind, dst, &mem)?;
            }
            Inst::Store {
                kind, addr, src, ..
            } => {
                let mem = self.amode_of(addr)?;
                self.emit_store(*kind, &mem, src)?;
            }
            Inst::Cas {
                kind,
                addr,
                expected,
                new_value,
                old,
            } => {
                debug_assert_eq!(Self::reg_of(expected)?, regs::rax());
                debug_assert_eq!(Self::reg_of(old)?, regs::rax());
                let mem = self.amode_of(addr)?;
                let nv = Self::reg_of(new_value)?;
                self.asm.lock_cmpxchg(int_size(*kind), &mem, nv);
            }
            Inst::AtomicRmw {
                op,
                kind,
                addr,
                value,
                dst,
            } => {
                let mem = self.amode_of(addr)?;
                let d = Self::reg_of(dst)?;
                let v = Self::reg_of(value)?;
                if d != v {
                    self.asm.mov_rr(int_size(*kind), d, v);
                }
                match op {
                    RmwOp::Add => self.asm.lock_xadd(int_size(*kind), &mem, d),
                    RmwOp::Swap => self.asm.xchg(int_size(*kind), &mem, d),
                }
            }
            Inst::MemBar { required } => {
                if required.contains(Barriers::STORE_LOAD) {
                    self.asm.mfence();
                }
            }
            Inst::SignExtend {
                from_bits,
                to_bits,
                dst,
                src,
            } => {
                let d = Self::reg_of(dst)?;
                let s = Self::reg_of(src)?;
                let to = OperandSize::from_bits(*to_bits as u32);
                match from_bits {
                    8 => self.asm.movsx_rr(OperandSize::Size8, to, d, s),
                    16 => self.asm.movsx_rr(OperandSize::Size16, to, d, s),
                    32 => self.asm.movsx_rr(OperandSize::Size32, OperandSize::Size64, d, s),
                    _ => {
                        return Err(CodegenError::Unsupported(format!(
                            "sign extension from {} bits",
                            from_bits
                        )))
                    }
                }
            }
            Inst::ZeroExtend {
                from_bits,
                dst,
                src,
                ..
            } => {
                let d = Self::reg_of(dst)?;
                let s = Self::reg_of(src)?;
                match from_bits {
                    8 => self.asm.movzx_rr(OperandSize::Size8, d, s),
                    16 => self.asm.movzx_rr(OperandSize::Size16, d, s),
                    32 => self.asm.mov_rr(OperandSize::Size32, d, s),
                    n if *n < 32 => {
                        // Odd widths mask after a DWORD move.
                        if d != s {
                            self.asm.mov_rr(OperandSize::Size32, d, s);
                        }
                        self.asm
                            .alu_ri(OperandSize::Size32, AluOp::And, d, (1i32 << n) - 1);
                    }
                    _ => {
                        return Err(CodegenError::Unsupported(format!(
                            "zero extension from {} bits",
                            from_bits
                        )))
                    }
                }
            }
            Inst::Narrow { dst, src } => {
                let d = Self::reg_of(dst)?;
                let s = Self::reg_of(src)?;
                // A DWORD move zeroes the upper half.
                self.asm.mov_rr(OperandSize::Size32, d, s);
            }
            Inst::Reinterpret { from, to, dst, src } => {
                let d = Self::reg_of(dst)?;
                let s = Self::reg_of(src)?;
                match (from, to) {
                    (Kind::Int, Kind::Float) => self.asm.movd_xr(OperandSize::Size32, d, s),
                    (Kind::Long, Kind::Double) => self.asm.movd_xr(OperandSize::Size64, d, s),
                    (Kind::Float, Kind::Int) => self.asm.movd_rx(OperandSize::Size32, d, s),
                    (Kind::Double, Kind::Long) => self.asm.movd_rx(OperandSize::Size64, d, s),
                    _ => {
                        return Err(CodegenError::Unsupported(format!(
                            "reinterpret {:?} as {:?}",
                            from, to
                        )))
                    }
                }
            }
            Inst::FloatConvert { op, dst, src } => {
                let d = Self::reg_of(dst)?;
                let s = Self::reg_of(src)?;
                match op {
                    FloatConvertOp::IntToFloat => {
                        self.asm
                            .cvtsi2s(FloatSize::Single, OperandSize::Size32, d, s)
                    }
                    FloatConvertOp::IntToDouble => {
                        self.asm
                            .cvtsi2s(FloatSize::Double, OperandSize::Size32, d, s)
                    }
                    FloatConvertOp::LongToFloat => {
                        self.asm
                            .cvtsi2s(FloatSize::Single, OperandSize::Size64, d, s)
                    }
                    FloatConvertOp::LongToDouble => {
                        self.asm
                            .cvtsi2s(FloatSize::Double, OperandSize::Size64, d, s)
                    }
                    FloatConvertOp::FloatToInt => {
                        self.asm
                            .cvtts2si(FloatSize::Single, OperandSize::Size32, d, s)
                    }
                    FloatConvertOp::FloatToLong => {
                        self.asm
                            .cvtts2si(FloatSize::Single, OperandSize::Size64, d, s)
                    }
                    FloatConvertOp::DoubleToInt => {
                        self.asm
                            .cvtts2si(FloatSize::Double, OperandSize::Size32, d, s)
                    }
                    FloatConvertOp::DoubleToLong => {
                        self.asm
                            .cvtts2si(FloatSize::Double, OperandSize::Size64, d, s)
                    }
                    FloatConvertOp::FloatToDouble => self.asm.cvts2s(FloatSize::Single, d, s),
                    FloatConvertOp::DoubleToFloat => self.asm.cvts2s(FloatSize::Double, d, s),
                }
            }
            Inst::SequentialSwitch {
                size,
                key,
                keys,
                targets,
                default_target,
            } => {
                let k = Self::reg_of(key)?;
                for (i, &kv) in keys.iter().enumerate() {
                    self.asm.alu_ri(*size, AluOp::Cmp, k, kv);
                    let l = self.label_of(targets[i]);
                    self.asm.jcc(CondCode::E, l);
                }
                if next != Some(*default_target) {
                    let l = self.label_of(*default_target);
                    self.asm.jmp(l);
                }
            }
            Inst::TableSwitch {
                index,
                low,
                targets,
                default_target,
                idx_scratch,
                addr_scratch,
            } => {
                self.emit_table_switch(
                    index,
                    *low,
                    targets,
                    *default_target,
                    idx_scratch,
                    addr_scratch,
                )?;
            }
            Inst::Call { info } => {
                let start = self.asm.offset();
                match &info.target {
                    CallTargetKind::DirectMethod(m) => {
                        self.asm.call_patch(PatchTarget::Method(m.0));
                    }
                    CallTargetKind::Foreign { name, address, near } => {
                        if *near {
                            self.asm.call_patch(PatchTarget::Foreign(*name));
                        } else {
                            // Far form: materialize the absolute address.
                            self.asm.mov_ri64(regs::scratch_reg(), *address);
                            self.asm.call_r(regs::scratch_reg());
                        }
                    }
                    CallTargetKind::Indirect => {
                        let target = info
                            .uses
                            .last()
                            .and_then(|v| v.as_reg())
                            .ok_or_else(|| {
                                CodegenError::Unsupported(
                                    "indirect call without target register".to_string(),
                                )
                            })?;
                        self.asm.call_r(target);
                    }
                }
                if let Some(handler) = info.exception_edge {
                    self.handlers.push(PendingHandler {
                        start,
                        end: self.asm.offset(),
                        handler,
                    });
                }
            }
            Inst::Deoptimize {
                action,
                reason,
                state,
            } => {
                let label = self.asm.new_label();
                self.stubs.push(PendingStub {
                    label,
                    action: *action,
                    reason: *reason,
                    state: *state,
                });
                self.asm.jmp(label);
            }
            Inst::Safepoint { .. } => {
                // The frame state was recorded against this offset; the
                // poll itself is owned by the host runtime's code patching.
            }
            Inst::Return { .. } => self.emit_epilogue(),
        }
        Ok(())
    }

    fn emit_branch(
        &mut self,
        cond: CondCode,
        float_unordered: Option<bool>,
        true_target: Block,
        false_target: Block,
        next: Option<Block>,
    ) {
        let tl = self.label_of(true_target);
        let fl = self.label_of(false_target);
        if let Some(unordered_is_true) = float_unordered {
            // NaN raises PF; dispatch it before the ordered test.
            if unordered_is_true {
                self.asm.jcc(CondCode::P, tl);
            } else {
                self.asm.jcc(CondCode::P, fl);
            }
            self.asm.jcc(cond, tl);
            if next != Some(false_target) {
                self.asm.jmp(fl);
            }
            return;
        }
        if next == Some(false_target) {
            self.asm.jcc(cond, tl);
        } else if next == Some(true_target) {
            self.asm.jcc(cond.invert(), fl);
        } else {
            self.asm.jcc(cond, tl);
            self.asm.jmp(fl);
        }
    }

    fn emit_load(&mut self, kind: Kind, dst: &Value, mem: &Amode) -> CodegenResult<()> {
        let d = Self::reg_of(dst)?;
        match kind {
            Kind::Boolean => self.asm.movzx_rm(OperandSize::Size8, d, mem),
            Kind::Byte => self
                .asm
                .movsx_rm(OperandSize::Size8, OperandSize::Size32, d, mem),
            Kind::Char => self.asm.movzx_rm(OperandSize::Size16, d, mem),
            Kind::Short => self
                .asm
                .movsx_rm(OperandSize::Size16, OperandSize::Size32, d, mem),
            Kind::Int => self.asm.mov_rm(OperandSize::Size32, d, mem),
            Kind::Long => self.asm.mov_rm(OperandSize::Size64, d, mem),
            Kind::Object => {
                if self.config.use_compressed_refs {
                    // Narrow load, then decode: ref = (narrow << shift) + base.
                    self.asm.mov_rm(OperandSize::Size32, d, mem);
                    if self.config.narrow_ref_shift > 0 {
                        self.asm.shift_ri(
                            OperandSize::Size64,
                            ShiftKind::Shl,
                            d,
                            self.config.narrow_ref_shift,
                        );
                    }
                    if self.config.narrow_ref_base != 0 {
                        self.asm
                            .mov_ri(OperandSize::Size64, regs::scratch_reg(), self.config.narrow_ref_base);
                        self.asm
                            .alu_rr(OperandSize::Size64, AluOp::Add, d, regs::scratch_reg());
                    }
                } else {
                    self.asm.mov_rm(OperandSize::Size64, d, mem);
                }
            }
            Kind::Float => self.asm.movs_rm(FloatSize::Single, d, mem),
            Kind::Double => self.asm.movs_rm(FloatSize::Double, d, mem),
            _ => {
                return Err(CodegenError::Unsupported(format!(
                    "load of kind {:?}",
                    kind
                )))
            }
        }
        Ok(())
    }

    fn emit_store(&mut self, kind: Kind, mem: &Amode, src: &Value) -> CodegenResult<()> {
        if let Value::Constant(c) = src {
            // The generator only lets storable constants through; null
            // stores specialize to an immediate zero.
            let size = mem_size(kind);
            let imm = match c {
                Constant::Null => 0,
                Constant::Float(bits) => bits.bits() as i32,
                _ => constant_imm32(c)?,
            };
            if kind == Kind::Object && self.config.use_compressed_refs {
                debug_assert!(c.is_null(), "only null object constants are storable");
                self.asm.mov_mi(OperandSize::Size32, mem, 0);
            } else {
                self.asm.mov_mi(size, mem, imm);
            }
            return Ok(());
        }
        let s = Self::reg_of(src)?;
        match kind {
            Kind::Boolean | Kind::Byte => self.asm.mov_mr(OperandSize::Size8, mem, s),
            Kind::Char | Kind::Short => self.asm.mov_mr(OperandSize::Size16, mem, s),
            Kind::Int => self.asm.mov_mr(OperandSize::Size32, mem, s),
            Kind::Long => self.asm.mov_mr(OperandSize::Size64, mem, s),
            Kind::Object => {
                if self.config.use_compressed_refs {
                    // Encode into the scratch register, store 32 bits.
                    let scratch = regs::scratch_reg();
                    self.asm.mov_rr(OperandSize::Size64, scratch, s);
                    if self.config.narrow_ref_base != 0 {
                        self.asm.mov_ri(
                            OperandSize::Size64,
                            regs::scratch_reg2(),
                            self.config.narrow_ref_base,
                        );
                        self.asm.alu_rr(
                            OperandSize::Size64,
                            AluOp::Sub,
                            scratch,
                            regs::scratch_reg2(),
                        );
                    }
                    if self.config.narrow_ref_shift > 0 {
                        self.asm.shift_ri(
                            OperandSize::Size64,
                            ShiftKind::Shr,
                            scratch,
                            self.config.narrow_ref_shift,
                        );
                    }
                    self.asm.mov_mr(OperandSize::Size32, mem, scratch);
                } else {
                    self.asm.mov_mr(OperandSize::Size64, mem, s);
                }
            }
            Kind::Float => self.asm.movs_mr(FloatSize::Single, mem, s),
            Kind::Double => self.asm.movs_mr(FloatSize::Double, mem, s),
            _ => {
                return Err(CodegenError::Unsupported(format!(
                    "store of kind {:?}",
                    kind
                )))
            }
        }
        Ok(())
    }

    fn emit_stack_move(
        &mut self,
        kind: Kind,
        dst: &Value,
        src: &Value,
        scratch: Reg,
        backup: &Value,
    ) -> CodegenResult<()> {
        let dst_mem = self.slot_amode(dst)?;
        let src_mem = self.slot_amode(src)?;
        let size = mem_size(kind);
        // 16- and 64-bit widths move through the stack directly.
        if matches!(size, OperandSize::Size16 | OperandSize::Size64) && !kind.is_float() {
            self.asm.push_m(size, &src_mem);
            self.asm.pop_m(size, &dst_mem);
            return Ok(());
        }
        // Otherwise: save scratch, load, store, restore.
        let backup_mem = self.slot_amode(backup)?;
        if kind.is_float() {
            let fs = float_size(kind);
            self.asm.movs_mr(fs, &backup_mem, scratch);
            self.asm.movs_rm(fs, scratch, &src_mem);
            self.asm.movs_mr(fs, &dst_mem, scratch);
            self.asm.movs_rm(fs, scratch, &backup_mem);
        } else {
            self.asm.mov_mr(size, &backup_mem, scratch);
            self.emit_extending_load_slot(kind, scratch, &src_mem);
            self.asm.mov_mr(size, &dst_mem, scratch);
            self.emit_extending_load_slot(kind, scratch, &backup_mem);
        }
        Ok(())
    }

    fn emit_table_switch(
        &mut self,
        index: &Value,
        low: i32,
        targets: &[Block],
        default_target: Block,
        idx_scratch: &Value,
        addr_scratch: &Value,
    ) -> CodegenResult<()> {
        let idx = Self::reg_of(index)?;
        let tmp = Self::reg_of(idx_scratch)?;
        let addr = Self::reg_of(addr_scratch)?;
        let default_label = self.label_of(default_target);
        let table_label = self.asm.new_label();

        if tmp != idx {
            self.asm.mov_rr(OperandSize::Size32, tmp, idx);
        }
        if low != 0 {
            self.asm.alu_ri(OperandSize::Size32, AluOp::Sub, tmp, low);
        }
        let len = i32::try_from(targets.len())
            .map_err(|_| CodegenError::OutOfRange("table switch entry count"))?;
        self.asm.alu_ri(OperandSize::Size32, AluOp::Cmp, tmp, len);
        self.asm.jcc(CondCode::AE, default_label);

        // addr := &table; tmp := table[tmp]; jmp addr + tmp.
        self.asm.lea_rip(addr, table_label);
        self.asm.movsx_rm(
            OperandSize::Size32,
            OperandSize::Size64,
            tmp,
            &Amode::base_index_disp(addr, tmp, Scale::Four, 0),
        );
        self.asm
            .alu_rr(OperandSize::Size64, AluOp::Add, addr, tmp);
        self.asm.jmp_r(addr);

        self.asm.bind(table_label);
        let base = self.asm.offset();
        for &t in targets {
            let l = self.label_of(t);
            self.asm.jump_table_entry(l, base);
        }
        Ok(())
    }

    fn emit_stubs(&mut self) -> CodegenResult<()> {
        if self.stubs.is_empty() {
            return Ok(());
        }
        let deopt_target = self.caps.lookup_foreign_call(&DEOPTIMIZE)?;
        for i in 0..self.stubs.len() {
            let (label, action, reason) = {
                let s = &self.stubs[i];
                (s.label, s.action, s.reason)
            };
            self.asm.bind(label);
            let encoded = self.caps.encode_deopt_action_and_reason(action, reason);
            // The deopt handler expects the (reason, action) word in the
            // scratch register.
            self.asm
                .mov_ri(OperandSize::Size64, regs::scratch_reg(), encoded as i64);
            if deopt_target.is_near() {
                self.asm.call_patch(PatchTarget::Foreign(DEOPTIMIZE.name));
            } else {
                self.asm.mov_ri64(regs::scratch_reg2(), deopt_target.address);
                self.asm.call_r(regs::scratch_reg2());
            }
            // The handler never returns; anything past it is a bug.
            self.asm.ud2();
        }
        Ok(())
    }
}

// ---- free helpers ----

fn int_size(kind: Kind) -> OperandSize {
    match kind.stack_kind() {
        Kind::Long | Kind::Object | Kind::Double => OperandSize::Size64,
        _ => OperandSize::Size32,
    }
}

fn mem_size(kind: Kind) -> OperandSize {
    match kind {
        Kind::Boolean | Kind::Byte => OperandSize::Size8,
        Kind::Char | Kind::Short => OperandSize::Size16,
        Kind::Int | Kind::Float => OperandSize::Size32,
        _ => OperandSize::Size64,
    }
}

fn float_size(kind: Kind) -> FloatSize {
    if kind == Kind::Double {
        FloatSize::Double
    } else {
        FloatSize::Single
    }
}

fn kind_for_size(size: OperandSize) -> Kind {
    if size.is64() {
        Kind::Long
    } else {
        Kind::Int
    }
}

fn constant_imm32(c: &Constant) -> CodegenResult<i32> {
    let v = c
        .as_long()
        .ok_or_else(|| CodegenError::Unsupported(format!("non-integer immediate {}", c)))?;
    i32::try_from(v).map_err(|_| CodegenError::OutOfRange("immediate exceeds 32 bits"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FrameState, MethodHandle};
    use crate::lir::{CallInfo, LirBlock};
    use crate::runtime::testing::TestRuntime;
    use crate::runtime::PatchKind;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02X}", b)).collect()
    }

    fn emit(lir: &Lir, caps: &TestRuntime, config: &CoreConfig) -> CompiledCode {
        let mut frame = FrameMap::new(8);
        frame.freeze();
        emit_code(lir, &frame, caps, config, &CancelToken::default()).unwrap()
    }

    fn one_block(insts: Vec<Inst>) -> Lir {
        let mut lir = Lir::default();
        lir.blocks.push(LirBlock {
            insts,
            ..Default::default()
        });
        lir.order = vec![Block::new(0)];
        lir
    }

    fn ret() -> Inst {
        Inst::Return {
            value: Value::Illegal,
        }
    }

    const PROLOGUE: &str = "55488BEC";
    const EPILOGUE: &str = "488BE55DC3";

    #[test]
    fn add_immediate_round_trip() {
        // v = rcx + 42 into rax: the emitted stream must contain the
        // ADD r/m, imm form with 42 in the immediate field.
        let lir = one_block(vec![
            Inst::Binary {
                op: AluOp::Add,
                size: OperandSize::Size32,
                dst: Value::reg(regs::rax(), Kind::Int),
                x: Value::reg(regs::rcx(), Kind::Int),
                y: Value::Constant(Constant::Int(42)),
            },
            Inst::Return {
                value: Value::reg(regs::rax(), Kind::Int),
            },
        ]);
        let caps = TestRuntime::default();
        let code = emit(&lir, &caps, &CoreConfig::default());
        let expected = format!("{}8BC183C02A{}", PROLOGUE, EPILOGUE);
        assert_eq!(hex(&code.code), expected);
        assert_eq!(code.frame_size, 0);
    }

    #[test]
    fn deopt_stub_carries_encoded_reason_and_action() {
        let mut lir = one_block(vec![]);
        let sid = lir.states.push(FrameState {
            bci: 3,
            ..Default::default()
        });
        lir.blocks[0].insts.push(Inst::Deoptimize {
            action: DeoptAction::InvalidateRecompile,
            reason: DeoptReason::NullCheck,
            state: sid,
        });
        let caps = TestRuntime::default();
        let code = emit(&lir, &caps, &CoreConfig::default());

        // jmp to the stub, then: mov r10, word; call; ud2.
        let expected = format!(
            "{}E90000000049C7C200020000E8000000000F0B",
            PROLOGUE
        );
        assert_eq!(hex(&code.code), expected);

        assert_eq!(code.deopt_stubs.len(), 1);
        let stub = &code.deopt_stubs[0];
        assert_eq!(stub.offset, 9);
        assert_eq!(
            stub.encoded,
            caps.encode_deopt_action_and_reason(
                DeoptAction::InvalidateRecompile,
                DeoptReason::NullCheck
            )
        );
        assert_eq!(stub.state, sid);

        // The deopt site records its frame state.
        assert_eq!(code.safepoints.len(), 1);
        assert_eq!(code.safepoints[0].offset, 4);
        assert_eq!(code.safepoints[0].state, sid);

        // And the stub's call is a patchable direct call to the runtime.
        assert_eq!(code.patch_sites.len(), 1);
        assert_eq!(code.patch_sites[0].kind, PatchKind::DirectCall);
        assert_eq!(
            code.patch_sites[0].target,
            PatchTarget::Foreign("deoptimize")
        );
    }

    #[test]
    fn far_deopt_target_materializes_address() {
        let mut lir = one_block(vec![]);
        let sid = lir.states.push(FrameState::default());
        lir.blocks[0].insts.push(Inst::Deoptimize {
            action: DeoptAction::None,
            reason: DeoptReason::UnreachedCode,
            state: sid,
        });
        let caps = TestRuntime {
            far_calls: true,
            ..Default::default()
        };
        let code = emit(&lir, &caps, &CoreConfig::default());
        // movabs r11, target; call r11 — no patchable call site.
        assert!(hex(&code.code).contains("49BB"));
        assert!(code.patch_sites.is_empty());
    }

    #[test]
    fn branch_elides_the_fallthrough_edge() {
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        let b2 = Block::new(2);
        let mut lir = Lir::default();
        lir.blocks.push(LirBlock {
            insts: vec![
                Inst::Cmp {
                    size: OperandSize::Size32,
                    x: Value::reg(regs::rax(), Kind::Int),
                    y: Value::Constant(Constant::Int(0)),
                },
                Inst::Branch {
                    cond: CondCode::E,
                    float_unordered: None,
                    true_target: b2,
                    false_target: b1,
                },
            ],
            succs: vec![b2, b1],
            ..Default::default()
        });
        lir.blocks.push(LirBlock {
            insts: vec![ret()],
            preds: vec![b0],
            ..Default::default()
        });
        lir.blocks.push(LirBlock {
            insts: vec![ret()],
            preds: vec![b0],
            ..Default::default()
        });
        lir.order = vec![b0, b1, b2];
        let caps = TestRuntime::default();
        let code = emit(&lir, &caps, &CoreConfig::default());
        // cmp; je b2 (over b1's epilogue); no jmp to the fallthrough b1.
        let expected = format!(
            "{}83F8000F8405000000{}{}",
            PROLOGUE, EPILOGUE, EPILOGUE
        );
        assert_eq!(hex(&code.code), expected);
    }

    #[test]
    fn call_with_exception_edge_fills_handler_table() {
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        let mut lir = Lir::default();
        let sid = lir.states.push(FrameState::default());
        lir.blocks.push(LirBlock {
            insts: vec![
                Inst::Call {
                    info: Box::new(CallInfo {
                        target: CallTargetKind::DirectMethod(MethodHandle(11)),
                        uses: smallvec::smallvec![],
                        defs: smallvec::smallvec![],
                        state: Some(sid),
                        exception_edge: Some(b1),
                    }),
                },
                Inst::Jump { target: b1 },
            ],
            succs: vec![b1],
            ..Default::default()
        });
        lir.blocks.push(LirBlock {
            insts: vec![ret()],
            preds: vec![b0],
            ..Default::default()
        });
        lir.order = vec![b0, b1];
        let caps = TestRuntime::default();
        let code = emit(&lir, &caps, &CoreConfig::default());

        // The jump to the next block vanishes; the handler range covers
        // exactly the call's bytes and points at b1.
        assert_eq!(code.exception_handlers.len(), 1);
        let h = &code.exception_handlers[0];
        assert_eq!((h.start, h.end), (4, 9));
        assert_eq!(h.handler, 9);
        // Patch site for the direct method call.
        assert_eq!(code.patch_sites.len(), 1);
        assert_eq!(code.patch_sites[0].target, PatchTarget::Method(11));
        // Safepoint at the call.
        assert_eq!(code.safepoints[0].offset, 4);
    }

    #[test]
    fn stack_bang_touches_shadow_pages() {
        let lir = one_block(vec![ret()]);
        let caps = TestRuntime::default();
        let config = CoreConfig {
            stack_shadow_pages: 2,
            ..Default::default()
        };
        let code = emit(&lir, &caps, &config);
        let s = hex(&code.code);
        // mov [rsp - 4096], eax and mov [rsp - 8192], eax.
        assert!(s.contains("89842400F0FFFF"));
        assert!(s.contains("89842400E0FFFF"));
    }

    #[test]
    fn table_switch_emits_table_and_bounds_check() {
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        let b2 = Block::new(2);
        let mut lir = Lir::default();
        lir.blocks.push(LirBlock {
            insts: vec![Inst::TableSwitch {
                index: Value::reg(regs::rcx(), Kind::Int),
                low: 0,
                targets: vec![b1, b2],
                default_target: b1,
                idx_scratch: Value::reg(regs::scratch_reg(), Kind::Long),
                addr_scratch: Value::reg(regs::scratch_reg2(), Kind::Long),
            }],
            succs: vec![b1, b2],
            ..Default::default()
        });
        lir.blocks.push(LirBlock {
            insts: vec![ret()],
            preds: vec![b0],
            ..Default::default()
        });
        lir.blocks.push(LirBlock {
            insts: vec![ret()],
            preds: vec![b0],
            ..Default::default()
        });
        lir.order = vec![b0, b1, b2];
        let caps = TestRuntime::default();
        let code = emit(&lir, &caps, &CoreConfig::default());
        let s = hex(&code.code);
        // Bounds check against the entry count, unsigned.
        assert!(s.contains("4183FA02"), "cmp r10d, 2 missing in {}", s);
        // Table entries are block offsets relative to the table base;
        // both targets are behind the table, so entries are positive.
        assert!(!code.code.is_empty());
    }

    #[test]
    fn compressed_reference_load_decodes() {
        let lir = one_block(vec![
            Inst::Load {
                kind: Kind::Object,
                dst: Value::reg(regs::rax(), Kind::Object),
                addr: Value::address(
                    Kind::Object,
                    Value::reg(regs::rsi(), Kind::Long),
                    16,
                ),
                state: None,
            },
            ret(),
        ]);
        let caps = TestRuntime::default();
        let config = CoreConfig {
            use_compressed_refs: true,
            narrow_ref_shift: 3,
            ..Default::default()
        };
        let code = emit(&lir, &caps, &config);
        let s = hex(&code.code);
        // 32-bit load followed by the shift decode.
        assert!(s.contains("8B4610"), "narrow load missing in {}", s);
        assert!(s.contains("48C1E003"), "shl rax, 3 missing in {}", s);
    }
}
