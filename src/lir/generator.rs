//! LIR generation: scheduled SSA nodes to machine operations.
//!
//! The generator walks each block's scheduled nodes in order, appending
//! LIR to the mirror block and maintaining a node→value map for operand
//! lookup. Constants, compares, and address nodes are lowered lazily at
//! their consumers so that flag-setting compares sit directly before the
//! branches that consume them. Phi data flow is resolved by moves at the
//! end of each predecessor (the front end splits critical edges).

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::context::CancelToken;
use crate::ir::graph::{CallTarget, MemAccess};
use crate::ir::{
    BinaryOp, Block, Condition, Constant, ConvertOp, DivRemOp, FrameState, Graph, InputStateId,
    Kind, Node, NodeData, ShiftOp, StateId, Value, Variable, VirtualSlot,
};
use crate::isa::amd64::args::{CondCode, OperandSize};
use crate::isa::amd64::asm::{AluOp, ShiftKind, SseOp};
use crate::isa::amd64::regs::{self, CallingConvention, Reg};
use crate::lir::{
    CallInfo, CallTargetKind, DivKind, FloatConvertOp, FrameMap, Inst, Lir, LirBlock, RmwOp,
    UnaryOp, VirtualSlotInfo,
};
use crate::result::{CodegenError, CodegenResult};
use crate::runtime::{Barriers, ForeignCallDescriptor, RuntimeCaps};
use crate::settings::CoreConfig;

/// Translate a scheduled graph into LIR, growing `frame` as needed.
pub fn generate_lir(
    graph: &Graph,
    frame: &mut FrameMap,
    caps: &dyn RuntimeCaps,
    config: &CoreConfig,
    cancel: &CancelToken,
) -> CodegenResult<Lir> {
    let mut gen = LirGenerator::new(graph, frame, caps, config);
    gen.run(cancel)?;
    Ok(gen.lir)
}

struct LirGenerator<'a> {
    graph: &'a Graph,
    frame: &'a mut FrameMap,
    caps: &'a dyn RuntimeCaps,
    config: &'a CoreConfig,
    lir: Lir,
    /// Node → operand, filled as nodes are lowered.
    values: Vec<Option<Value>>,
    /// Graph-level states already converted to LIR states.
    state_map: FxHashMap<InputStateId, StateId>,
    /// One scratch-backup spill slot per kind, for stack-to-stack moves.
    scratch_backups: FxHashMap<Kind, Value>,
    /// Location of each incoming argument, by signature index.
    incoming: Vec<Value>,
    current: Block,
}

impl<'a> LirGenerator<'a> {
    fn new(
        graph: &'a Graph,
        frame: &'a mut FrameMap,
        caps: &'a dyn RuntimeCaps,
        config: &'a CoreConfig,
    ) -> LirGenerator<'a> {
        let mut lir = Lir::default();
        for i in 0..graph.num_blocks() {
            let b = Block::new(i);
            lir.blocks.push(LirBlock {
                insts: Vec::new(),
                preds: graph.block(b).preds.clone(),
                succs: graph.block(b).succs.clone(),
                first_op_id: 0,
            });
        }
        lir.order = graph.order().to_vec();

        let incoming = incoming_locations(
            &caps.register_config().method_call,
            &graph.param_kinds,
            frame,
        );

        LirGenerator {
            graph,
            frame,
            caps,
            config,
            lir,
            values: vec![None; graph.num_nodes()],
            state_map: FxHashMap::default(),
            scratch_backups: FxHashMap::default(),
            incoming,
            current: Block::new(0),
        }
    }

    fn run(&mut self, cancel: &CancelToken) -> CodegenResult<()> {
        for &b in self.graph.order() {
            if cancel.is_cancelled() {
                return Err(CodegenError::Cancelled);
            }
            self.current = b;
            for &n in &self.graph.block(b).nodes {
                self.lower(n)?;
            }
        }
        Ok(())
    }

    // ---- infrastructure ----

    fn emit(&mut self, inst: Inst) {
        self.lir.blocks[self.current.index()].insts.push(inst);
    }

    fn new_variable(&mut self, kind: Kind) -> Value {
        let index = self.lir.num_variables;
        self.lir.num_variables += 1;
        Value::Variable(Variable { index, kind })
    }

    fn new_virtual_range(&mut self, slots: u32, ref_map: Vec<bool>) -> Value {
        let index = self.lir.vslots.len() as u32;
        self.lir.vslots.push(VirtualSlotInfo {
            kind: Kind::Long,
            slots,
            ref_map: Some(ref_map),
        });
        Value::VirtualStack(VirtualSlot {
            index,
            kind: Kind::Long,
        })
    }

    fn new_virtual_slot(&mut self, kind: Kind) -> Value {
        let index = self.lir.vslots.len() as u32;
        self.lir.vslots.push(VirtualSlotInfo {
            kind,
            slots: 1,
            ref_map: None,
        });
        Value::VirtualStack(VirtualSlot { index, kind })
    }

    /// The operand of a lowered node, lazily lowering the value-producing
    /// node families that are matched at their consumers.
    fn value_of(&mut self, n: Node) -> CodegenResult<Value> {
        if let Some(v) = &self.values[n.index()] {
            return Ok(v.clone());
        }
        let v = match self.graph.node(n) {
            NodeData::Constant { value } => Value::Constant(*value),
            NodeData::Phi { kind, .. } => {
                let kind = *kind;
                let var = self.new_variable(kind);
                var
            }
            NodeData::Compare { .. } => {
                // A compare consumed as a value materializes through SETcc.
                return self.lower_compare_to_bool(n);
            }
            NodeData::Address { .. } => self.address_value(n)?,
            other => {
                return Err(CodegenError::Unsupported(format!(
                    "node used before its scheduled definition: {:?}",
                    other
                )))
            }
        };
        self.values[n.index()] = Some(v.clone());
        Ok(v)
    }

    /// Force a value into a register-class operand (variable or register).
    fn use_reg(&mut self, v: Value, kind: Kind) -> Value {
        match v {
            Value::Variable(..) | Value::Reg(..) => v,
            _ => {
                let var = self.new_variable(kind);
                self.append_move(var.clone(), v, kind);
                var
            }
        }
    }

    /// Move selection: `MoveFromReg` when the source is a register or the
    /// destination is a stack location, `MoveToReg` otherwise,
    /// `MoveFromConst` for constants, `Lea` for addresses, and the
    /// decomposed `StackMove` when both sides live on the stack.
    fn append_move(&mut self, dst: Value, src: Value, kind: Kind) {
        let inst = match (&dst, &src) {
            (_, Value::Address(_)) => Inst::Lea { dst, addr: src },
            (_, Value::Constant(c)) => Inst::MoveFromConst { dst, src: *c },
            (d, s) if is_stack_location(d) && is_stack_location(s) => {
                let scratch = if kind.is_float() {
                    regs::xmm_scratch_reg()
                } else {
                    regs::scratch_reg()
                };
                let backup = self.scratch_backup_for(kind, scratch);
                Inst::StackMove {
                    kind,
                    dst,
                    src,
                    scratch,
                    backup,
                }
            }
            (d, s) if is_register_location(s) || is_stack_location(d) => {
                Inst::MoveFromReg { kind, dst, src }
            }
            _ => Inst::MoveToReg { kind, dst, src },
        };
        self.emit(inst);
    }

    /// The once-per-kind backup slot used to save the scratch register
    /// around a stack-to-stack move.
    fn scratch_backup_for(&mut self, kind: Kind, _scratch: Reg) -> Value {
        if let Some(v) = self.scratch_backups.get(&kind) {
            return v.clone();
        }
        let slot = self.new_virtual_slot(kind);
        self.scratch_backups.insert(kind, slot.clone());
        slot
    }

    fn state_for(&mut self, id: Option<InputStateId>) -> CodegenResult<Option<StateId>> {
        match id {
            None => Ok(None),
            Some(id) => self.state_id_for(id).map(Some),
        }
    }

    /// Convert a graph-level frame state to its LIR form, resolving node
    /// references to operands. Conversions are shared through `state_map`.
    fn state_id_for(&mut self, id: InputStateId) -> CodegenResult<StateId> {
        if let Some(&sid) = self.state_map.get(&id) {
            return Ok(sid);
        }
        let input = self.graph.state(id).clone();
        let caller = match input.caller {
            Some(c) => Some(self.state_id_for(c)?),
            None => None,
        };
        let mut locals = Vec::with_capacity(input.locals.len());
        for l in &input.locals {
            locals.push(match l {
                Some(n) => self.value_of(*n)?,
                None => Value::Illegal,
            });
        }
        let mut stack = Vec::with_capacity(input.stack.len());
        for &n in &input.stack {
            stack.push(self.value_of(n)?);
        }
        let mut locks = Vec::with_capacity(input.locks.len());
        for &n in &input.locks {
            locks.push(self.value_of(n)?);
        }
        let sid = self.lir.states.push(FrameState {
            bci: input.bci,
            locals,
            stack,
            locks,
            caller,
        });
        self.state_map.insert(id, sid);
        Ok(sid)
    }

    /// The address-operand form of a node: `Address` nodes resolve their
    /// components; any other pointer-valued node becomes a plain base
    /// register.
    fn as_address(&mut self, n: Node) -> CodegenResult<Value> {
        let v = self.value_of(n)?;
        match v {
            Value::Address(_) => Ok(v),
            other => {
                let base = self.use_reg(other, Kind::Long);
                Ok(Value::Address(Box::new(crate::ir::AddressValue {
                    kind: Kind::Long,
                    base,
                    index: Value::Illegal,
                    scale: crate::isa::amd64::args::Scale::One,
                    disp: 0,
                })))
            }
        }
    }

    /// Resolve an `Address` node into an address operand.
    fn address_value(&mut self, n: Node) -> CodegenResult<Value> {
        let (base, index, scale, disp) = match self.graph.node(n) {
            NodeData::Address {
                base,
                index,
                scale,
                disp,
            } => (*base, *index, *scale, *disp),
            other => {
                return Err(CodegenError::Unsupported(format!(
                    "expected address node, found {:?}",
                    other
                )))
            }
        };
        let base_v = self.value_of(base)?;
        let base_v = self.use_reg(base_v, Kind::Long);
        let index_v = match index {
            Some(i) => {
                let v = self.value_of(i)?;
                self.use_reg(v, Kind::Long)
            }
            None => Value::Illegal,
        };
        Ok(Value::Address(Box::new(crate::ir::AddressValue {
            kind: Kind::Long,
            base: base_v,
            index: index_v,
            scale,
            disp,
        })))
    }

    // ---- constant policy ----

    /// May this constant appear in an instruction's immediate field?
    fn can_inline_constant(&self, c: &Constant) -> bool {
        match c {
            Constant::Long(v) => {
                i32::try_from(*v).is_ok() && !self.caps.needs_data_patch(c)
            }
            Constant::Object(_) => false,
            Constant::Null => true,
            _ => !self.caps.needs_data_patch(c),
        }
    }

    /// May this constant be the right-hand side of a memory store?
    fn can_store_constant(&self, c: &Constant) -> bool {
        match c {
            Constant::Double(_) => false,
            _ => self.can_inline_constant(c),
        }
    }

    /// An ALU source operand: inlinable constants stay constants, all
    /// else is forced into a register.
    fn alu_operand(&mut self, v: Value, kind: Kind) -> Value {
        match &v {
            Value::Constant(c) if self.can_inline_constant(c) => v,
            Value::Constant(_) => self.use_reg(v, kind),
            Value::Variable(..) | Value::Reg(..) => v,
            _ => self.use_reg(v, kind),
        }
    }

    // ---- node dispatch ----

    fn lower(&mut self, n: Node) -> CodegenResult<()> {
        match self.graph.node(n).clone() {
            NodeData::Param { index, kind } => {
                let loc = self.incoming[index as usize].clone();
                let var = self.new_variable(kind.stack_kind());
                self.append_move(var.clone(), loc, kind.stack_kind());
                self.values[n.index()] = Some(var);
            }
            NodeData::Constant { value } => {
                self.values[n.index()] = Some(Value::Constant(value));
            }
            NodeData::Binary {
                op,
                kind,
                x,
                y,
                set_flags,
            } => self.lower_binary(n, op, kind, x, y, set_flags)?,
            NodeData::DivRem {
                op,
                kind,
                x,
                y,
                state,
            } => self.lower_div_rem(n, op, kind, x, y, state)?,
            NodeData::Shift { op, kind, x, y } => self.lower_shift(n, op, kind, x, y)?,
            NodeData::Negate { kind, x } => self.lower_unary(n, UnaryOp::Neg, kind, x)?,
            NodeData::Not { kind, x } => self.lower_unary(n, UnaryOp::Not, kind, x)?,
            NodeData::FloatBinary { op, kind, x, y } => {
                self.lower_float_binary(n, op, kind, x, y)?
            }
            NodeData::FloatRem { kind, x, y } => {
                let desc = if kind == Kind::Float {
                    crate::runtime::ARITHMETIC_FREM
                } else {
                    crate::runtime::ARITHMETIC_DREM
                };
                self.lower_foreign_call(n, desc, &[x, y], kind, None)?;
            }
            // Compares lower at their consumers; a bare schedule slot is
            // a no-op unless someone later asks for the boolean value.
            NodeData::Compare { .. } => {}
            NodeData::Conditional {
                kind,
                compare,
                true_value,
                false_value,
            } => self.lower_conditional(n, kind, compare, true_value, false_value)?,
            NodeData::Phi { kind, .. } => {
                if self.values[n.index()].is_none() {
                    let var = self.new_variable(kind);
                    self.values[n.index()] = Some(var);
                }
            }
            NodeData::Address { .. } => {
                // Lowered on demand by memory consumers; a standalone use
                // materializes through `value_of` → Lea.
            }
            NodeData::Load {
                kind,
                address,
                access,
                state,
            } => self.lower_load(n, kind, address, access, state)?,
            NodeData::Store {
                kind,
                address,
                value,
                access,
                state,
            } => self.lower_store(kind, address, value, access, state)?,
            NodeData::Cas {
                kind,
                address,
                expected,
                new_value,
                true_value,
                false_value,
            } => self.lower_cas(n, kind, address, expected, new_value, true_value, false_value)?,
            NodeData::AtomicReadAndAdd {
                kind,
                address,
                delta,
            } => self.lower_atomic(n, RmwOp::Add, kind, address, delta)?,
            NodeData::AtomicReadAndWrite {
                kind,
                address,
                new_value,
            } => self.lower_atomic(n, RmwOp::Swap, kind, address, new_value)?,
            NodeData::Convert { op, x } => self.lower_convert(n, op, x)?,
            NodeData::Reinterpret { to, x } => self.lower_reinterpret(n, to, x)?,
            NodeData::MemoryBarrier { required } => self.emit_barriers(required),
            NodeData::RawAlloca { slots, ref_map } => {
                let slot = self.new_virtual_range(slots, ref_map);
                let dst = self.new_variable(Kind::Long);
                self.emit(Inst::StackLea {
                    dst: dst.clone(),
                    slot,
                });
                self.values[n.index()] = Some(dst);
            }
            NodeData::Invoke {
                target,
                args,
                kind,
                state,
                exception_edge,
            } => self.lower_invoke(n, target, &args, kind, state, exception_edge)?,
            NodeData::ForeignCall {
                descriptor,
                args,
                kind,
                state,
            } => self.lower_foreign_call(n, descriptor, &args, kind, state)?,
            NodeData::Safepoint { state } => {
                let sid = self.state_id_for(state)?;
                self.emit(Inst::Safepoint { state: sid });
            }
            NodeData::Deoptimize {
                action,
                reason,
                state,
            } => {
                let sid = self.state_id_for(state)?;
                self.emit(Inst::Deoptimize {
                    action,
                    reason,
                    state: sid,
                });
            }
            NodeData::Jump { target } => {
                self.emit_phi_moves(target)?;
                self.emit(Inst::Jump { target });
            }
            NodeData::If {
                condition,
                true_target,
                false_target,
            } => self.lower_if(condition, true_target, false_target)?,
            NodeData::IntegerSwitch {
                value,
                keys,
                probabilities,
                targets,
                default_target,
            } => self.lower_switch(value, &keys, &probabilities, &targets, default_target)?,
            NodeData::Return { value } => {
                let ret = match value {
                    Some(v) => {
                        let kind = self.graph.node(v).result_kind().stack_kind();
                        let conv = self.caps.register_config().method_call.clone();
                        let reg = if kind.is_float() {
                            conv.float_ret
                        } else {
                            conv.int_ret
                        };
                        let val = self.value_of(v)?;
                        let loc = Value::reg(reg, kind);
                        self.append_move(loc.clone(), val, kind);
                        loc
                    }
                    None => Value::Illegal,
                };
                self.emit(Inst::Return { value: ret });
            }
        }
        Ok(())
    }

    // ---- arithmetic ----

    fn lower_binary(
        &mut self,
        n: Node,
        op: BinaryOp,
        kind: Kind,
        x: Node,
        y: Node,
        set_flags: bool,
    ) -> CodegenResult<()> {
        let stack_kind = kind.expect_integer("integer arithmetic")?;
        let size = operand_size(stack_kind);
        let mut xv = self.value_of(x)?;
        let mut yv = self.value_of(y)?;

        // Commutative swap puts the constant on the right.
        if xv.is_constant() && op.is_commutative() {
            std::mem::swap(&mut xv, &mut yv);
        }

        if op == BinaryOp::Mul {
            return self.lower_mul(n, size, stack_kind, xv, yv);
        }

        // ADD/SUB by ±1 shrink to INC/DEC when nobody reads the flags.
        if !set_flags && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            if let Some(imm) = yv.as_constant().and_then(|c| c.as_long()) {
                let unary = match (op, imm) {
                    (BinaryOp::Add, 1) | (BinaryOp::Sub, -1) => Some(UnaryOp::Inc),
                    (BinaryOp::Add, -1) | (BinaryOp::Sub, 1) => Some(UnaryOp::Dec),
                    _ => None,
                };
                if let Some(u) = unary {
                    let src = self.use_reg(xv, stack_kind);
                    let dst = self.new_variable(stack_kind);
                    self.emit(Inst::Unary {
                        op: u,
                        size,
                        dst: dst.clone(),
                        src,
                    });
                    self.values[n.index()] = Some(dst);
                    return Ok(());
                }
            }
        }

        let alu = match op {
            BinaryOp::Add => AluOp::Add,
            BinaryOp::Sub => AluOp::Sub,
            BinaryOp::And => AluOp::And,
            BinaryOp::Or => AluOp::Or,
            BinaryOp::Xor => AluOp::Xor,
            BinaryOp::Mul => unreachable!(),
        };
        let xv = self.use_reg(xv, stack_kind);
        let yv = self.alu_operand(yv, stack_kind);
        let dst = self.new_variable(stack_kind);
        self.emit(Inst::Binary {
            op: alu,
            size,
            dst: dst.clone(),
            x: xv,
            y: yv,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_mul(
        &mut self,
        n: Node,
        size: OperandSize,
        kind: Kind,
        xv: Value,
        yv: Value,
    ) -> CodegenResult<()> {
        // Three-operand immediate form when the multiplier fits 32 bits.
        if let Some(c) = yv.as_constant() {
            if let Some(imm) = c.as_long().and_then(|v| i32::try_from(v).ok()) {
                if self.can_inline_constant(&c) {
                    let xv = self.use_reg(xv, kind);
                    let dst = self.new_variable(kind);
                    self.emit(Inst::MulImm {
                        size,
                        dst: dst.clone(),
                        x: xv,
                        imm,
                    });
                    self.values[n.index()] = Some(dst);
                    return Ok(());
                }
            }
        }
        let xv = self.use_reg(xv, kind);
        let yv = self.use_reg(yv, kind);
        let dst = self.new_variable(kind);
        self.emit(Inst::Mul {
            size,
            dst: dst.clone(),
            x: xv,
            y: yv,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_div_rem(
        &mut self,
        n: Node,
        op: DivRemOp,
        kind: Kind,
        x: Node,
        y: Node,
        state: Option<InputStateId>,
    ) -> CodegenResult<()> {
        // Float division never takes the rdx:rax path; it is plain SSE
        // arithmetic, and float remainder is a runtime call.
        if kind.is_float() {
            return match op {
                DivRemOp::Div => {
                    let xv = {
                        let v = self.value_of(x)?;
                        self.use_reg(v, kind)
                    };
                    let yv = {
                        let v = self.value_of(y)?;
                        self.use_reg(v, kind)
                    };
                    let dst = self.new_variable(kind);
                    self.emit(Inst::FloatBinary {
                        op: SseOp::Div,
                        kind,
                        dst: dst.clone(),
                        x: xv,
                        y: yv,
                    });
                    self.values[n.index()] = Some(dst);
                    Ok(())
                }
                DivRemOp::Rem => {
                    let desc = if kind == Kind::Float {
                        crate::runtime::ARITHMETIC_FREM
                    } else {
                        crate::runtime::ARITHMETIC_DREM
                    };
                    self.lower_foreign_call(n, desc, &[x, y], kind, None)
                }
                _ => Err(CodegenError::Unsupported(format!(
                    "unsigned division on {:?}",
                    kind
                ))),
            };
        }
        let stack_kind = kind.expect_integer("integer division")?;
        let size = operand_size(stack_kind);
        let xv = self.value_of(x)?;
        let yv = self.value_of(y)?;
        let state = self.state_for(state)?;

        // Dividend pinned in rax; rdx is the high word.
        let rax = Value::reg(regs::rax(), stack_kind);
        let rdx = Value::reg(regs::rdx(), stack_kind);
        self.append_move(rax.clone(), xv, stack_kind);
        let divisor = self.use_reg(yv, stack_kind);

        let div_kind = match op {
            DivRemOp::Div | DivRemOp::Rem => DivKind::Signed,
            DivRemOp::UDiv | DivRemOp::URem => DivKind::Unsigned,
        };
        self.emit(Inst::DivRem {
            kind: div_kind,
            size,
            quotient: rax.clone(),
            remainder: rdx.clone(),
            dividend: rax.clone(),
            divisor,
            state,
        });

        let result_reg = match op {
            DivRemOp::Div | DivRemOp::UDiv => rax,
            DivRemOp::Rem | DivRemOp::URem => rdx,
        };
        let dst = self.new_variable(stack_kind);
        self.append_move(dst.clone(), result_reg, stack_kind);
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_shift(
        &mut self,
        n: Node,
        op: ShiftOp,
        kind: Kind,
        x: Node,
        y: Node,
    ) -> CodegenResult<()> {
        let stack_kind = kind.expect_integer("shift")?;
        let size = operand_size(stack_kind);
        let value = {
            let v = self.value_of(x)?;
            self.use_reg(v, stack_kind)
        };
        let yv = self.value_of(y)?;
        // The count lives in cl unless it is a constant (masked to the
        // operand width either way).
        let count = match yv.as_constant() {
            Some(c) if c.as_long().is_some() => Value::Constant(Constant::Int(
                (c.as_long().unwrap() as i32) & size.shift_mask() as i32,
            )),
            _ => {
                let cl = Value::reg(regs::rcx(), Kind::Int);
                self.append_move(cl.clone(), yv, Kind::Int);
                cl
            }
        };
        let shift = match op {
            ShiftOp::Shl => ShiftKind::Shl,
            ShiftOp::Shr => ShiftKind::Sar,
            ShiftOp::UShr => ShiftKind::Shr,
        };
        let dst = self.new_variable(stack_kind);
        self.emit(Inst::Shift {
            kind: shift,
            size,
            dst: dst.clone(),
            value,
            count,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_unary(&mut self, n: Node, op: UnaryOp, kind: Kind, x: Node) -> CodegenResult<()> {
        let stack_kind = kind.expect_integer("unary arithmetic")?;
        let size = operand_size(stack_kind);
        let src = {
            let v = self.value_of(x)?;
            self.use_reg(v, stack_kind)
        };
        let dst = self.new_variable(stack_kind);
        self.emit(Inst::Unary {
            op,
            size,
            dst: dst.clone(),
            src,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_float_binary(
        &mut self,
        n: Node,
        op: BinaryOp,
        kind: Kind,
        x: Node,
        y: Node,
    ) -> CodegenResult<()> {
        if !kind.is_float() {
            return Err(CodegenError::Unsupported(format!(
                "float arithmetic on {:?}",
                kind
            )));
        }
        let sse = match op {
            BinaryOp::Add => SseOp::Add,
            BinaryOp::Sub => SseOp::Sub,
            BinaryOp::Mul => SseOp::Mul,
            other => {
                return Err(CodegenError::Unsupported(format!(
                    "float operation {:?}",
                    other
                )))
            }
        };
        let xv = {
            let v = self.value_of(x)?;
            self.use_reg(v, kind)
        };
        let yv = {
            let v = self.value_of(y)?;
            self.use_reg(v, kind)
        };
        let dst = self.new_variable(kind);
        self.emit(Inst::FloatBinary {
            op: sse,
            kind,
            dst: dst.clone(),
            x: xv,
            y: yv,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    // ---- compares, branches, selects ----

    /// Emit the flag-setting compare for `Compare(cond, x, y)`, mirroring
    /// operands so an immediate or memory operand sits on the right, and
    /// return the (possibly flipped) condition code.
    fn emit_compare(&mut self, compare: Node) -> CodegenResult<(CondCode, Option<bool>)> {
        let (cond, x, y, unordered_is_true) = match self.graph.node(compare) {
            NodeData::Compare {
                cond,
                x,
                y,
                unordered_is_true,
            } => (*cond, *x, *y, *unordered_is_true),
            // Any other boolean-valued node branches on value != 0.
            _ => {
                let v = self.value_of(compare)?;
                let v = self.use_reg(v, Kind::Int);
                self.emit(Inst::Test {
                    size: OperandSize::Size32,
                    x: v.clone(),
                    y: v,
                });
                return Ok((CondCode::NE, None));
            }
        };

        let x_kind = self.graph.node(x).result_kind().stack_kind();
        let mut xv = self.value_of(x)?;
        let mut yv = self.value_of(y)?;
        let mut cond = cond;

        // Mirror so the immediate (or memory operand) is on the right.
        if xv.is_constant() && !yv.is_constant() {
            std::mem::swap(&mut xv, &mut yv);
            cond = cond.mirror();
        }

        if x_kind.is_float() {
            let xv = self.use_reg(xv, x_kind);
            let yv = self.use_reg(yv, x_kind);
            self.emit(Inst::FloatCmp {
                kind: x_kind,
                x: xv,
                y: yv,
            });
            return Ok((float_cond_code(cond)?, Some(unordered_is_true)));
        }

        let size = operand_size(x_kind);
        let xv = self.use_reg(xv, x_kind);

        // Compare against zero collapses to TEST.
        if let Some(c) = yv.as_constant() {
            if c.as_long() == Some(0) && matches!(cond, Condition::Eq | Condition::Ne) {
                self.emit(Inst::Test {
                    size,
                    x: xv.clone(),
                    y: xv,
                });
                return Ok((int_cond_code(cond), None));
            }
        }

        let yv = self.alu_operand(yv, x_kind);
        self.emit(Inst::Cmp { size, x: xv, y: yv });
        Ok((int_cond_code(cond), None))
    }

    fn lower_if(
        &mut self,
        condition: Node,
        true_target: Block,
        false_target: Block,
    ) -> CodegenResult<()> {
        // Phi inputs on branch edges would need edge splitting; the
        // front end guarantees it already happened.
        debug_assert!(self.block_has_no_phis(true_target));
        debug_assert!(self.block_has_no_phis(false_target));
        let (cond, float_unordered) = self.emit_compare(condition)?;
        self.emit(Inst::Branch {
            cond,
            float_unordered,
            true_target,
            false_target,
        });
        Ok(())
    }

    fn lower_conditional(
        &mut self,
        n: Node,
        kind: Kind,
        compare: Node,
        true_value: Node,
        false_value: Node,
    ) -> CodegenResult<()> {
        let stack_kind = kind.stack_kind();
        let size = operand_size(stack_kind);
        let tv = self.value_of(true_value)?;
        let fv = self.value_of(false_value)?;
        let tv = self.alu_operand(tv, stack_kind);
        let fv = self.alu_operand(fv, stack_kind);
        let (cond, float_unordered) = self.emit_compare(compare)?;
        let dst = self.new_variable(stack_kind);
        self.emit(Inst::CMove {
            size,
            cond,
            float_unordered,
            dst: dst.clone(),
            true_value: tv,
            false_value: fv,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_compare_to_bool(&mut self, n: Node) -> CodegenResult<Value> {
        let (cond, _) = self.emit_compare(n)?;
        let dst = self.new_variable(Kind::Int);
        self.emit(Inst::SetCc {
            cond,
            dst: dst.clone(),
        });
        self.values[n.index()] = Some(dst.clone());
        Ok(dst)
    }

    // ---- memory ----

    fn lower_load(
        &mut self,
        n: Node,
        kind: Kind,
        address: Node,
        access: MemAccess,
        state: Option<InputStateId>,
    ) -> CodegenResult<()> {
        let addr = self.as_address(address)?;
        let state = self.state_for(state)?;
        let dst = self.new_variable(kind.stack_kind());
        self.emit(Inst::Load {
            kind,
            dst: dst.clone(),
            addr,
            state,
        });
        if access == MemAccess::Volatile {
            self.emit_barriers(Barriers::LOAD_LOAD.union(Barriers::LOAD_STORE));
        }
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_store(
        &mut self,
        kind: Kind,
        address: Node,
        value: Node,
        access: MemAccess,
        state: Option<InputStateId>,
    ) -> CodegenResult<()> {
        if access == MemAccess::Volatile {
            self.emit_barriers(Barriers::LOAD_STORE.union(Barriers::STORE_STORE));
        }
        let addr = self.as_address(address)?;
        let state = self.state_for(state)?;
        let vv = self.value_of(value)?;
        // Constants only when storable; null stores specialize to imm 0.
        let src = match vv.as_constant() {
            Some(c) if self.can_store_constant(&c) => vv,
            _ => self.use_reg(vv, kind.stack_kind()),
        };
        self.emit(Inst::Store {
            kind,
            addr,
            src,
            state,
        });
        if access == MemAccess::Volatile {
            self.emit_barriers(Barriers::STORE_LOAD);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_cas(
        &mut self,
        n: Node,
        kind: Kind,
        address: Node,
        expected: Node,
        new_value: Node,
        true_value: Node,
        false_value: Node,
    ) -> CodegenResult<()> {
        let stack_kind = kind.expect_integer("compare-and-swap")?;
        let addr = self.as_address(address)?;
        let ev = self.value_of(expected)?;
        let nv = self.value_of(new_value)?;

        // Expected value pinned in rax, which also receives the old value.
        let rax = Value::reg(regs::rax(), stack_kind);
        self.append_move(rax.clone(), ev, stack_kind);
        let nv = self.use_reg(nv, stack_kind);
        self.emit(Inst::Cas {
            kind,
            addr,
            expected: rax.clone(),
            new_value: nv,
            old: rax,
        });

        // Success lives in ZF; materialize the requested values.
        let tv = self.value_of(true_value)?;
        let fv = self.value_of(false_value)?;
        let tv = self.alu_operand(tv, Kind::Int);
        let fv = self.alu_operand(fv, Kind::Int);
        let dst = self.new_variable(Kind::Int);
        self.emit(Inst::CMove {
            size: OperandSize::Size32,
            cond: CondCode::E,
            float_unordered: None,
            dst: dst.clone(),
            true_value: tv,
            false_value: fv,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn lower_atomic(
        &mut self,
        n: Node,
        op: RmwOp,
        kind: Kind,
        address: Node,
        value: Node,
    ) -> CodegenResult<()> {
        let stack_kind = kind.expect_integer("atomic read-modify-write")?;
        let addr = self.as_address(address)?;
        let vv = self.value_of(value)?;
        let vv = self.use_reg(vv, stack_kind);
        let dst = self.new_variable(stack_kind);
        self.emit(Inst::AtomicRmw {
            op,
            kind,
            addr,
            value: vv,
            dst: dst.clone(),
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    fn emit_barriers(&mut self, required: Barriers) {
        let needed = self.caps.barriers(required);
        if !needed.is_empty() && self.config.is_mp {
            self.emit(Inst::MemBar { required: needed });
        }
    }

    // ---- conversions ----

    fn lower_convert(&mut self, n: Node, op: ConvertOp, x: Node) -> CodegenResult<()> {
        let xv = self.value_of(x)?;
        let (inst, result_kind) = match op {
            ConvertOp::Narrow { from_bits, to_bits } => {
                debug_assert!(to_bits <= 32 && from_bits >= to_bits);
                let src = self.use_reg(xv, Kind::Long);
                let dst = self.new_variable(Kind::Int);
                (
                    Inst::Narrow {
                        dst: dst.clone(),
                        src,
                    },
                    dst,
                )
            }
            ConvertOp::SignExtend { from_bits, to_bits } => {
                let kind = if to_bits > 32 { Kind::Long } else { Kind::Int };
                let src = self.use_reg(xv, Kind::Int);
                let dst = self.new_variable(kind);
                (
                    Inst::SignExtend {
                        from_bits,
                        to_bits,
                        dst: dst.clone(),
                        src,
                    },
                    dst,
                )
            }
            ConvertOp::ZeroExtend { from_bits, to_bits } => {
                let kind = if to_bits > 32 { Kind::Long } else { Kind::Int };
                let src = self.use_reg(xv, Kind::Int);
                let dst = self.new_variable(kind);
                (
                    Inst::ZeroExtend {
                        from_bits,
                        to_bits,
                        dst: dst.clone(),
                        src,
                    },
                    dst,
                )
            }
            _ => {
                let (fc, src_kind, dst_kind) = float_convert(op)?;
                let src = self.use_reg(xv, src_kind);
                let dst = self.new_variable(dst_kind);
                (
                    Inst::FloatConvert {
                        op: fc,
                        dst: dst.clone(),
                        src,
                    },
                    dst,
                )
            }
        };
        self.emit(inst);
        self.values[n.index()] = Some(result_kind);
        Ok(())
    }

    fn lower_reinterpret(&mut self, n: Node, to: Kind, x: Node) -> CodegenResult<()> {
        let from = self.graph.node(x).result_kind().stack_kind();
        match (from, to) {
            (Kind::Int, Kind::Float)
            | (Kind::Float, Kind::Int)
            | (Kind::Long, Kind::Double)
            | (Kind::Double, Kind::Long) => {}
            _ => {
                return Err(CodegenError::Unsupported(format!(
                    "reinterpret {:?} as {:?}",
                    from, to
                )))
            }
        }
        let src = {
            let v = self.value_of(x)?;
            self.use_reg(v, from)
        };
        let dst = self.new_variable(to);
        self.emit(Inst::Reinterpret {
            from,
            to,
            dst: dst.clone(),
            src,
        });
        self.values[n.index()] = Some(dst);
        Ok(())
    }

    // ---- switches ----

    fn lower_switch(
        &mut self,
        value: Node,
        keys: &[i32],
        probabilities: &[f64],
        targets: &[Block],
        default_target: Block,
    ) -> CodegenResult<()> {
        debug_assert_eq!(keys.len(), targets.len());
        debug_assert!(targets
            .iter()
            .chain(std::iter::once(&default_target))
            .all(|&t| self.block_has_no_phis(t)));
        let key = {
            let v = self.value_of(value)?;
            self.use_reg(v, Kind::Int)
        };
        if keys.is_empty() {
            self.emit(Inst::Jump {
                target: default_target,
            });
            return Ok(());
        }

        let min = *keys.iter().min().unwrap();
        let max = *keys.iter().max().unwrap();
        let span = (max as i64) - (min as i64) + 1;
        let dense = keys.len() >= 4 && span <= 2 * keys.len() as i64 + 8;

        if dense {
            if span > (1 << 16) {
                return Err(CodegenError::OutOfRange("table switch key span"));
            }
            // Expand to a dense table; holes fall through to the default.
            let mut table = vec![default_target; span as usize];
            for (&k, &t) in keys.iter().zip(targets.iter()) {
                table[(k - min) as usize] = t;
            }
            self.emit(Inst::TableSwitch {
                index: key,
                low: min,
                targets: table,
                default_target,
                idx_scratch: Value::reg(regs::scratch_reg(), Kind::Long),
                addr_scratch: Value::reg(regs::scratch_reg2(), Kind::Long),
            });
        } else {
            // Probability-sorted cascade of compare-and-branch.
            let mut order: Vec<usize> = (0..keys.len()).collect();
            order.sort_by(|&a, &b| {
                probabilities
                    .get(b)
                    .unwrap_or(&0.0)
                    .partial_cmp(probabilities.get(a).unwrap_or(&0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            self.emit(Inst::SequentialSwitch {
                size: OperandSize::Size32,
                key,
                keys: order.iter().map(|&i| keys[i]).collect(),
                targets: order.iter().map(|&i| targets[i]).collect(),
                default_target,
            });
        }
        Ok(())
    }

    // ---- calls ----

    fn lower_invoke(
        &mut self,
        n: Node,
        target: CallTarget,
        args: &[Node],
        kind: Kind,
        state: InputStateId,
        exception_edge: Option<Block>,
    ) -> CodegenResult<()> {
        let conv = self.caps.register_config().method_call.clone();
        let mut uses = self.marshal_args(&conv, args)?;
        let target_kind = match target {
            CallTarget::Direct(m) => CallTargetKind::DirectMethod(m),
            CallTarget::Indirect(t) => {
                // Computed target rides in the second scratch register,
                // which no argument convention touches.
                let tv = self.value_of(t)?;
                let loc = Value::reg(regs::scratch_reg2(), Kind::Long);
                self.append_move(loc.clone(), tv, Kind::Long);
                uses.push(loc);
                CallTargetKind::Indirect
            }
        };
        let sid = self.state_id_for(state)?;
        self.finish_call(n, target_kind, uses, &conv, kind, Some(sid), exception_edge, true)
    }

    fn lower_foreign_call(
        &mut self,
        n: Node,
        descriptor: ForeignCallDescriptor,
        args: &[Node],
        kind: Kind,
        state: Option<InputStateId>,
    ) -> CodegenResult<()> {
        let target = self.caps.lookup_foreign_call(&descriptor)?;
        let conv = self.caps.register_config().foreign_call.clone();
        let uses = self.marshal_args(&conv, args)?;
        let sid = self.state_for(state)?;
        self.finish_call(
            n,
            CallTargetKind::Foreign {
                name: descriptor.name,
                address: target.address,
                near: target.is_near(),
            },
            uses,
            &conv,
            kind,
            sid,
            None,
            target.kills_caller_saves,
        )
    }

    /// Marshal argument values into their convention locations.
    fn marshal_args(
        &mut self,
        conv: &CallingConvention,
        args: &[Node],
    ) -> CodegenResult<SmallVec<[Value; 8]>> {
        let mut uses: SmallVec<[Value; 8]> = SmallVec::new();
        let (mut int_idx, mut float_idx, mut stack_idx) = (0usize, 0usize, 0u32);
        for &a in args {
            let kind = self.graph.node(a).result_kind().stack_kind();
            let v = self.value_of(a)?;
            let loc = if kind.is_float() && float_idx < conv.float_args.len() {
                float_idx += 1;
                Value::reg(conv.float_args[float_idx - 1], kind)
            } else if !kind.is_float() && int_idx < conv.int_args.len() {
                int_idx += 1;
                Value::reg(conv.int_args[int_idx - 1], kind)
            } else {
                stack_idx += 1;
                self.frame.reserve_outgoing(stack_idx);
                Value::Stack(self.frame.outgoing_arg_slot(stack_idx - 1, kind))
            };
            self.append_move(loc.clone(), v, kind);
            uses.push(loc);
        }
        Ok(uses)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_call(
        &mut self,
        n: Node,
        target: CallTargetKind,
        uses: SmallVec<[Value; 8]>,
        conv: &CallingConvention,
        kind: Kind,
        state: Option<StateId>,
        exception_edge: Option<Block>,
        kills_caller_saves: bool,
    ) -> CodegenResult<()> {
        let mut defs: SmallVec<[Value; 8]> = SmallVec::new();
        let ret_loc = if kind != Kind::Void {
            let reg = if kind.is_float() {
                conv.float_ret
            } else {
                conv.int_ret
            };
            let loc = Value::reg(reg, kind.stack_kind());
            defs.push(loc.clone());
            Some(loc)
        } else {
            None
        };
        if kills_caller_saves {
            for &r in &conv.caller_saved {
                if ret_loc.as_ref().and_then(|v| v.as_reg()) == Some(r) {
                    continue;
                }
                defs.push(Value::reg(r, Kind::Long));
            }
        }
        self.emit(Inst::Call {
            info: Box::new(CallInfo {
                target,
                uses,
                defs,
                state,
                exception_edge,
            }),
        });
        if let Some(ret) = ret_loc {
            let dst = self.new_variable(kind.stack_kind());
            self.append_move(dst.clone(), ret, kind.stack_kind());
            self.values[n.index()] = Some(dst);
        }
        Ok(())
    }

    // ---- phi resolution ----

    fn block_has_no_phis(&self, b: Block) -> bool {
        self.graph
            .block(b)
            .nodes
            .iter()
            .all(|&n| !matches!(self.graph.node(n), NodeData::Phi { .. }))
    }

    /// Emit the moves that realize `target`'s phis for the edge from the
    /// current block.
    fn emit_phi_moves(&mut self, target: Block) -> CodegenResult<()> {
        let pred_idx = self.graph.pred_index(target, self.current);
        let phis: Vec<Node> = self
            .graph
            .block(target)
            .nodes
            .iter()
            .copied()
            .filter(|&n| matches!(self.graph.node(n), NodeData::Phi { .. }))
            .collect();
        for phi in phis {
            let (kind, input) = match self.graph.node(phi) {
                NodeData::Phi { kind, inputs } => (*kind, inputs[pred_idx]),
                _ => unreachable!(),
            };
            let phi_var = self.value_of(phi)?;
            let inp = self.value_of(input)?;
            self.append_move(phi_var, inp, kind);
        }
        Ok(())
    }
}

// ---- free helpers ----

fn operand_size(kind: Kind) -> OperandSize {
    match kind {
        Kind::Long | Kind::Object | Kind::Double => OperandSize::Size64,
        _ => OperandSize::Size32,
    }
}

fn is_stack_location(v: &Value) -> bool {
    matches!(v, Value::Stack(_) | Value::VirtualStack(_))
}

fn is_register_location(v: &Value) -> bool {
    matches!(v, Value::Reg(..) | Value::Variable(..))
}

fn int_cond_code(c: Condition) -> CondCode {
    match c {
        Condition::Eq => CondCode::E,
        Condition::Ne => CondCode::NE,
        Condition::Lt => CondCode::L,
        Condition::Le => CondCode::LE,
        Condition::Gt => CondCode::G,
        Condition::Ge => CondCode::GE,
        Condition::Below => CondCode::B,
        Condition::BelowEq => CondCode::BE,
        Condition::Above => CondCode::A,
        Condition::AboveEq => CondCode::AE,
    }
}

/// UCOMIS sets flags like an unsigned compare; the signed relations map
/// onto the unsigned condition codes.
fn float_cond_code(c: Condition) -> CodegenResult<CondCode> {
    Ok(match c {
        Condition::Eq => CondCode::E,
        Condition::Ne => CondCode::NE,
        Condition::Lt | Condition::Below => CondCode::B,
        Condition::Le | Condition::BelowEq => CondCode::BE,
        Condition::Gt | Condition::Above => CondCode::A,
        Condition::Ge | Condition::AboveEq => CondCode::AE,
    })
}

fn float_convert(op: ConvertOp) -> CodegenResult<(FloatConvertOp, Kind, Kind)> {
    Ok(match op {
        ConvertOp::IntToFloat => (FloatConvertOp::IntToFloat, Kind::Int, Kind::Float),
        ConvertOp::IntToDouble => (FloatConvertOp::IntToDouble, Kind::Int, Kind::Double),
        ConvertOp::LongToFloat => (FloatConvertOp::LongToFloat, Kind::Long, Kind::Float),
        ConvertOp::LongToDouble => (FloatConvertOp::LongToDouble, Kind::Long, Kind::Double),
        ConvertOp::FloatToInt => (FloatConvertOp::FloatToInt, Kind::Float, Kind::Int),
        ConvertOp::FloatToLong => (FloatConvertOp::FloatToLong, Kind::Float, Kind::Long),
        ConvertOp::DoubleToInt => (FloatConvertOp::DoubleToInt, Kind::Double, Kind::Int),
        ConvertOp::DoubleToLong => (FloatConvertOp::DoubleToLong, Kind::Double, Kind::Long),
        ConvertOp::FloatToDouble => (FloatConvertOp::FloatToDouble, Kind::Float, Kind::Double),
        ConvertOp::DoubleToFloat => (FloatConvertOp::DoubleToFloat, Kind::Double, Kind::Float),
        _ => {
            return Err(CodegenError::Unsupported(format!(
                "not a float conversion: {:?}",
                op
            )))
        }
    })
}

/// Compute each incoming argument's location from the calling convention.
fn incoming_locations(
    conv: &CallingConvention,
    param_kinds: &[Kind],
    frame: &FrameMap,
) -> Vec<Value> {
    let (mut int_idx, mut float_idx, mut stack_idx) = (0usize, 0usize, 0u32);
    param_kinds
        .iter()
        .map(|&kind| {
            let kind = kind.stack_kind();
            if kind.is_float() && float_idx < conv.float_args.len() {
                float_idx += 1;
                Value::reg(conv.float_args[float_idx - 1], kind)
            } else if !kind.is_float() && int_idx < conv.int_args.len() {
                int_idx += 1;
                Value::reg(conv.int_args[int_idx - 1], kind)
            } else {
                stack_idx += 1;
                Value::Stack(frame.incoming_arg_slot(stack_idx - 1, kind))
            }
        })
        .collect()
}
