//! The low-level IR: machine operations over not-yet-located values.
//!
//! Each operation is a variant of `Inst`; its operands are `Value`s
//! classified by role (`Use`, `Alive`, `Temp`, `Def`) and a flag set
//! describing the locations it accepts. A static descriptor per opcode
//! lists the roles in iteration order, and `visit_values` walks operands
//! table-style; the stack-slot allocator and rewriters rely on the two
//! agreeing (a golden test asserts it per opcode).

use smallvec::SmallVec;

use crate::ir::{
    Block, Constant, FrameStates, Kind, MethodHandle, StateId, Value,
};
use crate::ir::state::{DeoptAction, DeoptReason};
use crate::isa::amd64::args::{CondCode, OperandSize};
use crate::isa::amd64::asm::{AluOp, ShiftKind, SseOp};
use crate::isa::amd64::regs::Reg;
use crate::runtime::Barriers;

pub mod emit;
pub mod frame;
pub mod generator;
pub mod stackalloc;

pub use self::frame::FrameMap;

/// When an operand's value is live relative to its instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandRole {
    /// Consumed at the instruction's start.
    Use,
    /// Consumed, and must not be overwritten by the instruction's outputs
    /// (forbids output aliasing).
    Alive,
    /// Scratch: dead after the instruction.
    Temp,
    /// Produced at the instruction's end.
    Def,
}

/// Locations an operand position accepts, plus allocator directives.
///
/// `HINT` marks an allocator preference toward the partner operand.
/// `UNINITIALIZED` marks a slot whose raw address escapes: the allocator
/// must treat it as live for the whole method. A slot whose address is
/// taken without this flag is a bug in the caller, not in the allocator.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OpFlags(u8);

impl OpFlags {
    pub const REG: OpFlags = OpFlags(0x01);
    pub const STACK: OpFlags = OpFlags(0x02);
    pub const CONST: OpFlags = OpFlags(0x04);
    pub const ILLEGAL: OpFlags = OpFlags(0x08);
    pub const HINT: OpFlags = OpFlags(0x10);
    pub const UNINITIALIZED: OpFlags = OpFlags(0x20);
    pub const ADDR: OpFlags = OpFlags(0x40);

    /// Union of two flag sets.
    pub const fn or(self, other: OpFlags) -> OpFlags {
        OpFlags(self.0 | other.0)
    }

    /// True if every flag of `other` is present.
    pub fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::fmt::Debug for OpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for (bit, name) in [
            (OpFlags::REG, "REG"),
            (OpFlags::STACK, "STACK"),
            (OpFlags::CONST, "CONST"),
            (OpFlags::ILLEGAL, "ILLEGAL"),
            (OpFlags::HINT, "HINT"),
            (OpFlags::UNINITIALIZED, "UNINITIALIZED"),
            (OpFlags::ADDR, "ADDR"),
        ] {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

const RS: OpFlags = OpFlags::REG.or(OpFlags::STACK);
const RSC: OpFlags = RS.or(OpFlags::CONST);
const RC: OpFlags = OpFlags::REG.or(OpFlags::CONST);

/// In-place unary integer ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Inc,
    Dec,
    Neg,
    Not,
}

/// Division family selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DivKind {
    Signed,
    Unsigned,
}

/// Atomic read-modify-write selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmwOp {
    /// LOCK XADD: fetch-and-add.
    Add,
    /// XCHG: fetch-and-set.
    Swap,
}

/// Float conversion selector (SSE cvt family).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatConvertOp {
    IntToFloat,
    IntToDouble,
    LongToFloat,
    LongToDouble,
    FloatToInt,
    FloatToLong,
    DoubleToInt,
    DoubleToLong,
    FloatToDouble,
    DoubleToFloat,
}

/// What a call transfers control to.
#[derive(Clone, Debug)]
pub enum CallTargetKind {
    /// A method, through a patchable rel32 call.
    DirectMethod(MethodHandle),
    /// A runtime helper with a known address; `near` decides the rel32 vs.
    /// materialized-register form.
    Foreign {
        name: &'static str,
        address: u64,
        near: bool,
    },
    /// Computed target; the value is the last `uses` operand.
    Indirect,
}

/// Out-of-line payload for calls, keeping the `Inst` enum small.
#[derive(Clone, Debug)]
pub struct CallInfo {
    pub target: CallTargetKind,
    /// Argument values, each pinned to its convention location; for
    /// `Indirect`, the final element is the target address.
    pub uses: SmallVec<[Value; 8]>,
    /// Return register followed by clobbered caller-saves.
    pub defs: SmallVec<[Value; 8]>,
    pub state: Option<StateId>,
    /// Handler block if an exception edge covers this call.
    pub exception_edge: Option<Block>,
}

/// One LIR operation.
///
/// `Branch`, `Jump`, `SequentialSwitch`, `TableSwitch`, `Return`, and
/// `Deoptimize` are terminators; every block ends in exactly one.
#[derive(Clone, Debug)]
pub enum Inst {
    /// Move whose source is (or is hinted to become) a register.
    MoveFromReg { kind: Kind, dst: Value, src: Value },
    /// Move whose destination is (or is hinted to become) a register.
    MoveToReg { kind: Kind, dst: Value, src: Value },
    /// Materialize a constant.
    MoveFromConst { dst: Value, src: Constant },
    /// Stack-to-stack move: push/pop pair for 16/64-bit widths, else a
    /// save/load/store sequence through `scratch` with `backup` holding
    /// the scratch register's old value.
    StackMove {
        kind: Kind,
        dst: Value,
        src: Value,
        scratch: Reg,
        backup: Value,
    },
    /// Address computation into a register.
    Lea { dst: Value, addr: Value },
    /// Address of a stack slot. The slot's raw address escapes, so its
    /// operand carries `UNINITIALIZED`.
    StackLea { dst: Value, slot: Value },
    /// `dst = x op y` (ternary form; `y` survives, forbidding aliasing).
    Binary {
        op: AluOp,
        size: OperandSize,
        dst: Value,
        x: Value,
        y: Value,
    },
    /// In-place unary op after moving `src` into `dst`.
    Unary {
        op: UnaryOp,
        size: OperandSize,
        dst: Value,
        src: Value,
    },
    /// Two-operand multiply: `dst = x * y`.
    Mul {
        size: OperandSize,
        dst: Value,
        x: Value,
        y: Value,
    },
    /// Three-operand immediate multiply: `dst = x * imm`.
    MulImm {
        size: OperandSize,
        dst: Value,
        x: Value,
        imm: i32,
    },
    /// Division publishing quotient (rax) and remainder (rdx). The
    /// dividend is pinned in rax; rdx is sign-extended (IDIV) or zeroed
    /// (DIV) first.
    DivRem {
        kind: DivKind,
        size: OperandSize,
        quotient: Value,
        remainder: Value,
        dividend: Value,
        divisor: Value,
        state: Option<StateId>,
    },
    /// Scalar SSE arithmetic: `dst = x op y`.
    FloatBinary {
        op: SseOp,
        kind: Kind,
        dst: Value,
        x: Value,
        y: Value,
    },
    /// Shift with the count in `cl` unless constant.
    Shift {
        kind: ShiftKind,
        size: OperandSize,
        dst: Value,
        value: Value,
        count: Value,
    },
    /// Integer compare establishing flags; `y` may sit in memory or be an
    /// inlinable constant (the generator mirrors operands to arrange it).
    Cmp { size: OperandSize, x: Value, y: Value },
    /// Compare-with-zero collapsed to TEST.
    Test { size: OperandSize, x: Value, y: Value },
    /// UCOMISS/UCOMISD flag-setting float compare.
    FloatCmp { kind: Kind, x: Value, y: Value },
    /// Two-way branch on flags. `float_unordered` carries the
    /// unordered-is-true bit for float compares.
    Branch {
        cond: CondCode,
        float_unordered: Option<bool>,
        true_target: Block,
        false_target: Block,
    },
    /// Unconditional jump.
    Jump { target: Block },
    /// Flags-consuming select: `dst = cond ? true_value : false_value`.
    CMove {
        size: OperandSize,
        cond: CondCode,
        float_unordered: Option<bool>,
        dst: Value,
        true_value: Value,
        false_value: Value,
    },
    /// Materialize flags into a 0/1 integer.
    SetCc { cond: CondCode, dst: Value },
    /// Memory load; sub-int kinds extend into a 32-bit register.
    Load {
        kind: Kind,
        dst: Value,
        addr: Value,
        state: Option<StateId>,
    },
    /// Memory store; constants only when storable per the policy.
    Store {
        kind: Kind,
        addr: Value,
        src: Value,
        state: Option<StateId>,
    },
    /// LOCK CMPXCHG. `expected` and `old` are pinned in rax; flags hold
    /// the success condition for a following `CMove`.
    Cas {
        kind: Kind,
        addr: Value,
        expected: Value,
        new_value: Value,
        old: Value,
    },
    /// XADD/XCHG returning the previous memory value in `dst`.
    AtomicRmw {
        op: RmwOp,
        kind: Kind,
        addr: Value,
        value: Value,
        dst: Value,
    },
    /// Hardware fence for the given (already target-filtered) barriers.
    MemBar { required: Barriers },
    /// MOVSX/MOVSXD sign extension.
    SignExtend {
        from_bits: u8,
        to_bits: u8,
        dst: Value,
        src: Value,
    },
    /// MOVZX or AND-mask zero extension.
    ZeroExtend {
        from_bits: u8,
        to_bits: u8,
        dst: Value,
        src: Value,
    },
    /// Truncation to ≤ 32 bits: a DWORD move zeroing the upper half.
    Narrow { dst: Value, src: Value },
    /// MOVD/MOVQ bit-preserving move across register classes.
    Reinterpret {
        from: Kind,
        to: Kind,
        dst: Value,
        src: Value,
    },
    /// SSE cvt conversions.
    FloatConvert {
        op: FloatConvertOp,
        dst: Value,
        src: Value,
    },
    /// Cascaded compare-and-branch over probability-sorted keys.
    SequentialSwitch {
        size: OperandSize,
        key: Value,
        keys: Vec<i32>,
        targets: Vec<Block>,
        default_target: Block,
    },
    /// Dense jump table; two word-kind temps compute the target address.
    TableSwitch {
        index: Value,
        low: i32,
        targets: Vec<Block>,
        default_target: Block,
        idx_scratch: Value,
        addr_scratch: Value,
    },
    /// Call (direct, foreign, or indirect).
    Call { info: Box<CallInfo> },
    /// Branch to an out-of-line stub that encodes (reason, action) and
    /// tail-calls the runtime's deoptimize entry.
    Deoptimize {
        action: DeoptAction,
        reason: DeoptReason,
        state: StateId,
    },
    /// Root-set observation point.
    Safepoint { state: StateId },
    /// Return through the epilogue; `value` is pinned to the return
    /// register by the generator.
    Return { value: Value },
}

/// Fieldless mirror of `Inst` used to key the descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Opcode {
    MoveFromReg,
    MoveToReg,
    MoveFromConst,
    StackMove,
    Lea,
    StackLea,
    Binary,
    Unary,
    Mul,
    MulImm,
    DivRem,
    FloatBinary,
    Shift,
    Cmp,
    Test,
    FloatCmp,
    Branch,
    Jump,
    CMove,
    SetCc,
    Load,
    Store,
    Cas,
    AtomicRmw,
    MemBar,
    SignExtend,
    ZeroExtend,
    Narrow,
    Reinterpret,
    FloatConvert,
    SequentialSwitch,
    TableSwitch,
    Call,
    Deoptimize,
    Safepoint,
    Return,
}

/// One operand position in an opcode descriptor.
#[derive(Clone, Copy, Debug)]
pub struct OperandDesc {
    pub role: OperandRole,
    pub flags: OpFlags,
    /// Zero-or-more repetition (call argument lists).
    pub many: bool,
}

const fn od(role: OperandRole, flags: OpFlags) -> OperandDesc {
    OperandDesc {
        role,
        flags,
        many: false,
    }
}

const fn od_many(role: OperandRole, flags: OpFlags) -> OperandDesc {
    OperandDesc {
        role,
        flags,
        many: true,
    }
}

/// Static description of an opcode: name plus operand roles in the order
/// `visit_values` produces them.
#[derive(Debug)]
pub struct OpDesc {
    pub name: &'static str,
    pub operands: &'static [OperandDesc],
}

use OperandRole::{Alive, Def, Temp, Use};

/// The opcode descriptor table, indexed by `Opcode` discriminant.
pub static OP_DESCS: &[OpDesc] = &[
    OpDesc {
        name: "move_from_reg",
        operands: &[od(Def, RS.or(OpFlags::HINT)), od(Use, RC)],
    },
    OpDesc {
        name: "move_to_reg",
        operands: &[od(Def, OpFlags::REG), od(Use, RSC.or(OpFlags::HINT))],
    },
    OpDesc {
        name: "move_from_const",
        operands: &[od(Def, RS)],
    },
    OpDesc {
        name: "stack_move",
        operands: &[
            od(Def, OpFlags::STACK),
            od(Use, OpFlags::STACK),
            od(Temp, OpFlags::STACK),
        ],
    },
    OpDesc {
        name: "lea",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::ADDR)],
    },
    OpDesc {
        name: "stack_lea",
        operands: &[
            od(Def, OpFlags::REG),
            od(Use, OpFlags::STACK.or(OpFlags::UNINITIALIZED)),
        ],
    },
    OpDesc {
        name: "binary",
        operands: &[
            od(Def, OpFlags::REG.or(OpFlags::HINT)),
            od(Use, OpFlags::REG),
            od(Alive, RSC),
        ],
    },
    OpDesc {
        name: "unary",
        operands: &[od(Def, OpFlags::REG.or(OpFlags::HINT)), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "mul",
        operands: &[
            od(Def, OpFlags::REG.or(OpFlags::HINT)),
            od(Use, OpFlags::REG),
            od(Alive, RS),
        ],
    },
    OpDesc {
        name: "mul_imm",
        operands: &[od(Def, OpFlags::REG), od(Use, RS)],
    },
    OpDesc {
        name: "div_rem",
        operands: &[
            od(Def, OpFlags::REG),
            od(Def, OpFlags::REG),
            od(Use, OpFlags::REG),
            od(Alive, OpFlags::REG),
        ],
    },
    OpDesc {
        name: "float_binary",
        operands: &[
            od(Def, OpFlags::REG.or(OpFlags::HINT)),
            od(Use, OpFlags::REG),
            od(Alive, RS),
        ],
    },
    OpDesc {
        name: "shift",
        operands: &[
            od(Def, OpFlags::REG.or(OpFlags::HINT)),
            od(Use, OpFlags::REG),
            od(Alive, RC),
        ],
    },
    OpDesc {
        name: "cmp",
        operands: &[od(Use, OpFlags::REG), od(Use, RSC)],
    },
    OpDesc {
        name: "test",
        operands: &[od(Use, OpFlags::REG), od(Use, RC)],
    },
    OpDesc {
        name: "float_cmp",
        operands: &[od(Use, OpFlags::REG), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "branch",
        operands: &[],
    },
    OpDesc {
        name: "jump",
        operands: &[],
    },
    OpDesc {
        name: "cmove",
        operands: &[od(Def, OpFlags::REG), od(Alive, RC), od(Alive, RSC)],
    },
    OpDesc {
        name: "setcc",
        operands: &[od(Def, OpFlags::REG)],
    },
    OpDesc {
        name: "load",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::ADDR)],
    },
    OpDesc {
        name: "store",
        operands: &[od(Use, OpFlags::ADDR), od(Use, RC)],
    },
    OpDesc {
        name: "cas",
        operands: &[
            od(Use, OpFlags::ADDR),
            od(Use, OpFlags::REG),
            od(Alive, OpFlags::REG),
            od(Def, OpFlags::REG),
        ],
    },
    OpDesc {
        name: "atomic_rmw",
        operands: &[
            od(Use, OpFlags::ADDR),
            od(Use, OpFlags::REG),
            od(Def, OpFlags::REG),
        ],
    },
    OpDesc {
        name: "membar",
        operands: &[],
    },
    OpDesc {
        name: "sign_extend",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "zero_extend",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "narrow",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "reinterpret",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "float_convert",
        operands: &[od(Def, OpFlags::REG), od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "sequential_switch",
        operands: &[od(Use, OpFlags::REG)],
    },
    OpDesc {
        name: "table_switch",
        operands: &[
            od(Use, OpFlags::REG),
            od(Temp, OpFlags::REG),
            od(Temp, OpFlags::REG),
        ],
    },
    OpDesc {
        name: "call",
        operands: &[od_many(Use, RSC), od_many(Temp, OpFlags::REG), od_many(Def, OpFlags::REG)],
    },
    OpDesc {
        name: "deoptimize",
        operands: &[],
    },
    OpDesc {
        name: "safepoint",
        operands: &[],
    },
    OpDesc {
        name: "return",
        operands: &[od(Use, OpFlags::REG.or(OpFlags::ILLEGAL))],
    },
];

impl Inst {
    /// The opcode of this instruction.
    pub fn opcode(&self) -> Opcode {
        match self {
            Inst::MoveFromReg { .. } => Opcode::MoveFromReg,
            Inst::MoveToReg { .. } => Opcode::MoveToReg,
            Inst::MoveFromConst { .. } => Opcode::MoveFromConst,
            Inst::StackMove { .. } => Opcode::StackMove,
            Inst::Lea { .. } => Opcode::Lea,
            Inst::StackLea { .. } => Opcode::StackLea,
            Inst::Binary { .. } => Opcode::Binary,
            Inst::Unary { .. } => Opcode::Unary,
            Inst::Mul { .. } => Opcode::Mul,
            Inst::MulImm { .. } => Opcode::MulImm,
            Inst::DivRem { .. } => Opcode::DivRem,
            Inst::FloatBinary { .. } => Opcode::FloatBinary,
            Inst::Shift { .. } => Opcode::Shift,
            Inst::Cmp { .. } => Opcode::Cmp,
            Inst::Test { .. } => Opcode::Test,
            Inst::FloatCmp { .. } => Opcode::FloatCmp,
            Inst::Branch { .. } => Opcode::Branch,
            Inst::Jump { .. } => Opcode::Jump,
            Inst::CMove { .. } => Opcode::CMove,
            Inst::SetCc { .. } => Opcode::SetCc,
            Inst::Load { .. } => Opcode::Load,
            Inst::Store { .. } => Opcode::Store,
            Inst::Cas { .. } => Opcode::Cas,
            Inst::AtomicRmw { .. } => Opcode::AtomicRmw,
            Inst::MemBar { .. } => Opcode::MemBar,
            Inst::SignExtend { .. } => Opcode::SignExtend,
            Inst::ZeroExtend { .. } => Opcode::ZeroExtend,
            Inst::Narrow { .. } => Opcode::Narrow,
            Inst::Reinterpret { .. } => Opcode::Reinterpret,
            Inst::FloatConvert { .. } => Opcode::FloatConvert,
            Inst::SequentialSwitch { .. } => Opcode::SequentialSwitch,
            Inst::TableSwitch { .. } => Opcode::TableSwitch,
            Inst::Call { .. } => Opcode::Call,
            Inst::Deoptimize { .. } => Opcode::Deoptimize,
            Inst::Safepoint { .. } => Opcode::Safepoint,
            Inst::Return { .. } => Opcode::Return,
        }
    }

    /// The static descriptor for this instruction's opcode.
    pub fn desc(&self) -> &'static OpDesc {
        &OP_DESCS[self.opcode() as usize]
    }

    /// Visit every operand with its role and flags, in descriptor order.
    ///
    /// Address operands are visited as a whole (flag `ADDR`); their base
    /// and index components are registers or variables resolved by the
    /// external register allocator, never stack slots, so the stack-slot
    /// passes treat an address as a single opaque use.
    pub fn visit_values(&mut self, f: &mut impl FnMut(&mut Value, OperandRole, OpFlags)) {
        let desc = self.desc();
        let ops = desc.operands;
        match self {
            Inst::MoveFromReg { dst, src, .. } | Inst::MoveToReg { dst, src, .. } => {
                f(dst, ops[0].role, ops[0].flags);
                f(src, ops[1].role, ops[1].flags);
            }
            Inst::MoveFromConst { dst, .. } => f(dst, ops[0].role, ops[0].flags),
            Inst::StackMove {
                dst, src, backup, ..
            } => {
                f(dst, ops[0].role, ops[0].flags);
                f(src, ops[1].role, ops[1].flags);
                f(backup, ops[2].role, ops[2].flags);
            }
            Inst::Lea { dst, addr } => {
                f(dst, ops[0].role, ops[0].flags);
                f(addr, ops[1].role, ops[1].flags);
            }
            Inst::StackLea { dst, slot } => {
                f(dst, ops[0].role, ops[0].flags);
                f(slot, ops[1].role, ops[1].flags);
            }
            Inst::Binary { dst, x, y, .. }
            | Inst::Mul { dst, x, y, .. }
            | Inst::FloatBinary { dst, x, y, .. } => {
                f(dst, ops[0].role, ops[0].flags);
                f(x, ops[1].role, ops[1].flags);
                f(y, ops[2].role, ops[2].flags);
            }
            Inst::Unary { dst, src, .. } => {
                f(dst, ops[0].role, ops[0].flags);
                f(src, ops[1].role, ops[1].flags);
            }
            Inst::MulImm { dst, x, .. } => {
                f(dst, ops[0].role, ops[0].flags);
                f(x, ops[1].role, ops[1].flags);
            }
            Inst::DivRem {
                quotient,
                remainder,
                dividend,
                divisor,
                ..
            } => {
                f(quotient, ops[0].role, ops[0].flags);
                f(remainder, ops[1].role, ops[1].flags);
                f(dividend, ops[2].role, ops[2].flags);
                f(divisor, ops[3].role, ops[3].flags);
            }
            Inst::Shift {
                dst, value, count, ..
            } => {
                f(dst, ops[0].role, ops[0].flags);
                f(value, ops[1].role, ops[1].flags);
                f(count, ops[2].role, ops[2].flags);
            }
            Inst::Cmp { x, y, .. } | Inst::Test { x, y, .. } | Inst::FloatCmp { x, y, .. } => {
                f(x, ops[0].role, ops[0].flags);
                f(y, ops[1].role, ops[1].flags);
            }
            Inst::Branch { .. } | Inst::Jump { .. } => {}
            Inst::CMove {
                dst,
                true_value,
                false_value,
                ..
            } => {
                f(dst, ops[0].role, ops[0].flags);
                f(true_value, ops[1].role, ops[1].flags);
                f(false_value, ops[2].role, ops[2].flags);
            }
            Inst::SetCc { dst, .. } => f(dst, ops[0].role, ops[0].flags),
            Inst::Load { dst, addr, .. } => {
                f(dst, ops[0].role, ops[0].flags);
                f(addr, ops[1].role, ops[1].flags);
            }
            Inst::Store { addr, src, .. } => {
                f(addr, ops[0].role, ops[0].flags);
                f(src, ops[1].role, ops[1].flags);
            }
            Inst::Cas {
                addr,
                expected,
                new_value,
                old,
                ..
            } => {
                f(addr, ops[0].role, ops[0].flags);
                f(expected, ops[1].role, ops[1].flags);
                f(new_value, ops[2].role, ops[2].flags);
                f(old, ops[3].role, ops[3].flags);
            }
            Inst::AtomicRmw {
                addr, value, dst, ..
            } => {
                f(addr, ops[0].role, ops[0].flags);
                f(value, ops[1].role, ops[1].flags);
                f(dst, ops[2].role, ops[2].flags);
            }
            Inst::MemBar { .. } => {}
            Inst::SignExtend { dst, src, .. }
            | Inst::ZeroExtend { dst, src, .. }
            | Inst::Narrow { dst, src }
            | Inst::Reinterpret { dst, src, .. }
            | Inst::FloatConvert { dst, src, .. } => {
                f(dst, ops[0].role, ops[0].flags);
                f(src, ops[1].role, ops[1].flags);
            }
            Inst::SequentialSwitch { key, .. } => f(key, ops[0].role, ops[0].flags),
            Inst::TableSwitch {
                index,
                idx_scratch,
                addr_scratch,
                ..
            } => {
                f(index, ops[0].role, ops[0].flags);
                f(idx_scratch, ops[1].role, ops[1].flags);
                f(addr_scratch, ops[2].role, ops[2].flags);
            }
            Inst::Call { info } => {
                for v in info.uses.iter_mut() {
                    f(v, ops[0].role, ops[0].flags);
                }
                for v in info.defs.iter_mut() {
                    f(v, ops[2].role, ops[2].flags);
                }
            }
            Inst::Deoptimize { .. } | Inst::Safepoint { .. } => {}
            Inst::Return { value } => f(value, ops[0].role, ops[0].flags),
        }
    }

    /// The frame state attached to this instruction, if any.
    pub fn frame_state(&self) -> Option<StateId> {
        match self {
            Inst::DivRem { state, .. }
            | Inst::Load { state, .. }
            | Inst::Store { state, .. } => *state,
            Inst::Call { info } => info.state,
            Inst::Deoptimize { state, .. } | Inst::Safepoint { state } => Some(*state),
            _ => None,
        }
    }

    /// True if this instruction must end its block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Branch { .. }
                | Inst::Jump { .. }
                | Inst::SequentialSwitch { .. }
                | Inst::TableSwitch { .. }
                | Inst::Return { .. }
                | Inst::Deoptimize { .. }
        )
    }
}

impl std::fmt::Display for Inst {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.desc().name)?;
        let mut clone = self.clone();
        let mut parts: Vec<String> = Vec::new();
        clone.visit_values(&mut |v, role, _| {
            let tag = match role {
                OperandRole::Use => "use",
                OperandRole::Alive => "alive",
                OperandRole::Temp => "tmp",
                OperandRole::Def => "def",
            };
            parts.push(format!("{}:{}", tag, v));
        });
        if !parts.is_empty() {
            write!(f, " {}", parts.join(", "))?;
        }
        match self {
            Inst::Branch {
                cond,
                true_target,
                false_target,
                ..
            } => write!(f, " {} -> {}, {}", cond, true_target, false_target)?,
            Inst::Jump { target } => write!(f, " -> {}", target)?,
            Inst::Return { .. } => {}
            _ => {}
        }
        Ok(())
    }
}

/// Side-table entry describing a virtual stack slot.
#[derive(Clone, Debug)]
pub struct VirtualSlotInfo {
    pub kind: Kind,
    /// Word-slot count; 1 for plain slots, more for ranges.
    pub slots: u32,
    /// For ranges: which word positions hold references.
    pub ref_map: Option<Vec<bool>>,
}

impl VirtualSlotInfo {
    /// True for multi-slot, reference-tagged allocations; these never
    /// participate in slot reuse.
    pub fn is_range(&self) -> bool {
        self.slots > 1 || self.ref_map.is_some()
    }
}

/// One block of LIR in the output ordering.
#[derive(Clone, Debug, Default)]
pub struct LirBlock {
    pub insts: Vec<Inst>,
    pub preds: Vec<Block>,
    pub succs: Vec<Block>,
    /// Id of the first operation; assigned by the allocator's numbering
    /// stage. Op `i` of the block has id `first_op_id + 2*i`.
    pub first_op_id: u32,
}

/// The LIR of one method: per-block instruction lists in emission order,
/// the frame-state arena, and the virtual-slot side table.
#[derive(Debug, Default)]
pub struct Lir {
    pub blocks: Vec<LirBlock>,
    /// Block emission order (same block ids as the input graph).
    pub order: Vec<Block>,
    pub states: FrameStates,
    pub vslots: Vec<VirtualSlotInfo>,
    /// Number of `Variable`s minted; the external register allocator
    /// consumes this.
    pub num_variables: u32,
}

impl Lir {
    pub fn block(&self, b: Block) -> &LirBlock {
        &self.blocks[b.index()]
    }

    pub fn block_mut(&mut self, b: Block) -> &mut LirBlock {
        &mut self.blocks[b.index()]
    }

    /// The id of the last operation, as assigned by numbering.
    pub fn max_op_id(&self) -> u32 {
        self.order
            .last()
            .map(|&b| {
                let blk = self.block(b);
                blk.first_op_id + 2 * (blk.insts.len().max(1) as u32 - 1)
            })
            .unwrap_or(0)
    }

    /// Dump the LIR through the `log` crate at trace level.
    pub fn trace_dump(&self, what: &str) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("LIR {}:", what);
            for &b in &self.order {
                log::trace!("  {}:", b);
                for inst in &self.block(b).insts {
                    log::trace!("    {}", inst);
                }
            }
        }
    }
}

#[cfg(test)]
mod desc_tests {
    //! Golden test: each opcode's descriptor must agree with the operand
    //! iterator on count, roles, and flags.

    use super::*;
    use crate::ir::{Variable, VirtualSlot};
    use crate::isa::amd64::regs;

    fn var(i: u32) -> Value {
        Value::Variable(Variable {
            index: i,
            kind: Kind::Int,
        })
    }

    fn vslot(i: u32) -> Value {
        Value::VirtualStack(VirtualSlot {
            index: i,
            kind: Kind::Int,
        })
    }

    fn samples() -> Vec<Inst> {
        use crate::ir::Constant;
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        vec![
            Inst::MoveFromReg {
                kind: Kind::Int,
                dst: vslot(0),
                src: var(0),
            },
            Inst::MoveToReg {
                kind: Kind::Int,
                dst: var(0),
                src: vslot(0),
            },
            Inst::MoveFromConst {
                dst: var(0),
                src: Constant::Int(1),
            },
            Inst::StackMove {
                kind: Kind::Int,
                dst: vslot(0),
                src: vslot(1),
                scratch: regs::scratch_reg(),
                backup: vslot(2),
            },
            Inst::Lea {
                dst: var(0),
                addr: Value::address(Kind::Long, var(1), 0),
            },
            Inst::StackLea {
                dst: var(0),
                slot: vslot(0),
            },
            Inst::Binary {
                op: AluOp::Add,
                size: OperandSize::Size32,
                dst: var(0),
                x: var(1),
                y: var(2),
            },
            Inst::Unary {
                op: UnaryOp::Neg,
                size: OperandSize::Size32,
                dst: var(0),
                src: var(1),
            },
            Inst::Mul {
                size: OperandSize::Size32,
                dst: var(0),
                x: var(1),
                y: var(2),
            },
            Inst::MulImm {
                size: OperandSize::Size32,
                dst: var(0),
                x: var(1),
                imm: 3,
            },
            Inst::DivRem {
                kind: DivKind::Signed,
                size: OperandSize::Size32,
                quotient: var(0),
                remainder: var(1),
                dividend: var(2),
                divisor: var(3),
                state: None,
            },
            Inst::FloatBinary {
                op: SseOp::Add,
                kind: Kind::Float,
                dst: var(0),
                x: var(1),
                y: var(2),
            },
            Inst::Shift {
                kind: ShiftKind::Shl,
                size: OperandSize::Size32,
                dst: var(0),
                value: var(1),
                count: var(2),
            },
            Inst::Cmp {
                size: OperandSize::Size32,
                x: var(0),
                y: var(1),
            },
            Inst::Test {
                size: OperandSize::Size32,
                x: var(0),
                y: var(1),
            },
            Inst::FloatCmp {
                kind: Kind::Float,
                x: var(0),
                y: var(1),
            },
            Inst::Branch {
                cond: CondCode::E,
                float_unordered: None,
                true_target: b0,
                false_target: b1,
            },
            Inst::Jump { target: b0 },
            Inst::CMove {
                size: OperandSize::Size32,
                cond: CondCode::G,
                float_unordered: None,
                dst: var(0),
                true_value: var(1),
                false_value: var(2),
            },
            Inst::SetCc {
                cond: CondCode::E,
                dst: var(0),
            },
            Inst::Load {
                kind: Kind::Int,
                dst: var(0),
                addr: Value::address(Kind::Int, var(1), 8),
                state: None,
            },
            Inst::Store {
                kind: Kind::Int,
                addr: Value::address(Kind::Int, var(1), 8),
                src: var(0),
                state: None,
            },
            Inst::Cas {
                kind: Kind::Int,
                addr: Value::address(Kind::Int, var(1), 0),
                expected: var(2),
                new_value: var(3),
                old: var(4),
            },
            Inst::AtomicRmw {
                op: RmwOp::Add,
                kind: Kind::Int,
                addr: Value::address(Kind::Int, var(1), 0),
                value: var(2),
                dst: var(3),
            },
            Inst::MemBar {
                required: Barriers::STORE_LOAD,
            },
            Inst::SignExtend {
                from_bits: 8,
                to_bits: 32,
                dst: var(0),
                src: var(1),
            },
            Inst::ZeroExtend {
                from_bits: 16,
                to_bits: 32,
                dst: var(0),
                src: var(1),
            },
            Inst::Narrow {
                dst: var(0),
                src: var(1),
            },
            Inst::Reinterpret {
                from: Kind::Int,
                to: Kind::Float,
                dst: var(0),
                src: var(1),
            },
            Inst::FloatConvert {
                op: FloatConvertOp::IntToDouble,
                dst: var(0),
                src: var(1),
            },
            Inst::SequentialSwitch {
                size: OperandSize::Size32,
                key: var(0),
                keys: vec![1, 2],
                targets: vec![b0, b1],
                default_target: b0,
            },
            Inst::TableSwitch {
                index: var(0),
                low: 0,
                targets: vec![b0, b1],
                default_target: b0,
                idx_scratch: Value::reg(regs::scratch_reg(), Kind::Long),
                addr_scratch: Value::reg(regs::scratch_reg2(), Kind::Long),
            },
            Inst::Call {
                info: Box::new(CallInfo {
                    target: CallTargetKind::DirectMethod(MethodHandle(1)),
                    uses: smallvec::smallvec![var(0), var(1)],
                    defs: smallvec::smallvec![var(2)],
                    state: None,
                    exception_edge: None,
                }),
            },
            Inst::Deoptimize {
                action: DeoptAction::None,
                reason: DeoptReason::NullCheck,
                state: StateId::new(0),
            },
            Inst::Safepoint {
                state: StateId::new(0),
            },
            Inst::Return { value: var(0) },
        ]
    }

    #[test]
    fn every_opcode_has_a_sample_and_desc() {
        let samples = samples();
        assert_eq!(samples.len(), OP_DESCS.len());
        let mut seen = std::collections::BTreeSet::new();
        for s in &samples {
            seen.insert(s.opcode());
        }
        assert_eq!(seen.len(), OP_DESCS.len(), "duplicate or missing opcode");
    }

    #[test]
    fn descriptors_match_visitor() {
        for mut inst in samples() {
            let desc = inst.desc();
            let mut visited: Vec<(OperandRole, OpFlags)> = Vec::new();
            inst.visit_values(&mut |_, role, flags| visited.push((role, flags)));
            // Expand the descriptor against the visited sequence: fixed
            // entries must match one-to-one, `many` entries greedily.
            let mut vi = 0;
            for od in desc.operands {
                if od.many {
                    while vi < visited.len()
                        && visited[vi].0 == od.role
                        && visited[vi].1 == od.flags
                    {
                        vi += 1;
                    }
                } else {
                    assert!(
                        vi < visited.len(),
                        "{}: too few operands visited",
                        desc.name
                    );
                    assert_eq!(visited[vi].0, od.role, "{}: role mismatch", desc.name);
                    assert_eq!(
                        visited[vi].1, od.flags,
                        "{}: flags mismatch at position {}",
                        desc.name, vi
                    );
                    vi += 1;
                }
            }
            assert_eq!(
                vi,
                visited.len(),
                "{}: visitor produced operands beyond the descriptor",
                desc.name
            );
        }
    }
}
