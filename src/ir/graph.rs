//! The scheduled SSA graph consumed by the LIR generator.
//!
//! The front end and the graph optimizers are external collaborators: they
//! deliver a graph whose nodes are already scheduled into blocks, with phis
//! at block heads and exactly one control node at each block's end. The
//! core never rewrites the graph; it only reads it.
//!
//! Nodes live in a per-method arena and refer to each other by dense ids,
//! so cycles (phi back-edges) are plain index pairs.

use crate::entity::entity_ref;
use crate::ir::{Constant, Kind};
use crate::isa::amd64::args::Scale;
use crate::ir::state::{DeoptAction, DeoptReason};
use crate::runtime::{Barriers, ForeignCallDescriptor};

entity_ref! {
    /// Reference to a node in the graph arena.
    Node, "n"
}

entity_ref! {
    /// Reference to a basic block.
    Block, "block"
}

entity_ref! {
    /// Reference to a graph-level frame state (values are nodes).
    InputStateId, "gstate"
}

/// A comparison relation at the graph level. Lowering maps it onto CPU
/// condition codes; `mirror` is the relation that holds with swapped
/// operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned below.
    Below,
    /// Unsigned below-or-equal.
    BelowEq,
    /// Unsigned above.
    Above,
    /// Unsigned above-or-equal.
    AboveEq,
}

impl Condition {
    /// The relation after swapping operands: `x rel y == y mirror(rel) x`.
    pub fn mirror(self) -> Condition {
        use Condition::*;
        match self {
            Eq => Eq,
            Ne => Ne,
            Lt => Gt,
            Le => Ge,
            Gt => Lt,
            Ge => Le,
            Below => Above,
            BelowEq => AboveEq,
            Above => Below,
            AboveEq => BelowEq,
        }
    }

    /// The complementary relation.
    pub fn negate(self) -> Condition {
        use Condition::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Le => Gt,
            Gt => Le,
            Ge => Lt,
            Below => AboveEq,
            BelowEq => Above,
            Above => BelowEq,
            AboveEq => Below,
        }
    }
}

/// Two-operand integer arithmetic selectable as a ternary LIR op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    /// True if `x op y == y op x`.
    pub fn is_commutative(self) -> bool {
        !matches!(self, BinaryOp::Sub)
    }
}

/// Division/remainder family; lowered through `rdx:rax`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DivRemOp {
    Div,
    Rem,
    UDiv,
    URem,
}

/// Shift family; the count is masked to the operand width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    /// Arithmetic right shift.
    Shr,
    /// Logical right shift.
    UShr,
}

/// Width- and representation-changing conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConvertOp {
    /// Truncate an integer to `to_bits` (≤ 32 emits a DWORD move).
    Narrow { from_bits: u8, to_bits: u8 },
    SignExtend { from_bits: u8, to_bits: u8 },
    ZeroExtend { from_bits: u8, to_bits: u8 },
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

/// Memory access semantics as the bytecode declares them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MemAccess {
    #[default]
    Plain,
    Volatile,
}

/// An opaque handle to a resolved method, minted by the host runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodHandle(pub u64);

/// The callee of an `Invoke` node.
#[derive(Clone, Debug)]
pub enum CallTarget {
    /// A resolved method, reached through a patchable direct call.
    Direct(MethodHandle),
    /// Computed target held in a value node.
    Indirect(Node),
}

/// One scheduled SSA node.
#[derive(Clone, Debug)]
pub enum NodeData {
    /// Incoming argument `index` of the method signature.
    Param { index: u32, kind: Kind },
    Constant { value: Constant },
    /// `x op y` over `Int` or `Long` stack kinds. `set_flags` is true
    /// when a consumer reads the CPU flags this op establishes, which
    /// disables flag-clobber-free rewrites like ADD 1 → INC.
    Binary {
        op: BinaryOp,
        kind: Kind,
        x: Node,
        y: Node,
        set_flags: bool,
    },
    /// Division or remainder. Carries a state because the zero-divisor
    /// case traps and must be able to reconstruct the frame.
    DivRem {
        op: DivRemOp,
        kind: Kind,
        x: Node,
        y: Node,
        state: Option<InputStateId>,
    },
    Shift {
        op: ShiftOp,
        kind: Kind,
        x: Node,
        y: Node,
    },
    Negate { kind: Kind, x: Node },
    Not { kind: Kind, x: Node },
    /// Float/double arithmetic (SSE scalar forms).
    FloatBinary {
        op: BinaryOp,
        kind: Kind,
        x: Node,
        y: Node,
    },
    /// Float/double remainder; lowered to a runtime foreign call.
    FloatRem { kind: Kind, x: Node, y: Node },
    /// A boolean-valued comparison, consumed by `If` or `Conditional`.
    Compare {
        cond: Condition,
        x: Node,
        y: Node,
        /// For float compares: the value the relation takes when either
        /// input is NaN.
        unordered_is_true: bool,
    },
    /// Select between two values on a compare (conditional move).
    Conditional {
        kind: Kind,
        compare: Node,
        true_value: Node,
        false_value: Node,
    },
    /// One value per predecessor, in predecessor order. Must be scheduled
    /// at its block's head.
    Phi { kind: Kind, inputs: Vec<Node> },
    /// `base + index*scale + disp`, feeding loads/stores/leas.
    Address {
        base: Node,
        index: Option<Node>,
        scale: Scale,
        disp: i32,
    },
    Load {
        kind: Kind,
        address: Node,
        access: MemAccess,
        state: Option<InputStateId>,
    },
    Store {
        kind: Kind,
        address: Node,
        value: Node,
        access: MemAccess,
        state: Option<InputStateId>,
    },
    /// Compare-and-swap: if `*address == expected`, store `new_value`;
    /// yields `true_value` on success else `false_value`.
    Cas {
        kind: Kind,
        address: Node,
        expected: Node,
        new_value: Node,
        true_value: Node,
        false_value: Node,
    },
    /// Atomically add `delta` to `*address`, yielding the old value.
    AtomicReadAndAdd {
        kind: Kind,
        address: Node,
        delta: Node,
    },
    /// Atomically exchange `*address` with `new_value`, yielding the old
    /// value.
    AtomicReadAndWrite {
        kind: Kind,
        address: Node,
        new_value: Node,
    },
    Convert { op: ConvertOp, x: Node },
    /// Bit-pattern-preserving move between int and float registers.
    Reinterpret { to: Kind, x: Node },
    /// Explicit memory fence with the given required barriers.
    MemoryBarrier { required: Barriers },
    /// Reserve `slots` contiguous word slots in the frame and yield their
    /// address. The raw address escapes, so the allocator must treat the
    /// backing slot as live for the whole method.
    RawAlloca {
        slots: u32,
        /// Bit `i` set marks word `i` as holding a reference.
        ref_map: Vec<bool>,
    },
    /// Method call; `state` is mandatory (calls can deoptimize).
    Invoke {
        target: CallTarget,
        args: Vec<Node>,
        kind: Kind,
        state: InputStateId,
        /// Handler block for the exception edge, if the call is covered
        /// by a catch.
        exception_edge: Option<Block>,
    },
    /// Call into a runtime helper. An argument whose raw slot address
    /// escapes must be produced by `RawAlloca`, whose lowering carries
    /// the `UNINITIALIZED` contract.
    ForeignCall {
        descriptor: ForeignCallDescriptor,
        args: Vec<Node>,
        kind: Kind,
        state: Option<InputStateId>,
    },
    /// Poll-and-park point; the runtime may observe the root set here.
    Safepoint { state: InputStateId },
    /// Unconditional transfer to the interpreter.
    Deoptimize {
        action: DeoptAction,
        reason: DeoptReason,
        state: InputStateId,
    },
    // ---- control nodes: exactly one ends each block ----
    Jump { target: Block },
    If {
        condition: Node,
        true_target: Block,
        false_target: Block,
    },
    /// Multi-way dispatch on an `Int` key.
    IntegerSwitch {
        value: Node,
        keys: Vec<i32>,
        /// Taken-probability per key, used to order the sequential
        /// compare chain. Same length as `keys`.
        probabilities: Vec<f64>,
        targets: Vec<Block>,
        default_target: Block,
    },
    Return { value: Option<Node> },
}

impl NodeData {
    /// The kind of the value this node produces; `Void` for pure effects
    /// and control.
    pub fn result_kind(&self) -> Kind {
        match self {
            NodeData::Param { kind, .. }
            | NodeData::Binary { kind, .. }
            | NodeData::DivRem { kind, .. }
            | NodeData::Shift { kind, .. }
            | NodeData::Negate { kind, .. }
            | NodeData::Not { kind, .. }
            | NodeData::FloatBinary { kind, .. }
            | NodeData::FloatRem { kind, .. }
            | NodeData::Conditional { kind, .. }
            | NodeData::Phi { kind, .. }
            | NodeData::Load { kind, .. }
            | NodeData::Cas { kind, .. }
            | NodeData::AtomicReadAndAdd { kind, .. }
            | NodeData::AtomicReadAndWrite { kind, .. }
            | NodeData::Invoke { kind, .. }
            | NodeData::ForeignCall { kind, .. } => *kind,
            NodeData::Constant { value } => value.kind(),
            NodeData::Compare { .. } => Kind::Boolean,
            NodeData::Address { .. } | NodeData::RawAlloca { .. } => Kind::Long,
            NodeData::Reinterpret { to, .. } => *to,
            NodeData::Convert { op, .. } => match op {
                ConvertOp::Narrow { to_bits, .. }
                | ConvertOp::SignExtend { to_bits, .. }
                | ConvertOp::ZeroExtend { to_bits, .. } => {
                    if *to_bits > 32 {
                        Kind::Long
                    } else {
                        Kind::Int
                    }
                }
                ConvertOp::IntToFloat | ConvertOp::LongToFloat | ConvertOp::DoubleToFloat => {
                    Kind::Float
                }
                ConvertOp::IntToDouble | ConvertOp::LongToDouble | ConvertOp::FloatToDouble => {
                    Kind::Double
                }
                ConvertOp::FloatToInt | ConvertOp::DoubleToInt => Kind::Int,
                ConvertOp::FloatToLong | ConvertOp::DoubleToLong => Kind::Long,
            },
            _ => Kind::Void,
        }
    }

    /// True for the block-terminating control nodes.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeData::Jump { .. }
                | NodeData::If { .. }
                | NodeData::IntegerSwitch { .. }
                | NodeData::Return { .. }
                | NodeData::Deoptimize { .. }
        )
    }
}

/// A basic block: scheduled nodes plus CFG edges.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    pub nodes: Vec<Node>,
    pub preds: Vec<Block>,
    pub succs: Vec<Block>,
}

/// A graph-level frame state; values are node references, resolved to
/// operands by the generator.
#[derive(Clone, Debug, Default)]
pub struct InputState {
    pub bci: i32,
    pub locals: Vec<Option<Node>>,
    pub stack: Vec<Node>,
    pub locks: Vec<Node>,
    pub caller: Option<InputStateId>,
}

/// The scheduled graph of one method.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<NodeData>,
    blocks: Vec<BlockData>,
    states: Vec<InputState>,
    /// Emission order, entry first; reverse postorder is the canonical
    /// choice and is what the caller's scheduler produces.
    order: Vec<Block>,
    /// Kinds of the method's parameters, in signature order.
    pub param_kinds: Vec<Kind>,
    /// Method compiled for on-stack replacement. Consumed as a flag only;
    /// OSR planning happens outside the core.
    pub osr_entry: bool,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Append a new empty block.
    pub fn create_block(&mut self) -> Block {
        let b = Block::new(self.blocks.len());
        self.blocks.push(BlockData::default());
        self.order.push(b);
        b
    }

    /// Add a CFG edge.
    pub fn add_edge(&mut self, from: Block, to: Block) {
        self.blocks[from.index()].succs.push(to);
        self.blocks[to.index()].preds.push(from);
    }

    /// Append a node to a block's schedule.
    pub fn append(&mut self, block: Block, data: NodeData) -> Node {
        let n = Node::new(self.nodes.len());
        self.nodes.push(data);
        self.blocks[block.index()].nodes.push(n);
        n
    }

    /// Intern a graph-level frame state.
    pub fn add_state(&mut self, state: InputState) -> InputStateId {
        let id = InputStateId::new(self.states.len());
        self.states.push(state);
        id
    }

    /// Override the emission order (must be a permutation of all blocks
    /// with the entry block first).
    pub fn set_emission_order(&mut self, order: Vec<Block>) {
        debug_assert_eq!(order.len(), self.blocks.len());
        self.order = order;
    }

    pub fn node(&self, n: Node) -> &NodeData {
        &self.nodes[n.index()]
    }

    pub fn block(&self, b: Block) -> &BlockData {
        &self.blocks[b.index()]
    }

    pub fn state(&self, id: InputStateId) -> &InputState {
        &self.states[id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Blocks in emission order.
    pub fn order(&self) -> &[Block] {
        &self.order
    }

    /// The entry block.
    pub fn entry(&self) -> Block {
        self.order[0]
    }

    /// Position of `pred` among `block`'s predecessors (phi input index).
    pub fn pred_index(&self, block: Block, pred: Block) -> usize {
        self.block(block)
            .preds
            .iter()
            .position(|&p| p == pred)
            .expect("edge must exist")
    }
}
