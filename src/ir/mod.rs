//! Machine-independent value model and the scheduled input graph.

pub mod graph;
pub mod kind;
pub mod state;
pub mod value;

pub use self::graph::{
    BinaryOp, Block, CallTarget, Condition, ConvertOp, DivRemOp, Graph, InputState, InputStateId,
    MemAccess, MethodHandle, Node, NodeData, ShiftOp,
};
pub use self::kind::{Kind, LirKind, RefState};
pub use self::state::{DeoptAction, DeoptReason, FrameState, FrameStates, StateId};
pub use self::value::{
    AddressValue, Constant, DoubleBits, FloatBits, ObjectHandle, StackSlot, Value, Variable,
    VirtualSlot,
};
