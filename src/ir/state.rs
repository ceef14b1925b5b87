//! Deoptimization frame states.
//!
//! A frame state snapshots the bytecode-level values live at a point,
//! sufficient to reconstruct an interpreter frame when compiled code
//! deoptimizes. States are built once by the generator, stored in a
//! per-compilation arena, and referenced by id from any instruction that
//! can trap, call, or deoptimize. The stack-slot allocator rewrites the
//! arena's values in place during assignment; emission reads them only.

use crate::entity::entity_ref;
use crate::ir::Value;

entity_ref! {
    /// Reference to a frame state in the per-compilation arena.
    StateId, "state"
}

/// A deoptimization snapshot at one bytecode position.
#[derive(Clone, Debug, Default)]
pub struct FrameState {
    /// Bytecode index this state restores to.
    pub bci: i32,
    /// Local variable values; `Value::Illegal` for dead locals.
    pub locals: Vec<Value>,
    /// Expression stack values.
    pub stack: Vec<Value>,
    /// Held monitors.
    pub locks: Vec<Value>,
    /// The inlining parent, outermost frame last.
    pub caller: Option<StateId>,
}

impl FrameState {
    /// Visit every live value in this state.
    pub fn visit_values(&self, f: &mut impl FnMut(&Value)) {
        for v in self
            .locals
            .iter()
            .chain(self.stack.iter())
            .chain(self.locks.iter())
        {
            if !v.is_illegal() {
                f(v);
            }
        }
    }

    /// Visit every live value mutably (allocator rewriting).
    pub fn visit_values_mut(&mut self, f: &mut impl FnMut(&mut Value)) {
        for v in self
            .locals
            .iter_mut()
            .chain(self.stack.iter_mut())
            .chain(self.locks.iter_mut())
        {
            if !v.is_illegal() {
                f(v);
            }
        }
    }
}

/// Arena of frame states for one compilation.
#[derive(Default, Debug)]
pub struct FrameStates {
    states: Vec<FrameState>,
}

impl FrameStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a state, returning its id.
    pub fn push(&mut self, state: FrameState) -> StateId {
        let id = StateId::new(self.states.len());
        self.states.push(state);
        id
    }

    pub fn get(&self, id: StateId) -> &FrameState {
        &self.states[id.index()]
    }

    pub fn get_mut(&mut self, id: StateId) -> &mut FrameState {
        &mut self.states[id.index()]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FrameState> {
        self.states.iter_mut()
    }
}

/// What the runtime should do with the compiled method after a
/// deoptimization fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeoptAction {
    /// Keep the code; this deopt is expected occasionally.
    None,
    /// Re-enter the interpreter and recompile later with fresh profiles.
    Recompile,
    /// Throw the code away and recompile.
    InvalidateRecompile,
    /// Throw the code away and never recompile this method.
    InvalidateStopCompiling,
}

/// Why a deoptimization fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    NullCheck,
    BoundsCheck,
    ClassCastException,
    ArithmeticException,
    UnreachedCode,
    TypeCheck,
    Unresolved,
    NotCompiledExceptionHandler,
    TransferToInterpreter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Kind, Variable};

    #[test]
    fn visit_skips_dead_locals() {
        let mut state = FrameState {
            bci: 7,
            locals: vec![
                Value::Variable(Variable {
                    index: 0,
                    kind: Kind::Int,
                }),
                Value::Illegal,
            ],
            stack: vec![Value::Variable(Variable {
                index: 1,
                kind: Kind::Object,
            })],
            locks: vec![],
            caller: None,
        };
        let mut seen = 0;
        state.visit_values(&mut |_| seen += 1);
        assert_eq!(seen, 2);
        state.visit_values_mut(&mut |v| *v = Value::Illegal);
        let mut seen = 0;
        state.visit_values(&mut |_| seen += 1);
        assert_eq!(seen, 0);
    }
}
