//! The operand value model shared by the LIR and its passes.

use crate::ir::Kind;
use crate::isa::amd64::args::Scale;
use crate::isa::amd64::regs::Reg;

/// An IEEE 754 single payload kept as its bit pattern so constants hash
/// and compare exactly.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FloatBits(u32);

impl FloatBits {
    pub fn from_f32(v: f32) -> Self {
        FloatBits(v.to_bits())
    }
    pub fn bits(self) -> u32 {
        self.0
    }
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0)
    }
}

impl std::fmt::Debug for FloatBits {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_f32())
    }
}

/// An IEEE 754 double payload kept as its bit pattern.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DoubleBits(u64);

impl DoubleBits {
    pub fn from_f64(v: f64) -> Self {
        DoubleBits(v.to_bits())
    }
    pub fn bits(self) -> u64 {
        self.0
    }
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl std::fmt::Debug for DoubleBits {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

/// An opaque handle to a managed object, minted by the host runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

/// A constant operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(FloatBits),
    Double(DoubleBits),
    /// The null reference.
    Null,
    /// A non-null managed object; always requires a data patch.
    Object(ObjectHandle),
}

impl Constant {
    /// The kind of this constant.
    pub fn kind(self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Null | Constant::Object(_) => Kind::Object,
        }
    }

    /// True for the null reference.
    pub fn is_null(self) -> bool {
        matches!(self, Constant::Null)
    }

    /// The integral bits, if this constant has an integer representation
    /// (floats are excluded on purpose; they are never immediates).
    pub fn as_long(self) -> Option<i64> {
        match self {
            Constant::Int(v) => Some(v as i64),
            Constant::Long(v) => Some(v),
            Constant::Null => Some(0),
            _ => None,
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Float(v) => write!(f, "{:?}f", v),
            Constant::Double(v) => write!(f, "{:?}d", v),
            Constant::Null => write!(f, "null"),
            Constant::Object(h) => write!(f, "obj#{}", h.0),
        }
    }
}

/// A concrete frame-relative stack slot.
///
/// `add_frame_size` distinguishes callee-frame slots (offsets grow up from
/// the stack pointer once the frame size is known) from incoming-argument
/// slots addressed above the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub kind: Kind,
    pub raw_offset: i32,
    pub add_frame_size: bool,
}

impl StackSlot {
    /// Resolve to an sp-relative byte offset given the final frame size.
    pub fn sp_offset(self, frame_size: u32) -> i32 {
        if self.add_frame_size {
            self.raw_offset + frame_size as i32
        } else {
            self.raw_offset
        }
    }
}

/// An abstract spill location awaiting assignment by the stack-slot
/// allocator; carries a kind but no offset. Range metadata (multi-slot
/// allocations with reference bitmaps) lives in the side table the
/// generator builds, keyed by `index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualSlot {
    pub index: u32,
    pub kind: Kind,
}

/// An SSA-style temporary; register assignment is performed by the
/// external register allocator, outside this core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Variable {
    pub index: u32,
    pub kind: Kind,
}

/// A not-yet-resolved address computation: `base + index*scale + disp`.
/// Base and index are themselves values (registers or variables).
#[derive(Clone, Debug, PartialEq)]
pub struct AddressValue {
    pub kind: Kind,
    pub base: Value,
    /// `Value::Illegal` when there is no index component.
    pub index: Value,
    pub scale: Scale,
    pub disp: i32,
}

/// A tagged operand value.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// Sentinel for absent operands.
    #[default]
    Illegal,
    Constant(Constant),
    /// A physical register holding a value of the given kind.
    Reg(Reg, Kind),
    Stack(StackSlot),
    VirtualStack(VirtualSlot),
    Variable(Variable),
    Address(Box<AddressValue>),
}

impl Value {
    /// A register value.
    pub fn reg(reg: Reg, kind: Kind) -> Value {
        Value::Reg(reg, kind)
    }

    /// An address value with no index component.
    pub fn address(kind: Kind, base: Value, disp: i32) -> Value {
        Value::Address(Box::new(AddressValue {
            kind,
            base,
            index: Value::Illegal,
            scale: Scale::One,
            disp,
        }))
    }

    /// The kind of this value; `Kind::Illegal` for the sentinel.
    pub fn kind(&self) -> Kind {
        match self {
            Value::Illegal => Kind::Illegal,
            Value::Constant(c) => c.kind(),
            Value::Reg(_, k) => *k,
            Value::Stack(s) => s.kind,
            Value::VirtualStack(v) => v.kind,
            Value::Variable(v) => v.kind,
            Value::Address(a) => a.kind,
        }
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self, Value::Illegal)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Value::Constant(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Value::Reg(..))
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, Value::Stack(_))
    }

    pub fn is_virtual_stack(&self) -> bool {
        matches!(self, Value::VirtualStack(_))
    }

    /// The physical register, if this is a register value.
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Value::Reg(r, _) => Some(*r),
            _ => None,
        }
    }

    /// The constant payload, if this is a constant.
    pub fn as_constant(&self) -> Option<Constant> {
        match self {
            Value::Constant(c) => Some(*c),
            _ => None,
        }
    }

    /// The concrete stack slot, if assigned.
    pub fn as_stack(&self) -> Option<StackSlot> {
        match self {
            Value::Stack(s) => Some(*s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Illegal => write!(f, "-"),
            Value::Constant(c) => write!(f, "{}", c),
            Value::Reg(r, k) => write!(f, "{}:{}", r, k.tag()),
            Value::Stack(s) => {
                if s.add_frame_size {
                    write!(f, "stack[{}]:{}", s.raw_offset, s.kind.tag())
                } else {
                    write!(f, "in[{}]:{}", s.raw_offset, s.kind.tag())
                }
            }
            Value::VirtualStack(v) => write!(f, "vstack{}:{}", v.index, v.kind.tag()),
            Value::Variable(v) => write!(f, "v{}:{}", v.index, v.kind.tag()),
            Value::Address(a) => {
                write!(f, "[{}", a.base)?;
                if !a.index.is_illegal() {
                    write!(f, " + {}*{}", a.index, a.scale.factor())?;
                }
                if a.disp != 0 {
                    write!(f, " + {}", a.disp)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::amd64::regs;

    #[test]
    fn constant_kinds_and_payloads() {
        assert_eq!(Constant::Int(42).kind(), Kind::Int);
        assert_eq!(Constant::Null.kind(), Kind::Object);
        assert_eq!(Constant::Int(-1).as_long(), Some(-1));
        assert_eq!(Constant::Null.as_long(), Some(0));
        assert_eq!(Constant::Float(FloatBits::from_f32(1.0)).as_long(), None);
    }

    #[test]
    fn stack_slot_offset_resolution() {
        let spill = StackSlot {
            kind: Kind::Int,
            raw_offset: -8,
            add_frame_size: true,
        };
        assert_eq!(spill.sp_offset(32), 24);
        let incoming = StackSlot {
            kind: Kind::Long,
            raw_offset: 16,
            add_frame_size: false,
        };
        assert_eq!(incoming.sp_offset(32), 16);
    }

    #[test]
    fn display_forms() {
        let v = Value::reg(regs::rax(), Kind::Int);
        assert_eq!(v.to_string(), "rax:i");
        let vs = Value::VirtualStack(VirtualSlot {
            index: 3,
            kind: Kind::Long,
        });
        assert_eq!(vs.to_string(), "vstack3:j");
    }
}
