//! AMD64 instruction arguments: operand sizes, condition codes, and
//! addressing modes.

use crate::isa::amd64::regs::Reg;

/// Operand width of an integer instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    Size8,
    Size16,
    Size32,
    Size64,
}

impl OperandSize {
    /// Width in bytes.
    pub fn bytes(self) -> u8 {
        match self {
            OperandSize::Size8 => 1,
            OperandSize::Size16 => 2,
            OperandSize::Size32 => 4,
            OperandSize::Size64 => 8,
        }
    }

    /// True for the 64-bit case.
    pub fn is64(self) -> bool {
        self == OperandSize::Size64
    }

    /// Smallest size covering `bits`.
    pub fn from_bits(bits: u32) -> OperandSize {
        match bits {
            0..=8 => OperandSize::Size8,
            9..=16 => OperandSize::Size16,
            17..=32 => OperandSize::Size32,
            _ => OperandSize::Size64,
        }
    }

    /// The mask applied to shift amounts at this width (5 or 6 bits).
    pub fn shift_mask(self) -> u8 {
        if self.is64() {
            63
        } else {
            31
        }
    }
}

/// Condition codes, in hardware encoding order (the low nibble of the
/// `Jcc`/`SETcc`/`CMOVcc` opcodes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CondCode {
    O = 0,
    NO = 1,
    B = 2,
    AE = 3,
    E = 4,
    NE = 5,
    BE = 6,
    A = 7,
    S = 8,
    NS = 9,
    P = 10,
    NP = 11,
    L = 12,
    GE = 13,
    LE = 14,
    G = 15,
}

impl CondCode {
    /// The machine encoding of this condition.
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// The condition that holds exactly when `self` does not.
    pub fn invert(self) -> CondCode {
        use CondCode::*;
        match self {
            O => NO,
            NO => O,
            B => AE,
            AE => B,
            E => NE,
            NE => E,
            BE => A,
            A => BE,
            S => NS,
            NS => S,
            P => NP,
            NP => P,
            L => GE,
            GE => L,
            LE => G,
            G => LE,
        }
    }

    /// The condition that holds on `cmp y, x` exactly when `self` holds on
    /// `cmp x, y`. Swapping comparison operands flips the inequalities but
    /// preserves (in)equality.
    pub fn mirror(self) -> CondCode {
        use CondCode::*;
        match self {
            E => E,
            NE => NE,
            L => G,
            G => L,
            LE => GE,
            GE => LE,
            B => A,
            A => B,
            BE => AE,
            AE => BE,
            O => O,
            NO => NO,
            S => S,
            NS => NS,
            P => P,
            NP => NP,
        }
    }
}

impl std::fmt::Display for CondCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut s = format!("{:?}", self);
        s.make_ascii_lowercase();
        write!(f, "{}", s)
    }
}

/// The scaling factor for the index register of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scale {
    One,
    Two,
    Four,
    Eight,
}

impl Scale {
    /// Build from a multiplier in {1, 2, 4, 8}.
    pub fn from_factor(factor: u8) -> Option<Scale> {
        match factor {
            1 => Some(Scale::One),
            2 => Some(Scale::Two),
            4 => Some(Scale::Four),
            8 => Some(Scale::Eight),
            _ => None,
        }
    }

    /// The two-bit SIB encoding.
    pub fn enc(self) -> u8 {
        match self {
            Scale::One => 0b00,
            Scale::Two => 0b01,
            Scale::Four => 0b10,
            Scale::Eight => 0b11,
        }
    }

    /// The multiplier.
    pub fn factor(self) -> u8 {
        1 << self.enc()
    }
}

/// A resolved x64 addressing mode: `base + index*scale + disp`.
///
/// This is the emission-time form; the LIR-level `Value::Address` carries
/// its components as `Value`s and is lowered to this once all operands are
/// physical registers.
#[derive(Clone, Copy, Debug)]
pub struct Amode {
    pub base: Reg,
    pub index: Option<(Reg, Scale)>,
    pub disp: i32,
}

impl Amode {
    /// Base register only.
    pub fn base(base: Reg) -> Amode {
        Amode {
            base,
            index: None,
            disp: 0,
        }
    }

    /// Base register plus displacement.
    pub fn base_disp(base: Reg, disp: i32) -> Amode {
        Amode {
            base,
            index: None,
            disp,
        }
    }

    /// Full base + index*scale + displacement form.
    pub fn base_index_disp(base: Reg, index: Reg, scale: Scale, disp: i32) -> Amode {
        Amode {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

impl std::fmt::Display for Amode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}", self.base)?;
        if let Some((index, scale)) = self.index {
            write!(f, " + {}*{}", index, scale.factor())?;
        }
        if self.disp != 0 {
            write!(f, " {} {:#x}", if self.disp < 0 { "-" } else { "+" }, self.disp.unsigned_abs())?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invert_is_involutive() {
        for enc in 0..16u8 {
            let cc: CondCode = unsafe { std::mem::transmute(enc) };
            assert_eq!(cc.invert().invert(), cc);
            assert_eq!(cc.mirror().mirror(), cc);
        }
    }

    #[test]
    fn mirror_flips_inequalities() {
        assert_eq!(CondCode::L.mirror(), CondCode::G);
        assert_eq!(CondCode::BE.mirror(), CondCode::AE);
        assert_eq!(CondCode::E.mirror(), CondCode::E);
    }

    #[test]
    fn scale_factors() {
        assert_eq!(Scale::from_factor(4), Some(Scale::Four));
        assert_eq!(Scale::from_factor(3), None);
        assert_eq!(Scale::Eight.factor(), 8);
    }
}
