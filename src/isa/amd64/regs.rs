//! AMD64 register definitions.

use crate::ir::Kind;

/// Register class: general-purpose or SSE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr,
    Xmm,
}

/// A physical AMD64 register, identified by class and hardware encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    class: RegClass,
    enc: u8,
}

impl Reg {
    /// Construct a general-purpose register from its hardware encoding.
    pub const fn gpr(enc: u8) -> Reg {
        assert!(enc < 16);
        Reg {
            class: RegClass::Gpr,
            enc,
        }
    }

    /// Construct an SSE register from its hardware encoding.
    pub const fn xmm(enc: u8) -> Reg {
        assert!(enc < 16);
        Reg {
            class: RegClass::Xmm,
            enc,
        }
    }

    /// The register class.
    pub fn class(self) -> RegClass {
        self.class
    }

    /// The 4-bit hardware encoding. The high bit goes into the REX prefix.
    pub fn enc(self) -> u8 {
        self.enc
    }

    /// True for general-purpose registers.
    pub fn is_gpr(self) -> bool {
        self.class == RegClass::Gpr
    }

    /// The register class that holds values of `kind`.
    pub fn class_for_kind(kind: Kind) -> RegClass {
        if kind.is_float() {
            RegClass::Xmm
        } else {
            RegClass::Gpr
        }
    }
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15",
];

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.class {
            RegClass::Gpr => write!(f, "{}", GPR_NAMES[self.enc as usize]),
            RegClass::Xmm => write!(f, "xmm{}", self.enc),
        }
    }
}

impl std::fmt::Debug for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A register guaranteed to be writable at its use site.
///
/// Construction is explicit so that defs are visibly distinct from uses in
/// lowering and emission code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Writable<R> {
    reg: R,
}

impl<R: Copy> Writable<R> {
    /// Mark a register writable.
    pub fn from_reg(reg: R) -> Writable<R> {
        Writable { reg }
    }

    /// The underlying register.
    pub fn to_reg(self) -> R {
        self.reg
    }
}

impl<R: std::fmt::Display + Copy> std::fmt::Display for Writable<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.reg)
    }
}

impl<R: std::fmt::Debug + Copy> std::fmt::Debug for Writable<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.reg)
    }
}

/// Get a reference to the accumulator (and division low word).
pub fn rax() -> Reg {
    Reg::gpr(0)
}

/// Get a reference to rcx; shift counts live in its low byte.
pub fn rcx() -> Reg {
    Reg::gpr(1)
}

/// Get a reference to rdx (division high word).
pub fn rdx() -> Reg {
    Reg::gpr(2)
}

/// Get a reference to rbx.
pub fn rbx() -> Reg {
    Reg::gpr(3)
}

/// Get a reference to the stack pointer.
pub fn rsp() -> Reg {
    Reg::gpr(4)
}

/// Get a reference to the frame pointer.
pub fn rbp() -> Reg {
    Reg::gpr(5)
}

/// Get a reference to rsi.
pub fn rsi() -> Reg {
    Reg::gpr(6)
}

/// Get a reference to rdi.
pub fn rdi() -> Reg {
    Reg::gpr(7)
}

/// Get a reference to the numbered extended register r8..r15.
pub fn gpr(num: u8) -> Reg {
    Reg::gpr(num)
}

/// Get a reference to the numbered SSE register.
pub fn xmm(num: u8) -> Reg {
    Reg::xmm(num)
}

/// The general-purpose scratch register (r10).
///
/// Reserved from allocation: stack-to-stack moves, table-switch address
/// computation, and deopt stubs materialize into it, so it must never hold
/// a live value across an instruction boundary.
pub fn scratch_reg() -> Reg {
    Reg::gpr(10)
}

/// A second scratch register (r11) for sequences that need two temps.
pub fn scratch_reg2() -> Reg {
    Reg::gpr(11)
}

/// The SSE scratch register (xmm15).
pub fn xmm_scratch_reg() -> Reg {
    Reg::xmm(15)
}

/// Get a writable reference to the scratch register.
pub fn writable_scratch_reg() -> Writable<Reg> {
    Writable::from_reg(scratch_reg())
}

/// Per-calling-convention register assignment.
#[derive(Clone, Debug)]
pub struct CallingConvention {
    /// Integer/reference argument registers, in order.
    pub int_args: Vec<Reg>,
    /// Float/double argument registers, in order.
    pub float_args: Vec<Reg>,
    /// Integer/reference return register.
    pub int_ret: Reg,
    /// Float/double return register.
    pub float_ret: Reg,
    /// Registers the callee may clobber.
    pub caller_saved: Vec<Reg>,
}

/// Register configuration handed in by the host runtime: which registers
/// the (external) register allocator may use, which are reserved, and how
/// each calling convention assigns arguments.
#[derive(Clone, Debug)]
pub struct RegisterConfig {
    /// Registers available to the register allocator.
    pub allocatable: Vec<Reg>,
    /// The reserved general-purpose scratch register.
    pub scratch: Reg,
    /// Convention for compiled-to-compiled method calls.
    pub method_call: CallingConvention,
    /// Convention for calls into runtime helpers.
    pub foreign_call: CallingConvention,
}

impl RegisterConfig {
    /// A System-V-flavoured default used by tests and the bring-up driver.
    pub fn base() -> RegisterConfig {
        let int_args = vec![rdi(), rsi(), rdx(), rcx(), gpr(8), gpr(9)];
        let float_args = (0u8..8).map(Reg::xmm).collect::<Vec<_>>();
        let caller_saved = vec![
            rax(),
            rcx(),
            rdx(),
            rsi(),
            rdi(),
            gpr(8),
            gpr(9),
            gpr(10),
            gpr(11),
        ];
        let conv = CallingConvention {
            int_args,
            float_args,
            int_ret: rax(),
            float_ret: Reg::xmm(0),
            caller_saved,
        };
        RegisterConfig {
            allocatable: vec![
                rax(),
                rcx(),
                rdx(),
                rbx(),
                rsi(),
                rdi(),
                gpr(8),
                gpr(9),
                gpr(12),
                gpr(13),
                gpr(14),
            ],
            scratch: scratch_reg(),
            method_call: conv.clone(),
            foreign_call: conv,
        }
    }

    /// Argument registers filtered by kind for the given convention.
    pub fn args_for_kind<'a>(conv: &'a CallingConvention, kind: Kind) -> &'a [Reg] {
        if kind.is_float() {
            &conv.float_args
        } else {
            &conv.int_args
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings() {
        assert_eq!(rax().enc(), 0);
        assert_eq!(rsp().enc(), 4);
        assert_eq!(rbp().enc(), 5);
        assert_eq!(gpr(10).enc(), 10);
        assert_eq!(Reg::xmm(15).enc(), 15);
    }

    #[test]
    fn names() {
        assert_eq!(rax().to_string(), "rax");
        assert_eq!(gpr(13).to_string(), "r13");
        assert_eq!(Reg::xmm(3).to_string(), "xmm3");
    }
}
