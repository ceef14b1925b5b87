//! The narrow interface between the core and its host runtime.
//!
//! The runtime used to be reachable as a process-wide singleton; here it is
//! a capability bundle borrowed for the duration of one compilation. The
//! core calls out through `RuntimeCaps` and hands back a `CompiledCode`
//! artifact for installation; nothing else crosses the boundary.

use crate::ir::{Constant, DeoptAction, DeoptReason, Kind, StateId};
use crate::isa::amd64::regs::RegisterConfig;
use crate::result::CodegenResult;

/// Offset in bytes from the beginning of the emitted function.
pub type CodeOffset = u32;

/// Memory-barrier requirement bits, in the JMM's four-fence vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Barriers(pub u8);

impl Barriers {
    pub const LOAD_LOAD: Barriers = Barriers(1);
    pub const LOAD_STORE: Barriers = Barriers(2);
    pub const STORE_LOAD: Barriers = Barriers(4);
    pub const STORE_STORE: Barriers = Barriers(8);

    /// Union of two requirement sets.
    pub fn union(self, other: Barriers) -> Barriers {
        Barriers(self.0 | other.0)
    }

    /// True if every bit of `other` is present.
    pub fn contains(self, other: Barriers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Identity and signature of a runtime helper routine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ForeignCallDescriptor {
    pub name: &'static str,
    pub result: Kind,
    pub args: &'static [Kind],
}

/// The `deoptimize` entry point: scratch register carries the encoded
/// (reason, action) word.
pub const DEOPTIMIZE: ForeignCallDescriptor = ForeignCallDescriptor {
    name: "deoptimize",
    result: Kind::Void,
    args: &[],
};

/// `frem(f32, f32) -> f32`; the FPREM path is not worth carrying.
pub const ARITHMETIC_FREM: ForeignCallDescriptor = ForeignCallDescriptor {
    name: "arithmeticFrem",
    result: Kind::Float,
    args: &[Kind::Float, Kind::Float],
};

/// `drem(f64, f64) -> f64`.
pub const ARITHMETIC_DREM: ForeignCallDescriptor = ForeignCallDescriptor {
    name: "arithmeticDrem",
    result: Kind::Double,
    args: &[Kind::Double, Kind::Double],
};

/// A resolved foreign-call target.
#[derive(Clone, Copy, Debug)]
pub struct ForeignCallTarget {
    /// Absolute entry address.
    pub address: u64,
    /// Upper bound on the distance between any code cache address and the
    /// target; decides the near (rel32) vs. far (register-indirect) form.
    pub max_target_offset: u64,
    /// Whether the callee clobbers the caller-saved register set.
    pub kills_caller_saves: bool,
}

impl ForeignCallTarget {
    /// True if a rel32 call provably reaches the target.
    pub fn is_near(&self) -> bool {
        self.max_target_offset < i32::MAX as u64
    }
}

/// What a patch site refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchTarget {
    /// A compiled or to-be-compiled method.
    Method(u64),
    /// A runtime helper, by descriptor name.
    Foreign(&'static str),
    /// A relocatable data constant.
    Data(Constant),
}

/// Kind of fixup the installer must apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// rel32 call displacement.
    DirectCall,
    /// Absolute 8-byte data reference.
    DataRef,
    /// Absolute 8-byte object reference tracked by the collector.
    ObjectRef,
}

/// One location in the code the runtime must fix up at installation.
#[derive(Clone, Debug)]
pub struct PatchSite {
    pub offset: CodeOffset,
    pub kind: PatchKind,
    pub target: PatchTarget,
}

/// Associates a code position with the frame state live there.
#[derive(Clone, Copy, Debug)]
pub struct SafepointRecord {
    pub offset: CodeOffset,
    pub state: StateId,
}

/// One out-of-line deoptimization stub.
#[derive(Clone, Copy, Debug)]
pub struct DeoptStubRecord {
    /// Offset of the stub's first byte.
    pub offset: CodeOffset,
    pub reason: DeoptReason,
    pub action: DeoptAction,
    /// The (reason, action) word as the host encoded it.
    pub encoded: u64,
    pub state: StateId,
}

/// An exception-handler table entry: PCs in `[start, end)` dispatch to
/// `handler`.
#[derive(Clone, Copy, Debug)]
pub struct ExceptionHandler {
    pub start: CodeOffset,
    pub end: CodeOffset,
    pub handler: CodeOffset,
}

/// The installable result of one compilation.
#[derive(Debug, Default)]
pub struct CompiledCode {
    /// Native code; execution starts at `entry_offset`.
    pub code: Vec<u8>,
    pub entry_offset: CodeOffset,
    /// Fixed frame size in bytes (excluding the return address).
    pub frame_size: u32,
    /// Ordered by code offset.
    pub safepoints: Vec<SafepointRecord>,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub patch_sites: Vec<PatchSite>,
    pub deopt_stubs: Vec<DeoptStubRecord>,
}

/// Capabilities the core requires from its host runtime.
pub trait RuntimeCaps {
    /// Resolve a runtime helper to a callable target.
    fn lookup_foreign_call(
        &self,
        descriptor: &ForeignCallDescriptor,
    ) -> CodegenResult<ForeignCallTarget>;

    /// Pack a (reason, action) pair into the word the deopt handler
    /// expects in the scratch register.
    fn encode_deopt_action_and_reason(&self, action: DeoptAction, reason: DeoptReason) -> u64;

    /// Whether a constant references a relocatable address and therefore
    /// cannot be inlined into an instruction's immediate field.
    fn needs_data_patch(&self, constant: &Constant) -> bool;

    /// Register tables and calling conventions for this target.
    fn register_config(&self) -> &RegisterConfig;

    /// Filter architecture-independent barrier requirements down to the
    /// fences this target actually needs (AMD64's TSO model only orders
    /// with a fence on store-load).
    fn barriers(&self, required: Barriers) -> Barriers;

    /// Hand the finished artifact to the runtime. The core calls this
    /// never; the driver does, after a successful compilation.
    fn install_code(&self, code: &CompiledCode) -> CodegenResult<()>;
}

#[cfg(test)]
pub mod testing {
    //! A scripted runtime used by unit tests.

    use super::*;
    use crate::result::CodegenError;

    /// Test runtime with fixed addresses and an identity deopt encoding.
    pub struct TestRuntime {
        pub config: RegisterConfig,
        /// Targets farther than 2 GiB force the far-call form.
        pub far_calls: bool,
    }

    impl Default for TestRuntime {
        fn default() -> Self {
            TestRuntime {
                config: RegisterConfig::base(),
                far_calls: false,
            }
        }
    }

    impl RuntimeCaps for TestRuntime {
        fn lookup_foreign_call(
            &self,
            descriptor: &ForeignCallDescriptor,
        ) -> CodegenResult<ForeignCallTarget> {
            if descriptor.name == "unknownHelper" {
                return Err(CodegenError::RuntimeLookup(descriptor.name.to_string()));
            }
            Ok(ForeignCallTarget {
                address: 0x7000_0000 + descriptor.name.len() as u64 * 0x100,
                max_target_offset: if self.far_calls {
                    1 << 40
                } else {
                    0x1000_0000
                },
                kills_caller_saves: true,
            })
        }

        fn encode_deopt_action_and_reason(
            &self,
            action: DeoptAction,
            reason: DeoptReason,
        ) -> u64 {
            ((action as u64) << 8) | reason as u64
        }

        fn needs_data_patch(&self, constant: &Constant) -> bool {
            matches!(constant, Constant::Object(_))
        }

        fn register_config(&self) -> &RegisterConfig {
            &self.config
        }

        fn barriers(&self, required: Barriers) -> Barriers {
            if required.contains(Barriers::STORE_LOAD) {
                Barriers::STORE_LOAD
            } else {
                Barriers::default()
            }
        }

        fn install_code(&self, _code: &CompiledCode) -> CodegenResult<()> {
            Ok(())
        }
    }
}
