//! Gantry code generation library.
//!
//! The back end of an optimizing JIT compiler for a managed runtime: it
//! accepts a scheduled, machine-independent SSA graph of one method and
//! emits AMD64 machine code together with the metadata the host runtime
//! needs to install and execute it (safepoint frame states, exception
//! handler offsets, deoptimization stubs, patch sites).
//!
//! The pipeline is three sequential phases over method-local state:
//! LIR generation ([`lir::generator`]), stack-slot allocation
//! ([`lir::stackalloc`]), and code emission ([`lir::emit`]). A
//! [`context::Context`] drives them; the host runtime is reached only
//! through the [`runtime::RuntimeCaps`] capability bundle.

#![deny(trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod bitset;
pub mod context;
pub mod ir;
pub mod isa;
pub mod lir;
pub mod result;
pub mod runtime;
pub mod settings;

mod entity;

pub use crate::context::{CancelToken, Compilation, Context};
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
