//! Result and error types representing the outcome of compiling a method.

use thiserror::Error;

/// A compilation error.
///
/// Errors surface whole-compilation: no phase attempts local recovery. The
/// driver decides whether to retry with a simpler pipeline or to mark the
/// method non-compilable.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// An operand/kind combination the target cannot lower, e.g. integer
    /// negation of an `Object` value. This is an internal compiler error:
    /// the graph builder handed us something the back end never supports.
    #[error("unsupported operand combination: {0}")]
    Unsupported(String),

    /// An encoding exceeded the range of its field, e.g. a branch or call
    /// displacement that does not fit in 32 bits, or a switch whose key
    /// count overflows the table form.
    #[error("encoding out of range: {0}")]
    OutOfRange(&'static str),

    /// The host runtime refused a lookup (foreign call target, type
    /// resolution). Propagated to the driver, which may retry.
    #[error("runtime lookup failed: {0}")]
    RuntimeLookup(String),

    /// The compilation was cancelled by the driver. Not an error in the
    /// usual sense: resources are released and nothing was observed.
    #[error("compilation cancelled")]
    Cancelled,
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl CodegenError {
    /// True if this "error" is the neutral cancelled outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CodegenError::Cancelled)
    }
}
