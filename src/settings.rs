//! Configuration accepted by the back-end core.
//!
//! There is no CLI or file format at this level; the surrounding driver owns
//! those and hands us a fully resolved bundle.

/// Target/runtime configuration for one compilation.
///
/// The bundle is read-only for the duration of a compilation; phases borrow
/// it and never mutate it.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Number of guard pages below the stack pointer that the prologue must
    /// touch ("stack banging") so that a stack overflow is raised eagerly.
    pub stack_shadow_pages: u32,
    /// Whether the host is multi-processor. On uniprocessor hosts most
    /// memory barriers degrade to compiler-only barriers.
    pub is_mp: bool,
    /// Word size in bytes. The reference target is 64-bit; 4 is accepted
    /// for the sake of the configuration surface but unused by the AMD64
    /// backend.
    pub word_size: u32,
    /// Store object references as 32-bit narrow values in memory.
    pub use_compressed_refs: bool,
    /// Base address added when decoding a narrow reference.
    pub narrow_ref_base: i64,
    /// Shift applied when decoding a narrow reference.
    pub narrow_ref_shift: u8,
    /// Minimum object alignment in bytes; constrains the narrow-ref shift.
    pub min_object_alignment: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            stack_shadow_pages: 0,
            is_mp: true,
            word_size: 8,
            use_compressed_refs: false,
            narrow_ref_base: 0,
            narrow_ref_shift: 0,
            min_object_alignment: 8,
        }
    }
}

impl CoreConfig {
    /// Size of the page used for stack banging.
    pub const PAGE_SIZE: u32 = 4096;
}
