//! Compact entity references.
//!
//! Graphs, blocks, and frame states are kept in per-compilation arenas and
//! referenced by dense `u32` indices instead of pointers; cyclic structures
//! (phis, predecessor edges) become plain index pairs and liveness sets
//! become bitsets over the index space.

/// Define a `u32` newtype used as an arena index.
macro_rules! entity_ref {
    ($(#[$attr:meta])* $name:ident, $display_prefix:expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Create a reference from its index.
            pub fn new(index: usize) -> Self {
                debug_assert!(index < u32::MAX as usize);
                $name(index as u32)
            }

            /// Return the underlying index.
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, concat!($display_prefix, "{}"), self.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                std::fmt::Display::fmt(self, f)
            }
        }
    };
}

pub(crate) use entity_ref;
