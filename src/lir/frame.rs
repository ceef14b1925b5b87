//! Stack frame layout.
//!
//! The frame is rbp-anchored: the prologue pushes rbp and subtracts the
//! final frame size from rsp. Slot offsets are recorded before that size
//! is known, so spill slots carry negative offsets resolved against the
//! frame size at emission (`add_frame_size`), incoming arguments sit at
//! fixed positive offsets above the saved rbp/return-address pair, and
//! outgoing argument slots are plain rsp-relative offsets.
//!
//! ```text
//!   rbp + 16 + 8n : incoming stack argument n   (add_frame_size, raw > 0)
//!   rbp +  8      : return address
//!   rbp +  0      : saved rbp
//!   rbp -  k      : spill area                  (add_frame_size, raw < 0)
//!   rsp + 8m      : outgoing argument m         (raw ≥ 0)
//! ```
//!
//! The map grows monotonically during generation and allocation and is
//! frozen before emission; growth after freezing is a pass-ordering bug.

use crate::ir::{Kind, StackSlot};

/// Offset of the first incoming stack argument relative to the frame
/// (above the saved rbp and the return address).
const INCOMING_ARG_BASE: i32 = 16;

/// Builder and final authority for the frame layout of one compilation.
#[derive(Debug)]
pub struct FrameMap {
    word_size: u32,
    spill_size: u32,
    outgoing_size: u32,
    frozen: bool,
}

impl FrameMap {
    pub fn new(word_size: u32) -> FrameMap {
        FrameMap {
            word_size,
            spill_size: 0,
            outgoing_size: 0,
            frozen: false,
        }
    }

    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    /// Allocate a fresh spill slot for `kind`, aligned to its size.
    pub fn alloc_spill_slot(&mut self, kind: Kind) -> StackSlot {
        debug_assert!(!self.frozen, "frame map frozen");
        let size = kind.size_in_bytes(self.word_size).max(1);
        self.spill_size = align_up(self.spill_size + size, size);
        StackSlot {
            kind,
            raw_offset: -(self.spill_size as i32),
            add_frame_size: true,
        }
    }

    /// Allocate a contiguous multi-word range; the result names its first
    /// (lowest-address) word.
    pub fn alloc_range(&mut self, slots: u32) -> StackSlot {
        debug_assert!(!self.frozen, "frame map frozen");
        let size = slots.max(1) * self.word_size;
        self.spill_size = align_up(self.spill_size + size, self.word_size);
        StackSlot {
            kind: Kind::Long,
            raw_offset: -(self.spill_size as i32),
            add_frame_size: true,
        }
    }

    /// Make sure the outgoing-argument area holds at least `n` word slots.
    pub fn reserve_outgoing(&mut self, n: u32) {
        debug_assert!(!self.frozen, "frame map frozen");
        self.outgoing_size = self.outgoing_size.max(n * self.word_size);
    }

    /// The slot of incoming stack argument `index` (0-based among the
    /// arguments that did not fit in registers).
    pub fn incoming_arg_slot(&self, index: u32, kind: Kind) -> StackSlot {
        StackSlot {
            kind,
            raw_offset: INCOMING_ARG_BASE + (index * self.word_size) as i32,
            add_frame_size: true,
        }
    }

    /// The slot of outgoing stack argument `index` at a call site.
    pub fn outgoing_arg_slot(&self, index: u32, kind: Kind) -> StackSlot {
        StackSlot {
            kind,
            raw_offset: (index * self.word_size) as i32,
            add_frame_size: false,
        }
    }

    /// Freeze the layout; the frame size is final afterwards.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The number of bytes the prologue subtracts from rsp. Sized so the
    /// stack pointer stays 16-byte aligned at call sites (the saved rbp
    /// and return address account for the other 16 bytes).
    pub fn frame_size(&self) -> u32 {
        debug_assert!(self.frozen, "frame size read before freeze");
        align_up(self.spill_size + self.outgoing_size, 16)
    }

    /// Bytes currently devoted to spill slots (test introspection).
    pub fn spill_size(&self) -> u32 {
        self.spill_size
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_slots_are_aligned_and_distinct() {
        let mut fm = FrameMap::new(8);
        let a = fm.alloc_spill_slot(Kind::Int);
        let b = fm.alloc_spill_slot(Kind::Long);
        let c = fm.alloc_spill_slot(Kind::Byte);
        assert_eq!(a.raw_offset, -4);
        assert_eq!(b.raw_offset, -16); // 8-aligned past the int
        assert_eq!(c.raw_offset, -17);
        assert!(a.add_frame_size && b.add_frame_size && c.add_frame_size);
    }

    #[test]
    fn frame_size_is_16_aligned() {
        let mut fm = FrameMap::new(8);
        fm.alloc_spill_slot(Kind::Int);
        fm.reserve_outgoing(3);
        fm.freeze();
        assert_eq!(fm.frame_size() % 16, 0);
        assert!(fm.frame_size() >= 4 + 24);
    }

    #[test]
    fn incoming_and_outgoing_offsets() {
        let mut fm = FrameMap::new(8);
        let in0 = fm.incoming_arg_slot(0, Kind::Long);
        let in1 = fm.incoming_arg_slot(1, Kind::Object);
        assert_eq!(in0.raw_offset, 16);
        assert_eq!(in1.raw_offset, 24);
        let out0 = fm.outgoing_arg_slot(0, Kind::Long);
        assert_eq!(out0.raw_offset, 0);
        assert!(!out0.add_frame_size);
    }

    #[test]
    fn range_allocation_is_word_aligned() {
        let mut fm = FrameMap::new(8);
        fm.alloc_spill_slot(Kind::Byte);
        let r = fm.alloc_range(3);
        assert_eq!(r.raw_offset % 8, 0);
        assert_eq!(fm.spill_size(), 32);
    }
}
