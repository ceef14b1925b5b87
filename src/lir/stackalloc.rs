//! Linear-scan allocation of virtual stack slots.
//!
//! Four stages over a fully built LIR:
//!
//! 1. number operations with even ids in block emission order;
//! 2. backward worklist dataflow building one liveness interval per
//!    virtual slot (`Def`/`Temp` start an interval, `Use`/`Alive` and
//!    frame-state references extend it, `UNINITIALIZED` pins it to the
//!    whole method);
//! 3. linear scan over intervals ordered by start, recycling finished
//!    slots through per-size-class free lists (multi-slot ranges never
//!    recycle);
//! 4. rewrite every recorded use position, and the frame-state arena,
//!    from virtual slots to their assigned locations.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use log::{debug, trace};
use rustc_hash::FxHashSet;

use crate::bitset::BitSet;
use crate::context::CancelToken;
use crate::ir::{Block, Kind, StackSlot, Value};
use crate::lir::{FrameMap, Lir, OpFlags, OperandRole};
use crate::result::{CodegenError, CodegenResult};

/// Liveness record of one virtual stack slot.
#[derive(Clone, Debug)]
pub struct StackInterval {
    pub kind: Kind,
    pub from: u32,
    pub to: u32,
    /// Prefer the location of this partner slot if it is free.
    pub location_hint: Option<u32>,
    pub location: Option<StackSlot>,
    pub uninitialized: bool,
}

impl StackInterval {
    fn new(kind: Kind) -> StackInterval {
        StackInterval {
            kind,
            from: u32::MAX,
            to: 0,
            location_hint: None,
            location: None,
            uninitialized: false,
        }
    }

    fn add_from(&mut self, pos: u32) {
        self.from = self.from.min(pos);
    }

    fn add_to(&mut self, pos: u32) {
        self.to = self.to.max(pos);
        // A use with no preceding def in this walk still opens the
        // interval; the def side tightens it later.
        self.from = self.from.min(pos);
    }

    /// True if this interval was never touched by the dataflow.
    fn is_unused(&self) -> bool {
        self.from == u32::MAX
    }
}

/// Replace every virtual stack slot in `lir` with a concrete frame slot.
pub fn allocate_stack_slots(
    lir: &mut Lir,
    frame: &mut FrameMap,
    cancel: &CancelToken,
) -> CodegenResult<()> {
    let mut alloc = Allocator::new(lir, frame);
    alloc.number_operations();
    alloc.build_intervals(cancel)?;
    #[cfg(debug_assertions)]
    alloc.verify_liveness_converged(cancel)?;
    alloc.assign_locations();
    #[cfg(debug_assertions)]
    alloc.verify_intervals();
    alloc.rewrite();
    #[cfg(debug_assertions)]
    alloc.verify_resolved();
    Ok(())
}

struct Allocator<'a> {
    lir: &'a mut Lir,
    frame: &'a mut FrameMap,
    max_op_id: u32,
    intervals: Vec<StackInterval>,
    live_in: Vec<BitSet>,
    live_out: Vec<BitSet>,
    /// (block index, instruction index) pairs that reference any virtual
    /// slot directly in an operand.
    use_positions: FxHashSet<(usize, usize)>,
}

impl<'a> Allocator<'a> {
    fn new(lir: &'a mut Lir, frame: &'a mut FrameMap) -> Allocator<'a> {
        let num_blocks = lir.blocks.len();
        let intervals = lir
            .vslots
            .iter()
            .map(|info| StackInterval::new(info.kind))
            .collect();
        Allocator {
            lir,
            frame,
            max_op_id: 0,
            intervals,
            live_in: vec![BitSet::new(); num_blocks],
            live_out: vec![BitSet::new(); num_blocks],
            use_positions: FxHashSet::default(),
        }
    }

    /// Stage 1: even ids in emission order, gap-free.
    fn number_operations(&mut self) {
        let mut next = 0u32;
        for &b in self.lir.order.clone().iter() {
            let blk = self.lir.block_mut(b);
            blk.first_op_id = next;
            next += 2 * blk.insts.len() as u32;
        }
        self.max_op_id = next.saturating_sub(2);
        debug!(
            "stackalloc: numbered {} ops, max id {}",
            next / 2,
            self.max_op_id
        );
    }

    fn block_last_id(&self, b: Block) -> u32 {
        let blk = self.lir.block(b);
        blk.first_op_id + 2 * (blk.insts.len() as u32 - 1)
    }

    /// Stage 2: backward worklist dataflow over virtual-slot ids.
    fn build_intervals(&mut self, cancel: &CancelToken) -> CodegenResult<()> {
        // Popping from the back visits blocks in reverse emission order
        // first, the natural direction for a backward analysis.
        let order = self.lir.order.clone();
        let mut worklist: Vec<Block> = order.to_vec();
        let mut queued: FxHashSet<Block> = worklist.iter().copied().collect();

        while let Some(b) = worklist.pop() {
            queued.remove(&b);
            if cancel.is_cancelled() {
                return Err(CodegenError::Cancelled);
            }

            // liveOut = union of successors' liveIn.
            let mut live = BitSet::new();
            for &s in &self.lir.block(b).succs {
                let succ_in = self.live_in[s.index()].clone();
                live.union_with(&succ_in);
            }
            let out_changed = self.live_out[b.index()] != live;
            if out_changed {
                self.live_out[b.index()] = live.clone();
            }

            // Slots live across the block's end extend to its boundary.
            let blk_len = self.lir.block(b).insts.len();
            if blk_len > 0 {
                let end_boundary = self.block_last_id(b) + 1;
                for slot in live.iter() {
                    self.intervals[slot].add_to(end_boundary);
                }
            }

            // Walk the block bottom-up applying the def/use closure.
            let first_id = self.lir.block(b).first_op_id;
            for idx in (0..blk_len).rev() {
                let op_id = first_id + 2 * idx as u32;
                let mut touched = false;
                let state = self.lir.blocks[b.index()].insts[idx].frame_state();

                let intervals = &mut self.intervals;
                self.lir.blocks[b.index()].insts[idx].visit_values(&mut |v, role, flags| {
                    let slot = match v {
                        Value::VirtualStack(vs) => vs.index as usize,
                        _ => return,
                    };
                    touched = true;
                    match role {
                        OperandRole::Def | OperandRole::Temp => {
                            intervals[slot].add_from(op_id);
                            live.remove(slot);
                        }
                        OperandRole::Use | OperandRole::Alive => {
                            intervals[slot].add_to(op_id);
                            live.insert(slot);
                            if flags.contains(OpFlags::UNINITIALIZED) {
                                intervals[slot].uninitialized = true;
                            }
                        }
                    }
                });

                // Frame-state references behave like uses at the op.
                if let Some(sid) = state {
                    let intervals = &mut self.intervals;
                    self.lir.states.get(sid).visit_values(&mut |v| {
                        if let Value::VirtualStack(vs) = v {
                            let slot = vs.index as usize;
                            intervals[slot].add_to(op_id);
                            live.insert(slot);
                        }
                    });
                }

                if touched {
                    self.use_positions.insert((b.index(), idx));
                }

                self.propagate_hint(b, idx);
            }

            // Slots live into the block extend to its start.
            for slot in live.iter() {
                self.intervals[slot].add_from(first_id);
            }

            if self.live_in[b.index()] != live {
                self.live_in[b.index()] = live;
                for &p in &self.lir.block(b).preds {
                    if queued.insert(p) {
                        worklist.push(p);
                    }
                }
            }
        }

        // UNINITIALIZED pins the whole method.
        let max = self.max_op_id;
        for iv in &mut self.intervals {
            if iv.uninitialized {
                iv.from = 0;
                iv.to = max;
            }
        }
        Ok(())
    }

    /// Record a location hint between a hinted operand and its partner
    /// when both are virtual slots.
    fn propagate_hint(&mut self, b: Block, idx: usize) {
        let mut hinted: Option<(usize, OperandRole)> = None;
        let mut first_def: Option<usize> = None;
        let mut first_use: Option<usize> = None;
        self.lir.blocks[b.index()].insts[idx].visit_values(&mut |v, role, flags| {
            let slot = match v {
                Value::VirtualStack(vs) => vs.index as usize,
                _ => return,
            };
            match role {
                OperandRole::Def if first_def.is_none() => first_def = Some(slot),
                OperandRole::Use | OperandRole::Alive if first_use.is_none() => {
                    first_use = Some(slot)
                }
                _ => {}
            }
            if flags.contains(OpFlags::HINT) && hinted.is_none() {
                hinted = Some((slot, role));
            }
        });
        if let Some((slot, role)) = hinted {
            let partner = match role {
                OperandRole::Def => first_use,
                _ => first_def,
            };
            if let Some(p) = partner {
                if p != slot {
                    self.intervals[slot].location_hint = Some(p as u32);
                }
            }
        }
    }

    /// Stage 3: linear scan.
    fn assign_locations(&mut self) {
        // unhandled ordered by `from` ascending, active by `to` ascending.
        let mut unhandled: BinaryHeap<Reverse<(u32, u32)>> = BinaryHeap::new();
        for (i, iv) in self.intervals.iter().enumerate() {
            if !iv.is_unused() {
                unhandled.push(Reverse((iv.from, i as u32)));
            }
        }
        let mut active: BinaryHeap<Reverse<(u32, u32)>> = BinaryHeap::new();
        // Free slots by size class {1, 2, 4, 8}.
        let mut free: [Vec<StackSlot>; 4] = Default::default();
        let class_index = |c: u32| c.trailing_zeros() as usize;

        while let Some(Reverse((from, slot))) = unhandled.pop() {
            // Evict finished intervals, recycling their locations.
            while let Some(&Reverse((to, done))) = active.peek() {
                if to >= from {
                    break;
                }
                active.pop();
                let done_iv = &self.intervals[done as usize];
                if self.lir.vslots[done as usize].is_range() || done_iv.uninitialized {
                    continue;
                }
                if let (Some(loc), Some(class)) = (
                    done_iv.location,
                    done_iv.kind.size_class(self.frame.word_size()),
                ) {
                    free[class_index(class)].push(loc);
                }
            }

            let is_range = self.lir.vslots[slot as usize].is_range();
            let range_slots = self.lir.vslots[slot as usize].slots;
            let (kind, iv_from, iv_to, hint) = {
                let iv = &self.intervals[slot as usize];
                (iv.kind, iv.from, iv.to, iv.location_hint)
            };

            let location = if is_range {
                // Reference-tagged ranges always get fresh storage.
                self.frame.alloc_range(range_slots)
            } else {
                match kind.size_class(self.frame.word_size()) {
                    Some(class) => {
                        let hint_loc = hint.and_then(|h| self.intervals[h as usize].location);
                        let list = &mut free[class_index(class)];
                        // Honor the hint when its location is in the list.
                        let picked = hint_loc
                            .and_then(|hl| list.iter().position(|s| s.raw_offset == hl.raw_offset))
                            .or(if list.is_empty() {
                                None
                            } else {
                                Some(list.len() - 1)
                            });
                        match picked {
                            Some(pos) => {
                                let reused = list.swap_remove(pos);
                                trace!(
                                    "stackalloc: reuse offset {} for vstack{}",
                                    reused.raw_offset,
                                    slot
                                );
                                // Re-tag with the current interval's kind.
                                StackSlot { kind, ..reused }
                            }
                            None => self.frame.alloc_spill_slot(kind),
                        }
                    }
                    // A kind outside {1,2,4,8} neither reuses nor donates.
                    None => self.frame.alloc_spill_slot(kind),
                }
            };
            trace!(
                "stackalloc: vstack{} [{}, {}] -> offset {}",
                slot,
                iv_from,
                iv_to,
                location.raw_offset
            );
            self.intervals[slot as usize].location = Some(location);
            active.push(Reverse((iv_to, slot)));
        }
    }

    /// Stage 4: rewrite operands and frame states in place.
    fn rewrite(&mut self) {
        let positions: Vec<(usize, usize)> = self.use_positions.iter().copied().collect();
        for (bi, idx) in positions {
            let intervals = &self.intervals;
            self.lir.blocks[bi].insts[idx].visit_values(&mut |v, _, _| {
                if let Value::VirtualStack(vs) = v {
                    let loc = intervals[vs.index as usize]
                        .location
                        .expect("every used virtual slot has a location");
                    *v = Value::Stack(loc);
                }
            });
        }
        let intervals = &self.intervals;
        for state in self.lir.states.iter_mut() {
            state.visit_values_mut(&mut |v| {
                if let Value::VirtualStack(vs) = v {
                    let loc = intervals[vs.index as usize]
                        .location
                        .expect("every state-referenced virtual slot has a location");
                    *v = Value::Stack(loc);
                }
            });
        }
        debug!(
            "stackalloc: rewrote {} use positions, {} intervals",
            self.use_positions.len(),
            self.intervals.len()
        );
    }

    /// Liveness convergence check: a second dataflow run must reproduce
    /// the fixed point exactly. Runs before assignment, while virtual
    /// slots are still present.
    #[cfg(debug_assertions)]
    fn verify_liveness_converged(&mut self, cancel: &CancelToken) -> CodegenResult<()> {
        let saved_in = self.live_in.clone();
        let saved_out = self.live_out.clone();
        self.build_intervals(cancel)?;
        assert_eq!(saved_in, self.live_in, "liveness did not converge");
        assert_eq!(saved_out, self.live_out, "liveness did not converge");
        Ok(())
    }

    /// Interval bounds and reuse-safety checks after assignment.
    #[cfg(debug_assertions)]
    fn verify_intervals(&self) {
        for (i, iv) in self.intervals.iter().enumerate() {
            if iv.is_unused() {
                continue;
            }
            assert!(iv.from <= iv.to, "interval {} inverted", i);
            assert!(iv.to <= self.max_op_id + 1, "interval {} beyond end", i);
            if iv.uninitialized {
                assert_eq!(iv.from, 0);
                assert_eq!(iv.to, self.max_op_id);
            }
        }

        // Reuse safety: same physical offset implies disjoint ranges,
        // and nothing shares with an uninitialized interval.
        for i in 0..self.intervals.len() {
            for j in i + 1..self.intervals.len() {
                let (a, b) = (&self.intervals[i], &self.intervals[j]);
                if a.is_unused() || b.is_unused() {
                    continue;
                }
                if let (Some(la), Some(lb)) = (a.location, b.location) {
                    if la.raw_offset == lb.raw_offset && la.add_frame_size == lb.add_frame_size {
                        assert!(
                            a.to < b.from || b.to < a.from,
                            "overlapping intervals {} and {} share a slot",
                            i,
                            j
                        );
                        assert!(
                            !a.uninitialized && !b.uninitialized,
                            "uninitialized slot was reused"
                        );
                    }
                }
            }
        }
    }

    /// No virtual slot may survive the rewrite.
    #[cfg(debug_assertions)]
    fn verify_resolved(&mut self) {
        for &b in self.lir.order.clone().iter() {
            for idx in 0..self.lir.block(b).insts.len() {
                self.lir.blocks[b.index()].insts[idx].visit_values(&mut |v, _, _| {
                    assert!(
                        !v.is_virtual_stack(),
                        "unresolved virtual slot after allocation"
                    );
                });
            }
        }
    }
}

/// Test-visible handle running the allocator and returning its intervals.
#[cfg(test)]
pub fn allocate_collecting_intervals(
    lir: &mut Lir,
    frame: &mut FrameMap,
) -> (Vec<StackInterval>, u32) {
    let cancel = CancelToken::default();
    let mut alloc = Allocator::new(lir, frame);
    alloc.number_operations();
    alloc.build_intervals(&cancel).unwrap();
    alloc.assign_locations();
    alloc.rewrite();
    let max = alloc.max_op_id;
    (alloc.intervals, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Block, Constant, Kind, Value, Variable, VirtualSlot};
    use crate::lir::{Inst, LirBlock, VirtualSlotInfo};

    fn vslot(i: u32, kind: Kind) -> Value {
        Value::VirtualStack(VirtualSlot { index: i, kind })
    }

    fn var(i: u32, kind: Kind) -> Value {
        Value::Variable(Variable { index: i, kind })
    }

    fn spill(kind: Kind, i: u32, dst_slot: bool) -> Inst {
        if dst_slot {
            Inst::MoveFromReg {
                kind,
                dst: vslot(i, kind),
                src: var(i, kind),
            }
        } else {
            Inst::MoveToReg {
                kind,
                dst: var(i, kind),
                src: vslot(i, kind),
            }
        }
    }

    fn one_block_lir(insts: Vec<Inst>, vslots: Vec<VirtualSlotInfo>) -> Lir {
        let mut lir = Lir::default();
        lir.blocks.push(LirBlock {
            insts,
            ..Default::default()
        });
        lir.order = vec![Block::new(0)];
        lir.vslots = vslots;
        lir
    }

    fn int_slot_info() -> VirtualSlotInfo {
        VirtualSlotInfo {
            kind: Kind::Int,
            slots: 1,
            ref_map: None,
        }
    }

    #[test]
    fn ids_are_even_and_dense() {
        let mut insts = Vec::new();
        for i in 0..3 {
            insts.push(spill(Kind::Int, i, true));
            insts.push(spill(Kind::Int, i, false));
        }
        insts.push(Inst::Return {
            value: Value::Illegal,
        });
        let mut lir = one_block_lir(insts, (0..3).map(|_| int_slot_info()).collect());
        let mut fm = FrameMap::new(8);
        let (_, max) = allocate_collecting_intervals(&mut lir, &mut fm);
        assert_eq!(max, 2 * 6);
        assert_eq!(lir.block(Block::new(0)).first_op_id, 0);
    }

    #[test]
    fn disjoint_intervals_share_one_slot() {
        // Three int slots with strictly disjoint live ranges: def then
        // last use, one after another.
        let mut insts = Vec::new();
        for i in 0..3 {
            insts.push(spill(Kind::Int, i, true));
            insts.push(spill(Kind::Int, i, false));
        }
        insts.push(Inst::Return {
            value: Value::Illegal,
        });
        let mut lir = one_block_lir(insts, (0..3).map(|_| int_slot_info()).collect());
        let mut fm = FrameMap::new(8);
        let (intervals, _) = allocate_collecting_intervals(&mut lir, &mut fm);

        let offsets: Vec<i32> = intervals
            .iter()
            .map(|iv| iv.location.unwrap().raw_offset)
            .collect();
        assert_eq!(offsets[0], offsets[1]);
        assert_eq!(offsets[1], offsets[2]);
        // Frame grew by exactly one int slot.
        assert_eq!(fm.spill_size(), 4);
    }

    #[test]
    fn kind_size_mismatch_allocates_fresh() {
        let insts = vec![
            spill(Kind::Int, 0, true),
            spill(Kind::Int, 0, false),
            spill(Kind::Long, 1, true),
            spill(Kind::Long, 1, false),
            Inst::Return {
                value: Value::Illegal,
            },
        ];
        let vslots = vec![
            int_slot_info(),
            VirtualSlotInfo {
                kind: Kind::Long,
                slots: 1,
                ref_map: None,
            },
        ];
        let mut lir = one_block_lir(insts, vslots);
        let mut fm = FrameMap::new(8);
        let (intervals, _) = allocate_collecting_intervals(&mut lir, &mut fm);
        // The long interval cannot reuse the int-class slot.
        assert_ne!(
            intervals[0].location.unwrap().raw_offset,
            intervals[1].location.unwrap().raw_offset
        );
        assert_eq!(fm.spill_size(), 16);
    }

    #[test]
    fn uninitialized_spans_method_and_is_never_reused() {
        // Slot 0 has its address taken (UNINITIALIZED); slot 1 is a
        // later short-lived int.
        let insts = vec![
            Inst::StackLea {
                dst: var(0, Kind::Long),
                slot: vslot(0, Kind::Int),
            },
            spill(Kind::Int, 1, true),
            spill(Kind::Int, 1, false),
            Inst::Return {
                value: Value::Illegal,
            },
        ];
        let mut lir = one_block_lir(insts, vec![int_slot_info(), int_slot_info()]);
        let mut fm = FrameMap::new(8);
        let (intervals, max) = allocate_collecting_intervals(&mut lir, &mut fm);
        assert_eq!(intervals[0].from, 0);
        assert_eq!(intervals[0].to, max);
        assert!(intervals[0].uninitialized);
        assert_ne!(
            intervals[0].location.unwrap().raw_offset,
            intervals[1].location.unwrap().raw_offset
        );
        // Fresh allocation for the second slot.
        assert_eq!(fm.spill_size(), 8);
    }

    #[test]
    fn state_references_keep_slots_alive() {
        use crate::ir::FrameState;
        let mut lir = Lir::default();
        let sid = lir.states.push(FrameState {
            bci: 3,
            locals: vec![vslot(0, Kind::Int)],
            stack: vec![],
            locks: vec![],
            caller: None,
        });
        lir.blocks.push(LirBlock {
            insts: vec![
                spill(Kind::Int, 0, true),
                Inst::Safepoint { state: sid },
                spill(Kind::Int, 1, true),
                spill(Kind::Int, 1, false),
                Inst::Return {
                    value: Value::Illegal,
                },
            ],
            ..Default::default()
        });
        lir.order = vec![Block::new(0)];
        lir.vslots = vec![int_slot_info(), int_slot_info()];
        let mut fm = FrameMap::new(8);
        let (intervals, _) = allocate_collecting_intervals(&mut lir, &mut fm);
        // Slot 0 is live up to the safepoint (id 2), so slot 1 (defined
        // at id 4) may still not reuse it if ranges overlap; here they
        // are disjoint (2 < 4), so reuse happens.
        assert_eq!(intervals[0].to, 2);
        assert_eq!(
            intervals[0].location.unwrap().raw_offset,
            intervals[1].location.unwrap().raw_offset
        );
        // And the state itself was rewritten.
        let state = lir.states.get(sid);
        assert!(state.locals[0].is_stack());
    }

    #[test]
    fn liveness_across_blocks_extends_to_boundaries() {
        // Block 0 defines slot 0, block 1 uses it; the interval must
        // cover the boundary between them.
        let mut lir = Lir::default();
        let b0 = Block::new(0);
        let b1 = Block::new(1);
        lir.blocks.push(LirBlock {
            insts: vec![spill(Kind::Int, 0, true), Inst::Jump { target: b1 }],
            succs: vec![b1],
            ..Default::default()
        });
        lir.blocks.push(LirBlock {
            insts: vec![
                spill(Kind::Int, 0, false),
                Inst::Return {
                    value: Value::Illegal,
                },
            ],
            preds: vec![b0],
            ..Default::default()
        });
        lir.order = vec![b0, b1];
        lir.vslots = vec![int_slot_info()];
        let mut fm = FrameMap::new(8);
        let (intervals, _) = allocate_collecting_intervals(&mut lir, &mut fm);
        // Defined at 0, live through the b0/b1 boundary (id 3), used at 4.
        assert_eq!(intervals[0].from, 0);
        assert_eq!(intervals[0].to, 4);
    }
}
