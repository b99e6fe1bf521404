/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Move insertion: split points inside traces, control-flow edges,
//! and copies for multiply-constrained operands.

use super::{
    CodeRange, Env, InsertMovePrio, InsertedMove, IntervalIndex, MoveDest, PendingMove,
};
use crate::moves::{ParallelMoves, ScratchResolver};
use crate::{
    Allocation, Block, EdgeResolution, EdgeState, Edit, Function, PReg, ProgPoint, RegAllocError,
    RegClass, VReg,
};
use alloc::vec::Vec;
use smallvec::SmallVec;

impl<'a, F: Function> Env<'a, F> {
    fn is_block_start(&self, pos: ProgPoint) -> bool {
        self.cfginfo.block_entry[self.cfginfo.block_of(pos).index()] == pos
    }

    /// Do two finished intervals of one value hold it in the same
    /// place? Spilled intervals of a value share its slot.
    fn same_location(&self, a: IntervalIndex, b: IntervalIndex) -> bool {
        let (a, b) = (&self.intervals[a], &self.intervals[b]);
        if a.is_spilled() || b.is_spilled() {
            a.is_spilled() && b.is_spilled() && a.vreg == b.vreg
        } else {
            a.alloc == b.alloc
        }
    }

    /// Record every move the final assignment needs, before spill
    /// slots are known.
    pub fn collect_moves(&mut self) {
        self.collect_split_moves();
        self.collect_edge_moves();
        self.collect_fixup_moves();
        self.extend_spill_ranges();
    }

    /// A split child that starts inside a block continues its
    /// predecessor sibling directly; the value moves there if the two
    /// locations differ. Children starting at a block start are
    /// connected by the block's edge moves instead.
    fn collect_split_moves(&mut self) {
        for v in 0..self.vregs.len() {
            let vreg = self.vregs[v].vreg;
            for r in 0..self.vregs[v].roots.len() {
                let root = self.vregs[v].roots[r];
                let children = self.intervals[root].children.clone();
                for child in children {
                    let start = self.intervals[child].start();
                    if self.is_block_start(start) {
                        continue;
                    }
                    let src = match self.interval_at(vreg, start.prev()) {
                        Some(src) => src,
                        None => continue,
                    };
                    if self.same_location(src, child) {
                        continue;
                    }
                    self.pending_moves.push(PendingMove {
                        pos: start,
                        prio: InsertMovePrio::Split,
                        from: src,
                        to: MoveDest::Interval(child),
                        vreg,
                        edge: None,
                    });
                    self.stats.split_moves += 1;
                }
            }
        }
    }

    /// Compare both sides of every control-flow edge, in trace order.
    fn collect_edge_moves(&mut self) {
        let entry = self.func.entry_block();
        for trace in self.traces.traces() {
            for &to in trace.blocks() {
                let preds = self.func.block_preds(to);
                let in_edge = preds.len() == 1 && to != entry;
                for &from in preds {
                    self.collect_edge(from, to, in_edge);
                }
            }
        }
        self.stats.edges = self.edges.len();
    }

    fn collect_edge(&mut self, from: Block, to: Block, in_edge: bool) {
        let exit = ProgPoint::before(self.func.block_insns(from).last());
        let entry = ProgPoint::before(self.func.block_insns(to).first());
        let (point, prio) = if in_edge {
            (entry, InsertMovePrio::InEdgeMoves)
        } else {
            (exit, InsertMovePrio::OutEdgeMoves)
        };
        let edge = self.edges.len() as u32;
        let mut moves = 0;

        let mut schedule = |this: &mut Self, src: VReg, dst: VReg| {
            let (from_iv, to_iv) = match (this.interval_at(src, exit), this.interval_at(dst, entry))
            {
                (Some(a), Some(b)) => (a, b),
                _ => return,
            };
            if src == dst && this.same_location(from_iv, to_iv) {
                return;
            }
            if src != dst
                && !this.intervals[from_iv].is_spilled()
                && this.intervals[from_iv].alloc == this.intervals[to_iv].alloc
            {
                return;
            }
            this.pending_moves.push(PendingMove {
                pos: point,
                prio,
                from: from_iv,
                to: MoveDest::Interval(to_iv),
                vreg: dst,
                edge: Some(edge),
            });
            moves += 1;
        };

        let liveins: SmallVec<[usize; 16]> = self.liveins[to.index()].iter().collect();
        for v in liveins {
            let vreg = self.vregs[v].vreg;
            schedule(self, vreg, vreg);
        }
        let last = self.func.block_insns(from).last();
        if let Some(succ_idx) = self.func.block_succs(from).iter().position(|&s| s == to) {
            let args = self.func.branch_blockparams(from, last, succ_idx);
            let params = self.func.block_params(to);
            for (&arg, &param) in args.iter().zip(params.iter()) {
                schedule(self, arg, param);
            }
        }

        let state = if moves > 0 {
            self.stats.edges_with_moves += 1;
            self.stats.edge_moves += moves;
            EdgeState::MoveScheduled
        } else {
            EdgeState::Resolved
        };
        trace!(
            "edge block{} -> block{}: {} moves at {:?}",
            from.index(),
            to.index(),
            moves,
            point
        );
        self.edges.push(EdgeResolution {
            from,
            to,
            from_trace: self.traces.trace_of(from),
            to_trace: self.traces.trace_of(to),
            state,
            point,
            moves: Vec::new(),
        });
    }

    fn collect_fixup_moves(&mut self) {
        for i in 0..self.multi_fixed_reg_fixups.len() {
            let fixup = self.multi_fixed_reg_fixups[i];
            if let Some(src) = self.interval_at(fixup.vreg, fixup.pos) {
                self.pending_moves.push(PendingMove {
                    pos: fixup.pos,
                    prio: InsertMovePrio::MultiFixedReg,
                    from: src,
                    to: MoveDest::Reg(fixup.preg),
                    vreg: fixup.vreg,
                    edge: None,
                });
            }
        }
    }

    /// A spilled interval that a move reads from or writes to outside
    /// of its own ranges still needs its slot at that point.
    fn extend_spill_ranges(&mut self) {
        for i in 0..self.pending_moves.len() {
            let m = self.pending_moves[i];
            let mut touched: SmallVec<[IntervalIndex; 2]> = SmallVec::new();
            touched.push(m.from);
            if let MoveDest::Interval(to) = m.to {
                touched.push(to);
            }
            for iv in touched {
                let interval = &self.intervals[iv];
                if interval.is_spilled() && !interval.covers(m.pos) {
                    let vreg = interval.vreg.vreg();
                    self.vregs[vreg]
                        .spill_ranges
                        .push(CodeRange::new(m.pos, m.pos.next()));
                }
            }
        }
    }

    /// Write the final location of every operand.
    pub fn apply_allocations(&mut self) {
        for iv in self.intervals.iter() {
            for u in iv.uses.iter() {
                let idx = self.inst_alloc_offsets[u.pos.inst().index()] as usize + u.slot as usize;
                self.allocs[idx] = iv.alloc;
            }
        }
        for fixup in self.multi_fixed_reg_fixups.iter() {
            self.allocs[fixup.alloc_index as usize] = Allocation::reg(fixup.preg);
        }
    }

    /// Turn the pending moves into edits: group them by program point
    /// and priority, then sequentialize each group.
    pub fn insert_moves(&mut self) -> Result<(), RegAllocError> {
        let mut inserted: Vec<InsertedMove> = Vec::with_capacity(self.pending_moves.len());
        for m in self.pending_moves.iter() {
            let from_alloc = self.intervals[m.from].alloc;
            let to_alloc = match m.to {
                MoveDest::Interval(iv) => self.intervals[iv].alloc,
                MoveDest::Reg(preg) => Allocation::reg(preg),
            };
            if let Some(edge) = m.edge {
                self.edges[edge as usize]
                    .moves
                    .push((from_alloc, to_alloc, m.vreg));
            }
            inserted.push(InsertedMove {
                pos: m.pos,
                prio: m.prio,
                from_alloc,
                to_alloc,
                to_vreg: m.vreg,
            });
        }
        inserted.sort_by_key(|m| (m.pos, m.prio));

        let mut i = 0;
        while i < inserted.len() {
            let (pos, prio) = (inserted[i].pos, inserted[i].prio);
            let mut j = i;
            while j < inserted.len() && inserted[j].pos == pos && inserted[j].prio == prio {
                j += 1;
            }
            for class in RegClass::ALL {
                let group: SmallVec<[InsertedMove; 16]> = inserted[i..j]
                    .iter()
                    .filter(|m| m.to_vreg.class() == class)
                    .copied()
                    .collect();
                if !group.is_empty() {
                    self.resolve_group(pos, class, &group)?;
                }
            }
            i = j;
        }

        for edge in self.edges.iter_mut() {
            if edge.state == EdgeState::MoveScheduled {
                edge.state = EdgeState::Resolved;
            }
        }
        self.stats.edits_count = self.edits.len();
        Ok(())
    }

    fn resolve_group(
        &mut self,
        pos: ProgPoint,
        class: RegClass,
        group: &[InsertedMove],
    ) -> Result<(), RegAllocError> {
        let mut parallel_moves = ParallelMoves::new();
        for m in group {
            parallel_moves.add(m.from_alloc, m.to_alloc, m.to_vreg);
        }
        let resolved = parallel_moves.resolve();
        if resolved.needs_scratch {
            self.stats.scratch_cycles += 1;
        }

        // Registers the group itself reads or writes are never free.
        let busy: SmallVec<[PReg; 8]> = group
            .iter()
            .flat_map(|m| [m.from_alloc.as_reg(), m.to_alloc.as_reg()])
            .flatten()
            .collect();
        let point = CodeRange::new(pos, pos.next());
        let free_regs: SmallVec<[PReg; 2]> = self
            .env
            .allocatable_regs(class)
            .filter(|&r| {
                !busy.contains(&r)
                    && !self.pregs[r.index()].allocations.overlaps(&point)
                    && !self.pregs[r.index()].reserved.overlaps(&point)
            })
            .take(2)
            .collect();

        let resolver = ScratchResolver::new(
            &free_regs,
            self.env.scratch_by_class[class.index()],
            self.env.allocatable_regs(class).next(),
            self.stack_to_stack_ok[class.index()],
            |n| self.extra_spillslot(class, n),
        );
        let moves = resolver
            .compute(resolved)
            .ok_or(RegAllocError::NoScratch(class))?;

        for (from, to, _) in moves {
            if from.is_stack() && to.is_stack() {
                self.stats.stack_to_stack_moves += 1;
            }
            trace!("edit at {:?}: {} -> {}", pos, from, to);
            self.edits.push((pos, Edit::Move { from, to, class }));
        }
        Ok(())
    }
}
