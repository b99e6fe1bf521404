/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Building the intervals and register reservations of one trace.

use super::{
    CodeRange, Env, Interval, IntervalIndex, MultiFixedRegFixup, Reservation, UsePos,
};
use crate::{
    Block, Function, Inst, Operand, OperandConstraint, OperandKind, OperandPos, PReg,
    PRegSet, ProgPoint, RegAllocError, TraceId, VReg,
};
use crate::FxHashMap;
use smallvec::{smallvec, SmallVec};

/// Reservations collected for the instruction being walked.
type InstReservations = SmallVec<[(PReg, Reservation); 8]>;

impl<'a, F: Function> Env<'a, F> {
    /// Walk the blocks of `trace` backwards and create one root
    /// interval per value live in or mentioned by the trace, together
    /// with the register reservations of fixed operands and clobbers.
    /// Returns the roots.
    pub fn build_intervals(
        &mut self,
        trace: TraceId,
    ) -> Result<SmallVec<[IntervalIndex; 16]>, RegAllocError> {
        for preg in self.pregs.iter_mut() {
            preg.reservations.clear();
        }
        let mut roots: FxHashMap<usize, IntervalIndex> = FxHashMap::default();
        let mut root_order: SmallVec<[IntervalIndex; 16]> = smallvec![];
        let blocks = self.traces.trace(trace).blocks();

        for &block in blocks.iter().rev() {
            let insns = self.func.block_insns(block);
            let block_from = ProgPoint::before(insns.first());
            let block_to = ProgPoint::before(insns.last().next());

            let mut live = self.liveouts[block.index()].clone();
            for i in 0..self.func.block_succs(block).len() {
                for &arg in self.func.branch_blockparams(block, insns.last(), i) {
                    live.set(arg.vreg(), true);
                }
            }
            for v in live.iter() {
                let iv = self.root_for(v, trace, &mut roots, &mut root_order);
                self.intervals[iv].prepend_range(CodeRange::new(block_from, block_to));
            }

            for inst in insns.iter().rev() {
                self.build_inst(inst, block_from, trace, &mut live, &mut roots, &mut root_order)?;
            }

            for &param in self.func.block_params(block) {
                live.set(param.vreg(), false);
            }

            if block == self.traces.trace(trace).head() {
                for v in live.iter() {
                    if let Some(&iv) = roots.get(&v) {
                        let vreg = self.vregs[v].vreg;
                        if let Some(hint) = self.hint_from_preds(block, |_, _| vreg) {
                            self.intervals[iv].hint = hint;
                        }
                    }
                }
                for (k, &param) in self.func.block_params(block).iter().enumerate() {
                    if let Some(&iv) = roots.get(&param.vreg()) {
                        let func = self.func;
                        let hint = self.hint_from_preds(block, |pred, succ_idx| {
                            let last = func.block_insns(pred).last();
                            func.branch_blockparams(pred, last, succ_idx)[k]
                        });
                        if let Some(hint) = hint {
                            self.intervals[iv].hint = hint;
                        }
                    }
                }
            }
        }

        for &iv in &root_order {
            let interval = &mut self.intervals[iv];
            interval.uses.reverse();
            interval.uses.sort_by_key(|u| u.pos);
            interval.trivial = is_dead_def(interval);
            let vreg = interval.vreg;
            self.vregs[vreg.vreg()].roots.push(iv);
        }
        for preg in self.pregs.iter_mut() {
            preg.reservations.sort_by_key(|r| r.range.from);
        }
        self.stats.initial_interval_count += root_order.len();
        Ok(root_order)
    }

    fn root_for(
        &mut self,
        v: usize,
        trace: TraceId,
        roots: &mut FxHashMap<usize, IntervalIndex>,
        root_order: &mut SmallVec<[IntervalIndex; 16]>,
    ) -> IntervalIndex {
        if let Some(&iv) = roots.get(&v) {
            return iv;
        }
        let iv = self
            .intervals
            .push(Interval::new(self.vregs[v].vreg, trace));
        roots.insert(v, iv);
        root_order.push(iv);
        iv
    }

    fn build_inst(
        &mut self,
        inst: Inst,
        block_from: ProgPoint,
        trace: TraceId,
        live: &mut crate::indexset::IndexSet,
        roots: &mut FxHashMap<usize, IntervalIndex>,
        root_order: &mut SmallVec<[IntervalIndex; 16]>,
    ) -> Result<(), RegAllocError> {
        let operands = self.func.inst_operands(inst);
        self.check_operand_constraints(inst, operands)?;

        let before = ProgPoint::before(inst);
        let after = ProgPoint::after(inst);
        let next = ProgPoint::before(inst.next());
        let mut reserved: InstReservations = smallvec![];

        // Registers written by the instruction itself.
        let mut fixed_outputs = PRegSet::empty();
        for op in operands {
            if op.kind() != OperandKind::Use {
                if let Some(preg) = op.as_fixed_reg() {
                    fixed_outputs.add(preg);
                }
            }
        }
        let clobbers = self.func.inst_clobbers(inst);
        for preg in clobbers {
            if !fixed_outputs.contains(preg) {
                reserve(&mut reserved, preg, CodeRange::new(after, next), None, inst)?;
            }
        }
        let mut written_late = clobbers;
        written_late.union_from(fixed_outputs);

        for (slot, &op) in operands.iter().enumerate() {
            if op.kind() == OperandKind::Use {
                continue;
            }
            let v = op.vreg().vreg();
            let iv = self.root_for(v, trace, roots, root_order);
            let pos = op.point(inst);
            let interval = &mut self.intervals[iv];
            match op.kind() {
                OperandKind::Def if live.get(v) => {
                    interval.ranges[0].from = pos;
                }
                OperandKind::Def => {
                    interval.prepend_range(CodeRange::new(pos, next));
                }
                _ => {
                    interval.prepend_range(CodeRange::new(before, next));
                }
            }
            interval.uses.push(UsePos {
                pos,
                operand: op,
                slot: slot as u16,
            });
            live.set(v, false);
            if let Some(preg) = op.as_fixed_reg() {
                let range = match (op.kind(), op.pos()) {
                    (OperandKind::Def, OperandPos::Late) => CodeRange::new(after, next),
                    _ => CodeRange::new(before, next),
                };
                reserve(&mut reserved, preg, range, Some(op.vreg()), inst)?;
            }
        }

        // Whether each used value is still needed once the
        // instruction has written its late outputs.
        let live_after: SmallVec<[bool; 8]> = operands
            .iter()
            .map(|op| {
                live.get(op.vreg().vreg())
                    || operands.iter().any(|o| {
                        o.vreg() == op.vreg()
                            && o.kind() == OperandKind::Use
                            && o.pos() == OperandPos::Late
                    })
            })
            .collect();
        let mut fixed_uses: SmallVec<[(VReg, PReg); 4]> = smallvec![];

        for pos in [OperandPos::Late, OperandPos::Early] {
            for (slot, &op) in operands.iter().enumerate() {
                if op.kind() != OperandKind::Use || op.pos() != pos {
                    continue;
                }
                let v = op.vreg().vreg();
                let iv = self.root_for(v, trace, roots, root_order);
                let point = op.point(inst);
                if !live.get(v) {
                    self.intervals[iv].prepend_range(CodeRange::new(block_from, point.next()));
                    live.set(v, true);
                }

                let preg = match op.as_fixed_reg() {
                    Some(preg) => preg,
                    None => {
                        self.intervals[iv].uses.push(UsePos {
                            pos: point,
                            operand: op,
                            slot: slot as u16,
                        });
                        continue;
                    }
                };

                let second_fixed = fixed_uses
                    .iter()
                    .any(|&(fv, fp)| fv == op.vreg() && fp != preg);
                let overwritten = pos == OperandPos::Early
                    && live_after[slot]
                    && written_late.contains(preg);
                if second_fixed || overwritten {
                    // The value stays where the first constraint puts
                    // it; the operand reads a copy made just before
                    // the instruction.
                    trace!(
                        "inst{}: fixup copy of {} into {}",
                        inst.index(),
                        op.vreg(),
                        preg
                    );
                    self.intervals[iv].uses.push(UsePos {
                        pos: point,
                        operand: Operand::new(
                            op.vreg(),
                            OperandConstraint::Any,
                            OperandKind::Use,
                            pos,
                        ),
                        slot: slot as u16,
                    });
                    let alloc_index = self.inst_alloc_offsets[inst.index()] + slot as u32;
                    self.multi_fixed_reg_fixups.push(MultiFixedRegFixup {
                        pos: before,
                        vreg: op.vreg(),
                        preg,
                        alloc_index,
                    });
                    self.stats.multi_fixed_fixups += 1;
                    let range = match pos {
                        OperandPos::Early => CodeRange::new(before, after),
                        OperandPos::Late => CodeRange::new(before, next),
                    };
                    reserve(&mut reserved, preg, range, None, inst)?;
                    continue;
                }

                fixed_uses.push((op.vreg(), preg));
                self.intervals[iv].uses.push(UsePos {
                    pos: point,
                    operand: op,
                    slot: slot as u16,
                });
                let range = match pos {
                    OperandPos::Early => CodeRange::new(before, after),
                    OperandPos::Late => CodeRange::new(before, next),
                };
                reserve(&mut reserved, preg, range, Some(op.vreg()), inst)?;
            }
        }

        for (preg, reservation) in reserved {
            self.stats.reservations += 1;
            self.pregs[preg.index()].reservations.push(reservation);
        }
        Ok(())
    }

    /// A value may be constrained to the stack or to registers at one
    /// instruction, but not both, and may not be both read and
    /// written by it.
    fn check_operand_constraints(&self, inst: Inst, operands: &[Operand]) -> Result<(), RegAllocError> {
        for (i, op) in operands.iter().enumerate() {
            if op.constraint() == OperandConstraint::Reg
                && !self.env.has_allocatable_regs(op.class())
            {
                return Err(RegAllocError::NoRegistersForClass(op.class()));
            }
            for other in &operands[i + 1..] {
                if other.vreg() != op.vreg() {
                    continue;
                }
                if (op.kind() == OperandKind::Use) != (other.kind() == OperandKind::Use) {
                    return Err(RegAllocError::SSA(op.vreg(), inst));
                }
                let stack = |o: &Operand| o.constraint() == OperandConstraint::Stack;
                let reg = |o: &Operand| {
                    matches!(
                        o.constraint(),
                        OperandConstraint::Reg | OperandConstraint::FixedReg(_)
                    )
                };
                if (stack(op) && reg(other)) || (reg(op) && stack(other)) {
                    return Err(RegAllocError::ConflictingConstraints(op.vreg(), inst));
                }
            }
        }
        Ok(())
    }

    /// The first register that a predecessor in an earlier trace holds
    /// the incoming value in. `value` names the value on the edge from
    /// `pred`, given the successor index of `block` in `pred`.
    fn hint_from_preds(
        &self,
        block: Block,
        value: impl Fn(Block, usize) -> VReg,
    ) -> Option<PReg> {
        let trace = self.traces.trace_of(block);
        for &pred in self.func.block_preds(block) {
            if self.traces.trace_of(pred) >= trace {
                continue;
            }
            let succ_idx = self
                .func
                .block_succs(pred)
                .iter()
                .position(|&s| s == block)?;
            let vreg = value(pred, succ_idx);
            let exit = ProgPoint::before(self.func.block_insns(pred).last());
            if let Some(preg) = self
                .interval_at(vreg, exit)
                .and_then(|iv| self.intervals[iv].alloc.as_reg())
            {
                return Some(preg);
            }
        }
        None
    }

    /// The interval (root or split child) of `vreg` that covers
    /// `point`, in the trace containing `point`.
    pub fn interval_at(&self, vreg: VReg, point: ProgPoint) -> Option<IntervalIndex> {
        let trace = self.traces.trace_of(self.cfginfo.block_of(point));
        let data = &self.vregs[vreg.vreg()];
        let root = data
            .roots
            .iter()
            .copied()
            .find(|&iv| self.intervals[iv].trace == trace)?;
        core::iter::once(root)
            .chain(self.intervals[root].children.iter().copied())
            .find(|&iv| self.intervals[iv].covers(point))
    }
}

/// An interval that holds only a dead definition: a def or temp that
/// is never read.
fn is_dead_def(iv: &Interval) -> bool {
    match (iv.uses.as_slice(), iv.ranges.as_slice()) {
        ([u], [r]) => {
            u.operand.kind() != OperandKind::Use
                && r.to <= ProgPoint::before(u.pos.inst().next())
        }
        _ => false,
    }
}

/// Add a reservation for the instruction being built. Reservations of
/// one owner merge; any other overlap is a conflict.
fn reserve(
    reserved: &mut InstReservations,
    preg: PReg,
    range: CodeRange,
    owner: Option<VReg>,
    inst: Inst,
) -> Result<(), RegAllocError> {
    for (p, r) in reserved.iter_mut() {
        if *p != preg || !r.range.overlaps(&range) {
            continue;
        }
        if owner.is_some() && r.owner == owner {
            r.range.from = core::cmp::min(r.range.from, range.from);
            r.range.to = core::cmp::max(r.range.to, range.to);
            return Ok(());
        }
        return Err(RegAllocError::FixedRegConflict(preg, inst));
    }
    reserved.push((preg, Reservation { range, owner }));
    Ok(())
}
