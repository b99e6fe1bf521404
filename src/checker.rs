/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies that the allocator's output moves every value to
//! where its uses expect it.
//!
//! We track symbolic values through the allocated program. The state
//! at a program point maps each `Allocation` to the set of vregs whose
//! current value it is known to hold. An instruction defining `v` into
//! `A` sets `A := {v}` and removes `v` from every other location; a
//! move `B := A` copies the set; a clobber forgets the register. Block
//! parameters are a parallel relabeling on each edge: every location
//! holding the argument also holds the parameter afterwards.
//!
//! The lattice is the powerset of vregs under set inclusion, with an
//! extra "unknown" top for unvisited blocks. States meet by
//! intersection at join points, and a location missing on one side is
//! dropped. The analysis iterates to a fixpoint; then each instruction
//! is checked against the state in front of it: every use's allocation
//! must hold the use's vreg and satisfy its constraint.
//!
//! Beyond dataflow, we check that no operand is left unallocated, that
//! allocations written by an instruction do not alias the inputs they
//! must stay apart from, and that every edge was resolved.

use crate::{
    Allocation, Block, EdgeState, Edit, Function, Inst, InstOrEdit, InstPosition, Operand,
    OperandConstraint, OperandKind, OperandPos, Output, PRegSet, VReg,
};
use crate::{FxHashMap, FxHashSet};
use alloc::collections::VecDeque;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;
use smallvec::{smallvec, SmallVec};

/// A set of errors detected by the checker.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
    pub errors: Vec<CheckerError>,
}

/// A single error detected by the checker.
#[derive(Clone, Debug)]
pub enum CheckerError {
    MissingAllocation {
        inst: Inst,
        op: Operand,
    },
    UnknownValueInAllocation {
        inst: Inst,
        op: Operand,
        alloc: Allocation,
    },
    IncorrectValuesInAllocation {
        inst: Inst,
        op: Operand,
        alloc: Allocation,
        actual: FxHashSet<VReg>,
    },
    AllocationIsNotReg {
        inst: Inst,
        op: Operand,
        alloc: Allocation,
    },
    AllocationIsNotFixedReg {
        inst: Inst,
        op: Operand,
        alloc: Allocation,
    },
    AllocationIsNotStack {
        inst: Inst,
        op: Operand,
        alloc: Allocation,
    },
    /// Two operands of one instruction that are live at the same time
    /// got the same location.
    OverlappingAllocations {
        inst: Inst,
        op: Operand,
        other: Operand,
        alloc: Allocation,
    },
    UnresolvedEdge {
        from: Block,
        to: Block,
    },
}

/// Abstract state for an allocation: a set of vreg names, with the
/// universe set as top.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CheckerValue {
    universe: bool,
    vregs: FxHashSet<VReg>,
}

impl Default for CheckerValue {
    fn default() -> CheckerValue {
        CheckerValue {
            universe: true,
            vregs: FxHashSet::default(),
        }
    }
}

impl CheckerValue {
    /// Intersect with `other`. Returns whether `self` changed.
    fn meet_with(&mut self, other: &CheckerValue) -> bool {
        if self.universe {
            *self = other.clone();
            !other.universe
        } else if other.universe {
            false
        } else {
            let before = self.vregs.len();
            self.vregs.retain(|v| other.vregs.contains(v));
            self.vregs.len() != before
        }
    }

    fn from_reg(reg: VReg) -> CheckerValue {
        CheckerValue {
            universe: false,
            vregs: core::iter::once(reg).collect(),
        }
    }
}

impl core::fmt::Display for CheckerValue {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if self.universe {
            write!(f, "top")
        } else {
            write!(f, "{{ ")?;
            for vreg in &self.vregs {
                write!(f, "{} ", vreg)?;
            }
            write!(f, "}}")
        }
    }
}

/// State that steps through program points as we scan over the
/// instruction stream.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CheckerState {
    top: bool,
    allocations: FxHashMap<Allocation, CheckerValue>,
}

impl Default for CheckerState {
    fn default() -> CheckerState {
        CheckerState {
            top: true,
            allocations: FxHashMap::default(),
        }
    }
}

impl CheckerState {
    /// Merge with the state of another predecessor.
    fn meet_with(&mut self, other: &CheckerState) {
        if self.top {
            *self = other.clone();
        } else if !other.top {
            let mut remove_keys: SmallVec<[Allocation; 4]> = smallvec![];
            for (k, v) in self.allocations.iter_mut() {
                match other.allocations.get(k) {
                    Some(o) => {
                        v.meet_with(o);
                    }
                    None => remove_keys.push(*k),
                }
            }
            for k in remove_keys {
                self.allocations.remove(&k);
            }
        }
    }

    fn get(&self, alloc: Allocation) -> CheckerValue {
        self.allocations.get(&alloc).cloned().unwrap_or_default()
    }

    fn check_val(
        &self,
        inst: Inst,
        op: Operand,
        alloc: Allocation,
    ) -> Result<(), CheckerError> {
        if alloc.is_none() {
            return Err(CheckerError::MissingAllocation { inst, op });
        }
        let val = self.get(alloc);
        if val.universe {
            return Err(CheckerError::UnknownValueInAllocation { inst, op, alloc });
        }
        if !val.vregs.contains(&op.vreg()) {
            return Err(CheckerError::IncorrectValuesInAllocation {
                inst,
                op,
                alloc,
                actual: val.vregs,
            });
        }
        Ok(())
    }

    /// Check the uses an instruction reads at `pos`. Early uses are
    /// checked before the instruction's effects, late uses after them.
    fn check(&self, pos: InstPosition, checkinst: &CheckerInst) -> Result<(), CheckerError> {
        if let CheckerInst::Op {
            inst,
            operands,
            allocs,
            ..
        } = checkinst
        {
            for (op, &alloc) in operands.iter().zip(allocs.iter()) {
                let is_here = matches!(
                    (op.pos(), pos),
                    (OperandPos::Early, InstPosition::Before) | (OperandPos::Late, InstPosition::After)
                );
                if !is_here || op.kind() != OperandKind::Use {
                    continue;
                }
                trace!(
                    "checker: inst{} op {} alloc {} value {}",
                    inst.index(),
                    op,
                    alloc,
                    self.get(alloc)
                );
                self.check_val(*inst, *op, alloc)?;
            }
        }
        Ok(())
    }

    /// Update according to instruction.
    fn update(&mut self, checkinst: &CheckerInst) {
        self.top = false;
        match checkinst {
            CheckerInst::Move { into, from } => {
                let val = self.get(*from);
                trace!("checker: move {} -> {} val {}", from, into, val);
                self.allocations.insert(*into, val);
            }
            CheckerInst::ParallelMove { into, from } => {
                // Every location holding a source also holds the
                // matching destination afterwards; destinations lose
                // their old labels first.
                let mut additions: FxHashMap<VReg, SmallVec<[VReg; 2]>> = FxHashMap::default();
                let mut deletions: FxHashSet<VReg> = FxHashSet::default();
                for (&dest, &src) in into.iter().zip(from.iter()) {
                    deletions.insert(dest);
                    additions.entry(src).or_default().push(dest);
                }
                for value in self.allocations.values_mut() {
                    if value.universe {
                        continue;
                    }
                    let mut insertions: SmallVec<[VReg; 2]> = smallvec![];
                    for vreg in value.vregs.iter() {
                        if let Some(additions) = additions.get(vreg) {
                            insertions.extend(additions.iter().copied());
                        }
                    }
                    value.vregs.retain(|v| !deletions.contains(v));
                    value.vregs.extend(insertions);
                }
            }
            CheckerInst::Op {
                operands,
                allocs,
                clobbers,
                ..
            } => {
                // Clobbers first: a fixed output in a clobbered
                // register survives the instruction.
                for clobber in *clobbers {
                    self.allocations.remove(&Allocation::reg(clobber));
                }
                for (op, &alloc) in operands.iter().zip(allocs.iter()) {
                    if op.kind() == OperandKind::Use {
                        continue;
                    }
                    for (other_alloc, other_value) in self.allocations.iter_mut() {
                        if *other_alloc != alloc {
                            other_value.vregs.remove(&op.vreg());
                        }
                    }
                    self.allocations.insert(alloc, CheckerValue::from_reg(op.vreg()));
                }
            }
        }
    }
}

fn check_constraint(inst: Inst, op: Operand, alloc: Allocation) -> Result<(), CheckerError> {
    match op.constraint() {
        OperandConstraint::Any => {
            if alloc.is_none() {
                return Err(CheckerError::MissingAllocation { inst, op });
            }
        }
        OperandConstraint::Reg => {
            if !alloc.is_reg() {
                return Err(CheckerError::AllocationIsNotReg { inst, op, alloc });
            }
        }
        OperandConstraint::Stack => {
            if !alloc.is_stack() {
                return Err(CheckerError::AllocationIsNotStack { inst, op, alloc });
            }
        }
        OperandConstraint::FixedReg(preg) => {
            if alloc != Allocation::reg(preg) {
                return Err(CheckerError::AllocationIsNotFixedReg { inst, op, alloc });
            }
        }
    }
    Ok(())
}

/// Operands whose locations must differ: defs and temps among
/// themselves, early defs and temps against every use, and late defs
/// against late uses.
fn must_not_alias(a: Operand, b: Operand) -> bool {
    use OperandKind::*;
    let writes = |op: Operand| op.kind() != Use;
    let early_write = |op: Operand| op.kind() == Temp || (op.kind() == Def && op.pos() == OperandPos::Early);
    match (a.kind(), b.kind()) {
        (Use, Use) => false,
        _ if writes(a) && writes(b) => true,
        _ => {
            let (w, u) = if writes(a) { (a, b) } else { (b, a) };
            early_write(w) || u.pos() == OperandPos::Late
        }
    }
}

/// An instruction representation in the checker's block summary.
#[derive(Clone, Debug)]
enum CheckerInst {
    /// A move inserted by the allocator.
    Move { into: Allocation, from: Allocation },

    /// Block-parameter passing on an edge: all reads happen before
    /// all writes.
    ParallelMove { into: Vec<VReg>, from: Vec<VReg> },

    /// An instruction of the input function, with its allocations.
    Op {
        inst: Inst,
        operands: Vec<Operand>,
        allocs: Vec<Allocation>,
        clobbers: PRegSet,
    },
}

#[derive(Debug)]
pub struct Checker<'a, F: Function> {
    f: &'a F,
    bb_in: FxHashMap<Block, CheckerState>,
    bb_insts: FxHashMap<Block, Vec<CheckerInst>>,
    edge_insts: FxHashMap<(Block, Block), Vec<CheckerInst>>,
    static_errors: Vec<CheckerError>,
}

impl<'a, F: Function> Checker<'a, F> {
    /// Create a new checker for the given function. Call `prepare()`
    /// with the allocator's output before `run()`.
    pub fn new(f: &'a F) -> Checker<'a, F> {
        let mut bb_in = FxHashMap::default();
        let mut bb_insts = FxHashMap::default();
        let mut edge_insts = FxHashMap::default();

        for block in 0..f.num_blocks() {
            let block = Block::new(block);
            bb_in.insert(block, CheckerState::default());
            bb_insts.insert(block, vec![]);
            for &succ in f.block_succs(block) {
                edge_insts.insert((block, succ), vec![]);
            }
        }

        Checker {
            f,
            bb_in,
            bb_insts,
            edge_insts,
            static_errors: vec![],
        }
    }

    /// Build the list of checker instructions from the function and
    /// the allocation results.
    pub fn prepare(&mut self, out: &Output) {
        for edge in out.edges.iter() {
            if edge.state != EdgeState::Resolved {
                self.static_errors.push(CheckerError::UnresolvedEdge {
                    from: edge.from,
                    to: edge.to,
                });
            }
        }
        for block in 0..self.f.num_blocks() {
            let block = Block::new(block);
            let mut insts = vec![];
            for inst_or_edit in out.block_insts_and_edits(self.f, block) {
                match inst_or_edit {
                    InstOrEdit::Inst(inst) => insts.push(self.handle_inst(block, inst, out)),
                    InstOrEdit::Edit(&Edit::Move { from, to, .. }) => {
                        insts.push(CheckerInst::Move { into: to, from })
                    }
                }
            }
            self.bb_insts.insert(block, insts);
        }
    }

    /// Create an `Op` for an instruction; for a branch, also record
    /// the block-parameter moves on each outgoing edge.
    fn handle_inst(&mut self, block: Block, inst: Inst, out: &Output) -> CheckerInst {
        let operands = self.f.inst_operands(inst).to_vec();
        let allocs = out.inst_allocs(inst).to_vec();

        for (i, (&op, &alloc)) in operands.iter().zip(allocs.iter()).enumerate() {
            if let Err(e) = check_constraint(inst, op, alloc) {
                self.static_errors.push(e);
            }
            for (&other, &other_alloc) in operands[i + 1..].iter().zip(allocs[i + 1..].iter()) {
                if alloc.is_some() && alloc == other_alloc && must_not_alias(op, other) {
                    self.static_errors.push(CheckerError::OverlappingAllocations {
                        inst,
                        op,
                        other,
                        alloc,
                    });
                }
            }
        }

        if self.f.is_branch(inst) {
            for (i, &succ) in self.f.block_succs(block).iter().enumerate() {
                let args = self.f.branch_blockparams(block, inst, i);
                let params = self.f.block_params(succ);
                if !args.is_empty() {
                    if let Some(edge) = self.edge_insts.get_mut(&(block, succ)) {
                        edge.push(CheckerInst::ParallelMove {
                            into: params.to_vec(),
                            from: args.to_vec(),
                        });
                    }
                }
            }
        }

        CheckerInst::Op {
            inst,
            operands,
            allocs,
            clobbers: self.f.inst_clobbers(inst),
        }
    }

    /// Compute the checker state at each block entry.
    fn analyze(&mut self) {
        let entry = self.f.entry_block();
        let mut queue = VecDeque::new();
        let mut queued = vec![false; self.f.num_blocks()];
        // The entry starts out knowing nothing rather than everything.
        if let Some(state) = self.bb_in.get_mut(&entry) {
            state.top = false;
        }
        queue.push_back(entry);
        queued[entry.index()] = true;

        while let Some(block) = queue.pop_front() {
            queued[block.index()] = false;
            let mut state = self.bb_in[&block].clone();
            for inst in self.bb_insts[&block].iter() {
                state.update(inst);
            }

            for &succ in self.f.block_succs(block) {
                let mut new_state = state.clone();
                for edge_inst in self.edge_insts[&(block, succ)].iter() {
                    new_state.update(edge_inst);
                }
                let cur_succ_in = &self.bb_in[&succ];
                new_state.meet_with(cur_succ_in);
                if &new_state != cur_succ_in {
                    trace!("analyze: block{} state changed", succ.index());
                    self.bb_in.insert(succ, new_state);
                    if !queued[succ.index()] {
                        queue.push_back(succ);
                        queued[succ.index()] = true;
                    }
                }
            }
        }
    }

    /// Step through each block from its entry state and check every
    /// instruction.
    fn find_errors(&self) -> Vec<CheckerError> {
        let mut errors = vec![];
        for block in 0..self.f.num_blocks() {
            let block = Block::new(block);
            let mut state = self.bb_in[&block].clone();
            for inst in self.bb_insts[&block].iter() {
                if let Err(e) = state.check(InstPosition::Before, inst) {
                    trace!("checker error: {:?}", e);
                    errors.push(e);
                }
                state.update(inst);
                if let Err(e) = state.check(InstPosition::After, inst) {
                    trace!("checker error: {:?}", e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Find any errors, returning `Err(CheckerErrors)` with all errors
    /// found or `Ok(())` otherwise.
    pub fn run(mut self) -> Result<(), CheckerErrors> {
        self.analyze();
        let mut errors = core::mem::take(&mut self.static_errors);
        errors.extend(self.find_errors());

        if trace_enabled!() {
            self.dump();
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CheckerErrors { errors })
        }
    }

    fn dump(&self) {
        fn print_state(state: &CheckerState) {
            let mut s = vec![];
            for (alloc, value) in &state.allocations {
                s.push(format!("{} := {}", alloc, value));
            }
            trace!("    {{ {} }}", s.join(", "))
        }
        trace!("=== CHECKER RESULT ===");
        for bb in 0..self.f.num_blocks() {
            let bb = Block::new(bb);
            trace!("block{}:", bb.index());
            let mut state = self.bb_in[&bb].clone();
            print_state(&state);
            for inst in self.bb_insts[&bb].iter() {
                match inst {
                    CheckerInst::Op {
                        inst,
                        operands,
                        allocs,
                        ..
                    } => trace!("  inst{}: {:?} ({:?})", inst.index(), operands, allocs),
                    CheckerInst::Move { from, into } => trace!("    {} -> {}", from, into),
                    CheckerInst::ParallelMove { from, into } => {
                        trace!("    parallel_move {:?} -> {:?}", from, into)
                    }
                }
                state.update(inst);
                print_state(&state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fuzzing::func::FuncBuilder;
    use crate::{EdgeResolution, PReg, ProgPoint, RegClass, SpillSlot, TraceId};

    fn v(n: usize) -> VReg {
        VReg::new(n, RegClass::Int)
    }

    fn r(n: usize) -> Allocation {
        Allocation::reg(PReg::new(n, RegClass::Int))
    }

    /// One block: v0 = def; v1 = def; ret v0.
    fn straight_line() -> crate::fuzzing::func::Func {
        let mut b = FuncBuilder::new();
        let b0 = b.add_block();
        b.push_inst(b0, &[Operand::reg_def(v(0))]);
        b.push_inst(b0, &[Operand::reg_def(v(1))]);
        b.push_ret(b0, &[Operand::reg_use(v(0))]);
        b.finish()
    }

    fn output(allocs: Vec<Allocation>, edits: Vec<(ProgPoint, Edit)>) -> Output {
        Output {
            inst_alloc_offsets: vec![0, 1, 2],
            allocs,
            edits,
            ..Output::default()
        }
    }

    fn check(f: &crate::fuzzing::func::Func, out: &Output) -> Result<(), CheckerErrors> {
        let mut checker = Checker::new(f);
        checker.prepare(out);
        checker.run()
    }

    #[test]
    fn accepts_correct_allocation() {
        let f = straight_line();
        assert!(check(&f, &output(vec![r(0), r(1), r(0)], vec![])).is_ok());
    }

    #[test]
    fn detects_overwritten_value() {
        let f = straight_line();
        let err = check(&f, &output(vec![r(0), r(0), r(0)], vec![])).unwrap_err();
        assert!(matches!(
            err.errors[0],
            CheckerError::IncorrectValuesInAllocation { .. }
        ));
    }

    #[test]
    fn follows_moves() {
        let f = straight_line();
        let slot = Allocation::stack(SpillSlot::new(0));
        let edits = vec![
            (
                ProgPoint::before(Inst::new(1)),
                Edit::Move {
                    from: r(0),
                    to: slot,
                    class: RegClass::Int,
                },
            ),
            (
                ProgPoint::before(Inst::new(2)),
                Edit::Move {
                    from: slot,
                    to: r(2),
                    class: RegClass::Int,
                },
            ),
        ];
        assert!(check(&f, &output(vec![r(0), r(0), r(2)], edits)).is_ok());
    }

    #[test]
    fn detects_constraint_violation() {
        let f = straight_line();
        let slot = Allocation::stack(SpillSlot::new(0));
        let err = check(&f, &output(vec![slot, r(1), slot], vec![])).unwrap_err();
        assert!(err
            .errors
            .iter()
            .any(|e| matches!(e, CheckerError::AllocationIsNotReg { .. })));
    }

    #[test]
    fn detects_unresolved_edge() {
        let f = straight_line();
        let mut out = output(vec![r(0), r(1), r(0)], vec![]);
        out.edges.push(EdgeResolution {
            from: Block::new(0),
            to: Block::new(0),
            from_trace: TraceId::new(0),
            to_trace: TraceId::new(0),
            state: EdgeState::MoveScheduled,
            point: ProgPoint::before(Inst::new(2)),
            moves: vec![],
        });
        let err = check(&f, &out).unwrap_err();
        assert!(matches!(err.errors[0], CheckerError::UnresolvedEdge { .. }));
    }
}
