/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Value bookkeeping and global liveness.

use super::{Env, SpillSlotIndex, VRegData};
use crate::cfg::CFGInfo;
use crate::indexset::IndexSet;
use crate::{
    Block, Function, Inst, OperandKind, OperandPos, ProgPoint, RegAllocError, RegClass, VReg,
    VecExt,
};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use smallvec::SmallVec;

impl<'a, F: Function> Env<'a, F> {
    /// Creates a record per value and checks that each value is
    /// defined at most once.
    pub fn create_vregs(&mut self) -> Result<(), RegAllocError> {
        let n = self.func.num_vregs();
        for i in 0..n {
            self.vregs.push(VRegData {
                vreg: VReg::new(i, RegClass::Int),
                roots: SmallVec::new(),
                spill_ranges: SmallVec::new(),
                slot: SpillSlotIndex::invalid(),
            });
        }

        let mut defined = Vec::new();
        defined.repopulate(n, false);
        let mut define = |vreg: VReg, inst: Inst| -> Result<(), RegAllocError> {
            match defined.get_mut(vreg.vreg()) {
                Some(seen) if !*seen => {
                    *seen = true;
                    Ok(())
                }
                _ => Err(RegAllocError::SSA(vreg, inst)),
            }
        };

        for block in 0..self.func.num_blocks() {
            let block = Block::new(block);
            for &param in self.func.block_params(block) {
                define(param, Inst::invalid())?;
                self.vregs[param.vreg()].vreg = param;
            }
            for inst in self.func.block_insns(block).iter() {
                for op in self.func.inst_operands(inst) {
                    let vreg = op.vreg();
                    if vreg.vreg() >= n {
                        return Err(RegAllocError::SSA(vreg, inst));
                    }
                    if op.kind() != OperandKind::Use {
                        define(vreg, inst)?;
                    }
                    self.vregs[vreg.vreg()].vreg = vreg;
                }
            }
            let last = self.func.block_insns(block).last();
            for i in 0..self.func.block_succs(block).len() {
                for &arg in self.func.branch_blockparams(block, last, i) {
                    if arg.vreg() >= n {
                        return Err(RegAllocError::SSA(arg, last));
                    }
                }
            }
        }
        Ok(())
    }

    /// Backward dataflow over all blocks until the live-in sets reach
    /// a fixpoint. Branch arguments are live-out of their block and
    /// block parameters are not live-in.
    pub fn compute_liveness(&mut self) -> Result<(), RegAllocError> {
        let nb = self.func.num_blocks();
        self.liveins.clear();
        self.liveouts.clear();
        for _ in 0..nb {
            self.liveins.push(IndexSet::new());
            self.liveouts.push(IndexSet::new());
        }

        let mut workqueue: VecDeque<Block> = VecDeque::new();
        let mut queued = Vec::new();
        queued.repopulate(nb, true);
        workqueue.extend(self.cfginfo.postorder.iter().copied());

        while let Some(block) = workqueue.pop_front() {
            queued[block.index()] = false;
            self.stats.livein_iterations += 1;
            let insns = self.func.block_insns(block);

            let mut live = self.liveouts[block.index()].clone();
            for i in 0..self.func.block_succs(block).len() {
                for &arg in self.func.branch_blockparams(block, insns.last(), i) {
                    live.set(arg.vreg(), true);
                }
            }

            for inst in insns.iter().rev() {
                let operands = self.func.inst_operands(inst);
                for op in operands.iter().filter(|op| op.kind() != OperandKind::Use) {
                    live.set(op.vreg().vreg(), false);
                }
                for pos in [OperandPos::Late, OperandPos::Early] {
                    for op in operands {
                        if op.kind() == OperandKind::Use && op.pos() == pos {
                            live.set(op.vreg().vreg(), true);
                        }
                    }
                }
            }
            for &param in self.func.block_params(block) {
                live.set(param.vreg(), false);
            }

            for &pred in self.func.block_preds(block) {
                if self.liveouts[pred.index()].union_with(&live) && !queued[pred.index()] {
                    queued[pred.index()] = true;
                    workqueue.push_back(pred);
                }
            }

            trace!("liveins at block{}: {:?}", block.index(), live);
            self.liveins[block.index()] = live;
        }

        if let Some(v) = self.liveins[self.func.entry_block().index()].iter().next() {
            trace!("v{} is live into the entry block", v);
            return Err(RegAllocError::EntryLivein);
        }
        Ok(())
    }
}

/// Checks that every used value has a definition, and that a use in
/// the defining block comes after the definition.
///
/// Dominance across blocks is not checked; a value that is used on a
/// path without a definition shows up as live into the entry block.
pub fn validate_ssa<F: Function>(f: &F, cfginfo: &CFGInfo) -> Result<(), RegAllocError> {
    let n = f.num_vregs();
    let mut def_inst: Vec<Inst> = Vec::new();
    def_inst.repopulate(n, Inst::invalid());
    let mut def_block: Vec<Block> = Vec::new();
    def_block.repopulate(n, Block::invalid());

    for block in 0..f.num_blocks() {
        let block = Block::new(block);
        for &param in f.block_params(block) {
            let slot = def_block
                .get_mut(param.vreg())
                .ok_or(RegAllocError::SSA(param, Inst::invalid()))?;
            if slot.is_valid() {
                return Err(RegAllocError::SSA(param, Inst::invalid()));
            }
            *slot = block;
        }
        for inst in f.block_insns(block).iter() {
            for op in f.inst_operands(inst) {
                if op.kind() == OperandKind::Use {
                    continue;
                }
                let v = op.vreg().vreg();
                if v >= n || def_block[v].is_valid() {
                    return Err(RegAllocError::SSA(op.vreg(), inst));
                }
                def_block[v] = cfginfo.block_of(ProgPoint::before(inst));
                def_inst[v] = inst;
            }
        }
    }

    for block in 0..f.num_blocks() {
        let block = Block::new(block);
        let insns = f.block_insns(block);
        for inst in insns.iter() {
            for op in f.inst_operands(inst) {
                if op.kind() != OperandKind::Use {
                    continue;
                }
                let v = op.vreg().vreg();
                if v >= n || def_block[v].is_invalid() {
                    return Err(RegAllocError::SSA(op.vreg(), inst));
                }
                if def_block[v] == block && def_inst[v].is_valid() && def_inst[v] >= inst {
                    return Err(RegAllocError::SSA(op.vreg(), inst));
                }
            }
        }
        for i in 0..f.block_succs(block).len() {
            for &arg in f.branch_blockparams(block, insns.last(), i) {
                if arg.vreg() >= n || def_block[arg.vreg()].is_invalid() {
                    return Err(RegAllocError::SSA(arg, insns.last()));
                }
            }
        }
    }

    Ok(())
}
