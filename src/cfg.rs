/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Lightweight CFG analyses and structural checks.

use alloc::vec::Vec;

use crate::{Block, Function, Inst, ProgPoint, RegAllocError, VecExt};
use smallvec::{smallvec, SmallVec};

#[derive(Debug, Default)]
pub struct CFGInfo {
    /// Postorder traversal of blocks.
    pub postorder: Vec<Block>,
    /// For each instruction, the block it belongs to.
    pub insn_block: Vec<Block>,
    /// For each block, the point before its first instruction.
    pub block_entry: Vec<ProgPoint>,
    /// For each block, the point after its last instruction.
    pub block_exit: Vec<ProgPoint>,
    /// For each block, what is the approximate loop depth?
    ///
    /// Precise when the CFG is reducible and blocks are numbered in
    /// RPO, so that backedges are exactly the edges to a lower or
    /// equal block index; a heuristic otherwise.
    pub approx_loop_depth: Vec<u32>,
}

impl CFGInfo {
    pub fn new<F: Function>(f: &F) -> Result<Self, RegAllocError> {
        let mut this = Self::default();
        this.init(f)?;
        Ok(this)
    }

    fn init<F: Function>(&mut self, f: &F) -> Result<(), RegAllocError> {
        let nb = f.num_blocks();
        compute_postorder(f, &mut self.postorder)?;
        if self.postorder.len() != nb {
            let mut reached = Vec::new();
            reached.repopulate(nb, false);
            for &b in &self.postorder {
                reached[b.index()] = true;
            }
            let unreached = reached.iter().position(|&r| !r).unwrap_or(0);
            return Err(RegAllocError::BB(Block::new(unreached)));
        }

        let insn_block = self.insn_block.repopulate(f.num_insts(), Block::invalid());
        let block_entry = self
            .block_entry
            .repopulate(nb, ProgPoint::before(Inst::invalid()));
        let block_exit = self
            .block_exit
            .repopulate(nb, ProgPoint::before(Inst::invalid()));
        let mut backedges_in: Vec<u32> = Vec::new();
        let mut backedges_out: Vec<u32> = Vec::new();
        backedges_in.repopulate(nb, 0);
        backedges_out.repopulate(nb, 0);

        for block in 0..nb {
            let block = Block::new(block);
            let insns = f.block_insns(block);
            if insns.is_empty() {
                return Err(RegAllocError::BB(block));
            }
            for inst in insns.iter() {
                if inst.index() >= insn_block.len() || insn_block[inst.index()].is_valid() {
                    return Err(RegAllocError::BB(block));
                }
                insn_block[inst.index()] = block;
                let terminator = f.is_branch(inst) || f.is_ret(inst);
                if terminator != (inst == insns.last()) {
                    return Err(RegAllocError::BB(block));
                }
            }
            block_entry[block.index()] = ProgPoint::before(insns.first());
            block_exit[block.index()] = ProgPoint::after(insns.last());

            let last = insns.last();
            for (i, &succ) in f.block_succs(block).iter().enumerate() {
                if f.branch_blockparams(block, last, i).len() != f.block_params(succ).len() {
                    return Err(RegAllocError::Branch(last));
                }
            }

            // With more than one predecessor, every predecessor must
            // have this block as its only successor.
            let preds = f.block_preds(block).len() + usize::from(block == f.entry_block());
            if preds > 1 {
                for &pred in f.block_preds(block) {
                    if f.block_succs(pred).len() > 1 {
                        return Err(RegAllocError::CritEdge(pred, block));
                    }
                }
            }

            // Edge moves into a merge block are placed before the
            // branch, so such a branch may not read any operand.
            let feeds_merge = f.block_succs(block).iter().any(|&succ| {
                f.block_preds(succ).len() + usize::from(succ == f.entry_block()) > 1
            });
            if feeds_merge && !f.inst_operands(last).is_empty() {
                return Err(RegAllocError::DisallowedBranchArg(last));
            }

            for &succ in f.block_succs(block) {
                if succ.index() <= block.index() {
                    backedges_in[succ.index()] += 1;
                    backedges_out[block.index()] += 1;
                }
            }
        }
        if insn_block.iter().any(|b| b.is_invalid()) {
            return Err(RegAllocError::BB(Block::new(nb.saturating_sub(1))));
        }

        // Walk blocks in index order keeping a stack of open loops,
        // each with the number of backedges still to be seen.
        let depths = self.approx_loop_depth.cleared();
        let mut open_loops: SmallVec<[u32; 4]> = smallvec![];
        for block in 0..nb {
            if backedges_in[block] > 0 {
                open_loops.push(backedges_in[block]);
            }
            depths.push(open_loops.len() as u32);
            let mut closing = backedges_out[block];
            while closing > 0 {
                match open_loops.last_mut() {
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining == 0 {
                            open_loops.pop();
                        }
                    }
                    None => break,
                }
                closing -= 1;
            }
        }

        Ok(())
    }

    /// The block containing `point`.
    #[inline(always)]
    pub fn block_of(&self, point: ProgPoint) -> Block {
        self.insn_block[point.inst().index()]
    }

    /// Reverse postorder.
    pub fn rpo(&self) -> impl Iterator<Item = Block> + '_ {
        self.postorder.iter().rev().copied()
    }
}

/// Iterative depth-first postorder from the entry block.
fn compute_postorder<F: Function>(f: &F, out: &mut Vec<Block>) -> Result<(), RegAllocError> {
    let nb = f.num_blocks();
    let entry = f.entry_block();
    if entry.index() >= nb {
        return Err(RegAllocError::BB(entry));
    }
    let mut visited = Vec::new();
    visited.repopulate(nb, false);
    out.clear();

    // Each stack entry is a block and the index of its next successor
    // to visit.
    let mut stack: SmallVec<[(Block, usize); 64]> = smallvec![(entry, 0)];
    visited[entry.index()] = true;
    while let Some(top) = stack.last_mut() {
        let block = top.0;
        let succ = f.block_succs(block).get(top.1).copied();
        top.1 += 1;
        match succ {
            Some(succ) => {
                let seen = visited
                    .get_mut(succ.index())
                    .ok_or(RegAllocError::BB(succ))?;
                if !*seen {
                    *seen = true;
                    stack.push((succ, 0));
                }
            }
            None => {
                out.push(block);
                stack.pop();
            }
        }
    }
    Ok(())
}
