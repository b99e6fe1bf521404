/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Traces and trace builders.
//!
//! A trace is a single-entry path of blocks: every block after the
//! head has exactly one predecessor, the block before it in the trace.
//! Blocks of a trace appear in increasing instruction order, so the
//! program points of a trace increase along it. Traces are allocated
//! one at a time in the order they appear here.

use alloc::vec::Vec;
use smallvec::SmallVec;

use crate::cfg::CFGInfo;
use crate::{Block, Function, RegAllocError, TraceId, VecExt};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Trace {
    id: TraceId,
    blocks: Vec<Block>,
}

impl Trace {
    pub fn id(&self) -> TraceId {
        self.id
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks[..]
    }

    /// The single entry block.
    pub fn head(&self) -> Block {
        self.blocks[0]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// How to partition a function into traces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceBuilderKind {
    /// Greedily grow each trace along single-predecessor successors,
    /// preferring the most deeply nested successor.
    UniDirectional,
    /// One trace per block.
    SingleBlock,
}

/// The ordered traces of a function and the block-to-trace mapping.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TraceBuilderResult {
    traces: Vec<Trace>,
    block_to_trace: Vec<TraceId>,
    block_pos: Vec<u32>,
}

impl TraceBuilderResult {
    /// Validates a client-supplied partition of the function's blocks.
    pub fn new<F: Function>(func: &F, traces: Vec<Vec<Block>>) -> Result<Self, RegAllocError> {
        let nb = func.num_blocks();
        let mut result = TraceBuilderResult::default();
        result.block_to_trace.repopulate(nb, TraceId::invalid());
        result.block_pos.repopulate(nb, 0);

        for (i, blocks) in traces.into_iter().enumerate() {
            let id = TraceId::new(i);
            if blocks.is_empty() {
                return Err(RegAllocError::InvalidTrace(id));
            }
            for (pos, &block) in blocks.iter().enumerate() {
                match result.block_to_trace.get_mut(block.index()) {
                    Some(slot) if slot.is_invalid() => *slot = id,
                    _ => return Err(RegAllocError::InvalidTrace(id)),
                }
                result.block_pos[block.index()] = pos as u32;
                if pos > 0 {
                    let prev = blocks[pos - 1];
                    if func.block_preds(block) != [prev]
                        || func.block_insns(block).first() <= func.block_insns(prev).last()
                    {
                        return Err(RegAllocError::InvalidTrace(id));
                    }
                }
            }
            result.traces.push(Trace { id, blocks });
        }

        if let Some(b) = result.block_to_trace.iter().position(|t| t.is_invalid()) {
            trace!("block{} is not covered by any trace", b);
            return Err(RegAllocError::InvalidTrace(TraceId::new(result.traces.len())));
        }
        if result.block_to_trace[func.entry_block().index()] != TraceId::new(0) {
            return Err(RegAllocError::InvalidTrace(
                result.block_to_trace[func.entry_block().index()],
            ));
        }
        Ok(result)
    }

    pub fn build<F: Function>(func: &F, kind: TraceBuilderKind) -> Result<Self, RegAllocError> {
        match kind {
            TraceBuilderKind::UniDirectional => Self::unidirectional(func),
            TraceBuilderKind::SingleBlock => Self::single_block(func),
        }
    }

    /// Start a trace at each not-yet-covered block in reverse
    /// postorder and extend it while some successor has the current
    /// block as its only predecessor and follows it in instruction
    /// order. Among several such successors the deepest loop nesting
    /// wins, then the lowest block index.
    pub fn unidirectional<F: Function>(func: &F) -> Result<Self, RegAllocError> {
        let cfg = CFGInfo::new(func)?;
        let mut covered = Vec::new();
        covered.repopulate(func.num_blocks(), false);
        let mut traces = Vec::new();

        for head in cfg.rpo() {
            if covered[head.index()] {
                continue;
            }
            let mut blocks = Vec::new();
            let mut cur = head;
            loop {
                covered[cur.index()] = true;
                blocks.push(cur);
                let cur_last = func.block_insns(cur).last();
                let next = func
                    .block_succs(cur)
                    .iter()
                    .copied()
                    .filter(|&s| {
                        !covered[s.index()]
                            && func.block_preds(s) == [cur]
                            && func.block_insns(s).first() > cur_last
                    })
                    .max_by_key(|&s| {
                        (
                            cfg.approx_loop_depth[s.index()],
                            core::cmp::Reverse(s.index()),
                        )
                    });
                match next {
                    Some(next) => cur = next,
                    None => break,
                }
            }
            trace!("trace{}: {:?}", traces.len(), blocks);
            traces.push(blocks);
        }

        Self::new(func, traces)
    }

    /// One trace per block, in reverse postorder.
    pub fn single_block<F: Function>(func: &F) -> Result<Self, RegAllocError> {
        let cfg = CFGInfo::new(func)?;
        let traces = cfg.rpo().map(|b| alloc::vec![b]).collect();
        Self::new(func, traces)
    }

    pub fn num_traces(&self) -> usize {
        self.traces.len()
    }

    pub fn traces(&self) -> &[Trace] {
        &self.traces[..]
    }

    pub fn trace(&self, id: TraceId) -> &Trace {
        &self.traces[id.index()]
    }

    /// The trace containing `block`.
    pub fn trace_of(&self, block: Block) -> TraceId {
        self.block_to_trace[block.index()]
    }

    /// Index of `block` within its trace.
    pub fn position_in_trace(&self, block: Block) -> usize {
        self.block_pos[block.index()] as usize
    }

    /// Is `to` the block right after `from` in the same trace?
    pub fn is_fallthrough(&self, from: Block, to: Block) -> bool {
        self.trace_of(from) == self.trace_of(to)
            && self.position_in_trace(to) == self.position_in_trace(from) + 1
    }

    /// Traces with an edge into the head of `id`, in order, without
    /// duplicates. A loop closed inside the trace lists the trace
    /// itself.
    pub fn predecessor_traces<F: Function>(&self, func: &F, id: TraceId) -> SmallVec<[TraceId; 4]> {
        let mut preds: SmallVec<[TraceId; 4]> = func
            .block_preds(self.trace(id).head())
            .iter()
            .map(|&p| self.trace_of(p))
            .collect();
        preds.sort_unstable();
        preds.dedup();
        preds
    }

    /// Traces entered by an edge leaving `id`, in order, without
    /// duplicates.
    pub fn successor_traces<F: Function>(&self, func: &F, id: TraceId) -> SmallVec<[TraceId; 4]> {
        let mut succs: SmallVec<[TraceId; 4]> = SmallVec::new();
        for &block in self.trace(id).blocks() {
            for &succ in func.block_succs(block) {
                if !self.is_fallthrough(block, succ) {
                    succs.push(self.trace_of(succ));
                }
            }
        }
        succs.sort_unstable();
        succs.dedup();
        succs
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fuzzing::func::{Func, FuncBuilder};
    use crate::{Operand, RegClass, VReg};
    use alloc::vec;

    fn v(n: usize) -> VReg {
        VReg::new(n, RegClass::Int)
    }

    /// b0 -> {b1, b2}; b1 -> b3; b2 -> b3.
    fn diamond() -> Func {
        let mut b = FuncBuilder::new();
        let b0 = b.add_block();
        let b1 = b.add_block();
        let b2 = b.add_block();
        let b3 = b.add_block();
        b.add_edge(b0, b1);
        b.add_edge(b0, b2);
        b.add_edge(b1, b3);
        b.add_edge(b2, b3);
        b.push_inst(b0, &[Operand::reg_def(v(0))]);
        b.push_branch(b0, &[], &[vec![], vec![]]);
        b.push_branch(b1, &[], &[vec![]]);
        b.push_branch(b2, &[], &[vec![]]);
        b.push_ret(b3, &[Operand::reg_use(v(0))]);
        b.finish()
    }

    #[test]
    fn unidirectional_diamond() {
        let f = diamond();
        let traces = TraceBuilderResult::unidirectional(&f).unwrap();
        // The merge block has two predecessors, so it heads its own trace.
        assert_eq!(traces.num_traces(), 3);
        assert_eq!(traces.trace(TraceId::new(0)).blocks(), &[Block::new(0), Block::new(1)]);
        assert_eq!(traces.trace_of(Block::new(3)), traces.trace_of(Block::new(3)));
        assert_eq!(traces.trace(traces.trace_of(Block::new(3))).len(), 1);
        assert!(traces.is_fallthrough(Block::new(0), Block::new(1)));
        assert!(!traces.is_fallthrough(Block::new(0), Block::new(2)));
        let t3 = traces.trace_of(Block::new(3));
        assert_eq!(traces.predecessor_traces(&f, t3).len(), 2);
        assert_eq!(
            traces.successor_traces(&f, TraceId::new(0)).as_slice(),
            &[traces.trace_of(Block::new(2)), t3]
        );
    }

    #[test]
    fn single_block_traces() {
        let f = diamond();
        let traces = TraceBuilderResult::single_block(&f).unwrap();
        assert_eq!(traces.num_traces(), 4);
        assert_eq!(traces.trace_of(Block::new(0)), TraceId::new(0));
    }

    #[test]
    fn rejects_side_entry() {
        let f = diamond();
        // b3 has two predecessors and cannot follow b1 inside a trace.
        let err = TraceBuilderResult::new(
            &f,
            vec![
                vec![Block::new(0), Block::new(1), Block::new(3)],
                vec![Block::new(2)],
            ],
        )
        .unwrap_err();
        assert_eq!(err, RegAllocError::InvalidTrace(TraceId::new(0)));
    }

    #[test]
    fn rejects_missing_block() {
        let f = diamond();
        let err = TraceBuilderResult::new(
            &f,
            vec![vec![Block::new(0), Block::new(1)], vec![Block::new(2)]],
        )
        .unwrap_err();
        assert_eq!(err, RegAllocError::InvalidTrace(TraceId::new(2)));
    }
}
